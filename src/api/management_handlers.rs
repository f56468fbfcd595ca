//! Management RPC handlers (root-only socket): tenant CRUD, config reload,
//! health, and the `/events` WebSocket defined in `ws.rs`.

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::state::ManagementState;
use crate::config::{TenantConfig, TenantUpdate};
use crate::error::{HvError, HvResult};

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[utoipa::path(get, path = "/health", responses((status = 200, body = HealthResponse)))]
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

#[utoipa::path(get, path = "/tenants", responses((status = 200, body = [TenantConfig])))]
pub async fn list_tenants(State(state): State<ManagementState>) -> Json<Vec<TenantConfig>> {
    Json(state.config.list().await)
}

#[utoipa::path(post, path = "/tenants", request_body = TenantConfig,
    responses((status = 201, description = "tenant created"), (status = 409, description = "already exists")))]
pub async fn create_tenant(
    State(state): State<ManagementState>,
    Json(tenant): Json<TenantConfig>,
) -> HvResult<()> {
    let created = state
        .config
        .add_tenant(tenant)
        .await
        .map_err(HvError::Internal)?;
    if created {
        Ok(())
    } else {
        Err(HvError::InvalidArgument("tenant already exists".to_string()))
    }
}

#[utoipa::path(patch, path = "/tenants/{id}", request_body = TenantUpdate,
    responses((status = 204, description = "updated"), (status = 404, description = "not found")))]
pub async fn update_tenant(
    State(state): State<ManagementState>,
    Path(id): Path<String>,
    Json(update): Json<TenantUpdate>,
) -> HvResult<()> {
    let updated = state.config.update_tenant(&id, update).await.map_err(HvError::Internal)?;
    if updated {
        Ok(())
    } else {
        Err(HvError::InvalidArgument(format!("unknown tenant {id}")))
    }
}

#[utoipa::path(delete, path = "/tenants/{id}", responses((status = 204, description = "removed")))]
pub async fn remove_tenant(
    State(state): State<ManagementState>,
    Path(id): Path<String>,
) -> HvResult<()> {
    let removed = state.config.remove_tenant(&id).await.map_err(HvError::Internal)?;
    // Revokes whatever the tenant is still holding even if it never
    // disconnected cleanly — removal from the roster is terminal.
    state.resources.cleanup_tenant_resources(&id).await;
    if removed {
        Ok(())
    } else {
        Err(HvError::InvalidArgument(format!("unknown tenant {id}")))
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ReloadRequest {}

#[utoipa::path(post, path = "/config/reload", responses((status = 204, description = "reloaded")))]
pub async fn reload_config(State(state): State<ManagementState>) -> HvResult<()> {
    state.config.reload().await.map_err(HvError::Internal)
}
