//! Bearer-token extractor for the Control RPC surface. Every route except
//! `/authenticate` requires `Authorization: Bearer <token>`, validated
//! against the Tenant/Session Manager.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;

use super::state::ControlState;
use crate::error::HvError;

pub struct AuthedTenant(pub String);

impl FromRequestParts<ControlState> for AuthedTenant {
    type Rejection = HvError;

    async fn from_request_parts(parts: &mut Parts, state: &ControlState) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| HvError::Unauthenticated("missing Authorization header".to_string()))?;

        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| HvError::Unauthenticated("expected a Bearer token".to_string()))?;

        let tenant_id = state.tenants.validate_token(token).await?;
        Ok(AuthedTenant(tenant_id))
    }
}
