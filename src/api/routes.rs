//! Router construction for the Control RPC surface (one per tenant socket)
//! and the Management RPC surface (one, on the root-only socket).

use axum::middleware as axum_middleware;
use axum::routing::{delete, get, patch, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use super::{control_handlers, management_handlers, middleware, state::ControlState, state::ManagementState, ws};

#[derive(OpenApi)]
#[openapi(
    paths(
        control_handlers::authenticate,
        control_handlers::load_overlay,
        control_handlers::get_overlay,
        control_handlers::unload_overlay,
        control_handlers::create_mmio,
        control_handlers::mmio_read,
        control_handlers::mmio_write,
        control_handlers::allocate_buffer,
        control_handlers::read_buffer,
        control_handlers::write_buffer,
        control_handlers::free_buffer,
        control_handlers::create_dma,
        control_handlers::dma_transfer,
        control_handlers::dma_status,
    ),
    components(schemas(
        control_handlers::AuthenticateRequest,
        control_handlers::AuthenticateResponse,
        control_handlers::LoadOverlayRequest,
        control_handlers::OverlayResponse,
        control_handlers::CreateMmioRequest,
        control_handlers::MmioHandleResponse,
        control_handlers::MmioReadResponse,
        control_handlers::MmioWriteRequest,
        control_handlers::AllocateBufferRequest,
        control_handlers::BufferHandleResponse,
        control_handlers::BufferReadResponse,
        control_handlers::BufferWriteRequest,
        control_handlers::CreateDmaRequest,
        control_handlers::DmaHandleResponse,
        control_handlers::DmaTransferRequest,
        control_handlers::DmaTransferResponse,
        control_handlers::DmaStatusResponse,
        crate::resources::IpCoreDescriptor,
        crate::resources::RegisterDescriptor,
        crate::resources::DmaTransferState,
        crate::error::ProblemDetails,
    )),
    tags((name = "control", description = "Per-tenant control RPC"))
)]
struct ControlApiDoc;

pub fn control_router(state: ControlState) -> Router {
    let swagger = SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ControlApiDoc::openapi());

    Router::new()
        .route("/authenticate", post(control_handlers::authenticate))
        .route("/overlay/load", post(control_handlers::load_overlay))
        .route(
            "/overlay/:id",
            get(control_handlers::get_overlay).delete(control_handlers::unload_overlay),
        )
        .route("/mmio", post(control_handlers::create_mmio))
        .route("/mmio/:handle/read", get(control_handlers::mmio_read))
        .route("/mmio/:handle/write", post(control_handlers::mmio_write))
        .route("/buffer", post(control_handlers::allocate_buffer))
        .route("/buffer/:handle/read", get(control_handlers::read_buffer))
        .route("/buffer/:handle/write", post(control_handlers::write_buffer))
        .route("/buffer/:handle", delete(control_handlers::free_buffer))
        .route("/dma", post(control_handlers::create_dma))
        .route("/dma/:handle/transfer", post(control_handlers::dma_transfer))
        .route("/dma/:handle/status/:transfer_id", get(control_handlers::dma_status))
        .merge(swagger)
        .layer(axum_middleware::from_fn(middleware::request_id_middleware))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[derive(OpenApi)]
#[openapi(
    paths(
        management_handlers::health,
        management_handlers::list_tenants,
        management_handlers::create_tenant,
        management_handlers::update_tenant,
        management_handlers::remove_tenant,
        management_handlers::reload_config,
    ),
    components(schemas(
        management_handlers::HealthResponse,
        crate::config::TenantConfig,
        crate::config::TenantUpdate,
        crate::error::ProblemDetails,
    )),
    tags((name = "management", description = "Root-only tenant and fleet management"))
)]
struct ManagementApiDoc;

pub fn management_router(state: ManagementState) -> Router {
    let swagger = SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ManagementApiDoc::openapi());

    Router::new()
        .route("/health", get(management_handlers::health))
        .route(
            "/tenants",
            get(management_handlers::list_tenants).post(management_handlers::create_tenant),
        )
        .route(
            "/tenants/:id",
            patch(management_handlers::update_tenant).delete(management_handlers::remove_tenant),
        )
        .route("/config/reload", post(management_handlers::reload_config))
        .route("/events", get(ws::events_handler))
        .merge(swagger)
        .layer(axum_middleware::from_fn(middleware::request_id_middleware))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
