//! Control RPC handlers (one router per tenant Unix socket).

use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::auth::AuthedTenant;
use super::state::ControlState;
use crate::error::HvResult;
use crate::hardware::DmaDirection;
use crate::resources::{DmaTransferState, IpCoreDescriptor};

#[derive(Debug, Deserialize, ToSchema)]
pub struct AuthenticateRequest {
    pub tenant_id: String,
    pub api_key: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct AuthenticateResponse {
    pub token: String,
    pub expires_at: u64,
}

#[utoipa::path(post, path = "/authenticate", request_body = AuthenticateRequest,
    responses((status = 200, body = AuthenticateResponse)))]
pub async fn authenticate(
    State(state): State<ControlState>,
    Json(req): Json<AuthenticateRequest>,
) -> HvResult<Json<AuthenticateResponse>> {
    let session = state.tenants.authenticate(&req.tenant_id, &req.api_key).await?;

    // The fast MMIO path authenticates with the last 16 raw bytes of the
    // session token's hex half, so a single token works on both surfaces.
    if let Some(hex_part) = session.token.split(':').nth(1) {
        if hex_part.len() == 32 {
            let mut raw = [0u8; 16];
            for (i, byte) in raw.iter_mut().enumerate() {
                *byte = u8::from_str_radix(&hex_part[i * 2..i * 2 + 2], 16).unwrap_or(0);
            }
            state.fast_mmio_tokens.register(raw, session.tenant_id.clone()).await;
        }
    }

    Ok(Json(AuthenticateResponse {
        token: session.token,
        expires_at: session.expires_at,
    }))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct LoadOverlayRequest {
    pub bitstream_path: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct OverlayResponse {
    pub overlay_handle: String,
    pub ip_cores: Vec<IpCoreDescriptor>,
}

#[utoipa::path(post, path = "/overlay/load", request_body = LoadOverlayRequest,
    responses((status = 200, body = OverlayResponse)))]
pub async fn load_overlay(
    State(state): State<ControlState>,
    AuthedTenant(tenant_id): AuthedTenant,
    Json(req): Json<LoadOverlayRequest>,
) -> HvResult<Json<OverlayResponse>> {
    let (handle, ip_cores) = state.resources.load_overlay(&tenant_id, &req.bitstream_path).await?;
    Ok(Json(OverlayResponse { overlay_handle: handle, ip_cores }))
}

#[utoipa::path(get, path = "/overlay/{id}", responses((status = 200, body = OverlayResponse)))]
pub async fn get_overlay(
    State(state): State<ControlState>,
    AuthedTenant(tenant_id): AuthedTenant,
    Path(id): Path<String>,
) -> HvResult<Json<OverlayResponse>> {
    let (_zone_id, ip_cores) = state.resources.get_overlay(&tenant_id, &id).await?;
    Ok(Json(OverlayResponse { overlay_handle: id, ip_cores }))
}

#[utoipa::path(delete, path = "/overlay/{id}", responses((status = 204, description = "unloaded")))]
pub async fn unload_overlay(
    State(state): State<ControlState>,
    AuthedTenant(tenant_id): AuthedTenant,
    Path(id): Path<String>,
) -> HvResult<()> {
    state.resources.unload_overlay(&tenant_id, &id).await
}

/// The zone (and therefore the owning overlay) is derived from
/// `base_address`/`length` against the tenant's own live overlays — an
/// explicit overlay handle is no longer part of this contract.
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateMmioRequest {
    pub base_address: u64,
    pub length: u64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MmioHandleResponse {
    pub mmio_handle: String,
}

#[utoipa::path(post, path = "/mmio", request_body = CreateMmioRequest,
    responses((status = 200, body = MmioHandleResponse)))]
pub async fn create_mmio(
    State(state): State<ControlState>,
    AuthedTenant(tenant_id): AuthedTenant,
    Json(req): Json<CreateMmioRequest>,
) -> HvResult<Json<MmioHandleResponse>> {
    let handle = state.resources.create_mmio(&tenant_id, req.base_address, req.length).await?;
    Ok(Json(MmioHandleResponse { mmio_handle: handle }))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct MmioReadQuery {
    pub offset: u64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct MmioReadResponse {
    pub value: u32,
}

#[utoipa::path(get, path = "/mmio/{handle}/read", responses((status = 200, body = MmioReadResponse)))]
pub async fn mmio_read(
    State(state): State<ControlState>,
    AuthedTenant(tenant_id): AuthedTenant,
    Path(handle): Path<String>,
    axum::extract::Query(query): axum::extract::Query<MmioReadQuery>,
) -> HvResult<Json<MmioReadResponse>> {
    let value = state.resources.mmio_read(&tenant_id, &handle, query.offset).await?;
    Ok(Json(MmioReadResponse { value }))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct MmioWriteRequest {
    pub offset: u64,
    pub value: u32,
}

#[utoipa::path(post, path = "/mmio/{handle}/write", request_body = MmioWriteRequest,
    responses((status = 204, description = "written")))]
pub async fn mmio_write(
    State(state): State<ControlState>,
    AuthedTenant(tenant_id): AuthedTenant,
    Path(handle): Path<String>,
    Json(req): Json<MmioWriteRequest>,
) -> HvResult<()> {
    state.resources.mmio_write(&tenant_id, &handle, req.offset, req.value).await
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AllocateBufferRequest {
    pub size: u64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BufferHandleResponse {
    pub buffer_handle: String,
}

#[utoipa::path(post, path = "/buffer", request_body = AllocateBufferRequest,
    responses((status = 200, body = BufferHandleResponse)))]
pub async fn allocate_buffer(
    State(state): State<ControlState>,
    AuthedTenant(tenant_id): AuthedTenant,
    Json(req): Json<AllocateBufferRequest>,
) -> HvResult<Json<BufferHandleResponse>> {
    let handle = state.resources.allocate_buffer(&tenant_id, req.size).await?;
    Ok(Json(BufferHandleResponse { buffer_handle: handle }))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct BufferReadQuery {
    pub offset: u64,
    pub len: u64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct BufferReadResponse {
    pub data_base64: String,
}

#[utoipa::path(get, path = "/buffer/{handle}/read", responses((status = 200, body = BufferReadResponse)))]
pub async fn read_buffer(
    State(state): State<ControlState>,
    AuthedTenant(tenant_id): AuthedTenant,
    Path(handle): Path<String>,
    axum::extract::Query(query): axum::extract::Query<BufferReadQuery>,
) -> HvResult<Json<BufferReadResponse>> {
    let data = state.resources.read_buffer(&tenant_id, &handle, query.offset, query.len).await?;
    Ok(Json(BufferReadResponse {
        data_base64: base64::Engine::encode(&base64::engine::general_purpose::STANDARD, &data),
    }))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct BufferWriteRequest {
    pub offset: u64,
    pub data_base64: String,
}

#[utoipa::path(post, path = "/buffer/{handle}/write", request_body = BufferWriteRequest,
    responses((status = 204, description = "written")))]
pub async fn write_buffer(
    State(state): State<ControlState>,
    AuthedTenant(tenant_id): AuthedTenant,
    Path(handle): Path<String>,
    Json(req): Json<BufferWriteRequest>,
) -> HvResult<()> {
    let data = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &req.data_base64)
        .map_err(|e| crate::error::HvError::InvalidArgument(format!("invalid base64: {e}")))?;
    state.resources.write_buffer(&tenant_id, &handle, req.offset, data).await
}

#[utoipa::path(delete, path = "/buffer/{handle}", responses((status = 204, description = "freed")))]
pub async fn free_buffer(
    State(state): State<ControlState>,
    AuthedTenant(tenant_id): AuthedTenant,
    Path(handle): Path<String>,
) -> HvResult<()> {
    state.resources.free_buffer(&tenant_id, &handle).await
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateDmaRequest {
    pub name: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DmaHandleResponse {
    pub dma_handle: String,
}

#[utoipa::path(post, path = "/dma", request_body = CreateDmaRequest,
    responses((status = 200, body = DmaHandleResponse)))]
pub async fn create_dma(
    State(state): State<ControlState>,
    AuthedTenant(tenant_id): AuthedTenant,
    Json(req): Json<CreateDmaRequest>,
) -> HvResult<Json<DmaHandleResponse>> {
    let handle = state.resources.create_dma(&tenant_id, &req.name).await?;
    Ok(Json(DmaHandleResponse { dma_handle: handle }))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct DmaTransferRequest {
    pub buffer_handle: String,
    pub direction: DmaDirection,
    pub length: u64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DmaTransferResponse {
    pub transfer_id: String,
}

#[utoipa::path(post, path = "/dma/{handle}/transfer", request_body = DmaTransferRequest,
    responses((status = 200, body = DmaTransferResponse)))]
pub async fn dma_transfer(
    State(state): State<ControlState>,
    AuthedTenant(tenant_id): AuthedTenant,
    Path(handle): Path<String>,
    Json(req): Json<DmaTransferRequest>,
) -> HvResult<Json<DmaTransferResponse>> {
    let transfer_id = state
        .resources
        .dma_transfer(&tenant_id, &handle, &req.buffer_handle, req.direction, req.length)
        .await?;
    Ok(Json(DmaTransferResponse { transfer_id }))
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DmaStatusResponse {
    pub state: DmaTransferState,
    pub bytes_transferred: u64,
}

#[utoipa::path(get, path = "/dma/{handle}/status/{transferId}", responses((status = 200, body = DmaStatusResponse)))]
pub async fn dma_status(
    State(state): State<ControlState>,
    AuthedTenant(tenant_id): AuthedTenant,
    Path((handle, transfer_id)): Path<(String, String)>,
) -> HvResult<Json<DmaStatusResponse>> {
    let status = state.resources.get_dma_status(&tenant_id, &handle, &transfer_id).await?;
    Ok(Json(DmaStatusResponse { state: status.state, bytes_transferred: status.bytes_transferred }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_round_trips() {
        use base64::Engine;
        let data = b"the quick brown fox jumps";
        let encoded = base64::engine::general_purpose::STANDARD.encode(data);
        let decoded = base64::engine::general_purpose::STANDARD.decode(&encoded).unwrap();
        assert_eq!(decoded, data);
    }
}
