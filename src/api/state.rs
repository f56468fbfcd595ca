//! Shared state handed to axum's `State` extractor for each of the three
//! socket surfaces (Control RPC, per tenant; Management RPC, root-only).

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::config::ConfigRegistry;
use crate::events::HvEvent;
use crate::fast_mmio::FastMmioTokens;
use crate::resources::ResourceRegistry;
use crate::tenant::TenantManager;

#[derive(Clone)]
pub struct ControlState {
    pub tenants: Arc<TenantManager>,
    pub resources: Arc<ResourceRegistry>,
    pub fast_mmio_tokens: FastMmioTokens,
}

#[derive(Clone)]
pub struct ManagementState {
    pub config: Arc<ConfigRegistry>,
    pub resources: Arc<ResourceRegistry>,
    pub events: broadcast::Sender<HvEvent>,
}
