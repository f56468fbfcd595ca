//! Structured events broadcast to management WebSocket subscribers
//! (`GET /events`), plus raw log lines re-emitted by `tracing_layer`.

use serde::Serialize;
use utoipa::ToSchema;

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HvEvent {
    TenantAdded { tenant_id: String },
    TenantRemoved { tenant_id: String },
    TenantUpdated { tenant_id: String },
    ZoneAllocated { zone_id: u32, tenant_id: String, bitstream: String },
    ZoneReleased { zone_id: u32, tenant_id: String },
    ReconfigStarted { zone_id: u32, tenant_id: String },
    ReconfigCompleted { zone_id: u32, tenant_id: String, ok: bool },
    LogLine { level: String, target: String, message: String, ts_millis: i64 },
}
