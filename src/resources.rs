//! Resource Registry (C5).
//!
//! The only component allowed to call into the Hardware Execution Thread.
//! Every operation here re-verifies ownership and authorization against
//! C1/C2 before touching the backend, and issues handles that later calls
//! must present back. Lock order when a call needs more than one
//! component: this registry's own table, then the PR-zone allocator, then
//! the configuration registry, then the tenant manager — never the
//! reverse, to avoid a lock-order inversion across components.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::RwLock;
use utoipa::ToSchema;
use uuid::Uuid;

use tokio::sync::broadcast;

use crate::config::HypervisorConfig;
use crate::error::{HvError, HvResult};
use crate::events::HvEvent;
use crate::hardware::{BackendRef, DmaDirection, HardwareThread};
use crate::pr_zone::PrZoneAllocator;
use crate::tenant::{ResourceKind, TenantManager};

/// Short handle form, e.g. `mmio_a1b2c3d4` — matches the original source's
/// `f"{prefix}_{uuid.uuid4().hex[:8]}"` convention and fits comfortably in
/// the Fast MMIO Path's fixed 32-byte wire handle field.
fn new_handle(prefix: &str) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{prefix}_{}", &hex[..8])
}

/// One exposed IP core on an overlay: a named, addressable register window
/// with a symbolic register map (`overlay.axi_gpio_0.register_map.CH1_DATA`
/// in the source system's dynamic-attribute form). Generated at
/// `load_overlay` time from the tenant's allowed address ranges — this
/// implementation has no bitstream-metadata parser, so one IP core is
/// synthesized per allowed range using a generic AXI-GPIO-style register
/// template.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct IpCoreDescriptor {
    pub name: String,
    pub base_address: u64,
    pub length: u64,
    pub registers: HashMap<String, RegisterDescriptor>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct RegisterDescriptor {
    pub offset: u64,
    pub width: u8,
    pub access: String,
}

fn generic_register_template() -> HashMap<String, RegisterDescriptor> {
    let mut registers = HashMap::new();
    registers.insert("CH1_DATA".to_string(), RegisterDescriptor { offset: 0x00, width: 32, access: "rw".to_string() });
    registers.insert("CH2_DATA".to_string(), RegisterDescriptor { offset: 0x08, width: 32, access: "rw".to_string() });
    registers.insert("GIER".to_string(), RegisterDescriptor { offset: 0x11c, width: 32, access: "rw".to_string() });
    registers.insert("IP_IER".to_string(), RegisterDescriptor { offset: 0x128, width: 32, access: "rw".to_string() });
    registers.insert("IP_ISR".to_string(), RegisterDescriptor { offset: 0x120, width: 32, access: "rw".to_string() });
    registers
}

fn ip_cores_for_tenant(bitstream_path: &str, allowed_ranges: &[(u64, u64)]) -> Vec<IpCoreDescriptor> {
    let stem = std::path::Path::new(bitstream_path)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("overlay")
        .to_string();
    allowed_ranges
        .iter()
        .enumerate()
        .map(|(idx, &(base_address, length))| IpCoreDescriptor {
            name: format!("{stem}_axi_gpio_{idx}"),
            base_address,
            length,
            registers: generic_register_template(),
        })
        .collect()
}

#[derive(Debug, Clone, Copy, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum DmaTransferState {
    Complete,
    Failed,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct DmaStatus {
    pub state: DmaTransferState,
    pub bytes_transferred: u64,
}

#[derive(Debug, Clone)]
struct OverlayEntry {
    tenant_id: String,
    zone_id: u32,
    ip_cores: Vec<IpCoreDescriptor>,
}

#[derive(Debug, Clone)]
struct MmioEntry {
    tenant_id: String,
    backend_ref: BackendRef,
    base_address: u64,
    length: u64,
}

#[derive(Debug, Clone)]
struct BufferEntry {
    tenant_id: String,
    backend_ref: BackendRef,
    size: u64,
}

#[derive(Debug, Clone)]
struct DmaEntry {
    tenant_id: String,
    backend_ref: BackendRef,
    zone_id: u32,
    #[allow(dead_code)]
    name: String,
}

struct Inner {
    overlays: HashMap<String, OverlayEntry>,
    mmios: HashMap<String, MmioEntry>,
    buffers: HashMap<String, BufferEntry>,
    dmas: HashMap<String, DmaEntry>,
    /// Transfers execute to completion inside `dma_transfer` itself (there
    /// is no async completion queue in this design), so this only needs to
    /// remember the outcome for a later status poll.
    dma_transfers: HashMap<String, DmaStatus>,
}

/// The Resource Registry (C5).
pub struct ResourceRegistry {
    state: RwLock<Inner>,
    hardware: Arc<HardwareThread>,
    pr_zones: Arc<PrZoneAllocator>,
    tenants: Arc<TenantManager>,
    config: Arc<HypervisorConfig>,
    events: broadcast::Sender<HvEvent>,
}

impl ResourceRegistry {
    pub fn new(
        hardware: Arc<HardwareThread>,
        pr_zones: Arc<PrZoneAllocator>,
        tenants: Arc<TenantManager>,
        config: Arc<HypervisorConfig>,
        events: broadcast::Sender<HvEvent>,
    ) -> Self {
        Self {
            state: RwLock::new(Inner {
                overlays: HashMap::new(),
                mmios: HashMap::new(),
                buffers: HashMap::new(),
                dmas: HashMap::new(),
                dma_transfers: HashMap::new(),
            }),
            hardware,
            pr_zones,
            tenants,
            config,
            events,
        }
    }

    /// Returns the new overlay's handle and its IP-core map, per the
    /// `LoadOverlay(bitstream_path) → (handle, ip_cores)` contract.
    #[tracing::instrument(skip(self), fields(tenant_id))]
    pub async fn load_overlay(&self, tenant_id: &str, bitstream_path: &str) -> HvResult<(String, Vec<IpCoreDescriptor>)> {
        if !self.tenants.can_allocate_overlay(tenant_id).await? {
            return Err(HvError::QuotaExceeded("overlay quota reached".to_string()));
        }
        let is_allowed = self.tenants.is_bitstream_allowed(tenant_id, basename(bitstream_path)).await?;
        let zone_id = self
            .pr_zones
            .find_best_zone_for_bitstream(bitstream_path, true, is_allowed)
            .await?;
        if !self.tenants.is_pr_zone_allowed(tenant_id, zone_id).await? {
            return Err(HvError::PermissionDenied(format!("PR zone {zone_id} not allowed for tenant")));
        }

        let overlay_handle = new_handle("overlay");
        self.pr_zones
            .allocate_zone(zone_id, tenant_id, bitstream_path, &overlay_handle)
            .await?;

        let _ = self.events.send(HvEvent::ReconfigStarted { zone_id, tenant_id: tenant_id.to_string() });
        let resolved = self.config.resolve_bitstream(bitstream_path);
        let reconfig_result = self.hardware.reconfigure_pr_zone(zone_id, resolved).await;
        let _ = self.events.send(HvEvent::ReconfigCompleted {
            zone_id,
            tenant_id: tenant_id.to_string(),
            ok: reconfig_result.is_ok(),
        });
        if let Err(e) = reconfig_result {
            self.pr_zones.release_zone_by_handle(&overlay_handle).await;
            return Err(e);
        }

        let _ = self.events.send(HvEvent::ZoneAllocated {
            zone_id,
            tenant_id: tenant_id.to_string(),
            bitstream: bitstream_path.to_string(),
        });
        let tenant_config = self.tenants.get_tenant_config(tenant_id).await?;
        let ip_cores = ip_cores_for_tenant(bitstream_path, &tenant_config.allowed_address_ranges);
        self.state.write().await.overlays.insert(
            overlay_handle.clone(),
            OverlayEntry {
                tenant_id: tenant_id.to_string(),
                zone_id,
                ip_cores: ip_cores.clone(),
            },
        );
        self.tenants.track_overlay(tenant_id, &overlay_handle).await;
        tracing::info!(tenant_id, zone_id, overlay_handle = %overlay_handle, "overlay loaded");
        Ok((overlay_handle, ip_cores))
    }

    /// `GetOverlayInfo(id)`: the owning PR zone and IP-core map recorded at
    /// load time.
    pub async fn get_overlay(&self, tenant_id: &str, overlay_handle: &str) -> HvResult<(u32, Vec<IpCoreDescriptor>)> {
        let entry = {
            let guard = self.state.read().await;
            guard
                .overlays
                .get(overlay_handle)
                .cloned()
                .ok_or_else(|| HvError::InvalidArgument(format!("unknown overlay {overlay_handle}")))?
        };
        self.require_owner(tenant_id, &entry.tenant_id)?;
        Ok((entry.zone_id, entry.ip_cores))
    }

    pub async fn unload_overlay(&self, tenant_id: &str, overlay_handle: &str) -> HvResult<()> {
        let entry = {
            let guard = self.state.read().await;
            guard
                .overlays
                .get(overlay_handle)
                .cloned()
                .ok_or_else(|| HvError::InvalidArgument(format!("unknown overlay {overlay_handle}")))?
        };
        self.require_owner(tenant_id, &entry.tenant_id)?;

        self.pr_zones.release_zone_by_handle(overlay_handle).await;
        self.state.write().await.overlays.remove(overlay_handle);
        self.tenants.untrack(tenant_id, ResourceKind::Overlay, overlay_handle, 0).await;
        let _ = self.events.send(HvEvent::ZoneReleased { zone_id: entry.zone_id, tenant_id: tenant_id.to_string() });
        Ok(())
    }

    /// The current contract (superseding the historical form that took an
    /// explicit `overlay_id`) derives the owning overlay, and through it the
    /// PR zone, from `base_address`: the window must fall entirely within
    /// an IP core exposed by one of the tenant's own live overlays. That is
    /// stronger than the tenant's general address allow-list alone, and the
    /// resolved zone is itself re-checked against the tenant's PR-zone
    /// allow-list before the backend call.
    #[tracing::instrument(skip(self))]
    pub async fn create_mmio(&self, tenant_id: &str, base_address: u64, length: u64) -> HvResult<String> {
        if !self.tenants.is_address_allowed(tenant_id, base_address, length).await? {
            return Err(HvError::PermissionDenied(format!(
                "address range 0x{base_address:x}+0x{length:x} not allowed for tenant"
            )));
        }

        let zone_id = {
            let guard = self.state.read().await;
            guard
                .overlays
                .values()
                .filter(|o| o.tenant_id == tenant_id)
                .find_map(|o| {
                    o.ip_cores.iter().find(|ip| {
                        base_address >= ip.base_address && base_address.saturating_add(length) <= ip.base_address.saturating_add(ip.length)
                    })?;
                    Some(o.zone_id)
                })
                .ok_or_else(|| {
                    HvError::InvalidArgument(format!(
                        "no owned overlay exposes address range 0x{base_address:x}+0x{length:x}"
                    ))
                })?
        };
        if !self.tenants.is_pr_zone_allowed(tenant_id, zone_id).await? {
            return Err(HvError::PermissionDenied(format!("PR zone {zone_id} not allowed for tenant")));
        }

        let backend_ref = self.hardware.create_mmio(base_address, length).await?;
        let handle = new_handle("mmio");
        self.state.write().await.mmios.insert(
            handle.clone(),
            MmioEntry {
                tenant_id: tenant_id.to_string(),
                backend_ref,
                base_address,
                length,
            },
        );
        self.tenants.track_mmio(tenant_id, &handle).await;
        Ok(handle)
    }

    pub async fn mmio_read(&self, tenant_id: &str, handle: &str, offset: u64) -> HvResult<u32> {
        let entry = self.require_mmio(tenant_id, handle).await?;
        if offset + 4 > entry.length {
            return Err(HvError::InvalidArgument(format!("offset 0x{offset:x} out of range")));
        }
        self.hardware.mmio_read(entry.backend_ref, offset).await
    }

    pub async fn mmio_write(&self, tenant_id: &str, handle: &str, offset: u64, value: u32) -> HvResult<()> {
        let entry = self.require_mmio(tenant_id, handle).await?;
        if offset + 4 > entry.length {
            return Err(HvError::InvalidArgument(format!("offset 0x{offset:x} out of range")));
        }
        self.hardware.mmio_write(entry.backend_ref, offset, value).await
    }

    pub async fn destroy_mmio(&self, tenant_id: &str, handle: &str) -> HvResult<()> {
        let entry = self.require_mmio(tenant_id, handle).await?;
        self.hardware.destroy_mmio(entry.backend_ref).await?;
        self.state.write().await.mmios.remove(handle);
        self.tenants.untrack(tenant_id, ResourceKind::Mmio, handle, 0).await;
        Ok(())
    }

    async fn require_mmio(&self, tenant_id: &str, handle: &str) -> HvResult<MmioEntry> {
        let guard = self.state.read().await;
        let entry = guard
            .mmios
            .get(handle)
            .cloned()
            .ok_or_else(|| HvError::InvalidArgument(format!("unknown mmio handle {handle}")))?;
        self.require_owner(tenant_id, &entry.tenant_id)?;
        Ok(entry)
    }

    /// Resolves an MMIO handle's ownership and bounds exactly once, for the
    /// fast-path socket (C6) to cache and then call the hardware thread
    /// directly on subsequent operations without retaking this registry's
    /// lock each time.
    pub async fn resolve_mmio(&self, tenant_id: &str, handle: &str) -> HvResult<(BackendRef, u64)> {
        let entry = self.require_mmio(tenant_id, handle).await?;
        Ok((entry.backend_ref, entry.length))
    }

    pub fn hardware(&self) -> &Arc<HardwareThread> {
        &self.hardware
    }

    pub async fn allocate_buffer(&self, tenant_id: &str, size: u64) -> HvResult<String> {
        if !self.tenants.can_allocate_buffer(tenant_id, size).await? {
            return Err(HvError::QuotaExceeded("buffer quota reached".to_string()));
        }
        let (backend_ref, descriptor) = self.hardware.allocate_buffer(size).await?;
        let handle = new_handle("buffer");
        self.state.write().await.buffers.insert(
            handle.clone(),
            BufferEntry {
                tenant_id: tenant_id.to_string(),
                backend_ref,
                size: descriptor.size,
            },
        );
        self.tenants.track_buffer(tenant_id, &handle, descriptor.size).await;
        Ok(handle)
    }

    pub async fn read_buffer(&self, tenant_id: &str, handle: &str, offset: u64, len: u64) -> HvResult<Vec<u8>> {
        let entry = self.require_buffer(tenant_id, handle).await?;
        if offset + len > entry.size {
            return Err(HvError::InvalidArgument("read out of bounds".to_string()));
        }
        self.hardware.read_buffer(entry.backend_ref, offset, len).await
    }

    pub async fn write_buffer(&self, tenant_id: &str, handle: &str, offset: u64, data: Vec<u8>) -> HvResult<()> {
        let entry = self.require_buffer(tenant_id, handle).await?;
        if offset + data.len() as u64 > entry.size {
            return Err(HvError::InvalidArgument("write out of bounds".to_string()));
        }
        self.hardware.write_buffer(entry.backend_ref, offset, data).await
    }

    pub async fn free_buffer(&self, tenant_id: &str, handle: &str) -> HvResult<()> {
        let entry = self.require_buffer(tenant_id, handle).await?;
        self.hardware.free_buffer(entry.backend_ref).await?;
        self.state.write().await.buffers.remove(handle);
        self.tenants.untrack(tenant_id, ResourceKind::Buffer, handle, entry.size).await;
        Ok(())
    }

    async fn require_buffer(&self, tenant_id: &str, handle: &str) -> HvResult<BufferEntry> {
        let guard = self.state.read().await;
        let entry = guard
            .buffers
            .get(handle)
            .cloned()
            .ok_or_else(|| HvError::InvalidArgument(format!("unknown buffer handle {handle}")))?;
        self.require_owner(tenant_id, &entry.tenant_id)?;
        Ok(entry)
    }

    /// `CreateDMA(name) → handle`: scoped to whichever PR zone the tenant
    /// currently owns, rather than to an explicit overlay handle — a tenant
    /// with no live overlay has no zone to scope a DMA channel to.
    pub async fn create_dma(&self, tenant_id: &str, name: &str) -> HvResult<String> {
        let owned_zones = self.pr_zones.get_tenant_zones(tenant_id).await;
        let zone_id = *owned_zones
            .first()
            .ok_or_else(|| HvError::InvalidArgument(format!("tenant {tenant_id} owns no PR zone")))?;
        if !self.tenants.is_pr_zone_allowed(tenant_id, zone_id).await? {
            return Err(HvError::PermissionDenied(format!("PR zone {zone_id} not allowed for tenant")));
        }

        let backend_ref = self.hardware.create_dma(zone_id).await?;
        let handle = new_handle("dma");
        self.state.write().await.dmas.insert(
            handle.clone(),
            DmaEntry {
                tenant_id: tenant_id.to_string(),
                backend_ref,
                zone_id,
                name: name.to_string(),
            },
        );
        self.tenants.track_dma(tenant_id, &handle).await;
        Ok(handle)
    }

    /// Transfers run to completion inline — there is no working async DMA
    /// completion path in the original source to ground one on, so this
    /// supplements it with the simplest correct semantics: `transfer`
    /// blocks until done and `get_dma_status` reports the recorded outcome.
    pub async fn dma_transfer(
        &self,
        tenant_id: &str,
        dma_handle: &str,
        buffer_handle: &str,
        direction: DmaDirection,
        length: u64,
    ) -> HvResult<String> {
        let dma_entry = {
            let guard = self.state.read().await;
            let entry = guard
                .dmas
                .get(dma_handle)
                .cloned()
                .ok_or_else(|| HvError::InvalidArgument(format!("unknown dma handle {dma_handle}")))?;
            self.require_owner(tenant_id, &entry.tenant_id)?;
            entry
        };
        let buffer_entry = self.require_buffer(tenant_id, buffer_handle).await?;
        if length > buffer_entry.size {
            return Err(HvError::InvalidArgument("transfer length exceeds buffer size".to_string()));
        }

        let result = self
            .hardware
            .dma_transfer(dma_entry.backend_ref, buffer_entry.backend_ref, direction, length)
            .await;

        let transfer_id = new_handle("transfer");
        let status = match &result {
            Ok(_) => DmaStatus { state: DmaTransferState::Complete, bytes_transferred: length },
            Err(_) => DmaStatus { state: DmaTransferState::Failed, bytes_transferred: 0 },
        };
        self.state.write().await.dma_transfers.insert(transfer_id.clone(), status);
        result.map(|_| transfer_id)
    }

    pub async fn get_dma_status(&self, tenant_id: &str, dma_handle: &str, transfer_id: &str) -> HvResult<DmaStatus> {
        self.require_owner(
            tenant_id,
            &self
                .state
                .read()
                .await
                .dmas
                .get(dma_handle)
                .ok_or_else(|| HvError::InvalidArgument(format!("unknown dma handle {dma_handle}")))?
                .tenant_id,
        )?;
        self.state
            .read()
            .await
            .dma_transfers
            .get(transfer_id)
            .cloned()
            .ok_or_else(|| HvError::InvalidArgument(format!("unknown transfer {transfer_id}")))
    }

    pub async fn destroy_dma(&self, tenant_id: &str, handle: &str) -> HvResult<()> {
        let entry = {
            let guard = self.state.read().await;
            let entry = guard
                .dmas
                .get(handle)
                .cloned()
                .ok_or_else(|| HvError::InvalidArgument(format!("unknown dma handle {handle}")))?;
            self.require_owner(tenant_id, &entry.tenant_id)?;
            entry
        };
        self.hardware.destroy_dma(entry.backend_ref).await?;
        self.state.write().await.dmas.remove(handle);
        self.tenants.untrack(tenant_id, ResourceKind::Dma, handle, 0).await;
        Ok(())
    }

    /// Releases every resource a departing or revoked tenant still holds:
    /// PR zones first (so a concurrent allocator scan never observes a
    /// zone that's "occupied" by a tenant whose backend objects are
    /// already gone), then backend-side teardown for whatever's left.
    pub async fn cleanup_tenant_resources(&self, tenant_id: &str) {
        self.pr_zones.release_all_tenant_zones(tenant_id).await;

        let (overlays, mmios, buffers, dmas) = {
            let mut guard = self.state.write().await;
            let overlays: Vec<_> = guard
                .overlays
                .iter()
                .filter(|(_, e)| e.tenant_id == tenant_id)
                .map(|(h, _)| h.clone())
                .collect();
            let mmios: Vec<_> = guard
                .mmios
                .iter()
                .filter(|(_, e)| e.tenant_id == tenant_id)
                .map(|(h, e)| (h.clone(), e.backend_ref))
                .collect();
            let buffers: Vec<_> = guard
                .buffers
                .iter()
                .filter(|(_, e)| e.tenant_id == tenant_id)
                .map(|(h, e)| (h.clone(), e.backend_ref))
                .collect();
            let dmas: Vec<_> = guard
                .dmas
                .iter()
                .filter(|(_, e)| e.tenant_id == tenant_id)
                .map(|(h, e)| (h.clone(), e.backend_ref))
                .collect();
            for h in &overlays {
                guard.overlays.remove(h);
            }
            for (h, _) in &mmios {
                guard.mmios.remove(h);
            }
            for (h, _) in &buffers {
                guard.buffers.remove(h);
            }
            for (h, _) in &dmas {
                guard.dmas.remove(h);
            }
            (overlays, mmios, buffers, dmas)
        };

        for (_, backend_ref) in mmios {
            let _ = self.hardware.destroy_mmio(backend_ref).await;
        }
        for (_, backend_ref) in buffers {
            let _ = self.hardware.free_buffer(backend_ref).await;
        }
        for (_, backend_ref) in dmas {
            let _ = self.hardware.destroy_dma(backend_ref).await;
        }
        let _ = overlays;

        self.tenants.reset_tenant_resources(tenant_id).await;
        tracing::info!(tenant_id, "cleaned up all tenant resources");
    }

    fn require_owner(&self, caller: &str, owner: &str) -> HvResult<()> {
        if caller != owner {
            return Err(HvError::PermissionDenied(format!("resource not owned by tenant {caller}")));
        }
        Ok(())
    }
}

fn basename(path: &str) -> &str {
    std::path::Path::new(path)
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigRegistry, TenantConfig};
    use crate::hardware::backend::MockHardwareBackend;
    use std::collections::HashSet;

    async fn test_registry() -> ResourceRegistry {
        let config_registry = Arc::new(ConfigRegistry::new(
            "/tmp/fpga-hv-resources-test.yaml".into(),
            vec![TenantConfig {
                tenant_id: "tenant1".into(),
                uid: 1001,
                gid: 1001,
                api_key: "key".into(),
                max_overlays: 2,
                max_buffers: 4,
                max_memory_mb: 16,
                allowed_bitstreams: HashSet::from(["conv2d.bit".to_string()]),
                allowed_address_ranges: vec![(0xA000_0000, 0x1_0000)],
                allowed_pr_zones: HashSet::from([0, 1]),
            }],
        ));
        let tenants = Arc::new(TenantManager::new(config_registry, 3600));
        let pr_zones = Arc::new(PrZoneAllocator::new(2));
        let hardware = Arc::new(
            HardwareThread::spawn(Box::new(MockHardwareBackend::default()), "/nonexistent".into(), 2, 5).unwrap(),
        );
        let hv_config = Arc::new(HypervisorConfig {
            socket_dir: "/tmp".into(),
            bitstream_dir: "/tmp".into(),
            config_file: "/tmp/fpga-hv-resources-test.yaml".into(),
            debug_mock_hardware: true,
            num_pr_zones: 2,
            session_ttl_secs: 3600,
            hw_timeout_secs: 5,
        });
        let (events_tx, _) = broadcast::channel(16);
        ResourceRegistry::new(hardware, pr_zones, tenants, hv_config, events_tx)
    }

    #[tokio::test]
    async fn overlay_then_mmio_lifecycle() {
        let registry = test_registry().await;
        let (overlay, ip_cores) = registry.load_overlay("tenant1", "conv2d.bit").await.unwrap();
        assert_eq!(ip_cores.len(), 1);
        let mmio = registry.create_mmio("tenant1", 0xA000_0000, 0x1000).await.unwrap();
        registry.mmio_write("tenant1", &mmio, 0x4, 42).await.unwrap();
        assert_eq!(registry.mmio_read("tenant1", &mmio, 0x4).await.unwrap(), 42);
        registry.destroy_mmio("tenant1", &mmio).await.unwrap();
        registry.unload_overlay("tenant1", &overlay).await.unwrap();
    }

    #[tokio::test]
    async fn mmio_outside_allowed_range_is_denied() {
        let registry = test_registry().await;
        let (_overlay, _) = registry.load_overlay("tenant1", "conv2d.bit").await.unwrap();
        let err = registry.create_mmio("tenant1", 0xB000_0000, 0x1000).await.unwrap_err();
        assert!(matches!(err, HvError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn mmio_requires_owned_overlay_covering_the_range() {
        let registry = test_registry().await;
        // no overlay loaded yet, so even an otherwise-allowed range has no owning zone
        let err = registry.create_mmio("tenant1", 0xA000_0000, 0x1000).await.unwrap_err();
        assert!(matches!(err, HvError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn cross_tenant_access_is_denied() {
        let registry = test_registry().await;
        let (overlay, _) = registry.load_overlay("tenant1", "conv2d.bit").await.unwrap();
        let mmio = registry.create_mmio("tenant1", 0xA000_0000, 0x1000).await.unwrap();
        let err = registry.mmio_read("intruder", &mmio, 0).await.unwrap_err();
        assert!(matches!(err, HvError::PermissionDenied(_)));
        let _ = overlay;
    }

    #[tokio::test]
    async fn cleanup_releases_zone_for_reuse() {
        let registry = test_registry().await;
        let (overlay1, _) = registry.load_overlay("tenant1", "conv2d.bit").await.unwrap();
        registry.cleanup_tenant_resources("tenant1").await;
        let _ = overlay1;
        // zone should be free again
        let (overlay2, _) = registry.load_overlay("tenant1", "conv2d.bit").await.unwrap();
        assert!(registry.unload_overlay("tenant1", &overlay2).await.is_ok());
    }

    #[tokio::test]
    async fn dma_lifecycle_reports_completed_status() {
        let registry = test_registry().await;
        let (overlay, _) = registry.load_overlay("tenant1", "conv2d.bit").await.unwrap();
        let buffer = registry.allocate_buffer("tenant1", 4096).await.unwrap();
        let dma = registry.create_dma("tenant1", "conv_input").await.unwrap();
        let transfer_id = registry
            .dma_transfer("tenant1", &dma, &buffer, DmaDirection::HostToDevice, 1024)
            .await
            .unwrap();
        let status = registry.get_dma_status("tenant1", &dma, &transfer_id).await.unwrap();
        assert!(matches!(status.state, DmaTransferState::Complete));
        assert_eq!(status.bytes_transferred, 1024);
        registry.destroy_dma("tenant1", &dma).await.unwrap();
        registry.unload_overlay("tenant1", &overlay).await.unwrap();
    }

    #[tokio::test]
    async fn dma_without_owned_zone_is_rejected() {
        let registry = test_registry().await;
        let err = registry.create_dma("tenant1", "conv_input").await.unwrap_err();
        assert!(matches!(err, HvError::InvalidArgument(_)));
    }
}
