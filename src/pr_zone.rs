//! PR-Zone Allocator (C3).
//!
//! Tracks which of the `N` partial-reconfiguration zones holds which
//! tenant's bitstream, with an affinity hint so a revisited bitstream
//! prefers the zone it last occupied (cuts reconfiguration churn).
//! Releasing a zone only frees the logical slot — it does not itself
//! decouple or reprogram the fabric; the next allocation triggers that.

use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::error::{HvError, HvResult};

#[derive(Debug, Clone)]
pub struct ZoneOccupant {
    pub tenant_id: String,
    pub bitstream_path: String,
    pub overlay_handle: String,
}

#[derive(Debug, Clone, Default)]
struct Zone {
    occupant: Option<ZoneOccupant>,
}

struct Inner {
    zones: Vec<Zone>,
    /// bitstream basename -> zone index last used for it (cache affinity).
    affinity: HashMap<String, u32>,
}

/// The PR-Zone Allocator (C3).
pub struct PrZoneAllocator {
    state: Mutex<Inner>,
}

impl PrZoneAllocator {
    pub fn new(num_zones: u32) -> Self {
        Self {
            state: Mutex::new(Inner {
                zones: vec![Zone::default(); num_zones as usize],
                affinity: HashMap::new(),
            }),
        }
    }

    /// Picks a zone for `bitstream_path`, preferring affinity, failing with
    /// `ResourceExhausted` if none is free. Does not mark it allocated —
    /// callers finalize with `allocate_zone` once C4's reconfiguration
    /// succeeds.
    pub async fn find_best_zone_for_bitstream(
        &self,
        bitstream_path: &str,
        allowed_bitstreams_empty_means_deny: bool,
        is_allowed: bool,
    ) -> HvResult<u32> {
        let basename = std::path::Path::new(bitstream_path)
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| bitstream_path.to_string());

        if allowed_bitstreams_empty_means_deny && !is_allowed {
            return Err(HvError::PermissionDenied(format!(
                "bitstream {basename} not in tenant allow-list"
            )));
        }

        let guard = self.state.lock().await;
        if let Some(&preferred) = guard.affinity.get(&basename) {
            if guard.zones[preferred as usize].occupant.is_none() {
                return Ok(preferred);
            }
        }
        for (idx, zone) in guard.zones.iter().enumerate() {
            if zone.occupant.is_none() {
                return Ok(idx as u32);
            }
        }
        Err(HvError::ResourceExhausted("no free PR zone".to_string()))
    }

    pub async fn allocate_zone(
        &self,
        zone_id: u32,
        tenant_id: &str,
        bitstream_path: &str,
        overlay_handle: &str,
    ) -> HvResult<()> {
        let mut guard = self.state.lock().await;
        let zone = guard
            .zones
            .get_mut(zone_id as usize)
            .ok_or_else(|| HvError::InvalidArgument(format!("unknown PR zone {zone_id}")))?;
        if zone.occupant.is_some() {
            return Err(HvError::ReconfigError(format!("zone {zone_id} already occupied")));
        }
        zone.occupant = Some(ZoneOccupant {
            tenant_id: tenant_id.to_string(),
            bitstream_path: bitstream_path.to_string(),
            overlay_handle: overlay_handle.to_string(),
        });
        let basename = std::path::Path::new(bitstream_path)
            .file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| bitstream_path.to_string());
        guard.affinity.insert(basename, zone_id);
        Ok(())
    }

    pub async fn release_zone_by_handle(&self, overlay_handle: &str) {
        let mut guard = self.state.lock().await;
        for zone in guard.zones.iter_mut() {
            if zone.occupant.as_ref().map(|o| o.overlay_handle.as_str()) == Some(overlay_handle) {
                zone.occupant = None;
                return;
            }
        }
        // Idempotent: releasing an already-free/unknown handle is a no-op.
    }

    pub async fn release_all_tenant_zones(&self, tenant_id: &str) -> Vec<u32> {
        let mut guard = self.state.lock().await;
        let mut released = Vec::new();
        for (idx, zone) in guard.zones.iter_mut().enumerate() {
            if zone.occupant.as_ref().map(|o| o.tenant_id.as_str()) == Some(tenant_id) {
                zone.occupant = None;
                released.push(idx as u32);
            }
        }
        released
    }

    pub async fn get_tenant_zones(&self, tenant_id: &str) -> Vec<u32> {
        let guard = self.state.lock().await;
        guard
            .zones
            .iter()
            .enumerate()
            .filter(|(_, z)| z.occupant.as_ref().map(|o| o.tenant_id.as_str()) == Some(tenant_id))
            .map(|(idx, _)| idx as u32)
            .collect()
    }

    pub async fn occupant(&self, zone_id: u32) -> Option<ZoneOccupant> {
        let guard = self.state.lock().await;
        guard.zones.get(zone_id as usize).and_then(|z| z.occupant.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn exhaustion_then_release_frees_a_slot() {
        let allocator = PrZoneAllocator::new(2);
        let z0 = allocator
            .find_best_zone_for_bitstream("base.bit", true, true)
            .await
            .unwrap();
        allocator.allocate_zone(z0, "tenant1", "base.bit", "overlay_1").await.unwrap();
        let z1 = allocator
            .find_best_zone_for_bitstream("conv2d.bit", true, true)
            .await
            .unwrap();
        allocator.allocate_zone(z1, "tenant1", "conv2d.bit", "overlay_2").await.unwrap();

        let err = allocator
            .find_best_zone_for_bitstream("third.bit", true, true)
            .await
            .unwrap_err();
        assert!(matches!(err, HvError::ResourceExhausted(_)));

        allocator.release_zone_by_handle("overlay_1").await;
        let z2 = allocator
            .find_best_zone_for_bitstream("third.bit", true, true)
            .await
            .unwrap();
        assert_eq!(z2, z0);
    }

    #[tokio::test]
    async fn affinity_prefers_previous_zone() {
        let allocator = PrZoneAllocator::new(2);
        let z0 = allocator
            .find_best_zone_for_bitstream("base.bit", true, true)
            .await
            .unwrap();
        allocator.allocate_zone(z0, "tenant1", "base.bit", "overlay_1").await.unwrap();
        allocator.release_zone_by_handle("overlay_1").await;

        let picked = allocator
            .find_best_zone_for_bitstream("base.bit", true, true)
            .await
            .unwrap();
        assert_eq!(picked, z0);
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let allocator = PrZoneAllocator::new(1);
        allocator.release_zone_by_handle("missing").await;
        allocator.release_zone_by_handle("missing").await;
    }
}
