//! Tenant/Session Manager (C2).
//!
//! Authenticates `(tenant_id, key)` against the Configuration Registry and
//! mints session tokens of the form `tenantId:128-bit-random-hex`. Quota and
//! authorization predicates are pure inspections of tenant state performed
//! under the registry lock.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use tokio::sync::RwLock;

use crate::config::ConfigRegistry;
use crate::error::{HvError, HvResult};

#[derive(Debug, Clone)]
pub struct Session {
    pub tenant_id: String,
    pub token: String,
    pub created_at: u64,
    pub expires_at: u64,
}

impl Session {
    fn is_valid(&self, now: u64) -> bool {
        now <= self.expires_at
    }
}

#[derive(Debug, Default)]
struct TenantResources {
    overlays: HashSet<String>,
    mmio_handles: HashSet<String>,
    buffer_handles: HashSet<String>,
    dma_handles: HashSet<String>,
    total_memory_bytes: u64,
}

struct Inner {
    sessions: HashMap<String, Session>,
    resources: HashMap<String, TenantResources>,
}

/// The Tenant/Session Manager (C2).
pub struct TenantManager {
    config: Arc<ConfigRegistry>,
    state: RwLock<Inner>,
    session_ttl_secs: u64,
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl TenantManager {
    pub fn new(config: Arc<ConfigRegistry>, session_ttl_secs: u64) -> Self {
        Self {
            config,
            state: RwLock::new(Inner {
                sessions: HashMap::new(),
                resources: HashMap::new(),
            }),
            session_ttl_secs,
        }
    }

    /// Generates `tenantId:128-bit-random-hex`.
    fn mint_token(tenant_id: &str) -> String {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
        format!("{tenant_id}:{hex}")
    }

    pub async fn authenticate(&self, tenant_id: &str, api_key: &str) -> HvResult<Session> {
        let tenant = self
            .config
            .get(tenant_id)
            .await
            .ok_or_else(|| HvError::Unauthenticated(format!("unknown tenant {tenant_id}")))?;

        if tenant.api_key != api_key {
            return Err(HvError::Unauthenticated("invalid credentials".to_string()));
        }

        let now = now_secs();
        let session = Session {
            tenant_id: tenant_id.to_string(),
            token: Self::mint_token(tenant_id),
            created_at: now,
            expires_at: now + self.session_ttl_secs,
        };

        let mut guard = self.state.write().await;
        guard.sessions.insert(session.token.clone(), session.clone());
        guard
            .resources
            .entry(tenant_id.to_string())
            .or_insert_with(TenantResources::default);

        Ok(session)
    }

    /// Validates a token, lazily purging it if expired.
    pub async fn validate_token(&self, token: &str) -> HvResult<String> {
        let mut guard = self.state.write().await;
        let now = now_secs();
        match guard.sessions.get(token) {
            Some(session) if session.is_valid(now) => Ok(session.tenant_id.clone()),
            Some(_) => {
                guard.sessions.remove(token);
                Err(HvError::Unauthenticated("session expired".to_string()))
            }
            None => Err(HvError::Unauthenticated("unknown session token".to_string())),
        }
    }

    pub async fn can_allocate_overlay(&self, tenant_id: &str) -> HvResult<bool> {
        let tenant = self.require_tenant(tenant_id).await?;
        let guard = self.state.read().await;
        let used = guard
            .resources
            .get(tenant_id)
            .map(|r| r.overlays.len())
            .unwrap_or(0);
        Ok(used < tenant.max_overlays)
    }

    pub async fn can_allocate_buffer(&self, tenant_id: &str, size: u64) -> HvResult<bool> {
        let tenant = self.require_tenant(tenant_id).await?;
        let guard = self.state.read().await;
        let resources = guard.resources.get(tenant_id);
        let count = resources.map(|r| r.buffer_handles.len()).unwrap_or(0);
        if count >= tenant.max_buffers {
            return Ok(false);
        }
        let used_bytes = resources.map(|r| r.total_memory_bytes).unwrap_or(0);
        Ok(used_bytes + size <= tenant.max_memory_bytes())
    }

    pub async fn is_bitstream_allowed(&self, tenant_id: &str, basename: &str) -> HvResult<bool> {
        let tenant = self.require_tenant(tenant_id).await?;
        Ok(tenant.is_bitstream_allowed(basename))
    }

    pub async fn is_address_allowed(&self, tenant_id: &str, addr: u64, size: u64) -> HvResult<bool> {
        let tenant = self.require_tenant(tenant_id).await?;
        Ok(tenant.is_address_allowed(addr, size))
    }

    pub async fn is_pr_zone_allowed(&self, tenant_id: &str, zone_id: u32) -> HvResult<bool> {
        let tenant = self.require_tenant(tenant_id).await?;
        Ok(tenant.is_pr_zone_allowed(zone_id))
    }

    /// Looks up a tenant's full configuration (address ranges, zone
    /// allow-list, etc.) for callers that need more than one predicate.
    pub async fn get_tenant_config(&self, tenant_id: &str) -> HvResult<crate::config::TenantConfig> {
        self.require_tenant(tenant_id).await
    }

    async fn require_tenant(&self, tenant_id: &str) -> HvResult<crate::config::TenantConfig> {
        self.config
            .get(tenant_id)
            .await
            .ok_or_else(|| HvError::PermissionDenied(format!("unknown tenant {tenant_id}")))
    }

    // -- per-tenant handle bookkeeping, mirrored by the Resource Registry --

    pub async fn track_overlay(&self, tenant_id: &str, handle: &str) {
        let mut guard = self.state.write().await;
        guard
            .resources
            .entry(tenant_id.to_string())
            .or_default()
            .overlays
            .insert(handle.to_string());
    }

    pub async fn track_mmio(&self, tenant_id: &str, handle: &str) {
        let mut guard = self.state.write().await;
        guard
            .resources
            .entry(tenant_id.to_string())
            .or_default()
            .mmio_handles
            .insert(handle.to_string());
    }

    pub async fn track_buffer(&self, tenant_id: &str, handle: &str, size: u64) {
        let mut guard = self.state.write().await;
        let entry = guard.resources.entry(tenant_id.to_string()).or_default();
        entry.buffer_handles.insert(handle.to_string());
        entry.total_memory_bytes += size;
    }

    pub async fn track_dma(&self, tenant_id: &str, handle: &str) {
        let mut guard = self.state.write().await;
        guard
            .resources
            .entry(tenant_id.to_string())
            .or_default()
            .dma_handles
            .insert(handle.to_string());
    }

    pub async fn untrack(&self, tenant_id: &str, kind: ResourceKind, handle: &str, bytes: u64) {
        let mut guard = self.state.write().await;
        if let Some(entry) = guard.resources.get_mut(tenant_id) {
            match kind {
                ResourceKind::Overlay => {
                    entry.overlays.remove(handle);
                }
                ResourceKind::Mmio => {
                    entry.mmio_handles.remove(handle);
                }
                ResourceKind::Buffer => {
                    entry.buffer_handles.remove(handle);
                    entry.total_memory_bytes = entry.total_memory_bytes.saturating_sub(bytes);
                }
                ResourceKind::Dma => {
                    entry.dma_handles.remove(handle);
                }
            }
        }
    }

    /// Resets tracked resource bookkeeping for a tenant after a full cleanup.
    pub async fn reset_tenant_resources(&self, tenant_id: &str) {
        let mut guard = self.state.write().await;
        guard.resources.insert(tenant_id.to_string(), TenantResources::default());
    }
}

#[derive(Debug, Clone, Copy)]
pub enum ResourceKind {
    Overlay,
    Mmio,
    Buffer,
    Dma,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TenantConfig;
    use std::collections::HashSet as Set;

    async fn manager_with_tenant() -> (Arc<ConfigRegistry>, TenantManager) {
        let config = Arc::new(ConfigRegistry::new(
            "/tmp/fpga-hv-test-config.yaml".into(),
            vec![TenantConfig {
                tenant_id: "tenant1".into(),
                uid: 1001,
                gid: 1001,
                api_key: "test_key_1".into(),
                max_overlays: 1,
                max_buffers: 2,
                max_memory_mb: 1,
                allowed_bitstreams: Set::from(["base.bit".to_string()]),
                allowed_address_ranges: vec![(0xA000_0000, 0x1_0000)],
                allowed_pr_zones: Set::from([0]),
            }],
        ));
        let mgr = TenantManager::new(config.clone(), 3600);
        (config, mgr)
    }

    #[tokio::test]
    async fn authenticate_then_validate_round_trips() {
        let (_cfg, mgr) = manager_with_tenant().await;
        let session = mgr.authenticate("tenant1", "test_key_1").await.unwrap();
        let tenant_id = mgr.validate_token(&session.token).await.unwrap();
        assert_eq!(tenant_id, "tenant1");
    }

    #[tokio::test]
    async fn wrong_key_is_unauthenticated() {
        let (_cfg, mgr) = manager_with_tenant().await;
        let err = mgr.authenticate("tenant1", "wrong").await.unwrap_err();
        assert!(matches!(err, HvError::Unauthenticated(_)));
    }

    #[tokio::test]
    async fn empty_allow_list_denies_all() {
        let (_cfg, mgr) = manager_with_tenant().await;
        assert!(mgr.is_bitstream_allowed("tenant1", "base.bit").await.unwrap());
        assert!(!mgr.is_bitstream_allowed("tenant1", "other.bit").await.unwrap());
    }

    #[tokio::test]
    async fn buffer_quota_enforced_by_count_and_bytes() {
        let (_cfg, mgr) = manager_with_tenant().await;
        assert!(mgr.can_allocate_buffer("tenant1", 1024).await.unwrap());
        mgr.track_buffer("tenant1", "buf_1", 1024 * 1024).await;
        // exceeds max_memory_mb=1
        assert!(!mgr.can_allocate_buffer("tenant1", 1).await.unwrap());
    }
}
