//! Configuration Registry (C1).
//!
//! Holds `tenant_id -> TenantConfig`, persists to a YAML sibling file with
//! temp-file-then-rename atomicity, and notifies registered observers on
//! every mutation. Observer failures are logged and swallowed — they must
//! never roll back the mutation they're reacting to.

mod persist;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{error, info};
use utoipa::ToSchema;

pub use persist::PersistedDocument;

/// A `(base, length)` window in the physical address space.
pub type AddressRange = (u64, u64);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TenantConfig {
    pub tenant_id: String,
    pub uid: u32,
    pub gid: u32,
    pub api_key: String,
    pub max_overlays: usize,
    pub max_buffers: usize,
    pub max_memory_mb: u64,
    #[serde(default)]
    pub allowed_bitstreams: HashSet<String>,
    #[serde(default)]
    pub allowed_address_ranges: Vec<AddressRange>,
    #[serde(default)]
    pub allowed_pr_zones: HashSet<u32>,
}

impl TenantConfig {
    pub fn max_memory_bytes(&self) -> u64 {
        self.max_memory_mb * 1024 * 1024
    }

    /// `(addr, size)` is allowed iff some allowed range `(b, l)` satisfies
    /// `addr >= b && addr + size <= b + l`. An empty list denies everything —
    /// the safer reading, adopted over the historical "allow all" variant.
    pub fn is_address_allowed(&self, addr: u64, size: u64) -> bool {
        if self.allowed_address_ranges.is_empty() {
            return false;
        }
        self.allowed_address_ranges
            .iter()
            .any(|(base, len)| addr >= *base && addr.saturating_add(size) <= base.saturating_add(*len))
    }

    /// Same empty-deny-all rule for bitstreams.
    pub fn is_bitstream_allowed(&self, basename: &str) -> bool {
        if self.allowed_bitstreams.is_empty() {
            return false;
        }
        self.allowed_bitstreams.contains(basename)
    }

    /// Same empty-deny-all rule for PR zones.
    pub fn is_pr_zone_allowed(&self, zone_id: u32) -> bool {
        if self.allowed_pr_zones.is_empty() {
            return false;
        }
        self.allowed_pr_zones.contains(&zone_id)
    }
}

/// Process-global settings not tied to any one tenant.
#[derive(Debug, Clone)]
pub struct HypervisorConfig {
    pub socket_dir: std::path::PathBuf,
    pub bitstream_dir: std::path::PathBuf,
    pub config_file: std::path::PathBuf,
    pub debug_mock_hardware: bool,
    pub num_pr_zones: u32,
    pub session_ttl_secs: u64,
    pub hw_timeout_secs: u64,
}

impl HypervisorConfig {
    pub fn from_env() -> Self {
        Self {
            socket_dir: std::env::var("SOCKET_DIR")
                .unwrap_or_else(|_| "/var/run/pynq".to_string())
                .into(),
            bitstream_dir: std::env::var("BITSTREAM_DIR")
                .unwrap_or_else(|_| "/opt/bitstreams".to_string())
                .into(),
            config_file: std::env::var("HV_CONFIG_FILE")
                .unwrap_or_else(|_| "/etc/pynq/config.yaml".to_string())
                .into(),
            debug_mock_hardware: std::env::var("HV_DEBUG")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
            num_pr_zones: std::env::var("HV_NUM_PR_ZONES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2),
            session_ttl_secs: std::env::var("HV_SESSION_TTL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3600),
            hw_timeout_secs: std::env::var("HV_HW_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        }
    }

    /// Resolve a bitstream path against `BITSTREAM_DIR` unless already
    /// absolute — the requested path must always be honored, never
    /// substituted for a hardcoded debug artifact.
    pub fn resolve_bitstream(&self, requested: &str) -> std::path::PathBuf {
        let p = std::path::Path::new(requested);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.bitstream_dir.join(p)
        }
    }
}

#[derive(Debug, Clone)]
pub enum ConfigEvent {
    TenantAdded(String),
    TenantRemoved(String),
    TenantUpdated(String),
    BitstreamAdded(String, String),
}

pub type ConfigObserver = Arc<dyn Fn(ConfigEvent) + Send + Sync>;

/// Partial update applied by the management RPC surface.
#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TenantUpdate {
    pub api_key: Option<String>,
    pub max_overlays: Option<usize>,
    pub max_buffers: Option<usize>,
    pub max_memory_mb: Option<u64>,
    #[serde(default)]
    pub add_bitstreams: Vec<String>,
    #[serde(default)]
    pub remove_bitstreams: Vec<String>,
}

struct Inner {
    tenants: HashMap<String, TenantConfig>,
    observers: Vec<ConfigObserver>,
}

/// The Configuration Registry (C1). One instance, process-wide.
pub struct ConfigRegistry {
    state: RwLock<Inner>,
    config_file: std::path::PathBuf,
}

impl ConfigRegistry {
    pub fn new(config_file: std::path::PathBuf, initial: Vec<TenantConfig>) -> Self {
        let tenants = initial.into_iter().map(|t| (t.tenant_id.clone(), t)).collect();
        Self {
            state: RwLock::new(Inner {
                tenants,
                observers: Vec::new(),
            }),
            config_file,
        }
    }

    pub async fn load(config_file: std::path::PathBuf) -> anyhow::Result<Self> {
        let initial = if config_file.exists() {
            PersistedDocument::load(&config_file)?.tenants
        } else {
            Vec::new()
        };
        Ok(Self::new(config_file, initial))
    }

    pub fn register_observer(&self, observer: ConfigObserver) {
        // Synchronous accessor used only at startup, before the async
        // runtime's lock contention matters; a blocking write is fine here.
        if let Ok(mut guard) = self.state.try_write() {
            guard.observers.push(observer);
        }
    }

    pub async fn get(&self, tenant_id: &str) -> Option<TenantConfig> {
        self.state.read().await.tenants.get(tenant_id).cloned()
    }

    pub async fn list(&self) -> Vec<TenantConfig> {
        self.state.read().await.tenants.values().cloned().collect()
    }

    pub async fn add_tenant(&self, tenant: TenantConfig) -> anyhow::Result<bool> {
        let mut guard = self.state.write().await;
        if guard.tenants.contains_key(&tenant.tenant_id) {
            return Ok(false);
        }
        let id = tenant.tenant_id.clone();
        guard.tenants.insert(id.clone(), tenant);
        self.notify(&guard.observers, ConfigEvent::TenantAdded(id.clone()));
        self.persist(&guard.tenants)?;
        info!(tenant_id = %id, "added tenant");
        Ok(true)
    }

    pub async fn update_tenant(&self, tenant_id: &str, update: TenantUpdate) -> anyhow::Result<bool> {
        let mut guard = self.state.write().await;
        let Some(tenant) = guard.tenants.get_mut(tenant_id) else {
            return Ok(false);
        };
        if let Some(key) = update.api_key {
            tenant.api_key = key;
        }
        if let Some(v) = update.max_overlays {
            tenant.max_overlays = v;
        }
        if let Some(v) = update.max_buffers {
            tenant.max_buffers = v;
        }
        if let Some(v) = update.max_memory_mb {
            tenant.max_memory_mb = v;
        }
        for b in update.add_bitstreams {
            tenant.allowed_bitstreams.insert(b);
        }
        for b in &update.remove_bitstreams {
            tenant.allowed_bitstreams.remove(b);
        }
        self.notify(&guard.observers, ConfigEvent::TenantUpdated(tenant_id.to_string()));
        self.persist(&guard.tenants)?;
        info!(tenant_id, "updated tenant");
        Ok(true)
    }

    pub async fn remove_tenant(&self, tenant_id: &str) -> anyhow::Result<bool> {
        let mut guard = self.state.write().await;
        if guard.tenants.remove(tenant_id).is_none() {
            return Ok(false);
        }
        self.notify(&guard.observers, ConfigEvent::TenantRemoved(tenant_id.to_string()));
        self.persist(&guard.tenants)?;
        info!(tenant_id, "removed tenant");
        Ok(true)
    }

    /// Re-reads the persisted YAML document and swaps it in for the
    /// in-memory tenant map, firing observers for whatever actually
    /// changed. A no-op (but not an error) if the file doesn't exist.
    pub async fn reload(&self) -> anyhow::Result<()> {
        if !self.config_file.exists() {
            return Ok(());
        }
        let reloaded = PersistedDocument::load(&self.config_file)?.tenants;
        let new_tenants: HashMap<String, TenantConfig> =
            reloaded.into_iter().map(|t| (t.tenant_id.clone(), t)).collect();

        let mut guard = self.state.write().await;
        let mut events = Vec::new();
        for id in guard.tenants.keys() {
            if !new_tenants.contains_key(id) {
                events.push(ConfigEvent::TenantRemoved(id.clone()));
            }
        }
        for (id, tenant) in &new_tenants {
            match guard.tenants.get(id) {
                None => events.push(ConfigEvent::TenantAdded(id.clone())),
                Some(existing) if existing != tenant => {
                    events.push(ConfigEvent::TenantUpdated(id.clone()))
                }
                Some(_) => {}
            }
        }

        guard.tenants = new_tenants;
        for event in events {
            self.notify(&guard.observers, event);
        }
        info!(config_file = %self.config_file.display(), "configuration reloaded from disk");
        Ok(())
    }

    pub async fn add_allowed_bitstream(&self, tenant_id: &str, bitstream: String) -> anyhow::Result<bool> {
        let mut guard = self.state.write().await;
        let Some(tenant) = guard.tenants.get_mut(tenant_id) else {
            return Ok(false);
        };
        tenant.allowed_bitstreams.insert(bitstream.clone());
        self.notify(
            &guard.observers,
            ConfigEvent::BitstreamAdded(tenant_id.to_string(), bitstream),
        );
        self.persist(&guard.tenants)?;
        Ok(true)
    }

    fn notify(&self, observers: &[ConfigObserver], event: ConfigEvent) {
        for observer in observers {
            // Observer failures are advisory; a panic-free callback is the
            // only contract, so we don't catch_unwind here — callers are
            // expected not to panic. We do isolate errors returned via
            // logging-only side effects (the callback signature is `Fn`,
            // not `Result`, by design: no return to swallow).
            observer(event.clone());
        }
    }

    fn persist(&self, tenants: &HashMap<String, TenantConfig>) -> anyhow::Result<()> {
        let doc = PersistedDocument {
            tenants: tenants.values().cloned().collect(),
        };
        match doc.save(&self.config_file) {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(error = %e, "failed to persist configuration");
                Err(e)
            }
        }
    }
}
