//! Fast MMIO Path (C6).
//!
//! A raw framed protocol over a Unix-domain socket, separate from the
//! Control RPC socket, for tenants that need tight register-poke loops
//! without per-call JSON/HTTP overhead. Each connection authenticates once
//! with a 16-byte token, then issues a stream of single-byte opcodes. A
//! `(handle, tenant_id) -> BackendRef` cache lets most operations skip the
//! Resource Registry's ownership/bounds checks entirely after the first
//! successful call on that handle; any failure invalidates the cache entry
//! so the next attempt re-verifies from scratch.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::RwLock;

use crate::hardware::BackendRef;
use crate::resources::ResourceRegistry;

const OP_WRITE: u8 = 0x01;
const OP_READ: u8 = 0x02;
const OP_WRITE_ACK: u8 = 0x06;
const OP_BATCH_WRITE: u8 = 0x10;

const HANDLE_FIELD_LEN: usize = 32;

/// Token registry shared between the Control RPC surface (which mints
/// tokens on `authenticate`) and this fast path (which only ever reads it).
#[derive(Clone, Default)]
pub struct FastMmioTokens {
    inner: Arc<RwLock<HashMap<[u8; 16], String>>>,
}

impl FastMmioTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, token: [u8; 16], tenant_id: String) {
        self.inner.write().await.insert(token, tenant_id);
    }

    pub async fn revoke(&self, token: &[u8; 16]) {
        self.inner.write().await.remove(token);
    }

    async fn resolve(&self, token: &[u8; 16]) -> Option<String> {
        self.inner.read().await.get(token).cloned()
    }
}

pub struct FastMmioServer {
    socket_path: std::path::PathBuf,
    resources: Arc<ResourceRegistry>,
    tokens: FastMmioTokens,
}

impl FastMmioServer {
    pub fn new(socket_path: std::path::PathBuf, resources: Arc<ResourceRegistry>, tokens: FastMmioTokens) -> Self {
        Self { socket_path, resources, tokens }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)?;
        }
        let listener = UnixListener::bind(&self.socket_path)?;
        nix::sys::stat::fchmodat(
            None,
            &self.socket_path,
            nix::sys::stat::Mode::from_bits_truncate(0o666),
            nix::sys::stat::FchmodatFlags::FollowSymlink,
        )?;
        tracing::info!(path = %self.socket_path.display(), "fast MMIO path listening");

        loop {
            let (conn, _) = listener.accept().await?;
            let resources = self.resources.clone();
            let tokens = self.tokens.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(conn, resources, tokens).await {
                    tracing::debug!(error = %e, "fast MMIO connection closed");
                }
            });
        }
    }
}

async fn handle_connection(
    mut conn: UnixStream,
    resources: Arc<ResourceRegistry>,
    tokens: FastMmioTokens,
) -> anyhow::Result<()> {
    let mut token = [0u8; 16];
    conn.read_exact(&mut token).await?;

    let Some(tenant_id) = tokens.resolve(&token).await else {
        conn.write_all(&[0x00]).await?;
        return Ok(());
    };
    conn.write_all(&[0x01]).await?;

    // Per-connection cache, since this connection is pinned to one tenant.
    let mut cache: HashMap<[u8; HANDLE_FIELD_LEN], (BackendRef, u64)> = HashMap::new();

    loop {
        let mut op = [0u8; 1];
        if conn.read_exact(&mut op).await.is_err() {
            return Ok(());
        }

        match op[0] {
            OP_WRITE => {
                let Some((handle, offset, value)) = read_write_frame(&mut conn).await? else {
                    return Ok(());
                };
                let _ = do_write(&resources, &tenant_id, &mut cache, &handle, offset, value).await;
            }
            OP_WRITE_ACK => {
                let Some((handle, offset, value)) = read_write_frame(&mut conn).await? else {
                    return Ok(());
                };
                let ok = do_write(&resources, &tenant_id, &mut cache, &handle, offset, value).await.is_ok();
                conn.write_all(&[if ok { 0x01 } else { 0x00 }]).await?;
            }
            OP_READ => {
                let mut buf = [0u8; HANDLE_FIELD_LEN + 4];
                if conn.read_exact(&mut buf).await.is_err() {
                    return Ok(());
                }
                let handle: [u8; HANDLE_FIELD_LEN] = buf[..HANDLE_FIELD_LEN].try_into().unwrap();
                let offset = u32::from_be_bytes(buf[HANDLE_FIELD_LEN..].try_into().unwrap()) as u64;
                match do_read(&resources, &tenant_id, &mut cache, &handle, offset).await {
                    Ok(value) => conn.write_all(&value.to_be_bytes()).await?,
                    Err(_) => conn.write_all(&[0u8; 4]).await?,
                }
            }
            OP_BATCH_WRITE => {
                let mut count_buf = [0u8; 2];
                if conn.read_exact(&mut count_buf).await.is_err() {
                    return Ok(());
                }
                let count = u16::from_be_bytes(count_buf);
                let mut success_count: u16 = 0;
                for _ in 0..count {
                    let Some((handle, offset, value)) = read_write_frame(&mut conn).await? else {
                        return Ok(());
                    };
                    if do_write(&resources, &tenant_id, &mut cache, &handle, offset, value).await.is_ok() {
                        success_count += 1;
                    }
                }
                conn.write_all(&success_count.to_be_bytes()).await?;
            }
            _ => return Ok(()),
        }
    }
}

async fn read_write_frame(
    conn: &mut UnixStream,
) -> anyhow::Result<Option<([u8; HANDLE_FIELD_LEN], u64, u32)>> {
    let mut buf = [0u8; HANDLE_FIELD_LEN + 8];
    if conn.read_exact(&mut buf).await.is_err() {
        return Ok(None);
    }
    let handle: [u8; HANDLE_FIELD_LEN] = buf[..HANDLE_FIELD_LEN].try_into().unwrap();
    let offset = u32::from_be_bytes(buf[HANDLE_FIELD_LEN..HANDLE_FIELD_LEN + 4].try_into().unwrap()) as u64;
    let value = u32::from_be_bytes(buf[HANDLE_FIELD_LEN + 4..].try_into().unwrap());
    Ok(Some((handle, offset, value)))
}

fn handle_str(handle: &[u8; HANDLE_FIELD_LEN]) -> String {
    String::from_utf8_lossy(handle).trim_end_matches(['\0', ' ']).to_string()
}

/// Ownership and ranges are re-verified once per handle (on a cache miss)
/// through the Resource Registry; subsequent operations on a cached handle
/// go straight to the hardware thread, skipping the registry lock. Any
/// hardware-level error invalidates the cache entry so the next call
/// re-verifies from scratch rather than trusting a possibly-stale mapping.
async fn do_write(
    resources: &ResourceRegistry,
    tenant_id: &str,
    cache: &mut HashMap<[u8; HANDLE_FIELD_LEN], (BackendRef, u64)>,
    handle: &[u8; HANDLE_FIELD_LEN],
    offset: u64,
    value: u32,
) -> anyhow::Result<()> {
    let (backend_ref, length) = match cache.get(handle) {
        Some(&entry) => entry,
        None => {
            let resolved = resources
                .resolve_mmio(tenant_id, &handle_str(handle))
                .await
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
            cache.insert(*handle, resolved);
            resolved
        }
    };
    if offset + 4 > length {
        cache.remove(handle);
        anyhow::bail!("offset 0x{offset:x} out of range");
    }
    let result = resources.hardware().mmio_write(backend_ref, offset, value).await;
    if result.is_err() {
        cache.remove(handle);
    }
    result.map_err(|e| anyhow::anyhow!(e.to_string()))
}

async fn do_read(
    resources: &ResourceRegistry,
    tenant_id: &str,
    cache: &mut HashMap<[u8; HANDLE_FIELD_LEN], (BackendRef, u64)>,
    handle: &[u8; HANDLE_FIELD_LEN],
    offset: u64,
) -> anyhow::Result<u32> {
    let (backend_ref, length) = match cache.get(handle) {
        Some(&entry) => entry,
        None => {
            let resolved = resources
                .resolve_mmio(tenant_id, &handle_str(handle))
                .await
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
            cache.insert(*handle, resolved);
            resolved
        }
    };
    if offset + 4 > length {
        cache.remove(handle);
        anyhow::bail!("offset 0x{offset:x} out of range");
    }
    let result = resources.hardware().mmio_read(backend_ref, offset).await;
    if result.is_err() {
        cache.remove(handle);
    }
    result.map_err(|e| anyhow::anyhow!(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigRegistry, HypervisorConfig, TenantConfig};
    use crate::hardware::backend::MockHardwareBackend;
    use crate::hardware::HardwareThread;
    use crate::pr_zone::PrZoneAllocator;
    use crate::tenant::TenantManager;
    use std::collections::HashSet;

    async fn test_registry() -> ResourceRegistry {
        let config_registry = Arc::new(ConfigRegistry::new(
            "/tmp/fpga-hv-fast-mmio-test.yaml".into(),
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
            config_file: "/tmp/fpga-hv-fast-mmio-test.yaml".into(),
            debug_mock_hardware: true,
            num_pr_zones: 2,
            session_ttl_secs: 3600,
            hw_timeout_secs: 5,
        });
        let (events_tx, _) = tokio::sync::broadcast::channel(16);
        ResourceRegistry::new(hardware, pr_zones, tenants, hv_config, events_tx)
    }

    fn wire_handle(handle: &str) -> [u8; HANDLE_FIELD_LEN] {
        let mut buf = [0u8; HANDLE_FIELD_LEN];
        let bytes = handle.as_bytes();
        assert!(bytes.len() <= HANDLE_FIELD_LEN, "handle {handle} too long for wire field");
        buf[..bytes.len()].copy_from_slice(bytes);
        buf
    }

    #[tokio::test]
    async fn write_then_read_is_a_cache_hit_on_second_call() {
        let registry = test_registry().await;
        let (_overlay, _) = registry.load_overlay("tenant1", "conv2d.bit").await.unwrap();
        let mmio = registry.create_mmio("tenant1", 0xA000_0000, 0x1000).await.unwrap();
        let wire = wire_handle(&mmio);
        let mut cache = HashMap::new();

        assert!(cache.is_empty());
        do_write(&registry, "tenant1", &mut cache, &wire, 0x10, 0xdead_beef).await.unwrap();
        assert_eq!(cache.len(), 1, "first call resolves through the registry and populates the cache");

        let value = do_read(&registry, "tenant1", &mut cache, &wire, 0x10).await.unwrap();
        assert_eq!(value, 0xdead_beef);
        assert_eq!(cache.len(), 1, "second call is served from the cache, no new entry");
    }

    #[tokio::test]
    async fn out_of_range_offset_invalidates_the_cache_entry() {
        let registry = test_registry().await;
        let (_overlay, _) = registry.load_overlay("tenant1", "conv2d.bit").await.unwrap();
        let mmio = registry.create_mmio("tenant1", 0xA000_0000, 0x1000).await.unwrap();
        let wire = wire_handle(&mmio);
        let mut cache = HashMap::new();

        do_write(&registry, "tenant1", &mut cache, &wire, 0x10, 1).await.unwrap();
        assert_eq!(cache.len(), 1);

        let err = do_write(&registry, "tenant1", &mut cache, &wire, 0x1_0000, 1).await;
        assert!(err.is_err());
        assert!(cache.is_empty(), "a failed call must invalidate its cache entry");
    }

    #[tokio::test]
    async fn unknown_handle_is_never_cached() {
        let registry = test_registry().await;
        let wire = wire_handle("mmio_deadbeef");
        let mut cache = HashMap::new();
        let err = do_read(&registry, "tenant1", &mut cache, &wire, 0).await;
        assert!(err.is_err());
        assert!(cache.is_empty());
    }
}
