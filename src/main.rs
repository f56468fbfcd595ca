//! Multi-tenant hypervisor for a reconfigurable FPGA fabric.
//!
//! Exposes three socket surfaces: one Control RPC socket per tenant
//! (`<socket_dir>/<tenant_id>.sock`), a root-only Management RPC socket
//! (`<socket_dir>/management.sock`), and a raw Fast MMIO socket
//! (`<socket_dir>/mmio_fast.sock`) shared by every tenant.
//!
//! Exit codes: 0 clean shutdown, 1 initialization failure, 2 privilege
//! failure (real-hardware mode requires root).

mod api;
mod config;
mod error;
mod events;
mod fast_mmio;
mod hardware;
mod pr_zone;
mod resources;
mod tenant;
mod tracing_layer;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::UnixListener;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use api::state::{ControlState, ManagementState};
use config::{ConfigEvent, ConfigRegistry, HypervisorConfig};
use events::HvEvent;
use fast_mmio::{FastMmioServer, FastMmioTokens};
use hardware::backend::{MockHardwareBackend, RealHardwareBackend};
use hardware::HardwareThread;
use pr_zone::PrZoneAllocator;
use resources::ResourceRegistry;
use tenant::TenantManager;

#[tokio::main]
async fn main() {
    match run().await {
        Ok(()) => std::process::exit(0),
        Err(e) => {
            error!(error = %e, "fatal startup error");
            std::process::exit(1);
        }
    }
}

async fn run() -> Result<()> {
    let hv_config = Arc::new(HypervisorConfig::from_env());

    let (events_tx, _) = broadcast::channel::<HvEvent>(1024);

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(true)
                .with_thread_names(true),
        )
        .with(tracing_layer::EventBroadcastLayer::new(events_tx.clone()))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,fpga_hv=debug")))
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting fpga-hv");

    if !hv_config.debug_mock_hardware && !nix::unistd::Uid::effective().is_root() {
        error!("real-hardware mode requires root (set HV_DEBUG=1 to run unprivileged against the mock backend)");
        std::process::exit(2);
    }

    std::fs::create_dir_all(&hv_config.socket_dir)
        .with_context(|| format!("creating socket directory {}", hv_config.socket_dir.display()))?;

    let config_registry = Arc::new(ConfigRegistry::load(hv_config.config_file.clone()).await?);
    let tenants = Arc::new(TenantManager::new(config_registry.clone(), hv_config.session_ttl_secs));
    let pr_zones = Arc::new(PrZoneAllocator::new(hv_config.num_pr_zones));

    let backend: Box<dyn hardware::HardwareBackend> = if hv_config.debug_mock_hardware {
        info!("HV_DEBUG set: using the in-memory mock hardware backend");
        Box::new(MockHardwareBackend::default())
    } else {
        Box::<RealHardwareBackend>::default()
    };
    let static_bitstream = hv_config.bitstream_dir.join("static_shell.bit");
    let hardware = Arc::new(
        HardwareThread::spawn(backend, static_bitstream, hv_config.num_pr_zones, hv_config.hw_timeout_secs)
            .context("hardware thread failed to initialize")?,
    );

    let resources = Arc::new(ResourceRegistry::new(
        hardware.clone(),
        pr_zones.clone(),
        tenants.clone(),
        hv_config.clone(),
        events_tx.clone(),
    ));

    let fast_mmio_tokens = FastMmioTokens::new();

    // Bridge configuration mutations onto the management event stream.
    {
        let events_tx = events_tx.clone();
        config_registry.register_observer(Arc::new(move |event: ConfigEvent| {
            let mapped = match event {
                ConfigEvent::TenantAdded(tenant_id) => HvEvent::TenantAdded { tenant_id },
                ConfigEvent::TenantRemoved(tenant_id) => HvEvent::TenantRemoved { tenant_id },
                ConfigEvent::TenantUpdated(tenant_id) => HvEvent::TenantUpdated { tenant_id },
                ConfigEvent::BitstreamAdded(tenant_id, _bitstream) => HvEvent::TenantUpdated { tenant_id },
            };
            let _ = events_tx.send(mapped);
        }));
    }

    let tenant_sockets: Arc<Mutex<HashMap<String, JoinHandle<()>>>> = Arc::new(Mutex::new(HashMap::new()));
    for tenant in config_registry.list().await {
        spawn_tenant_socket(
            &hv_config,
            &config_registry,
            &tenants,
            &resources,
            &fast_mmio_tokens,
            &tenant_sockets,
            tenant.tenant_id,
        )
        .await?;
    }

    // New tenants added at runtime (via the management socket) get their
    // own Control RPC socket without a restart.
    {
        let hv_config = hv_config.clone();
        let config_registry = config_registry.clone();
        let tenants = tenants.clone();
        let resources = resources.clone();
        let fast_mmio_tokens = fast_mmio_tokens.clone();
        let tenant_sockets = tenant_sockets.clone();
        config_registry.register_observer(Arc::new(move |event: ConfigEvent| {
            if let ConfigEvent::TenantAdded(tenant_id) = event {
                let hv_config = hv_config.clone();
                let config_registry = config_registry.clone();
                let tenants = tenants.clone();
                let resources = resources.clone();
                let fast_mmio_tokens = fast_mmio_tokens.clone();
                let tenant_sockets = tenant_sockets.clone();
                tokio::spawn(async move {
                    if let Err(e) = spawn_tenant_socket(
                        &hv_config,
                        &config_registry,
                        &tenants,
                        &resources,
                        &fast_mmio_tokens,
                        &tenant_sockets,
                        tenant_id,
                    )
                    .await
                    {
                        error!(error = %e, "failed to spawn tenant socket");
                    }
                });
            }
        }));
    }

    let fast_mmio_socket = hv_config.socket_dir.join("mmio_fast.sock");
    let fast_mmio_server = FastMmioServer::new(fast_mmio_socket, resources.clone(), fast_mmio_tokens.clone());
    tokio::spawn(async move {
        if let Err(e) = fast_mmio_server.run().await {
            error!(error = %e, "fast MMIO server exited");
        }
    });

    let management_socket_path = hv_config.socket_dir.join("management.sock");
    let management_state = ManagementState {
        config: config_registry.clone(),
        resources: resources.clone(),
        events: events_tx.clone(),
    };
    let management_router = api::management_router(management_state);
    if management_socket_path.exists() {
        std::fs::remove_file(&management_socket_path)?;
    }
    let management_listener = UnixListener::bind(&management_socket_path)?;
    set_socket_mode(&management_socket_path, 0o600)?;
    info!(path = %management_socket_path.display(), "management RPC listening");

    let shutdown = shutdown_signal();
    tokio::select! {
        result = axum::serve(management_listener, management_router) => {
            result.context("management server exited")?;
        }
        _ = shutdown => {
            info!("shutdown signal received");
        }
    }

    Ok(())
}

async fn spawn_tenant_socket(
    hv_config: &Arc<HypervisorConfig>,
    config_registry: &Arc<ConfigRegistry>,
    tenants: &Arc<TenantManager>,
    resources: &Arc<ResourceRegistry>,
    fast_mmio_tokens: &FastMmioTokens,
    tenant_sockets: &Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
    tenant_id: String,
) -> Result<()> {
    let mut guard = tenant_sockets.lock().await;
    if guard.contains_key(&tenant_id) {
        return Ok(());
    }

    let socket_path = hv_config.socket_dir.join(format!("{tenant_id}.sock"));
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)?;
    }
    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("binding tenant socket {}", socket_path.display()))?;
    set_socket_mode(&socket_path, 0o600)?;
    if let Some(tenant) = config_registry.get(&tenant_id).await {
        chown_socket(&socket_path, tenant.uid, tenant.gid)?;
    }

    let control_state = ControlState {
        tenants: tenants.clone(),
        resources: resources.clone(),
        fast_mmio_tokens: fast_mmio_tokens.clone(),
    };
    let router = api::control_router(control_state);

    info!(tenant_id = %tenant_id, path = %socket_path.display(), "control RPC listening");
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            error!(tenant_id = %tenant_id, error = %e, "tenant control server exited");
        }
    });
    guard.insert(tenant_id.to_string(), handle);
    Ok(())
}

fn set_socket_mode(path: &std::path::Path, mode: u32) -> Result<()> {
    nix::sys::stat::fchmodat(
        None,
        path,
        nix::sys::stat::Mode::from_bits_truncate(mode),
        nix::sys::stat::FchmodatFlags::FollowSymlink,
    )
    .with_context(|| format!("chmod {:o} on {}", mode, path.display()))
}

/// Hands the tenant socket over to the tenant's own uid/gid, so mode 0600
/// actually restricts access to that tenant rather than to whichever uid
/// the hypervisor process runs as.
fn chown_socket(path: &std::path::Path, uid: u32, gid: u32) -> Result<()> {
    nix::unistd::chown(
        path,
        Some(nix::unistd::Uid::from_raw(uid)),
        Some(nix::unistd::Gid::from_raw(gid)),
    )
    .with_context(|| format!("chown {uid}:{gid} on {}", path.display()))
}

async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("installing SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("installing SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }
}
