//! The two mayfly processes.
//!
//! `run_api` serves the HTTP front; `run_controller` converges allocations
//! on one uplink. They share nothing but the store: the API only writes
//! desired state, the controller acts on what it observes there. Both treat
//! an unreachable etcd as fatal at startup and drain cleanly on
//! SIGINT/SIGTERM.

pub mod api;
pub mod config;
pub mod controller;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tower_http::trace::TraceLayer;
use tracing::info;

use mayfly_common::MacAddr;
use mayfly_dhcp::{
    DeviceManager, LeaseBinder, LinkLayer, NetlinkLinkLayer, UdpClientFactory,
};
use mayfly_store::{EtcdStore, IndexMaintainer, StateStore};

pub use api::AppState;
pub use config::Config;
pub use controller::Controller;

async fn connect_store(config: &Config) -> anyhow::Result<Arc<dyn StateStore>> {
    let store = EtcdStore::connect(
        &config.etcd,
        config.dial_timeout(),
        config.request_timeout(),
    )
    .await
    .context("connecting to etcd")?;
    Ok(Arc::new(store))
}

/// Serve the HTTP API until interrupted.
pub async fn run_api(config: Config) -> anyhow::Result<()> {
    let store = connect_store(&config).await?;
    let state = AppState {
        store,
        request_timeout: config.request_timeout(),
    };

    let app = api::api_router()
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(
        "API listening on http://{}",
        listener.local_addr().context("resolving local address")?
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving API")?;
    info!("API shut down");
    Ok(())
}

/// Run the controller until interrupted, then drain: every bound allocation
/// is demoted to Stopped so the next start can resurrect the same IPs.
pub async fn run_controller(config: Config) -> anyhow::Result<()> {
    let store = connect_store(&config).await?;

    // Seed the pool with the statically configured MACs.
    for raw in &config.macs {
        let mac: MacAddr = match raw.parse() {
            Ok(mac) => mac,
            Err(_) => {
                tracing::warn!(mac = %raw, "invalid MAC address in configuration");
                continue;
            }
        };
        match store.put_mac(mac).await {
            Ok(()) => info!(mac = %mac, "registered MAC with pool"),
            Err(e) => tracing::warn!(mac = %mac, error = %e, "error registering MAC with pool"),
        }
    }

    let link: Arc<dyn LinkLayer> =
        Arc::new(NetlinkLinkLayer::new(&config.interface).context("opening netlink")?);
    let binder = Arc::new(LeaseBinder::new(
        Arc::new(UdpClientFactory::new()),
        link.clone(),
        config.interface.clone(),
        config.client_timeout(),
        config.assign_interfaces,
    ));
    let devices = Arc::new(DeviceManager::new(link));

    let controller = Controller::new(
        store.clone(),
        binder,
        devices,
        config.manage_interfaces,
        config.dynamic_interfaces,
    );
    info!("controller starting");
    controller.start().await.context("starting controller")?;

    let index = IndexMaintainer::spawn(store.clone())
        .await
        .context("starting index maintainer")?;

    shutdown_signal().await;

    info!("draining");
    controller.stop().await;
    index.stop();
    info!("controller stopped");
    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => tracing::error!(error = %e, "failed to listen for SIGTERM"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
    }
}
