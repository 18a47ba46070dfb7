//! cairnd — Cairn cluster membership daemon.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;

use cairn_core::config::CairnConfig;
use cairn_core::wire::service_tag;
use cairn_services::{
    join, reconcile, resolve, resolve_seed, Backoff, DiscoveryListener, PeerRegistry,
    SystemInterfaces, TcpConnector,
};

mod discovery;
mod keepalive;
mod status;

use discovery::announce::Announcer;
use discovery::multicast::MulticastDiscovery;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    // Load config
    if let Err(e) = CairnConfig::write_default_if_missing() {
        tracing::warn!(error = %e, "failed to write default config");
    }
    let mut config = CairnConfig::load().unwrap_or_else(|e| {
        tracing::warn!(error = %e, "failed to load config, using defaults");
        CairnConfig::default()
    });
    if let Some(interface) = std::env::args().nth(1) {
        config.node.interface = interface;
    }
    tracing::info!(interface = %config.node.interface, "cairnd starting");

    // Identity — fatal if it cannot be resolved
    let identity = Arc::new(
        resolve(
            &SystemInterfaces,
            &config.node.interface,
            config.node_name(),
            config.network.port,
        )
        .context("failed to resolve node identity")?,
    );

    // Shared state
    let connector = TcpConnector::new(config.timeouts.connect(), config.timeouts.request());
    let registry = Arc::new(PeerRegistry::new(identity.clone(), connector));
    let tag = service_tag(&config.network.service_tag);
    let group_if = discovery::group_interface(&identity);

    // Bind RPC before announcing so peers that see us can dial us.
    let rpc_listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.network.port)))
        .await
        .with_context(|| format!("failed to bind rpc port {}", config.network.port))?;

    // ── Shutdown channel ─────────────────────────────────────────────────────
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    {
        let shutdown = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c().await.ok();
            tracing::info!("shutdown signal received");
            let _ = shutdown.send(());
        });
    }

    // ── Spawn tasks ──────────────────────────────────────────────────────────

    let rpc_task = tokio::spawn(cairn_services::serve(
        rpc_listener,
        registry.clone(),
        shutdown_tx.subscribe(),
    ));

    let announcer = Announcer::new(&identity, &tag, group_if, config.network.discovery_port)?;
    let announce_task = tokio::spawn(
        announcer.run(config.discovery.announce_interval(), shutdown_tx.subscribe()),
    );

    let discovery_task = {
        let transport = MulticastDiscovery::new(config.network.discovery_port, group_if, tag);
        let backoff = Backoff::new(
            config.discovery.backoff_initial(),
            config.discovery.backoff_max(),
        );
        let listener =
            DiscoveryListener::new(transport, identity.clone(), backoff, shutdown_tx.subscribe());
        tokio::spawn(reconcile(listener, registry.clone()))
    };

    // Join runs once, alongside discovery; failure only costs the head start.
    let _join_task = {
        let registry = registry.clone();
        let seed = config.join_seed().map(str::to_string);
        let port = config.network.port;
        let within = config.timeouts.join();
        tokio::spawn(async move { run_join(registry, seed, port, within).await })
    };

    let keepalive_task = tokio::spawn(
        keepalive::Keepalive::new(
            registry.clone(),
            config.keepalive.interval(),
            shutdown_tx.subscribe(),
        )
        .run(),
    );

    if config.network.status_port != 0 {
        let state = status::StatusState {
            identity: identity.clone(),
            registry: registry.clone(),
        };
        let port = config.network.status_port;
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            if let Err(e) = status::serve(state, port, shutdown).await {
                tracing::error!(error = %e, "status server failed");
            }
        });
    }

    // ── Wait for exit ────────────────────────────────────────────────────────

    let mut shutdown_rx = shutdown_tx.subscribe();

    tokio::select! {
        _ = shutdown_rx.recv()   => tracing::info!("shutting down"),
        r = rpc_task             => tracing::error!("rpc server exited: {:?}", r),
        r = discovery_task       => tracing::error!("discovery exited: {:?}", r),
        r = keepalive_task       => tracing::error!("keepalive exited: {:?}", r),
    }

    // Make sure every task sees shutdown even if we got here via a task exit.
    let _ = shutdown_tx.send(());
    match announce_task.await {
        Ok(Err(e)) => tracing::warn!(error = %e, "announcer failed"),
        Err(e) => tracing::warn!(error = %e, "announcer panicked"),
        Ok(Ok(())) => {}
    }
    registry.shutdown().await;

    Ok(())
}

async fn run_join(
    registry: Arc<PeerRegistry<TcpConnector>>,
    seed: Option<String>,
    default_port: u16,
    within: std::time::Duration,
) {
    let Some(seed) = seed else {
        tracing::info!("no join address configured, relying on discovery");
        return;
    };

    let result = match resolve_seed(&seed, default_port, within).await {
        Ok(addr) => join(registry.factory(), Some(addr)).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(peers) => {
            for peer in peers {
                registry.upsert(peer).await;
            }
            tracing::info!(members = registry.len(), "seed peers registered");
        }
        Err(e) => tracing::warn!(error = %e, "join failed, continuing with discovery"),
    }
}
