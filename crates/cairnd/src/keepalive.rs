//! Keepalive — periodically connects to every registered peer and pings it.
//!
//! Peers with no connection are dialed (so unreachable peers get retried
//! once per tick); a failed ping retires the connection and marks the peer
//! unreachable. Nothing is ever evicted from here.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::broadcast;

use cairn_services::{PeerRegistry, RegistryError, TcpConnector};

pub struct Keepalive {
    registry: Arc<PeerRegistry<TcpConnector>>,
    interval: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl Keepalive {
    pub fn new(
        registry: Arc<PeerRegistry<TcpConnector>>,
        interval: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            registry,
            interval,
            shutdown,
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("keepalive shutting down");
                    return Ok(());
                }

                _ = ticker.tick() => {
                    let peers = self.registry.snapshot();
                    tracing::debug!(peers = peers.len(), "keepalive tick");
                    join_all(peers.iter().map(|p| check_peer(&self.registry, &p.name))).await;
                }
            }
        }
    }
}

async fn check_peer(registry: &PeerRegistry<TcpConnector>, name: &str) {
    let client = match registry.connection_for(name).await {
        Ok(client) => client,
        // connection_for already logged and marked the peer
        Err(RegistryError::ConnectFailed { .. }) => return,
        Err(e) => {
            tracing::debug!(peer = %name, error = %e, "keepalive skipped");
            return;
        }
    };

    match client.ping().await {
        Ok(remote) if remote != name => {
            tracing::warn!(peer = %name, answered_as = %remote, "peer answered under another name");
        }
        Ok(_) => tracing::trace!(peer = %name, "pong"),
        Err(e) => {
            tracing::warn!(peer = %name, error = %e, "keepalive ping failed");
            registry.report_failure(name).await;
        }
    }
}
