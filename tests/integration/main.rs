//! Cairn integration test harness.
//!
//! Every test here runs whole nodes in-process over loopback: a real RPC
//! server, a real `PeerRegistry` dialing through `TcpConnector`, and a
//! channel-fed discovery transport standing in for multicast. No root or
//! extra network setup is needed.
//!
//!   cargo test --test integration

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};

use cairn_core::identity::InterfaceInfo;
use cairn_core::{InstanceId, NodeIdentity, PeerDescriptor};
use cairn_services::{
    reconcile, serve, Backoff, DiscoveryEvent, DiscoveryListener, DiscoveryTransport,
    PeerRegistry, TcpConnector,
};

mod join;
mod membership;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
pub const REQUEST_TIMEOUT: Duration = Duration::from_millis(500);

/// One in-process node: identity, registry and a live RPC server.
pub struct Node {
    pub identity: Arc<NodeIdentity>,
    pub registry: Arc<PeerRegistry<TcpConnector>>,
    pub addr: SocketAddr,
    shutdown: broadcast::Sender<()>,
}

impl Node {
    /// Bind an ephemeral loopback port and start serving RPC on it.
    pub async fn start(name: &str) -> Result<Node> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .context("failed to bind loopback listener")?;
        let addr = listener.local_addr()?;

        let identity = Arc::new(NodeIdentity::with_instance(
            name.to_string(),
            InterfaceInfo {
                name: "lo".to_string(),
                index: 1,
            },
            vec![addr.ip()],
            addr.port(),
            InstanceId::generate(),
        ));
        let registry = Arc::new(PeerRegistry::new(
            identity.clone(),
            TcpConnector::new(CONNECT_TIMEOUT, REQUEST_TIMEOUT),
        ));

        let (shutdown, _) = broadcast::channel(1);
        tokio::spawn(serve(listener, registry.clone(), shutdown.subscribe()));

        Ok(Node {
            identity,
            registry,
            addr,
            shutdown,
        })
    }

    /// What a peer would learn about this node from an announcement.
    pub fn descriptor(&self) -> PeerDescriptor {
        PeerDescriptor::new(self.identity.name(), self.addr).with_instance(self.identity.instance())
    }

    /// Start feeding discovery events into this node's registry.
    /// Events sent on the returned channel are treated as multicast sightings.
    pub fn discover(&self) -> mpsc::UnboundedSender<DiscoveryEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = DiscoveryListener::new(
            ChannelTransport { rx },
            self.identity.clone(),
            Backoff::new(Duration::from_millis(5), Duration::from_millis(20)),
            self.shutdown.subscribe(),
        );
        tokio::spawn(reconcile(listener, self.registry.clone()));
        tx
    }

    pub async fn stop(&self) {
        let _ = self.shutdown.send(());
        self.registry.shutdown().await;
    }
}

/// Discovery transport fed from a channel.
pub struct ChannelTransport {
    rx: mpsc::UnboundedReceiver<DiscoveryEvent>,
}

impl DiscoveryTransport for ChannelTransport {
    async fn open(&mut self) -> io::Result<()> {
        Ok(())
    }

    async fn recv(&mut self) -> io::Result<DiscoveryEvent> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "sighting feed closed"))
    }
}

/// A loopback address with nothing listening on it.
pub async fn dead_addr() -> Result<SocketAddr> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
    let addr = listener.local_addr()?;
    drop(listener);
    Ok(addr)
}

/// Poll `cond` every 10ms until it holds or `within` elapses.
pub async fn wait_until(within: Duration, mut cond: impl FnMut() -> bool) -> Result<()> {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if cond() {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("condition not met within {:?}", within);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
