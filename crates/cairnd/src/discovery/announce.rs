//! Self-announcement broadcast.
//!
//! Periodically sends this node's announcement to the discovery group so
//! nearby peers can find it, and sends one departing announcement on
//! shutdown so they drop it straight away.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::time;

use cairn_core::wire::{Announcement, ServiceTag};
use cairn_core::NodeIdentity;

use super::multicast::{make_sender_socket, multicast_group};

pub struct Announcer {
    socket: UdpSocket,
    dest: SocketAddrV4,
    alive: Vec<u8>,
    departing: Vec<u8>,
}

impl Announcer {
    pub fn new(
        identity: &NodeIdentity,
        tag: &ServiceTag,
        interface: Ipv4Addr,
        discovery_port: u16,
    ) -> Result<Self> {
        let mut ann = Announcement {
            name: identity.name().to_string(),
            instance: identity.instance(),
            rpc_port: identity.rpc_port(),
            departing: false,
        };
        let alive = ann.encode(tag).context("encoding announcement")?;
        ann.departing = true;
        let departing = ann.encode(tag).context("encoding departure")?;

        let socket = make_sender_socket(interface).context("failed to create announce socket")?;
        let socket = UdpSocket::from_std(socket).context("failed to convert to tokio UdpSocket")?;

        Ok(Self {
            socket,
            dest: SocketAddrV4::new(multicast_group(), discovery_port),
            alive,
            departing,
        })
    }

    /// Announce every `interval` until shutdown, then announce departure.
    pub async fn run(self, interval: Duration, mut shutdown: broadcast::Receiver<()>) -> Result<()> {
        let mut ticker = time::interval(interval);

        tracing::info!(
            dest = %self.dest,
            interval_ms = interval.as_millis() as u64,
            "announcer starting"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    self.send(&self.departing).await;
                    tracing::info!("departure announced");
                    return Ok(());
                }

                _ = ticker.tick() => self.send(&self.alive).await,
            }
        }
    }

    async fn send(&self, datagram: &[u8]) {
        match self.socket.send_to(datagram, self.dest).await {
            Ok(n) => tracing::trace!(bytes = n, "announcement sent"),
            Err(e) => tracing::warn!(error = %e, "announcement send failed"),
        }
    }
}
