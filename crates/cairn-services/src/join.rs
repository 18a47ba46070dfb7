//! Seed-based join — pull an initial peer list from one configured node.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use cairn_core::rpc::RpcError;
use cairn_core::PeerDescriptor;

use crate::connection::{ConnectError, ConnectionFactory};
use crate::rpc::PeerDirectory;

#[derive(Debug, thiserror::Error)]
pub enum JoinError {
    /// Seed could not be resolved or dialed. Not fatal: discovery carries on.
    #[error("join seed {seed} unreachable: {source}")]
    Unreachable {
        seed: String,
        #[source]
        source: ConnectError,
    },

    #[error("join seed {seed} did not return a peer list: {source}")]
    Rejected {
        seed: SocketAddr,
        #[source]
        source: RpcError,
    },
}

/// Turn a configured seed (`host`, `ip`, `host:port`, `[v6]:port`) into one
/// socket address. Bare hosts get `default_port`.
pub async fn resolve_seed(
    seed: &str,
    default_port: u16,
    within: Duration,
) -> Result<SocketAddr, JoinError> {
    let seed = seed.trim();
    if let Ok(addr) = seed.parse::<SocketAddr>() {
        return Ok(addr);
    }
    if let Ok(ip) = seed.trim_start_matches('[').trim_end_matches(']').parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, default_port));
    }

    let has_port = seed
        .rsplit_once(':')
        .is_some_and(|(_, port)| port.parse::<u16>().is_ok());
    let target = if has_port {
        seed.to_string()
    } else {
        format!("{seed}:{default_port}")
    };

    let unreachable = |source| JoinError::Unreachable {
        seed: seed.to_string(),
        source,
    };

    let resolved = tokio::time::timeout(within, tokio::net::lookup_host(target.clone()))
        .await
        .map_err(|_| {
            unreachable(ConnectError::Timeout {
                addr: target.clone(),
                after: within,
            })
        })?
        .map_err(|source| {
            unreachable(ConnectError::Io {
                addr: target.clone(),
                source,
            })
        })?
        .next();

    resolved.ok_or_else(|| {
        unreachable(ConnectError::Io {
            addr: target.clone(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses"),
        })
    })
}

/// Ask `seed` for its view of the cluster.
///
/// With no seed this is a no-op returning an empty list. The seed is dialed
/// through the same factory the registry uses; the join connection is
/// retired before returning.
pub async fn join<F>(factory: &F, seed: Option<SocketAddr>) -> Result<Vec<PeerDescriptor>, JoinError>
where
    F: ConnectionFactory,
    F::Conn: PeerDirectory,
{
    let Some(seed) = seed else {
        return Ok(Vec::new());
    };

    tracing::info!(seed = %seed, "joining cluster via seed");

    let conn = factory
        .establish(seed)
        .await
        .map_err(|source| JoinError::Unreachable {
            seed: seed.to_string(),
            source,
        })?;

    let peers = conn.known_peers().await;
    factory.retire(conn).await;
    let peers = peers.map_err(|source| JoinError::Rejected { seed, source })?;

    tracing::info!(seed = %seed, peers = peers.len(), "join complete");
    Ok(peers)
}
