//! Connection factory — the registry's only way to open or close a peer link.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

/// Dials and releases peer connections.
///
/// `establish` makes exactly one bounded attempt; retry policy belongs to
/// the caller. `retire` must be safe to call on an already-retired handle.
pub trait ConnectionFactory: Send + Sync + 'static {
    type Conn: Clone + Send + Sync + 'static;

    fn establish(
        &self,
        addr: SocketAddr,
    ) -> impl Future<Output = Result<Self::Conn, ConnectError>> + Send;

    fn retire(&self, conn: Self::Conn) -> impl Future<Output = ()> + Send;

    /// False once the handle can no longer carry requests. The registry
    /// retires dead handles instead of handing them out.
    fn is_live(&self, conn: &Self::Conn) -> bool;
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("dial {addr} timed out after {after:?}")]
    Timeout { addr: String, after: Duration },

    #[error("dial {addr} failed: {source}")]
    Io {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}
