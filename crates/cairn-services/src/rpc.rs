//! Cluster RPC over TCP — client handles, the dialer the registry uses, and
//! the accept loop that answers peers.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};

use cairn_core::rpc::{
    decode_body, encode_frame, frame_len, RpcError, RpcRequest, RpcResponse, FRAME_HEADER_LEN,
};
use cairn_core::PeerDescriptor;

use crate::connection::{ConnectError, ConnectionFactory};
use crate::registry::PeerRegistry;

// ── Framing ───────────────────────────────────────────────────────────────────

pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let frame = encode_frame(msg)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame. `Ok(None)` means the peer closed cleanly between frames.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, RpcError>
where
    R: AsyncRead + Unpin,
    T: serde::de::DeserializeOwned,
{
    let mut prefix = [0u8; FRAME_HEADER_LEN];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = frame_len(prefix)?;
    let mut body = BytesMut::zeroed(len);
    reader.read_exact(&mut body).await?;
    decode_body(&body).map(Some)
}

// ── Client ────────────────────────────────────────────────────────────────────

/// Handle to one peer connection. Clones share the same stream.
///
/// Calls are serialized: one request/response exchange at a time.
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    peer: SocketAddr,
    stream: Mutex<Option<TcpStream>>,
    request_timeout: Duration,
    closed: AtomicBool,
}

impl std::fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcClient")
            .field("peer", &self.inner.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl RpcClient {
    pub fn new(stream: TcpStream, peer: SocketAddr, request_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(ClientInner {
                peer,
                stream: Mutex::new(Some(stream)),
                request_timeout,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Send one request and wait for its response.
    ///
    /// Any transport failure poisons the handle; later calls return `Closed`.
    /// So does dropping the call midway, since the stream may then hold a
    /// half-written request or an unread response.
    pub async fn call(&self, request: &RpcRequest) -> Result<RpcResponse, RpcError> {
        let mut slot = self.inner.stream.lock().await;
        let mut stream = slot.take().ok_or(RpcError::Closed)?;
        let poison = PoisonOnDrop::arm(&self.inner.closed);

        let exchange = async {
            write_frame(&mut stream, request).await?;
            read_frame::<_, RpcResponse>(&mut stream)
                .await?
                .ok_or(RpcError::Closed)
        };
        let response = match tokio::time::timeout(self.inner.request_timeout, exchange).await {
            Ok(result) => result?,
            Err(_) => return Err(RpcError::Timeout),
        };

        *slot = Some(stream);
        poison.disarm();

        match response {
            RpcResponse::Error { message } => Err(RpcError::Remote(message)),
            response => Ok(response),
        }
    }

    /// Liveness check. Returns the responder's node name.
    pub async fn ping(&self) -> Result<String, RpcError> {
        match self.call(&RpcRequest::Ping).await? {
            RpcResponse::Pong { name } => Ok(name),
            _ => Err(RpcError::Unexpected("ping")),
        }
    }

    /// Close the stream. Idempotent.
    pub async fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        let stream = self.inner.stream.lock().await.take();
        if let Some(mut stream) = stream {
            let _ = stream.shutdown().await;
        }
    }
}

/// Marks a client closed unless the exchange it guards completes. The
/// stream itself is dropped with the call's future.
struct PoisonOnDrop<'a> {
    closed: &'a AtomicBool,
    armed: bool,
}

impl<'a> PoisonOnDrop<'a> {
    fn arm(closed: &'a AtomicBool) -> Self {
        Self { closed, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PoisonOnDrop<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.closed.store(true, Ordering::Release);
        }
    }
}

/// Something that can hand back a remote node's peer list.
pub trait PeerDirectory {
    fn known_peers(&self) -> impl Future<Output = Result<Vec<PeerDescriptor>, RpcError>> + Send;
}

impl PeerDirectory for RpcClient {
    async fn known_peers(&self) -> Result<Vec<PeerDescriptor>, RpcError> {
        match self.call(&RpcRequest::KnownPeers).await? {
            RpcResponse::Peers { peers } => Ok(peers),
            _ => Err(RpcError::Unexpected("known_peers")),
        }
    }
}

// ── Dialer ────────────────────────────────────────────────────────────────────

/// Connection factory for `RpcClient` handles over TCP.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
    request_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            request_timeout,
        }
    }
}

impl ConnectionFactory for TcpConnector {
    type Conn = RpcClient;

    async fn establish(&self, addr: SocketAddr) -> Result<RpcClient, ConnectError> {
        let stream = match tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(ConnectError::Io {
                    addr: addr.to_string(),
                    source,
                })
            }
            Err(_) => {
                return Err(ConnectError::Timeout {
                    addr: addr.to_string(),
                    after: self.connect_timeout,
                })
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(addr = %addr, error = %e, "TCP_NODELAY failed");
        }
        tracing::debug!(addr = %addr, "rpc connection established");
        Ok(RpcClient::new(stream, addr, self.request_timeout))
    }

    async fn retire(&self, conn: RpcClient) {
        tracing::debug!(addr = %conn.peer_addr(), "rpc connection retired");
        conn.close().await;
    }

    fn is_live(&self, conn: &RpcClient) -> bool {
        !conn.is_closed()
    }
}

// ── Server ────────────────────────────────────────────────────────────────────

/// What the RPC server needs to answer peers.
pub trait MembershipView: Send + Sync + 'static {
    fn local_name(&self) -> String;

    /// Own descriptor first, then every registered peer.
    fn known_peers(&self) -> Vec<PeerDescriptor>;
}

impl<F: ConnectionFactory> MembershipView for PeerRegistry<F> {
    fn local_name(&self) -> String {
        self.local().name().to_string()
    }

    fn known_peers(&self) -> Vec<PeerDescriptor> {
        self.local()
            .descriptor()
            .into_iter()
            .chain(self.snapshot().iter().map(|p| p.descriptor()))
            .collect()
    }
}

/// Accept peer connections until shutdown.
pub async fn serve<V: MembershipView>(
    listener: TcpListener,
    view: Arc<V>,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), RpcError> {
    tracing::info!(addr = %listener.local_addr()?, "rpc server listening");

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                tracing::info!("rpc server shutting down");
                return Ok(());
            }

            accepted = listener.accept() => {
                let (stream, remote) = match accepted {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(error = %e, "accept failed");
                        continue;
                    }
                };
                let view = view.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, view.as_ref()).await {
                        tracing::debug!(remote = %remote, error = %e, "rpc connection ended");
                    }
                });
            }
        }
    }
}

async fn handle_connection<V: MembershipView>(
    mut stream: TcpStream,
    view: &V,
) -> Result<(), RpcError> {
    while let Some(request) = read_frame::<_, RpcRequest>(&mut stream).await? {
        let response = match request {
            RpcRequest::Ping => RpcResponse::Pong {
                name: view.local_name(),
            },
            RpcRequest::KnownPeers => RpcResponse::Peers {
                peers: view.known_peers(),
            },
        };
        write_frame(&mut stream, &response).await?;
    }
    Ok(())
}
