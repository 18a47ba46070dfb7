//! cairn-services — membership bootstrap and the peer registry.
//!
//! Identity resolution, seed join, the discovery listener and the registry
//! that reconciles them with live RPC connections.

pub mod backoff;
pub mod connection;
pub mod discovery;
pub mod join;
pub mod registry;
pub mod resolve;
pub mod rpc;

pub use backoff::Backoff;
pub use connection::{ConnectError, ConnectionFactory};
pub use discovery::{reconcile, DiscoveryEvent, DiscoveryListener, DiscoveryTransport};
pub use join::{join, resolve_seed, JoinError};
pub use registry::{PeerRegistry, PeerSnapshot, RegistryError, UpsertOutcome};
pub use resolve::{resolve, IdentityError, InterfaceAddrs, InterfaceSource, SystemInterfaces};
pub use rpc::{serve, MembershipView, PeerDirectory, RpcClient, TcpConnector};
