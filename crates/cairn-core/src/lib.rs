//! cairn-core — shared identity types, discovery wire format, RPC messages
//! and configuration. All other Cairn crates depend on this one.

pub mod config;
pub mod identity;
pub mod rpc;
pub mod wire;

pub use identity::{Health, InstanceId, InterfaceInfo, NodeIdentity, PeerDescriptor};
