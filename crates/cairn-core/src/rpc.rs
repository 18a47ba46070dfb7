//! Cluster RPC messages.
//!
//! Frames on the TCP stream are `[length: u32 big-endian][JSON body]`.
//! The framing itself lives with the transport in cairn-services; this
//! module owns the message types and body encoding.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::identity::PeerDescriptor;

/// Maximum frame body in bytes. Larger frames close the connection.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Length prefix size.
pub const FRAME_HEADER_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RpcRequest {
    /// Liveness check. Answered with `Pong`.
    Ping,
    /// Ask for the responder's own descriptor plus every peer it knows.
    KnownPeers,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RpcResponse {
    Pong { name: String },
    Peers { peers: Vec<PeerDescriptor> },
    Error { message: String },
}

/// Errors on the RPC path, client or server side.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("request timed out")]
    Timeout,

    #[error("frame of {0} bytes exceeds maximum {}", MAX_FRAME_LEN)]
    FrameTooLarge(usize),

    #[error("malformed message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("connection closed")]
    Closed,

    #[error("remote error: {0}")]
    Remote(String),

    #[error("unexpected response to {0}")]
    Unexpected(&'static str),
}

/// Serialize a message into a complete frame (length prefix included).
pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, RpcError> {
    let body = serde_json::to_vec(msg)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(RpcError::FrameTooLarge(body.len()));
    }
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Validate a length prefix read off the wire.
pub fn frame_len(prefix: [u8; FRAME_HEADER_LEN]) -> Result<usize, RpcError> {
    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_LEN {
        return Err(RpcError::FrameTooLarge(len));
    }
    Ok(len)
}

pub fn decode_body<T: DeserializeOwned>(body: &[u8]) -> Result<T, RpcError> {
    Ok(serde_json::from_slice(body)?)
}
