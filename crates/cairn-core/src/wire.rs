//! Cairn discovery wire format.
//!
//! One datagram per announcement: a fixed `AnnouncementHeader` followed by
//! `name_len` bytes of UTF-8 node name. The advertised IP is never in the
//! datagram; receivers take it from the UDP source address.
//!
//! The header is `#[repr(C, packed)]` with zerocopy derives. Multi-byte
//! integers are stored as big-endian byte arrays so there is no alignment
//! or endianness ambiguity.

use static_assertions::assert_eq_size;
use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::identity::InstanceId;

// ── Header ────────────────────────────────────────────────────────────────────

/// Fixed prefix of every discovery datagram.
///
/// Wire size: 60 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct AnnouncementHeader {
    /// Always `ANNOUNCE_MAGIC`.
    pub magic: [u8; 6],

    /// Wire format version. Currently 0x01.
    pub version: u8,

    /// Bit flags:
    ///   bit    0: sender is leaving the cluster
    ///   bits 1-7: reserved, must be zero
    pub flags: u8,

    /// BLAKE3 hash of the service tag. Datagrams for another tag are ignored.
    pub service_tag: [u8; 32],

    /// Sender's per-process instance id.
    pub instance: [u8; 16],

    /// Sender's RPC port, big-endian.
    pub rpc_port: [u8; 2],

    /// Length of the name that follows the header.
    pub name_len: u8,

    /// Reserved, must be zero.
    pub reserved: u8,
}

assert_eq_size!(AnnouncementHeader, [u8; 60]);

pub const HEADER_LEN: usize = std::mem::size_of::<AnnouncementHeader>();

pub const ANNOUNCE_MAGIC: [u8; 6] = *b"CAIRN\0";

pub const ANNOUNCE_VERSION: u8 = 0x01;

pub const FLAG_DEPARTING: u8 = 0x01;

/// Largest node name that fits in `name_len`.
pub const MAX_NAME_LEN: usize = u8::MAX as usize;

/// IPv4 multicast group for discovery announcements (administratively scoped).
pub const MULTICAST_GROUP_V4: [u8; 4] = [239, 255, 77, 77];

// ── Service tag ───────────────────────────────────────────────────────────────

/// Hashed service tag — scopes discovery to one application.
pub type ServiceTag = [u8; 32];

/// Compute the tag hash carried in every announcement.
pub fn service_tag(tag: &str) -> ServiceTag {
    *blake3::hash(tag.as_bytes()).as_bytes()
}

// ── Announcement ──────────────────────────────────────────────────────────────

/// Decoded form of one discovery datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub name: String,
    pub instance: InstanceId,
    pub rpc_port: u16,
    pub departing: bool,
}

impl Announcement {
    pub fn encode(&self, tag: &ServiceTag) -> Result<Vec<u8>, WireError> {
        if self.name.is_empty() {
            return Err(WireError::EmptyName);
        }
        if self.name.len() > MAX_NAME_LEN {
            return Err(WireError::NameTooLong(self.name.len()));
        }

        let header = AnnouncementHeader {
            magic: ANNOUNCE_MAGIC,
            version: ANNOUNCE_VERSION,
            flags: if self.departing { FLAG_DEPARTING } else { 0 },
            service_tag: *tag,
            instance: self.instance.0,
            rpc_port: self.rpc_port.to_be_bytes(),
            name_len: self.name.len() as u8,
            reserved: 0,
        };

        let mut out = Vec::with_capacity(HEADER_LEN + self.name.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(self.name.as_bytes());
        Ok(out)
    }

    /// Parse a datagram, rejecting anything not meant for `tag`.
    pub fn decode(buf: &[u8], tag: &ServiceTag) -> Result<Self, WireError> {
        let header = AnnouncementHeader::read_from_prefix(buf).ok_or(WireError::Truncated {
            need: HEADER_LEN,
            got: buf.len(),
        })?;

        if header.magic != ANNOUNCE_MAGIC {
            return Err(WireError::BadMagic);
        }
        if header.version != ANNOUNCE_VERSION {
            return Err(WireError::UnknownVersion(header.version));
        }
        if header.flags & !FLAG_DEPARTING != 0 {
            return Err(WireError::ReservedFlagsSet(header.flags));
        }
        if header.service_tag != *tag {
            return Err(WireError::TagMismatch);
        }

        let name_len = header.name_len as usize;
        if name_len == 0 {
            return Err(WireError::EmptyName);
        }
        let name_bytes = buf
            .get(HEADER_LEN..HEADER_LEN + name_len)
            .ok_or(WireError::Truncated {
                need: HEADER_LEN + name_len,
                got: buf.len(),
            })?;
        let name = std::str::from_utf8(name_bytes).map_err(|_| WireError::InvalidName)?;

        Ok(Self {
            name: name.to_string(),
            instance: InstanceId(header.instance),
            rpc_port: u16::from_be_bytes(header.rpc_port),
            departing: header.flags & FLAG_DEPARTING != 0,
        })
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Reasons a discovery datagram is dropped.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("datagram too short: need {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },

    #[error("bad magic")]
    BadMagic,

    #[error("unknown announcement version: 0x{0:02x}")]
    UnknownVersion(u8),

    #[error("reserved flags are non-zero: 0x{0:02x}")]
    ReservedFlagsSet(u8),

    #[error("service tag does not match")]
    TagMismatch,

    #[error("node name is empty")]
    EmptyName,

    #[error("node name is {0} bytes, maximum is {}", MAX_NAME_LEN)]
    NameTooLong(usize),

    #[error("node name is not valid UTF-8")]
    InvalidName,
}

// ── Tests ─────────────────────────────────────────────────────────────────────
