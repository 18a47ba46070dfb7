//! Local-network discovery: multicast announcements out, sightings in.

pub mod announce;
pub mod multicast;

use std::net::{IpAddr, Ipv4Addr};

use cairn_core::NodeIdentity;

/// IPv4 address used to join the multicast group: the first IPv4 bound to
/// our interface, or unspecified when the interface is IPv6-only.
pub fn group_interface(identity: &NodeIdentity) -> Ipv4Addr {
    identity
        .ips()
        .iter()
        .find_map(|ip| match ip {
            IpAddr::V4(v4) => Some(*v4),
            IpAddr::V6(_) => None,
        })
        .unwrap_or(Ipv4Addr::UNSPECIFIED)
}
