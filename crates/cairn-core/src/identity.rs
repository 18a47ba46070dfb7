//! Node identity and peer descriptors.
//!
//! `NodeIdentity` is resolved once at startup and never mutated.
//! `PeerDescriptor` is what a sighting says about another node; a newer
//! descriptor for the same name replaces the old one wholesale.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

/// Random per-process token. Two descriptors with the same name but a
/// different instance id belong to different incarnations of that node.
///
/// Serialized as a 32-character hex string, the same form `Display` prints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceId(pub [u8; 16]);

impl InstanceId {
    pub fn generate() -> Self {
        Self(rand::random())
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl Serialize for InstanceId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for InstanceId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        let mut bytes = [0u8; 16];
        hex::decode_to_slice(&text, &mut bytes).map_err(serde::de::Error::custom)?;
        Ok(Self(bytes))
    }
}

/// The network interface this node is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    pub name: String,
    /// OS interface index (from `if_nametoindex`).
    pub index: u32,
}

/// This node's own identity.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    name: String,
    interface: InterfaceInfo,
    ips: Vec<IpAddr>,
    rpc_port: u16,
    instance: InstanceId,
}

impl NodeIdentity {
    /// Build an identity with a freshly generated instance id.
    ///
    /// Callers are expected to have validated `name` and `ips`; the
    /// identity resolver is the only production caller.
    pub fn new(name: String, interface: InterfaceInfo, ips: Vec<IpAddr>, rpc_port: u16) -> Self {
        Self::with_instance(name, interface, ips, rpc_port, InstanceId::generate())
    }

    pub fn with_instance(
        name: String,
        interface: InterfaceInfo,
        ips: Vec<IpAddr>,
        rpc_port: u16,
        instance: InstanceId,
    ) -> Self {
        Self {
            name,
            interface,
            ips,
            rpc_port,
            instance,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn interface(&self) -> &InterfaceInfo {
        &self.interface
    }

    /// Local addresses in interface order, duplicates removed.
    pub fn ips(&self) -> &[IpAddr] {
        &self.ips
    }

    pub fn rpc_port(&self) -> u16 {
        self.rpc_port
    }

    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    /// The address peers should dial: first local IP plus the RPC port.
    pub fn advertised_addr(&self) -> Option<SocketAddr> {
        self.ips.first().map(|ip| SocketAddr::new(*ip, self.rpc_port))
    }

    /// This node as other nodes see it.
    pub fn descriptor(&self) -> Option<PeerDescriptor> {
        self.advertised_addr().map(|addr| PeerDescriptor {
            name: self.name.clone(),
            addr,
            instance: Some(self.instance),
        })
    }

    /// Does `addr` point back at this process?
    pub fn owns_addr(&self, addr: &SocketAddr) -> bool {
        addr.port() == self.rpc_port && self.ips.contains(&addr.ip())
    }

    /// Is this descriptor a sighting of ourselves?
    pub fn is_self(&self, peer: &PeerDescriptor) -> bool {
        peer.name == self.name || self.owns_addr(&peer.addr)
    }
}

/// A fact about another node, from discovery or a join response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    /// Logical node name. Unique key in the registry.
    pub name: String,
    /// IP + RPC port.
    pub addr: SocketAddr,
    /// Discovery-protocol instance id, when the source carried one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<InstanceId>,
}

impl PeerDescriptor {
    pub fn new(name: impl Into<String>, addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            addr,
            instance: None,
        }
    }

    pub fn with_instance(mut self, instance: InstanceId) -> Self {
        self.instance = Some(instance);
        self
    }
}

/// Registry's last-known reachability for a peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Health {
    #[default]
    Unknown,
    Reachable,
    Unreachable,
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Health::Unknown => "unknown",
            Health::Reachable => "reachable",
            Health::Unreachable => "unreachable",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local() -> NodeIdentity {
        NodeIdentity::with_instance(
            "a".into(),
            InterfaceInfo { name: "eth0".into(), index: 2 },
            vec!["10.0.0.1".parse().unwrap(), "fd00::1".parse().unwrap()],
            8181,
            InstanceId([7; 16]),
        )
    }

    #[test]
    fn is_self_matches_name_or_own_address() {
        let me = local();
        assert!(me.is_self(&PeerDescriptor::new("a", "10.0.0.9:9999".parse().unwrap())));
        assert!(me.is_self(&PeerDescriptor::new("other", "10.0.0.1:8181".parse().unwrap())));
        assert!(me.is_self(&PeerDescriptor::new("other", "[fd00::1]:8181".parse().unwrap())));
        assert!(!me.is_self(&PeerDescriptor::new("b", "10.0.0.1:9000".parse().unwrap())));
        assert!(!me.is_self(&PeerDescriptor::new("b", "10.0.0.2:8181".parse().unwrap())));
    }

    #[test]
    fn descriptor_uses_first_ip() {
        let d = local().descriptor().unwrap();
        assert_eq!(d.name, "a");
        assert_eq!(d.addr, "10.0.0.1:8181".parse().unwrap());
        assert_eq!(d.instance, Some(InstanceId([7; 16])));
    }

    #[test]
    fn health_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Health::Unreachable).unwrap(), "\"unreachable\"");
        assert_eq!(Health::default(), Health::Unknown);
    }

    #[test]
    fn descriptor_without_instance_omits_field() {
        let d = PeerDescriptor::new("b", "10.0.0.2:8181".parse().unwrap());
        let json = serde_json::to_string(&d).unwrap();
        assert!(!json.contains("instance"));
        let back: PeerDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn instance_serializes_as_hex() {
        let d = PeerDescriptor::new("b", "10.0.0.2:8181".parse().unwrap())
            .with_instance(InstanceId([0xab; 16]));
        let json = serde_json::to_value(&d).unwrap();
        assert_eq!(json["instance"], "ab".repeat(16));
        assert_eq!(json["instance"], InstanceId([0xab; 16]).to_string());

        let back: PeerDescriptor = serde_json::from_value(json).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn malformed_instance_is_rejected() {
        let short = r#"{"name":"b","addr":"10.0.0.2:8181","instance":"abcd"}"#;
        assert!(serde_json::from_str::<PeerDescriptor>(short).is_err());
        let array = r#"{"name":"b","addr":"10.0.0.2:8181","instance":[1,2,3]}"#;
        assert!(serde_json::from_str::<PeerDescriptor>(array).is_err());
    }
}
