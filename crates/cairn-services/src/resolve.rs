//! Identity resolver — works out who this node is at startup.

use std::net::IpAddr;

use cairn_core::{InterfaceInfo, NodeIdentity};

/// Startup-fatal identity failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("interface '{0}' not found")]
    InterfaceNotFound(String),

    #[error("no usable address bound to interface '{0}'")]
    NoAddressBound(String),

    #[error("node name is empty and no host name is available")]
    InvalidIdentity,
}

/// An interface as the OS reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceAddrs {
    pub index: u32,
    /// Bound addresses in `ip/prefix` form, in OS order.
    pub addrs: Vec<String>,
}

/// Where interface and host facts come from.
pub trait InterfaceSource {
    /// `None` when no interface has this name.
    fn interface(&self, name: &str) -> Option<InterfaceAddrs>;

    fn hostname(&self) -> Option<String>;
}

/// Resolve this node's identity.
///
/// Unparseable addresses are logged and skipped. A blank override counts
/// as no override.
pub fn resolve<S: InterfaceSource>(
    source: &S,
    interface: &str,
    name_override: Option<&str>,
    rpc_port: u16,
) -> Result<NodeIdentity, IdentityError> {
    let iface = source
        .interface(interface)
        .ok_or_else(|| IdentityError::InterfaceNotFound(interface.to_string()))?;

    let mut ips: Vec<IpAddr> = Vec::with_capacity(iface.addrs.len());
    for raw in &iface.addrs {
        match parse_bound_addr(raw) {
            Some(ip) => {
                tracing::debug!(interface, ip = %ip, "bound address");
                if !ips.contains(&ip) {
                    ips.push(ip);
                }
            }
            None => tracing::warn!(interface, addr = %raw, "skipping unparseable address"),
        }
    }
    if ips.is_empty() {
        return Err(IdentityError::NoAddressBound(interface.to_string()));
    }

    let name = match name_override.map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) => name.to_string(),
        None => source.hostname().unwrap_or_default().trim().to_string(),
    };
    if name.is_empty() {
        return Err(IdentityError::InvalidIdentity);
    }

    let info = InterfaceInfo {
        name: interface.to_string(),
        index: iface.index,
    };
    let identity = NodeIdentity::new(name, info, ips, rpc_port);
    tracing::info!(
        node = identity.name(),
        interface,
        ips = ?identity.ips(),
        instance = %identity.instance(),
        "identity resolved"
    );
    Ok(identity)
}

/// `10.0.0.1/24` → `10.0.0.1`. A bare address is accepted too; a prefix,
/// if present, must be in range for the address family.
pub fn parse_bound_addr(raw: &str) -> Option<IpAddr> {
    let (ip, prefix) = match raw.split_once('/') {
        Some((ip, prefix)) => (ip, Some(prefix)),
        None => (raw, None),
    };
    let ip: IpAddr = ip.trim().parse().ok()?;
    if let Some(prefix) = prefix {
        let bits: u8 = prefix.trim().parse().ok()?;
        let max = if ip.is_ipv4() { 32 } else { 128 };
        if bits > max {
            return None;
        }
    }
    Some(ip)
}

// ── System source ─────────────────────────────────────────────────────────────

/// Reads interfaces from the running OS.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemInterfaces;

impl InterfaceSource for SystemInterfaces {
    fn interface(&self, name: &str) -> Option<InterfaceAddrs> {
        let index = if_index(name)?;

        let addrs = match nix::ifaddrs::getifaddrs() {
            Ok(all) => all
                .filter(|ifa| ifa.interface_name == name)
                .filter_map(|ifa| {
                    let addr = ifa.address?;
                    let netmask = ifa.netmask;
                    if let Some(v4) = addr.as_sockaddr_in() {
                        let prefix = netmask
                            .as_ref()
                            .and_then(|m| m.as_sockaddr_in())
                            .map(|m| u32::from(m.ip()).count_ones())
                            .unwrap_or(32);
                        Some(format!("{}/{}", v4.ip(), prefix))
                    } else if let Some(v6) = addr.as_sockaddr_in6() {
                        let prefix = netmask
                            .as_ref()
                            .and_then(|m| m.as_sockaddr_in6())
                            .map(|m| u128::from(m.ip()).count_ones())
                            .unwrap_or(128);
                        Some(format!("{}/{}", v6.ip(), prefix))
                    } else {
                        // link-layer entries carry no IP
                        None
                    }
                })
                .collect(),
            Err(e) => {
                tracing::warn!(interface = name, error = %e, "getifaddrs failed");
                Vec::new()
            }
        };

        Some(InterfaceAddrs { index, addrs })
    }

    fn hostname(&self) -> Option<String> {
        nix::unistd::gethostname()
            .ok()
            .and_then(|h| h.into_string().ok())
    }
}

/// OS interface index for a named interface, `None` if it does not exist.
pub fn if_index(name: &str) -> Option<u32> {
    let name_cstr = std::ffi::CString::new(name).ok()?;
    let index = unsafe { libc::if_nametoindex(name_cstr.as_ptr()) };
    (index != 0).then_some(index)
}
