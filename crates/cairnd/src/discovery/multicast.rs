//! UDP multicast discovery transport.
//!
//! Joins the Cairn multicast group on the bound interface and turns valid
//! announcement datagrams into discovery events. Datagrams for another
//! service tag, or that fail to parse, are dropped here.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use cairn_core::wire::{Announcement, ServiceTag, MULTICAST_GROUP_V4};
use cairn_core::PeerDescriptor;
use cairn_services::{DiscoveryEvent, DiscoveryTransport};

pub fn multicast_group() -> Ipv4Addr {
    Ipv4Addr::from(MULTICAST_GROUP_V4)
}

pub struct MulticastDiscovery {
    port: u16,
    interface: Ipv4Addr,
    tag: ServiceTag,
    socket: Option<UdpSocket>,
    buf: Vec<u8>,
}

impl MulticastDiscovery {
    /// `interface` is the local IPv4 address used to join the group;
    /// `UNSPECIFIED` lets the OS choose.
    pub fn new(port: u16, interface: Ipv4Addr, tag: ServiceTag) -> Self {
        Self {
            port,
            interface,
            tag,
            socket: None,
            buf: vec![0u8; 1024],
        }
    }
}

impl DiscoveryTransport for MulticastDiscovery {
    async fn open(&mut self) -> io::Result<()> {
        self.socket = None;
        let socket = make_listener_socket(self.port, self.interface)?;
        self.socket = Some(UdpSocket::from_std(socket)?);
        tracing::info!(port = self.port, group = %multicast_group(), "discovery listener bound");
        Ok(())
    }

    async fn recv(&mut self) -> io::Result<DiscoveryEvent> {
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "discovery socket not open"))?;

        loop {
            let (len, from) = socket.recv_from(&mut self.buf).await?;

            let ann = match Announcement::decode(&self.buf[..len], &self.tag) {
                Ok(ann) => ann,
                Err(e) => {
                    tracing::trace!(from = %from, error = %e, "dropping datagram");
                    continue;
                }
            };

            if ann.departing {
                return Ok(DiscoveryEvent::Departed {
                    name: ann.name,
                    instance: Some(ann.instance),
                });
            }

            let addr = SocketAddr::new(from.ip(), ann.rpc_port);
            return Ok(DiscoveryEvent::Sighted(
                PeerDescriptor::new(ann.name, addr).with_instance(ann.instance),
            ));
        }
    }
}

/// UDP socket bound to the discovery port and joined to the group.
fn make_listener_socket(port: u16, interface: Ipv4Addr) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

    // Several nodes may share a host during development.
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;

    let bind_addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
    socket.bind(&bind_addr.into())?;

    socket.join_multicast_v4(&multicast_group(), &interface)?;
    socket.set_multicast_loop_v4(true)?;

    Ok(socket.into())
}

/// UDP socket for sending announcements out of `interface`.
pub fn make_sender_socket(interface: Ipv4Addr) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    if !interface.is_unspecified() {
        socket.set_multicast_if_v4(&interface)?;
    }
    // TTL 1 — local network only
    socket.set_multicast_ttl_v4(1)?;
    socket.set_multicast_loop_v4(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0).into())?;

    Ok(socket.into())
}
