//! On-demand discovery over UDP multicast: clients ask "where is the
//! server?", the responder answers with this node's TCP endpoint.

pub mod frame;
pub mod poller;
pub mod responder;

pub use frame::FrameError;
pub use poller::AddressPoller;
pub use responder::AddressResponder;

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

use socket2::{Domain, Protocol, Socket, Type};
use thiserror::Error;

use crate::config::MulticastConfig;

/// Default discovery group, IPv4 family.
pub const DEFAULT_GROUP_V4: Ipv4Addr = Ipv4Addr::new(230, 100, 12, 4);
/// Default discovery group, IPv6 family (link-local scope).
pub const DEFAULT_GROUP_V6: Ipv6Addr = Ipv6Addr::new(0xff02, 0x0231, 0, 0, 0, 0, 0, 0x4500);

#[derive(Debug, Error)]
pub enum McastError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("multicast group {group} unavailable: {source}")]
    Group { group: IpAddr, source: io::Error },
    #[error("invalid interface spec '{spec}'")]
    BadInterface { spec: String },
    #[error("interface {interface} does not support multicast: {source}")]
    MulticastUnsupported { interface: String, source: io::Error },
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("no discovery response after {attempts} attempts")]
    NoResponse { attempts: usize },
}

impl McastError {
    pub fn is_retryable(&self) -> bool {
        match self {
            McastError::Io(_) | McastError::Group { .. } | McastError::NoResponse { .. } => true,
            McastError::BadInterface { .. }
            | McastError::MulticastUnsupported { .. }
            | McastError::Frame(_) => false,
        }
    }
}

/// What the responder advertises about this node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResponderAdvert {
    pub hostname: String,
    pub port: u16,
    pub ssl: bool,
}

pub(crate) struct GroupSocket {
    pub socket: UdpSocket,
    pub group: SocketAddr,
}

/// Open a datagram socket joined to the discovery group. With no explicit
/// group configured, IPv4 is tried first and IPv6 is the fallback.
pub(crate) fn open_group(config: &MulticastConfig) -> Result<GroupSocket, McastError> {
    match config.address {
        Some(addr) => open_family(config, addr),
        None => match open_family(config, IpAddr::V4(DEFAULT_GROUP_V4)) {
            Ok(group) => Ok(group),
            Err(v4_err) => {
                tracing::debug!("ipv4 discovery group unavailable ({v4_err}), trying ipv6");
                open_family(config, IpAddr::V6(DEFAULT_GROUP_V6)).map_err(|_| v4_err)
            }
        },
    }
}

fn open_family(config: &MulticastConfig, group_ip: IpAddr) -> Result<GroupSocket, McastError> {
    let domain = match group_ip {
        IpAddr::V4(_) => Domain::IPV4,
        IpAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_recv_buffer_size(config.so_rcvbuf)?;

    let bind_ip = match group_ip {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    socket.bind(&SocketAddr::new(bind_ip, config.port).into())?;

    match group_ip {
        IpAddr::V4(group) => {
            let interface = match config.if_name.as_deref() {
                Some(spec) => spec.parse::<Ipv4Addr>().map_err(|_| McastError::BadInterface {
                    spec: spec.to_string(),
                })?,
                None => primary_interface_v4(group, config.port),
            };
            // Routing sends through the chosen interface; failure here is
            // the interface telling us it cannot do multicast, before any
            // join is attempted.
            socket
                .set_multicast_if_v4(&interface)
                .map_err(|source| McastError::MulticastUnsupported {
                    interface: interface.to_string(),
                    source,
                })?;
            socket
                .join_multicast_v4(&group, &interface)
                .map_err(|source| McastError::Group {
                    group: group_ip,
                    source,
                })?;
            socket.set_multicast_loop_v4(true)?;
        }
        IpAddr::V6(group) => {
            let index = match config.if_name.as_deref() {
                Some(spec) => spec.parse::<u32>().map_err(|_| McastError::BadInterface {
                    spec: spec.to_string(),
                })?,
                None => primary_interface_v6(group, config.port),
            };
            socket
                .set_multicast_if_v6(index)
                .map_err(|source| McastError::MulticastUnsupported {
                    interface: index.to_string(),
                    source,
                })?;
            socket
                .join_multicast_v6(&group, index)
                .map_err(|source| McastError::Group {
                    group: group_ip,
                    source,
                })?;
            socket.set_multicast_loop_v6(true)?;
        }
    }

    Ok(GroupSocket {
        socket: socket.into(),
        group: SocketAddr::new(group_ip, config.port),
    })
}

/// Interface carrying the local host's primary IPv4 address for this
/// group. A connected datagram socket consults the routing table without
/// sending anything; its local address names the egress interface. Falls
/// back to the OS default only when that lookup fails.
fn primary_interface_v4(group: Ipv4Addr, port: u16) -> Ipv4Addr {
    fn probe(group: Ipv4Addr, port: u16) -> io::Result<Ipv4Addr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect((group, port))?;
        match socket.local_addr()?.ip() {
            IpAddr::V4(ip) if !ip.is_unspecified() => Ok(ip),
            other => Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no primary ipv4 address ({other})"),
            )),
        }
    }
    match probe(group, port) {
        Ok(interface) => interface,
        Err(err) => {
            tracing::debug!("primary ipv4 interface lookup failed, using os default: {err}");
            Ipv4Addr::UNSPECIFIED
        }
    }
}

/// IPv6 counterpart of `primary_interface_v4`: the probe's scope id is
/// the interface index.
fn primary_interface_v6(group: Ipv6Addr, port: u16) -> u32 {
    fn probe(group: Ipv6Addr, port: u16) -> io::Result<u32> {
        let socket = UdpSocket::bind((Ipv6Addr::UNSPECIFIED, 0))?;
        socket.connect((group, port))?;
        match socket.local_addr()? {
            SocketAddr::V6(addr) => Ok(addr.scope_id()),
            SocketAddr::V4(_) => Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "no primary ipv6 address",
            )),
        }
    }
    match probe(group, port) {
        Ok(index) => index,
        Err(err) => {
            tracing::debug!("primary ipv6 interface lookup failed, using os default: {err}");
            0
        }
    }
}
