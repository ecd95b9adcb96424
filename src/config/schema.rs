//! Configuration structs with serde defaults.

use std::fmt;
use std::io;
use std::net::{IpAddr, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use socket2::{Domain, Socket, Type};
use thiserror::Error;

use crate::core::ByteChannel;

/// Fallback data port when a node does not specify one.
pub const DEFAULT_DATA_PORT: u16 = 7075;
/// Multicast group port for on-demand discovery.
pub const DEFAULT_MULTICAST_PORT: u16 = 4446;

const DEFAULT_SO_RCVBUF: usize = 1024 * 1024;
const DEFAULT_SO_SNDBUF: usize = 8192;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid node spec '{spec}': {reason}")]
    InvalidNode { spec: String, reason: String },
    #[error("no server nodes configured and multicast discovery is disabled")]
    NoNodes,
    #[error("multicast discovery failed: {0}")]
    Discovery(#[from] crate::mcast::McastError),
    #[error("could not connect to any configured node")]
    NoReachableNode,
    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },
}

/// One addressable server in the cluster. `id` is matched against the
/// process's instance number to pick the listen address.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerNode {
    pub id: usize,
    pub hostname: String,
    #[serde(default = "default_data_port")]
    pub port: u16,
}

fn default_data_port() -> u16 {
    DEFAULT_DATA_PORT
}

impl ServerNode {
    pub fn new(id: usize, hostname: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            hostname: hostname.into(),
            port,
        }
    }

    /// Parse a `host:port[,host:port...]` list, assigning sequential ids.
    /// IPv6 literals use brackets: `[::1]:7075`.
    pub fn parse(spec: &str) -> Result<Vec<ServerNode>, ConfigError> {
        let mut nodes = Vec::new();
        for (id, part) in spec.split(',').enumerate() {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (hostname, port) = split_host_port(part)?;
            nodes.push(ServerNode::new(id, hostname, port));
        }
        Ok(nodes)
    }
}

impl fmt::Display for ServerNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} (id {})", self.hostname, self.port, self.id)
    }
}

fn split_host_port(part: &str) -> Result<(String, u16), ConfigError> {
    let invalid = |reason: &str| ConfigError::InvalidNode {
        spec: part.to_string(),
        reason: reason.to_string(),
    };

    if let Some(rest) = part.strip_prefix('[') {
        let end = rest.find(']').ok_or_else(|| invalid("unterminated '['"))?;
        let hostname = rest[..end].to_string();
        let tail = &rest[end + 1..];
        if tail.is_empty() {
            return Ok((hostname, DEFAULT_DATA_PORT));
        }
        let port = tail
            .strip_prefix(':')
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| invalid("bad port"))?;
        return Ok((hostname, port));
    }

    match part.rsplit_once(':') {
        Some((host, port)) => {
            let port = port.parse().map_err(|_| invalid("bad port"))?;
            Ok((host.to_string(), port))
        }
        None => Ok((part.to_string(), DEFAULT_DATA_PORT)),
    }
}

/// On-demand discovery settings, shared by responder and poller.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MulticastConfig {
    pub enabled: bool,
    /// Override for the group address; family-dependent default otherwise.
    pub address: Option<IpAddr>,
    pub port: u16,
    /// Forced network interface: an IPv4 interface address or an IPv6
    /// interface index. OS default when absent.
    pub if_name: Option<String>,
    pub so_rcvbuf: usize,
    /// Poller request / responder reply codes, agreed out-of-band.
    pub request_code: u32,
    pub response_code: u32,
    pub poll_attempts: usize,
    pub poll_timeout_ms: u64,
}

impl Default for MulticastConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            address: None,
            port: DEFAULT_MULTICAST_PORT,
            if_name: None,
            so_rcvbuf: DEFAULT_SO_RCVBUF,
            request_code: 230,
            response_code: 235,
            poll_attempts: 3,
            poll_timeout_ms: 500,
        }
    }
}

impl MulticastConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// TLS seam. Key material and certificate handling live behind the
/// wrapper capability; the server only asks it to wrap accepted streams.
pub trait TlsWrap: Send + Sync {
    fn wrap(&self, stream: TcpStream) -> io::Result<Box<dyn ByteChannel>>;
}

#[derive(Clone, Default)]
pub struct SslConfig {
    pub wrapper: Option<Arc<dyn TlsWrap>>,
}

impl SslConfig {
    pub fn secure(wrapper: Arc<dyn TlsWrap>) -> Self {
        Self {
            wrapper: Some(wrapper),
        }
    }

    pub fn is_secure(&self) -> bool {
        self.wrapper.is_some()
    }
}

impl fmt::Debug for SslConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SslConfig")
            .field("secure", &self.is_secure())
            .finish()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bridge heartbeat cadence in milliseconds.
    pub heartbeat_ms: u64,
    pub nodes: Vec<ServerNode>,
    pub multicast: MulticastConfig,
    #[serde(skip)]
    pub ssl: SslConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            heartbeat_ms: 1000,
            nodes: Vec::new(),
            multicast: MulticastConfig::default(),
            ssl: SslConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn heartbeat(&self) -> Duration {
        Duration::from_millis(self.heartbeat_ms)
    }

    pub fn node(&self, instance: usize) -> Option<&ServerNode> {
        self.nodes.iter().find(|node| node.id == instance)
    }

    /// Listen address for this instance. Falls back to the wildcard
    /// address and the default data port when no node entry exists.
    pub fn listen_addr(&self, instance: usize) -> (String, u16) {
        match self.node(instance) {
            Some(node) => (node.hostname.clone(), node.port),
            None => ("0.0.0.0".to_string(), DEFAULT_DATA_PORT),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub nodes: Vec<ServerNode>,
    pub tcp_no_delay: bool,
    pub keep_alive: bool,
    pub so_snd_buf: usize,
    pub so_rcvbuf: usize,
    pub so_linger_secs: u64,
    pub multicast: MulticastConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            nodes: Vec::new(),
            tcp_no_delay: true,
            keep_alive: true,
            so_snd_buf: DEFAULT_SO_SNDBUF,
            so_rcvbuf: DEFAULT_SO_RCVBUF,
            so_linger_secs: 0,
            multicast: MulticastConfig::default(),
        }
    }
}

impl ClientConfig {
    pub fn with_hosts(hosts: &str) -> Result<Self, ConfigError> {
        Ok(Self {
            nodes: ServerNode::parse(hosts)?,
            ..Self::default()
        })
    }

    /// Connect to the first reachable node, discovering one over multicast
    /// when the node list is empty.
    pub fn open_socket(&self) -> Result<TcpStream, ConfigError> {
        let discovered;
        let nodes: &[ServerNode] = if self.nodes.is_empty() {
            if !self.multicast.enabled {
                return Err(ConfigError::NoNodes);
            }
            let node = crate::mcast::AddressPoller::new(self.multicast.clone()).poll()?;
            discovered = [node];
            &discovered
        } else {
            &self.nodes
        };

        for node in nodes {
            match self.connect_node(node) {
                Ok(stream) => {
                    tracing::info!("connected to {node}");
                    return Ok(stream);
                }
                Err(err) => {
                    tracing::info!("node {node} is unavailable: {err}");
                }
            }
        }
        Err(ConfigError::NoReachableNode)
    }

    fn connect_node(&self, node: &ServerNode) -> io::Result<TcpStream> {
        let mut last_err = None;
        for addr in (node.hostname.as_str(), node.port).to_socket_addrs()? {
            let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
            socket.set_nodelay(self.tcp_no_delay)?;
            socket.set_keepalive(self.keep_alive)?;
            socket.set_send_buffer_size(self.so_snd_buf)?;
            socket.set_recv_buffer_size(self.so_rcvbuf)?;
            socket.set_linger(Some(Duration::from_secs(self.so_linger_secs)))?;
            match socket.connect(&addr.into()) {
                Ok(()) => return Ok(socket.into()),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "hostname resolved to nothing")
        }))
    }
}
