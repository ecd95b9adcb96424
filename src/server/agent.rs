//! Per-connection protocol driver contract.
//!
//! The agent owns the wire codec for transaction streaming; the server
//! only drives it one bounded step at a time and interprets the error
//! taxonomy below.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use thiserror::Error;

use crate::core::{ByteChannel, JournalKey, ReaderFactory};
use crate::server::bridge::EventBridge;
use crate::server::registry::WriterRegistry;

/// Who is on the other end of the channel.
#[derive(Clone, Debug)]
pub struct ClientIdentity {
    pub remote: SocketAddr,
    /// Principal established by the protocol handshake, when there is one.
    pub principal: Option<String>,
}

impl ClientIdentity {
    pub fn anonymous(remote: SocketAddr) -> Self {
        Self {
            remote,
            principal: None,
        }
    }
}

/// Decides whether a client may follow the journals it asked for.
pub trait AuthorizationHandler: Send + Sync {
    fn authorize(&self, identity: &ClientIdentity, requested: &[JournalKey]) -> bool;
}

/// How one `process` step ended, when it did not end normally.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Peer hung up; the handler ends the connection quietly.
    #[error("peer disconnected")]
    Disconnected,
    /// A cluster peer claimed authority; the whole server must halt.
    #[error("lost cluster vote to instance {instance}")]
    ClusterLoss { instance: usize },
    /// Unrecoverable transport failure on this connection.
    #[error("network error: {0}")]
    Network(#[from] io::Error),
    /// The authorization step denied the requested journals.
    #[error("authorization denied for {remote}")]
    Unauthorized { remote: SocketAddr },
    /// Malformed frame or out-of-contract message from the peer.
    #[error("protocol error: {reason}")]
    Protocol { reason: String },
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

/// One connection's protocol driver.
///
/// `process` performs a single bounded unit of request/response or
/// event-drain work and may suspend on the channel or on the bridge;
/// returning `Ok(())` means "loop again". `close` releases per-connection
/// resources and is called exactly once by the handler.
pub trait Agent: Send {
    fn process(&mut self, channel: &mut dyn ByteChannel) -> Result<(), AgentError>;
    fn close(&mut self);
}

/// Everything an agent may need from the server, captured at accept time.
#[derive(Clone)]
pub struct AgentContext {
    pub identity: ClientIdentity,
    pub bridge: EventBridge,
    pub registry: Arc<WriterRegistry>,
    pub readers: Arc<dyn ReaderFactory>,
    pub authorization: Option<Arc<dyn AuthorizationHandler>>,
    /// Set by operators to keep a node alive through cluster votes.
    pub ignore_voting: Arc<AtomicBool>,
}

/// Builds one agent per accepted connection.
pub trait AgentFactory: Send + Sync {
    fn create(&self, context: AgentContext) -> Box<dyn Agent>;
}
