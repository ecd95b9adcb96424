#![forbid(unsafe_code)]

pub mod config;
pub mod core;
pub mod error;
pub mod mcast;
pub mod server;
pub mod telemetry;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the surface embedders wire against at the crate root.
pub use crate::config::{
    ClientConfig, MulticastConfig, ServerConfig, ServerNode, SslConfig, TlsWrap,
};
pub use crate::core::{
    ByteChannel, CommitListener, CommitPublisher, JournalEvent, JournalKey, JournalReader,
    JournalWriter, ReaderFactory, WriterIndex,
};
pub use crate::mcast::{AddressPoller, AddressResponder};
pub use crate::server::{
    Agent, AgentError, AgentFactory, AuthorizationHandler, ClientIdentity, EventBridge,
    JOURNAL_KEY_NOT_FOUND, JournalServer, ServerState,
};
