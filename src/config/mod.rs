//! Network configuration: server/client knobs, nodes, discovery, TLS seam.

pub mod load;
pub mod schema;

pub use load::{load_from, load_or_default};
pub use schema::{
    ClientConfig, ConfigError, MulticastConfig, ServerConfig, ServerNode, SslConfig, TlsWrap,
};
