use thiserror::Error;

use crate::config::ConfigError;
use crate::mcast::McastError;
use crate::server::{NetError, RegistryError};

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over the capability errors the
/// individual modules return.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Net(#[from] NetError),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Mcast(#[from] McastError),
}

impl Error {
    /// Whether retrying the failed operation may succeed without changing
    /// inputs or configuration.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Config(_) | Error::Registry(_) => false,
            Error::Net(e) => e.is_retryable(),
            Error::Mcast(e) => e.is_retryable(),
        }
    }
}
