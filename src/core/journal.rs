//! Journal keys and the storage capabilities the server consumes.

use std::io::{self, Read, Write};

use crate::core::event::CommitListener;

/// Stable index assigned to a published writer for the server's lifetime.
pub type WriterIndex = usize;

/// Identity of a journal: an id plus an optional storage location.
///
/// Equality is pairwise; an absent location matches only another absent
/// location.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct JournalKey {
    pub id: String,
    pub location: Option<String>,
}

impl JournalKey {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            location: None,
        }
    }

    pub fn at(id: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            location: Some(location.into()),
        }
    }
}

impl std::fmt::Display for JournalKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.location {
            Some(location) => write!(f, "{}@{location}", self.id),
            None => write!(f, "{}", self.id),
        }
    }
}

/// Append handle to a journal, owned by the embedding application.
///
/// The server only needs the key and the commit-listener seam; appending
/// and transaction logs stay behind this trait.
pub trait JournalWriter: Send + Sync {
    fn key(&self) -> &JournalKey;

    /// Install or clear the commit listener. The server installs a
    /// publisher at `start` and clears it at `halt`; implementations must
    /// invoke the listener after every committed transaction, off the
    /// commit critical path.
    fn set_commit_listener(&self, listener: Option<CommitListener>);
}

/// Read handle to a journal, opened on behalf of a connected client.
pub trait JournalReader: Send {
    fn key(&self) -> &JournalKey;

    /// Highest committed transaction sequence visible to this reader.
    fn committed_seq(&self) -> u64;
}

/// Capability to open readers; handed to per-connection agents.
pub trait ReaderFactory: Send + Sync {
    fn open_reader(&self, key: &JournalKey) -> io::Result<Box<dyn JournalReader>>;
}

/// Connected byte stream handed to agents; TLS-wrapped when configured.
pub trait ByteChannel: Read + Write + Send {}

impl<T: Read + Write + Send> ByteChannel for T {}
