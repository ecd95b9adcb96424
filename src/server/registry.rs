//! Published-writer registry: journal key to stable wire index.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::core::{CommitPublisher, JournalKey, JournalWriter, WriterIndex};
use crate::server::bridge::EventBridge;

/// Wire sentinel for a key that resolves to no published writer.
pub const JOURNAL_KEY_NOT_FOUND: i32 = -1;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("writers cannot be published while the server is running")]
    AlreadyStarted,
}

struct PublishedWriter {
    writer: Arc<dyn JournalWriter>,
    index: WriterIndex,
    publisher: Option<Arc<CommitPublisher>>,
}

/// Registry of writers published before `start`. Indices are assigned in
/// publication order and never reused for the server's lifetime.
pub struct WriterRegistry {
    next_index: AtomicUsize,
    started: AtomicBool,
    writers: Mutex<Vec<PublishedWriter>>,
}

impl WriterRegistry {
    pub fn new() -> Self {
        Self {
            next_index: AtomicUsize::new(0),
            started: AtomicBool::new(false),
            writers: Mutex::new(Vec::new()),
        }
    }

    pub fn publish(&self, writer: Arc<dyn JournalWriter>) -> Result<WriterIndex, RegistryError> {
        if self.started.load(Ordering::Acquire) {
            return Err(RegistryError::AlreadyStarted);
        }
        let index = self.next_index.fetch_add(1, Ordering::AcqRel);
        let mut writers = self.writers.lock().expect("registry lock");
        writers.push(PublishedWriter {
            writer,
            index,
            publisher: None,
        });
        Ok(index)
    }

    /// Resolve a key to the index of the writer it was published under.
    /// Absent locations match only absent locations.
    pub fn resolve(&self, key: &JournalKey) -> Option<WriterIndex> {
        let writers = self.writers.lock().expect("registry lock");
        writers
            .iter()
            .find(|published| published.writer.key() == key)
            .map(|published| published.index)
    }

    /// `resolve` for the wire layer: `JOURNAL_KEY_NOT_FOUND` on a miss.
    pub fn resolve_wire(&self, key: &JournalKey) -> i32 {
        match self.resolve(key) {
            Some(index) => index as i32,
            None => JOURNAL_KEY_NOT_FOUND,
        }
    }

    pub fn len(&self) -> usize {
        self.writers.lock().expect("registry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn mark_started(&self) {
        self.started.store(true, Ordering::Release);
    }

    pub(crate) fn clear_started(&self) {
        self.started.store(false, Ordering::Release);
    }

    /// Install a commit publisher on every published writer.
    pub(crate) fn attach_publishers(&self, bridge: &EventBridge) {
        let mut writers = self.writers.lock().expect("registry lock");
        for published in writers.iter_mut() {
            let publisher = Arc::new(CommitPublisher::new(published.index, bridge.clone()));
            published.writer.set_commit_listener(Some(Arc::clone(&publisher)));
            published.publisher = Some(publisher);
        }
    }

    /// Detach every commit publisher so no callback can enqueue into a
    /// bridge that is about to be torn down.
    pub(crate) fn detach_publishers(&self) {
        let mut writers = self.writers.lock().expect("registry lock");
        for published in writers.iter_mut() {
            if let Some(publisher) = published.publisher.take() {
                publisher.detach();
            }
            published.writer.set_commit_listener(None);
        }
    }
}

impl Default for WriterRegistry {
    fn default() -> Self {
        Self::new()
    }
}
