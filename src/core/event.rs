//! Commit events and the publisher handle installed on writers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;

use crate::core::journal::WriterIndex;
use crate::server::bridge::EventBridge;

/// A committed-transaction notification fanned out to subscribers.
///
/// Events for one writer index are totally ordered by `seq`; no ordering
/// is defined across indices.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JournalEvent {
    pub writer_index: WriterIndex,
    pub seq: u64,
    pub descriptor: Bytes,
}

impl JournalEvent {
    pub fn new(writer_index: WriterIndex, seq: u64, descriptor: Bytes) -> Self {
        Self {
            writer_index,
            seq,
            descriptor,
        }
    }
}

/// Listener installed on a writer at server start.
pub type CommitListener = Arc<CommitPublisher>;

/// Pushes a writer's commit events into the bridge.
///
/// The writer owns this handle, not a back-pointer into the server: after
/// `detach` every call becomes a no-op, so a commit callback racing with
/// `halt` can never enqueue into a torn-down bridge.
pub struct CommitPublisher {
    writer_index: WriterIndex,
    bridge: EventBridge,
    detached: AtomicBool,
}

impl CommitPublisher {
    pub fn new(writer_index: WriterIndex, bridge: EventBridge) -> Self {
        Self {
            writer_index,
            bridge,
            detached: AtomicBool::new(false),
        }
    }

    pub fn writer_index(&self) -> WriterIndex {
        self.writer_index
    }

    /// Publish one committed transaction. No-op once detached.
    pub fn publish(&self, seq: u64, descriptor: Bytes) {
        if self.detached.load(Ordering::Acquire) {
            return;
        }
        self.bridge
            .publish(JournalEvent::new(self.writer_index, seq, descriptor));
    }

    pub fn detach(&self) {
        self.detached.store(true, Ordering::Release);
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }
}
