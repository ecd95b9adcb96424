//! Core journal model: keys, writer/reader capabilities, commit events.

pub mod event;
pub mod journal;

pub use event::{CommitListener, CommitPublisher, JournalEvent};
pub use journal::{
    ByteChannel, JournalKey, JournalReader, JournalWriter, ReaderFactory, WriterIndex,
};
