//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;

use annal::core::{ByteChannel, CommitListener, JournalKey, JournalReader, JournalWriter, ReaderFactory};
use annal::server::{Agent, AgentContext, AgentError, AgentFactory};

/// Writer stub that pushes commits through whatever listener the server
/// installed.
pub struct FakeWriter {
    key: JournalKey,
    listener: Mutex<Option<CommitListener>>,
}

impl FakeWriter {
    pub fn new(key: JournalKey) -> Arc<Self> {
        Arc::new(Self {
            key,
            listener: Mutex::new(None),
        })
    }

    /// Simulate a committed transaction.
    pub fn commit(&self, seq: u64) {
        let listener = self.listener.lock().unwrap();
        if let Some(listener) = listener.as_ref() {
            listener.publish(seq, Bytes::from_static(b"tx"));
        }
    }

    pub fn has_listener(&self) -> bool {
        self.listener.lock().unwrap().is_some()
    }
}

impl JournalWriter for FakeWriter {
    fn key(&self) -> &JournalKey {
        &self.key
    }

    fn set_commit_listener(&self, listener: Option<CommitListener>) {
        *self.listener.lock().unwrap() = listener;
    }
}

/// Reader factory for servers whose tests never open readers.
pub struct NoReaders;

impl ReaderFactory for NoReaders {
    fn open_reader(&self, key: &JournalKey) -> std::io::Result<Box<dyn JournalReader>> {
        Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            key.to_string(),
        ))
    }
}

/// Blocks on the channel until the peer or the server closes it.
pub struct BlockingAgent;

impl Agent for BlockingAgent {
    fn process(&mut self, channel: &mut dyn ByteChannel) -> Result<(), AgentError> {
        let mut buf = [0u8; 64];
        match channel.read(&mut buf) {
            Ok(0) => Err(AgentError::Disconnected),
            Ok(_) => Ok(()),
            Err(err) => Err(AgentError::Network(err)),
        }
    }

    fn close(&mut self) {}
}

pub struct BlockingFactory;

impl AgentFactory for BlockingFactory {
    fn create(&self, _context: AgentContext) -> Box<dyn Agent> {
        Box::new(BlockingAgent)
    }
}

/// Poll `check` until it holds or `timeout` expires.
pub fn wait_until(timeout: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}
