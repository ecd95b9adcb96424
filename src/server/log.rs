//! Connection-audit log drained off the hot path.

use std::net::SocketAddr;
use std::sync::Mutex;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender};

/// Lifecycle records emitted by the acceptor and handlers.
#[derive(Clone, Debug)]
pub enum ServerLogEvent {
    Connected { remote: SocketAddr },
    Disconnected { remote: SocketAddr, forced: bool },
    SessionError { remote: SocketAddr, reason: String },
    VoteLost { instance: usize },
}

struct Running {
    tx: Sender<ServerLogEvent>,
    join: JoinHandle<()>,
}

/// Audit-log worker. Records are enqueued from connection threads and
/// written out on a dedicated thread so slow sinks never stall accepts.
pub struct ServerLog {
    running: Mutex<Option<Running>>,
}

impl ServerLog {
    pub fn new() -> Self {
        Self {
            running: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        let mut running = self.running.lock().expect("server log lock");
        if running.is_some() {
            return;
        }
        let (tx, rx) = channel::unbounded::<ServerLogEvent>();
        let join = thread::Builder::new()
            .name("annal-server-log".to_string())
            .spawn(move || {
                while let Ok(event) = rx.recv() {
                    emit(&event);
                }
            })
            .expect("spawn server log thread");
        *running = Some(Running { tx, join });
    }

    pub fn record(&self, event: ServerLogEvent) {
        let running = self.running.lock().expect("server log lock");
        if let Some(running) = running.as_ref() {
            let _ = running.tx.send(event);
        }
    }

    /// Drain and stop the worker. Records sent after this are dropped.
    pub fn halt(&self) {
        let running = self.running.lock().expect("server log lock").take();
        if let Some(Running { tx, join }) = running {
            drop(tx);
            let _ = join.join();
        }
    }
}

impl Default for ServerLog {
    fn default() -> Self {
        Self::new()
    }
}

fn emit(event: &ServerLogEvent) {
    match event {
        ServerLogEvent::Connected { remote } => {
            tracing::info!(target: "annal::audit", %remote, "connected");
        }
        ServerLogEvent::Disconnected { remote, forced } => {
            tracing::info!(target: "annal::audit", %remote, forced, "disconnected");
        }
        ServerLogEvent::SessionError { remote, reason } => {
            tracing::info!(target: "annal::audit", %remote, reason, "session error");
        }
        ServerLogEvent::VoteLost { instance } => {
            tracing::info!(target: "annal::audit", instance, "cluster vote lost");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_without_start_is_dropped() {
        let log = ServerLog::new();
        log.record(ServerLogEvent::VoteLost { instance: 7 });
        log.halt();
    }

    #[test]
    fn start_and_halt_are_idempotent() {
        let log = ServerLog::new();
        log.start();
        log.start();
        log.record(ServerLogEvent::VoteLost { instance: 1 });
        log.halt();
        log.halt();
    }
}
