//! Connection ownership and idempotent close.

use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// One accepted connection: the control handle used to force the socket
/// shut plus the remote address. The handler owns the read/write channel;
/// this holder is what the server keeps in its channel set.
pub struct ConnectionHolder {
    id: u64,
    remote: SocketAddr,
    control: TcpStream,
    closed: AtomicBool,
}

impl ConnectionHolder {
    pub fn new(control: TcpStream, remote: SocketAddr) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::AcqRel),
            remote,
            control,
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    /// Shut the socket down, unblocking any read or write in flight.
    /// Idempotent; close errors degrade to a warning since the channel is
    /// unusable either way.
    pub fn close(&self, force: bool) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if force {
            tracing::info!("client forced out: {}", self.remote);
        } else {
            tracing::info!("client disconnected: {}", self.remote);
        }
        if let Err(err) = self.control.shutdown(Shutdown::Both) {
            tracing::warn!("cannot close channel for {}: {err}", self.remote);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
