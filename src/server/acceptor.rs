//! Accept loop: one dedicated thread feeding the worker pool.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::core::ByteChannel;
use crate::server::agent::{AgentContext, ClientIdentity};
use crate::server::handler::run_handler;
use crate::server::holder::ConnectionHolder;
use crate::server::log::ServerLogEvent;
use crate::server::pool::WorkerPool;
use crate::server::{ServerShared, ServerState};

const ACCEPT_POLL: Duration = Duration::from_millis(25);

/// Accept until the server leaves `Running` or the listener dies. A fatal
/// I/O error is logged and the loop exits; initiating halt is the owner's
/// call, not ours.
pub(crate) fn run_accept_loop(shared: Arc<ServerShared>, listener: TcpListener, pool: WorkerPool) {
    if let Err(err) = listener.set_nonblocking(true) {
        tracing::error!("acceptor failed to set nonblocking: {err}");
        return;
    }

    loop {
        if shared.state() != ServerState::Running {
            break;
        }
        match listener.accept() {
            Ok((stream, remote)) => accept_one(&shared, &pool, stream, remote),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                thread::sleep(ACCEPT_POLL);
            }
            Err(err) => {
                if shared.state() == ServerState::Running {
                    tracing::error!("acceptor dying: {err}");
                }
                break;
            }
        }
    }
    tracing::debug!("acceptor shutdown");
}

fn accept_one(shared: &Arc<ServerShared>, pool: &WorkerPool, stream: TcpStream, remote: SocketAddr) {
    // The control clone stays with the holder so halt can force the
    // socket shut while the handler owns the read/write channel.
    let control = match stream.try_clone() {
        Ok(control) => control,
        Err(err) => {
            tracing::warn!("cannot clone accepted socket from {remote}: {err}");
            return;
        }
    };

    let channel: Box<dyn ByteChannel> = match shared.config.ssl.wrapper.as_ref() {
        Some(wrapper) => match wrapper.wrap(stream) {
            Ok(channel) => channel,
            Err(err) => {
                tracing::info!("tls handshake failed for {remote}: {err}");
                let _ = control.shutdown(Shutdown::Both);
                return;
            }
        },
        None => Box::new(stream),
    };

    let holder = Arc::new(ConnectionHolder::new(control, remote));
    shared.add_channel(Arc::clone(&holder));

    let agent = shared.agents.create(AgentContext {
        identity: ClientIdentity::anonymous(remote),
        bridge: shared.bridge.clone(),
        registry: Arc::clone(&shared.registry),
        readers: Arc::clone(&shared.readers),
        authorization: shared.authorization.clone(),
        ignore_voting: Arc::clone(&shared.ignore_voting),
    });

    let task_shared = Arc::clone(shared);
    let task_holder = Arc::clone(&holder);
    let submitted = pool.submit(Box::new(move || {
        run_handler(task_shared, task_holder, channel, agent);
    }));

    match submitted {
        Ok(()) => {
            tracing::info!("connected: {remote}");
            shared.server_log.record(ServerLogEvent::Connected { remote });
        }
        Err(_) => {
            tracing::info!("ignoring connection from {remote}: server is shutting down");
            shared.remove_channel(&holder);
        }
    }
}
