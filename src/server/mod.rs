//! Replication server: lifecycle, acceptor, per-connection handlers.

pub mod acceptor;
pub mod agent;
pub mod bridge;
pub mod handler;
pub mod holder;
pub mod log;
pub mod pool;
pub mod registry;

pub use agent::{
    Agent, AgentContext, AgentError, AgentFactory, AuthorizationHandler, ClientIdentity,
};
pub use bridge::{BridgeWait, EventBridge, Subscription};
pub use holder::ConnectionHolder;
pub use log::{ServerLog, ServerLogEvent};
pub use pool::{SubmissionRejected, WorkerPool};
pub use registry::{JOURNAL_KEY_NOT_FOUND, RegistryError, WriterRegistry};

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use thiserror::Error;

use crate::config::ServerConfig;
use crate::core::{JournalWriter, ReaderFactory, WriterIndex};
use crate::mcast::{AddressResponder, McastError, ResponderAdvert};

const DEFAULT_HALT_DEADLINE: Duration = Duration::from_secs(30);
const LINGER_GRACE: Duration = Duration::from_secs(30);
const WORKER_IDLE_TIMEOUT: Duration = Duration::from_secs(60);
const BRIDGE_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum NetError {
    #[error("server is already running")]
    AlreadyRunning,
    #[error("cannot bind {addr}: {source}")]
    Bind { addr: String, source: io::Error },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Mcast(#[from] McastError),
}

impl NetError {
    pub fn is_retryable(&self) -> bool {
        match self {
            NetError::AlreadyRunning => false,
            NetError::Bind { .. } | NetError::Io(_) => true,
            NetError::Mcast(e) => e.is_retryable(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerState {
    Stopped,
    Running,
    Halting,
}

const STATE_STOPPED: u8 = 0;
const STATE_RUNNING: u8 = 1;
const STATE_HALTING: u8 = 2;

impl ServerState {
    fn from_u8(value: u8) -> Self {
        match value {
            STATE_RUNNING => ServerState::Running,
            STATE_HALTING => ServerState::Halting,
            _ => ServerState::Stopped,
        }
    }
}

pub(crate) struct ServerShared {
    pub(crate) config: ServerConfig,
    pub(crate) instance: usize,
    state: AtomicU8,
    pub(crate) registry: Arc<WriterRegistry>,
    pub(crate) bridge: EventBridge,
    pool: Mutex<Option<WorkerPool>>,
    channels: Mutex<HashMap<u64, Arc<ConnectionHolder>>>,
    pub(crate) server_log: ServerLog,
    pub(crate) readers: Arc<dyn ReaderFactory>,
    pub(crate) agents: Arc<dyn AgentFactory>,
    pub(crate) authorization: Option<Arc<dyn AuthorizationHandler>>,
    pub(crate) ignore_voting: Arc<AtomicBool>,
    local_addr: Mutex<Option<SocketAddr>>,
    acceptor_join: Mutex<Option<JoinHandle<()>>>,
    responder: Mutex<Option<AddressResponder>>,
    // Serializes start against concurrent starts; halt is gated by the
    // state CAS instead so a worker-thread halt can never block here.
    lifecycle: Mutex<()>,
}

impl ServerShared {
    pub(crate) fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn add_channel(&self, holder: Arc<ConnectionHolder>) {
        self.channels
            .lock()
            .expect("channel set lock")
            .insert(holder.id(), holder);
    }

    pub(crate) fn remove_channel(&self, holder: &Arc<ConnectionHolder>) {
        self.channels
            .lock()
            .expect("channel set lock")
            .remove(&holder.id());
        holder.close(false);
        self.server_log.record(ServerLogEvent::Disconnected {
            remote: holder.remote(),
            forced: false,
        });
    }

    fn close_all_channels(&self) {
        let mut channels = self.channels.lock().expect("channel set lock");
        for holder in channels.values() {
            holder.close(true);
        }
        channels.clear();
    }

    fn connected_clients(&self) -> usize {
        self.channels.lock().expect("channel set lock").len()
    }

    /// Tear down whatever `start` already brought up after a mid-start
    /// failure, leaving the server `Stopped`.
    fn teardown_partial(&self) {
        if let Some(responder) = self.responder.lock().expect("responder lock").take() {
            responder.halt();
        }
        self.bridge.halt();
        self.registry.detach_publishers();
        self.registry.clear_started();
        self.server_log.halt();
        *self.local_addr.lock().expect("local addr lock") = None;
    }

    pub(crate) fn halt_with(&self, deadline: Duration) {
        let swapped = self.state.compare_exchange(
            STATE_RUNNING,
            STATE_HALTING,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if swapped.is_err() {
            return;
        }

        tracing::debug!("stopping agent services");
        let pool = self.pool.lock().expect("pool lock").take();
        if let Some(pool) = &pool {
            pool.shutdown();
        }

        self.registry.detach_publishers();

        tracing::debug!("stopping acceptor");
        let acceptor = self.acceptor_join.lock().expect("acceptor join lock").take();
        if let Some(join) = acceptor {
            let _ = join.join();
        }
        *self.local_addr.lock().expect("local addr lock") = None;

        if deadline > Duration::ZERO
            && let Some(pool) = &pool
            && !pool.await_quiescence(deadline)
        {
            tracing::debug!("worker quiescence deadline expired");
        }

        tracing::debug!("stopping bridge");
        self.bridge.halt();

        tracing::debug!("stopping mcast responder");
        if let Some(responder) = self.responder.lock().expect("responder lock").take() {
            responder.halt();
        }

        tracing::debug!("closing channels");
        self.close_all_channels();

        tracing::debug!("stopping server log");
        self.server_log.halt();

        if deadline > Duration::ZERO && let Some(pool) = &pool {
            if pool.await_quiescence(LINGER_GRACE) {
                tracing::info!("server is shutdown");
            } else {
                tracing::info!("server is shutdown, but some connections are still lingering");
            }
        }

        self.registry.clear_started();
        self.state.store(STATE_STOPPED, Ordering::Release);
    }
}

/// Streams committed journal deltas to replica clients and answers
/// on-demand discovery requests. One instance per process node.
pub struct JournalServer {
    shared: Arc<ServerShared>,
}

impl JournalServer {
    pub fn new(
        config: ServerConfig,
        instance: usize,
        readers: Arc<dyn ReaderFactory>,
        agents: Arc<dyn AgentFactory>,
        authorization: Option<Arc<dyn AuthorizationHandler>>,
    ) -> Self {
        let bridge = EventBridge::new(config.heartbeat(), BRIDGE_QUEUE_CAPACITY);
        Self {
            shared: Arc::new(ServerShared {
                config,
                instance,
                state: AtomicU8::new(STATE_STOPPED),
                registry: Arc::new(WriterRegistry::new()),
                bridge,
                pool: Mutex::new(None),
                channels: Mutex::new(HashMap::new()),
                server_log: ServerLog::new(),
                readers,
                agents,
                authorization,
                ignore_voting: Arc::new(AtomicBool::new(false)),
                local_addr: Mutex::new(None),
                acceptor_join: Mutex::new(None),
                responder: Mutex::new(None),
                lifecycle: Mutex::new(()),
            }),
        }
    }

    /// Publish a writer before `start`; its commit events will be
    /// streamed under the returned index.
    pub fn publish(&self, writer: Arc<dyn JournalWriter>) -> Result<WriterIndex, RegistryError> {
        self.shared.registry.publish(writer)
    }

    pub fn start(&self) -> Result<(), NetError> {
        let shared = &self.shared;
        let _guard = shared.lifecycle.lock().expect("lifecycle lock");
        if shared.state() != ServerState::Stopped {
            return Err(NetError::AlreadyRunning);
        }

        shared.registry.mark_started();
        shared.server_log.start();
        shared.registry.attach_publishers(&shared.bridge);

        let (host, port) = shared.config.listen_addr(shared.instance);
        let listener = match TcpListener::bind((host.as_str(), port)) {
            Ok(listener) => listener,
            Err(source) => {
                shared.teardown_partial();
                return Err(NetError::Bind {
                    addr: format!("{host}:{port}"),
                    source,
                });
            }
        };
        let local = match listener.local_addr() {
            Ok(local) => local,
            Err(err) => {
                shared.teardown_partial();
                return Err(NetError::Io(err));
            }
        };
        *shared.local_addr.lock().expect("local addr lock") = Some(local);

        if shared.config.multicast.enabled {
            let advert = ResponderAdvert {
                hostname: host.clone(),
                port: local.port(),
                ssl: shared.config.ssl.is_secure(),
            };
            match AddressResponder::start(shared.config.multicast.clone(), advert) {
                Ok(responder) => {
                    *shared.responder.lock().expect("responder lock") = Some(responder);
                }
                Err(err) => {
                    shared.teardown_partial();
                    return Err(NetError::Mcast(err));
                }
            }
        }

        shared.bridge.start();

        let pool = WorkerPool::new(
            format!("annal-server-{}-agent", shared.instance),
            WORKER_IDLE_TIMEOUT,
        );
        *shared.pool.lock().expect("pool lock") = Some(pool.clone());

        shared.state.store(STATE_RUNNING, Ordering::Release);

        let acceptor_shared = Arc::clone(shared);
        let spawned = thread::Builder::new()
            .name(format!("annal-acceptor-{}", shared.instance))
            .spawn(move || acceptor::run_accept_loop(acceptor_shared, listener, pool));
        match spawned {
            Ok(join) => {
                *shared.acceptor_join.lock().expect("acceptor join lock") = Some(join);
            }
            Err(err) => {
                shared.state.store(STATE_STOPPED, Ordering::Release);
                shared.pool.lock().expect("pool lock").take();
                shared.teardown_partial();
                return Err(NetError::Io(err));
            }
        }

        tracing::info!("server instance {} listening on {local}", shared.instance);
        Ok(())
    }

    /// Halt with the default 30-second deadline.
    pub fn halt(&self) {
        self.halt_with(DEFAULT_HALT_DEADLINE);
    }

    /// Halt, waiting up to `deadline` for in-flight handlers. A zero
    /// deadline skips the quiescence waits and is safe to call from a
    /// worker thread.
    pub fn halt_with(&self, deadline: Duration) {
        self.shared.halt_with(deadline);
    }

    pub fn state(&self) -> ServerState {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == ServerState::Running
    }

    pub fn connected_clients(&self) -> usize {
        self.shared.connected_clients()
    }

    /// Bound listen address while running; `None` when stopped.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock().expect("local addr lock")
    }

    pub fn bridge(&self) -> &EventBridge {
        &self.shared.bridge
    }

    pub fn registry(&self) -> &Arc<WriterRegistry> {
        &self.shared.registry
    }

    pub fn instance(&self) -> usize {
        self.shared.instance
    }

    pub fn is_ignore_voting(&self) -> bool {
        self.shared.ignore_voting.load(Ordering::Acquire)
    }

    pub fn set_ignore_voting(&self, ignore: bool) {
        self.shared.ignore_voting.store(ignore, Ordering::Release);
    }
}

impl Drop for JournalServer {
    fn drop(&mut self) {
        // Last-resort cleanup; embedders are expected to halt explicitly.
        self.shared.halt_with(Duration::ZERO);
    }
}
