//! Server lifecycle integration: start/stop, cluster-vote loss, restarts.

use std::io::Read;
use std::net::TcpStream;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use annal::config::{MulticastConfig, ServerConfig, ServerNode};
use annal::core::{ByteChannel, JournalKey};
use annal::server::{
    Agent, AgentContext, AgentError, AgentFactory, JournalServer, RegistryError, ServerState,
};

mod common;
use common::{BlockingAgent, BlockingFactory, FakeWriter, NoReaders, wait_until};

/// First connection blocks as a bystander; the second loses the vote.
struct VoteLossFactory {
    connections: AtomicUsize,
}

struct VoteLossAgent;

impl Agent for VoteLossAgent {
    fn process(&mut self, _channel: &mut dyn ByteChannel) -> Result<(), AgentError> {
        Err(AgentError::ClusterLoss { instance: 7 })
    }

    fn close(&mut self) {}
}

impl AgentFactory for VoteLossFactory {
    fn create(&self, _context: AgentContext) -> Box<dyn Agent> {
        // Connection 0 is a blocking bystander; connection 1 loses the vote.
        match self.connections.fetch_add(1, Ordering::AcqRel) {
            1 => Box::new(VoteLossAgent),
            _ => Box::new(BlockingAgent),
        }
    }
}

fn loopback_config() -> ServerConfig {
    ServerConfig {
        heartbeat_ms: 100,
        nodes: vec![ServerNode::new(0, "127.0.0.1", 0)],
        multicast: MulticastConfig {
            enabled: false,
            ..MulticastConfig::default()
        },
        ..ServerConfig::default()
    }
}

fn server(agents: Arc<dyn AgentFactory>) -> JournalServer {
    JournalServer::new(loopback_config(), 0, Arc::new(NoReaders), agents, None)
}

#[test]
fn start_and_halt_empty_server() {
    let server = server(Arc::new(BlockingFactory));
    assert_eq!(server.state(), ServerState::Stopped);
    assert!(server.local_addr().is_none());

    server.start().unwrap();
    assert_eq!(server.state(), ServerState::Running);
    let addr = server.local_addr().expect("listening address");
    assert_ne!(addr.port(), 0);

    server.halt_with(Duration::from_secs(5));
    assert_eq!(server.state(), ServerState::Stopped);
    assert_eq!(server.connected_clients(), 0);
    assert!(server.local_addr().is_none());
    assert!(TcpStream::connect(addr).is_err(), "listener must be closed");
}

#[test]
fn start_twice_is_rejected() {
    let server = server(Arc::new(BlockingFactory));
    server.start().unwrap();
    assert!(server.start().is_err());
    server.halt_with(Duration::from_millis(200));
}

#[test]
fn halt_twice_is_idempotent() {
    let server = server(Arc::new(BlockingFactory));
    server.start().unwrap();
    server.halt_with(Duration::from_millis(200));
    server.halt_with(Duration::from_millis(200));
    assert_eq!(server.state(), ServerState::Stopped);
}

#[test]
fn halt_from_stopped_is_a_no_op() {
    let server = server(Arc::new(BlockingFactory));
    server.halt();
    assert_eq!(server.state(), ServerState::Stopped);
}

#[test]
fn publish_after_start_is_rejected() {
    let server = server(Arc::new(BlockingFactory));
    server
        .publish(FakeWriter::new(JournalKey::new("quotes")))
        .unwrap();
    server.start().unwrap();
    assert!(matches!(
        server.publish(FakeWriter::new(JournalKey::new("trades"))),
        Err(RegistryError::AlreadyStarted)
    ));
    server.halt_with(Duration::from_millis(200));
}

#[test]
fn connected_client_is_tracked_and_forced_out_on_halt() {
    let server = server(Arc::new(BlockingFactory));
    server.start().unwrap();
    let addr = server.local_addr().unwrap();

    let mut client = TcpStream::connect(addr).unwrap();
    assert!(
        wait_until(Duration::from_secs(5), || server.connected_clients() == 1),
        "client never registered"
    );

    server.halt_with(Duration::from_millis(200));
    assert_eq!(server.state(), ServerState::Stopped);
    assert_eq!(server.connected_clients(), 0);

    // Force-close surfaces as EOF on the client side.
    client
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    let mut buf = [0u8; 1];
    assert_eq!(client.read(&mut buf).unwrap_or(0), 0);
}

#[test]
fn cluster_vote_loss_halts_the_whole_server() {
    let server = server(Arc::new(VoteLossFactory {
        connections: AtomicUsize::new(0),
    }));
    server.start().unwrap();
    let addr = server.local_addr().unwrap();

    // First a bystander connection that just blocks.
    let _bystander = TcpStream::connect(addr).unwrap();
    assert!(wait_until(Duration::from_secs(5), || {
        server.connected_clients() == 1
    }));

    // The second connection's agent reports the lost vote.
    let _loser = TcpStream::connect(addr).unwrap();

    assert!(
        wait_until(Duration::from_secs(10), || {
            server.state() == ServerState::Stopped
        }),
        "cluster loss must drive the server to Stopped"
    );
    assert_eq!(server.connected_clients(), 0);
    assert!(TcpStream::connect(addr).is_err(), "listener must be closed");
}

#[test]
fn server_restarts_after_halt() {
    let server = server(Arc::new(BlockingFactory));
    server.start().unwrap();
    server.halt_with(Duration::from_millis(200));

    server.start().unwrap();
    assert_eq!(server.state(), ServerState::Running);
    let addr = server.local_addr().unwrap();
    assert!(TcpStream::connect(addr).is_ok());
    server.halt_with(Duration::from_millis(200));
}

#[test]
fn ignore_voting_flag_round_trips() {
    let server = server(Arc::new(BlockingFactory));
    assert!(!server.is_ignore_voting());
    server.set_ignore_voting(true);
    assert!(server.is_ignore_voting());
    server.set_ignore_voting(false);
    assert!(!server.is_ignore_voting());
}
