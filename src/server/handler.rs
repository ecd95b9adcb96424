//! Per-connection cooperative loop driving one agent.

use std::sync::Arc;
use std::time::Duration;

use crate::core::ByteChannel;
use crate::server::agent::{Agent, AgentError};
use crate::server::holder::ConnectionHolder;
use crate::server::log::ServerLogEvent;
use crate::server::{ServerShared, ServerState};

/// Drive the agent until disconnect, halt or a fatal error. On exit the
/// agent is closed, the holder removed from the channel set, and a
/// cluster-vote loss escalates to a zero-deadline server halt.
pub(crate) fn run_handler(
    shared: Arc<ServerShared>,
    holder: Arc<ConnectionHolder>,
    mut channel: Box<dyn ByteChannel>,
    mut agent: Box<dyn Agent>,
) {
    let remote = holder.remote();
    let mut halt_server = false;

    loop {
        if shared.state() != ServerState::Running {
            break;
        }
        match agent.process(channel.as_mut()) {
            Ok(()) => {}
            Err(AgentError::Disconnected) => break,
            Err(AgentError::ClusterLoss { instance }) => {
                halt_server = true;
                tracing::info!("server lost cluster vote to {instance} [{remote}]");
                shared.server_log.record(ServerLogEvent::VoteLost { instance });
                break;
            }
            Err(AgentError::Unauthorized { remote }) => {
                tracing::info!("authorization denied for {remote}");
                shared.server_log.record(ServerLogEvent::SessionError {
                    remote,
                    reason: "authorization denied".to_string(),
                });
                break;
            }
            Err(AgentError::Network(err)) => {
                if shared.state() == ServerState::Running {
                    tracing::info!("client died: {remote}");
                    tracing::debug!("{err}");
                    shared.server_log.record(ServerLogEvent::SessionError {
                        remote,
                        reason: err.to_string(),
                    });
                }
                break;
            }
            Err(AgentError::Protocol { reason }) => {
                tracing::info!("protocol error from {remote}: {reason}");
                shared.server_log.record(ServerLogEvent::SessionError { remote, reason });
                break;
            }
            Err(AgentError::Other(err)) => {
                tracing::error!("unhandled error in connection handler for {remote}: {err}");
                break;
            }
        }
    }

    agent.close();
    shared.remove_channel(&holder);

    if halt_server {
        shared.halt_with(Duration::ZERO);
    }
}
