//! Server-side on-demand address responder.

use std::net::UdpSocket;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::MulticastConfig;
use crate::mcast::{McastError, ResponderAdvert, frame, open_group};

const RECV_POLL: Duration = Duration::from_millis(250);

/// Listens on the discovery group and answers request datagrams with this
/// node's advertised endpoint.
pub struct AddressResponder {
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl AddressResponder {
    pub fn start(config: MulticastConfig, advert: ResponderAdvert) -> Result<Self, McastError> {
        let group = open_group(&config)?;
        group.socket.set_read_timeout(Some(RECV_POLL))?;
        // Encode once; a bad advert should fail start, not every reply.
        let reply = frame::encode_response(config.response_code, &advert)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let thread_shutdown = Arc::clone(&shutdown);
        let request_code = config.request_code;
        let join = thread::Builder::new()
            .name("annal-mcast-responder".to_string())
            .spawn(move || {
                run_responder_loop(group.socket, request_code, reply, thread_shutdown);
            })?;

        tracing::debug!("mcast responder on {} advertising port {}", group.group, advert.port);
        Ok(Self {
            shutdown,
            join: Some(join),
        })
    }

    pub fn halt(mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

fn run_responder_loop(
    socket: UdpSocket,
    request_code: u32,
    reply: Vec<u8>,
    shutdown: Arc<AtomicBool>,
) {
    let mut buf = [0u8; frame::MAX_FRAME_LEN];
    loop {
        if shutdown.load(Ordering::Acquire) {
            break;
        }
        match socket.recv_from(&mut buf) {
            Ok((len, src)) => {
                if frame::peek_code(&buf[..len]) != Some(request_code) {
                    continue;
                }
                match socket.send_to(&reply, src) {
                    Ok(_) => tracing::debug!("discovery reply sent to {src}"),
                    Err(err) => tracing::debug!("discovery reply to {src} failed: {err}"),
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                continue;
            }
            Err(err) => {
                if !shutdown.load(Ordering::Acquire) {
                    tracing::warn!("mcast responder receive failed: {err}");
                }
                break;
            }
        }
    }
    tracing::debug!("mcast responder shutdown");
}
