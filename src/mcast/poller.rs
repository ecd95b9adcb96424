//! Client-side poller: multicast a request, wait for a responder.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use crate::config::{MulticastConfig, ServerNode};
use crate::mcast::{McastError, frame, open_group};

/// Discovers a server's TCP endpoint over the multicast group.
pub struct AddressPoller {
    config: MulticastConfig,
}

impl AddressPoller {
    pub fn new(config: MulticastConfig) -> Self {
        Self { config }
    }

    /// Poll with the attempts and per-attempt timeout from config.
    pub fn poll(&self) -> Result<ServerNode, McastError> {
        self.poll_with(self.config.poll_attempts, self.config.poll_timeout())
    }

    /// Send up to `attempts` requests, waiting `timeout` after each, and
    /// return the first well-formed response.
    pub fn poll_with(&self, attempts: usize, timeout: Duration) -> Result<ServerNode, McastError> {
        let attempts = attempts.max(1);
        let group = open_group(&self.config)?;
        let request = frame::encode_request(self.config.request_code);
        let mut buf = [0u8; frame::MAX_FRAME_LEN];

        for attempt in 0..attempts {
            group.socket.send_to(&request, group.group)?;
            let deadline = Instant::now() + timeout;

            loop {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                group.socket.set_read_timeout(Some(deadline - now))?;
                match group.socket.recv_from(&mut buf) {
                    Ok((len, src)) => {
                        // The group echoes our own request; skip anything
                        // that does not decode as a response.
                        let Ok(advert) =
                            frame::decode_response(&buf[..len], self.config.response_code)
                        else {
                            continue;
                        };
                        let hostname = match advert.hostname.parse::<IpAddr>() {
                            Ok(ip) if ip.is_unspecified() => src.ip().to_string(),
                            _ => advert.hostname,
                        };
                        return Ok(ServerNode::new(0, hostname, advert.port));
                    }
                    Err(err)
                        if matches!(
                            err.kind(),
                            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                        ) =>
                    {
                        break;
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            tracing::debug!("discovery attempt {} of {attempts} timed out", attempt + 1);
        }

        Err(McastError::NoResponse { attempts })
    }
}
