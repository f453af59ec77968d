//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Wire codec, transport backends and command dispatch."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Socket backend.
//!
//! Broadcasts go out as single UDP datagrams to the configured multicast
//! group. Synchronous commands use one TCP connection carrying
//! newline-delimited JSON envelopes:
//!
//! ```text
//! -> {"msg_id":7,"topic":"R_CONFIG","payload":"{\"device\":\"pump\",...}"}
//! <- {"msg_id":7,"ok":true,"rows":["{\"data\":\"...\"}"],"error":null}
//! ```
//!
//! Replies carrying a stale `msg_id` and lines that do not parse as an
//! envelope are skipped. A timed-out request drops the connection, so the
//! next call reconnects instead of reading the tail of an abandoned reply.
use std::io::{self, BufRead, BufReader, ErrorKind, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use daqlink_common::config::BackendConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::transport::{MessagingContext, TransportBackend};
use crate::{DaqError, Result};

#[derive(Debug, Serialize)]
struct RequestEnvelope<'a> {
    msg_id: u64,
    topic: &'a str,
    payload: &'a str,
}

#[derive(Debug, Deserialize)]
struct ResponseEnvelope {
    msg_id: u64,
    ok: bool,
    #[serde(default)]
    rows: Vec<String>,
    #[serde(default)]
    error: Option<String>,
}

/// UDP multicast plus TCP request/response backend.
#[derive(Default)]
pub struct NetBackend {
    config: Option<BackendConfig>,
    multicast: Option<UdpSocket>,
    stream: Option<BufReader<TcpStream>>,
    next_id: u64,
    context: Option<Arc<MessagingContext>>,
}

impl NetBackend {
    /// Create an unconfigured backend; call `initialize` before sending.
    pub fn new() -> Self {
        Self::default()
    }

    fn config(&self) -> Result<&BackendConfig> {
        self.config
            .as_ref()
            .ok_or_else(|| DaqError::Lifecycle("net backend is not initialised".to_owned()))
    }

    fn ensure_open(&self) -> Result<()> {
        match &self.context {
            Some(context) if context.is_terminated() => Err(DaqError::Lifecycle(
                "messaging context has been terminated".to_owned(),
            )),
            _ => Ok(()),
        }
    }

    fn connection(&mut self, deadline: Instant) -> Result<&mut BufReader<TcpStream>> {
        if self.stream.is_none() {
            let config = self.config()?;
            let endpoint = config.sync_endpoint;
            let wait = config
                .connect_timeout
                .min(deadline.saturating_duration_since(Instant::now()))
                .max(Duration::from_millis(1));
            let stream = TcpStream::connect_timeout(&endpoint, wait).map_err(|err| {
                DaqError::Transport(format!("connect to {endpoint} failed: {err}"))
            })?;
            stream.set_nodelay(true)?;
            debug!(%endpoint, "sync channel connected");
            self.stream = Some(BufReader::new(stream));
        }
        self.stream
            .as_mut()
            .ok_or_else(|| DaqError::Transport("sync channel unavailable".to_owned()))
    }

    fn request(&mut self, topic: &str, payload: &str, timeout: Duration) -> Result<Vec<String>> {
        self.ensure_open()?;
        let deadline = Instant::now() + timeout;
        self.next_id = self.next_id.wrapping_add(1);
        let msg_id = self.next_id;
        let mut line = serde_json::to_string(&RequestEnvelope {
            msg_id,
            topic,
            payload,
        })?;
        line.push('\n');

        let outcome = self.exchange(msg_id, &line, deadline);
        match outcome {
            Err(DaqError::Io(err)) if is_timeout(&err) => {
                // a reply may be half read; start the next call on a clean stream
                self.stream = None;
                Err(DaqError::Timeout {
                    topic: topic.to_owned(),
                    waited: timeout,
                })
            }
            Err(err @ (DaqError::Io(_) | DaqError::Transport(_))) => {
                // a broken stream is reconnected on the next call
                self.stream = None;
                Err(err)
            }
            other => other,
        }
    }

    fn exchange(&mut self, msg_id: u64, line: &str, deadline: Instant) -> Result<Vec<String>> {
        let stream = self.connection(deadline)?;
        stream.get_mut().write_all(line.as_bytes())?;

        let mut buffer = String::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(io::Error::from(ErrorKind::TimedOut).into());
            }
            stream.get_mut().set_read_timeout(Some(remaining))?;
            buffer.clear();
            if stream.read_line(&mut buffer)? == 0 {
                return Err(DaqError::Transport(
                    "sync channel closed by peer".to_owned(),
                ));
            }
            let response: ResponseEnvelope = match serde_json::from_str(buffer.trim_end()) {
                Ok(response) => response,
                Err(err) => {
                    debug!(error = %err, "discarding unparseable reply line");
                    continue;
                }
            };
            if response.msg_id != msg_id {
                debug!(
                    expected = msg_id,
                    received = response.msg_id,
                    "discarding stale reply"
                );
                continue;
            }
            if !response.ok {
                return Err(DaqError::Transport(
                    response
                        .error
                        .unwrap_or_else(|| "request refused by middleman".to_owned()),
                ));
            }
            return Ok(response.rows);
        }
    }
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

impl TransportBackend for NetBackend {
    fn name(&self) -> &'static str {
        "net"
    }

    fn setup(&mut self, context: &Arc<MessagingContext>) {
        self.context = Some(Arc::clone(context));
    }

    fn initialize(&mut self, config: &BackendConfig) -> Result<()> {
        config
            .validate()
            .map_err(|err| DaqError::Validation(err.to_string()))?;
        let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)))?;
        socket.set_multicast_ttl_v4(config.multicast_ttl)?;
        socket.set_multicast_loop_v4(true)?;
        info!(
            sync = %config.sync_endpoint,
            multicast = %config.multicast_target(),
            "net backend initialised"
        );
        self.multicast = Some(socket);
        self.config = Some(config.clone());
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.config.is_some()
            && self
                .context
                .as_ref()
                .map_or(true, |context| !context.is_terminated())
    }

    fn send_command(&mut self, topic: &str, payload: &str, timeout: Duration) -> Result<String> {
        let mut rows = self.request(topic, payload, timeout)?;
        match rows.len() {
            1 => Ok(rows.remove(0)),
            count => Err(DaqError::protocol(format!(
                "expected one result for {topic}, got {count}"
            ))),
        }
    }

    fn send_command_rows(
        &mut self,
        topic: &str,
        payload: &str,
        timeout: Duration,
    ) -> Result<Vec<String>> {
        self.request(topic, payload, timeout)
    }

    fn send_multicast(&mut self, payload: &str) -> Result<()> {
        self.ensure_open()?;
        let target = self.config()?.multicast_target();
        let socket = self
            .multicast
            .as_ref()
            .ok_or_else(|| DaqError::Lifecycle("multicast socket is not open".to_owned()))?;
        let written = socket.send_to(payload.as_bytes(), target)?;
        if written != payload.len() {
            warn!(written, expected = payload.len(), "short multicast write");
            return Err(DaqError::Transport(format!(
                "short multicast write: {written} of {} bytes",
                payload.len()
            )));
        }
        Ok(())
    }

    fn finalize(&mut self) {
        self.stream = None;
        self.multicast = None;
        debug!("net backend finalised");
    }
}
