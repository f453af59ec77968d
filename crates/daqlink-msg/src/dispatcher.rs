//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Wire codec, transport backends and command dispatch."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use daqlink_common::config::BackendConfig;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::codec::Payload;
use crate::logging::{log_command, DispatchMetricsExporter, MessageDirection};
use crate::transport::{MessagingContext, TransportBackend};
use crate::types::{Command, DeliveryMode, Reply};
use crate::{DaqError, Result};

/// Largest serialized payload handed to a backend.
pub const MAX_PAYLOAD_BYTES: usize = 655_355;

/// Snapshot of dispatcher counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchMetrics {
    /// Commands the backend accepted.
    pub sent: u64,
    /// Commands the backend failed to deliver.
    pub failed: u64,
    /// Commands refused by the size guard.
    pub rejected: u64,
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> DispatchMetrics {
        DispatchMetrics {
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        }
    }
}

/// Routes commands to the transport backend.
///
/// Every send goes through one lock around the backend, so concurrent callers
/// are serialised. The size guard runs before the lock is taken.
pub struct Dispatcher {
    backend: Mutex<Box<dyn TransportBackend>>,
    counters: Counters,
    exporter: Option<DispatchMetricsExporter>,
}

impl Dispatcher {
    /// Wrap a backend.
    pub fn new(backend: Box<dyn TransportBackend>) -> Self {
        Self {
            backend: Mutex::new(backend),
            counters: Counters::default(),
            exporter: None,
        }
    }

    /// Attach a prometheus exporter.
    pub fn with_metrics(mut self, exporter: DispatchMetricsExporter) -> Self {
        self.attach_metrics(exporter);
        self
    }

    /// Attach a prometheus exporter to an existing dispatcher.
    pub fn attach_metrics(&mut self, exporter: DispatchMetricsExporter) {
        self.exporter = Some(exporter);
    }

    /// Name of the wrapped backend.
    pub fn backend_name(&self) -> &'static str {
        self.backend.lock().name()
    }

    /// Bind the backend to a messaging context.
    pub fn setup(&self, context: &Arc<MessagingContext>) {
        self.backend.lock().setup(context);
    }

    /// Initialise the backend.
    pub fn initialize(&self, config: &BackendConfig) -> Result<()> {
        let mut backend = self.backend.lock();
        backend.initialize(config)?;
        debug!(backend = backend.name(), "transport backend initialised");
        Ok(())
    }

    /// Whether the backend reports itself ready.
    pub fn is_ready(&self) -> bool {
        self.backend.lock().is_ready()
    }

    /// Release the backend.
    pub fn finalize(&self) {
        let mut backend = self.backend.lock();
        backend.finalize();
        debug!(backend = backend.name(), "transport backend finalised");
    }

    /// Counter snapshot.
    pub fn metrics(&self) -> DispatchMetrics {
        self.counters.snapshot()
    }

    /// Send a command using its delivery mode.
    ///
    /// Payloads longer than [`MAX_PAYLOAD_BYTES`] fail with
    /// [`DaqError::PayloadTooLarge`] and never reach the backend. A successful
    /// synchronous reply only means the backend delivered the request; whether
    /// the remote side acted on it is up to the caller to judge from the reply.
    pub fn dispatch(&self, command: &Command) -> Result<Reply> {
        let wire = command.payload.to_wire();
        let mode = command.mode.as_str();
        if wire.len() > MAX_PAYLOAD_BYTES {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            if let Some(exporter) = &self.exporter {
                exporter.observe_rejected(mode);
            }
            log_command(MessageDirection::Rejected, command, wire.len());
            warn!(
                topic = command.label(),
                size = wire.len(),
                limit = MAX_PAYLOAD_BYTES,
                "payload exceeds size limit, not sent"
            );
            return Err(DaqError::PayloadTooLarge {
                size: wire.len(),
                limit: MAX_PAYLOAD_BYTES,
            });
        }

        log_command(MessageDirection::Outbound, command, wire.len());
        let started = Instant::now();
        let outcome = {
            let mut backend = self.backend.lock();
            match (command.mode, command.topic.as_deref()) {
                (DeliveryMode::Multicast, _) => backend.send_multicast(&wire).map(|()| Reply::None),
                (DeliveryMode::SyncSingle, Some(topic)) => backend
                    .send_command(topic, &wire, command.timeout)
                    .map(Reply::Single),
                (DeliveryMode::SyncMulti, Some(topic)) => backend
                    .send_command_rows(topic, &wire, command.timeout)
                    .map(Reply::Rows),
                (_, None) => Err(DaqError::Validation(
                    "synchronous command without a topic".to_owned(),
                )),
            }
        };
        let elapsed = started.elapsed();

        match &outcome {
            Ok(_) => {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
                if let Some(exporter) = &self.exporter {
                    exporter.observe_sent(mode);
                    exporter.observe_latency(mode, elapsed);
                }
                if command.mode.is_sync() {
                    log_command(MessageDirection::Inbound, command, wire.len());
                }
            }
            Err(err) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                if let Some(exporter) = &self.exporter {
                    exporter.observe_failed(mode, err.category().as_str());
                }
                warn!(
                    topic = command.label(),
                    mode,
                    category = err.category().as_str(),
                    error = %err,
                    "dispatch failed"
                );
            }
        }
        outcome
    }

    /// Synchronous request expecting exactly one result string.
    pub fn send_sync(&self, topic: &str, payload: Payload, timeout: Duration) -> Result<String> {
        self.dispatch(&Command::sync(topic, payload, timeout))?
            .into_single()
    }

    /// Synchronous request expecting one result string per row.
    pub fn send_sync_rows(
        &self,
        topic: &str,
        payload: Payload,
        timeout: Duration,
    ) -> Result<Vec<String>> {
        self.dispatch(&Command::sync_rows(topic, payload, timeout))?
            .into_rows()
    }

    /// Fire-and-forget broadcast. The topic travels inside the payload.
    pub fn send_broadcast(&self, payload: Payload) -> Result<()> {
        self.dispatch(&Command::broadcast(payload)).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{CallKind, InMemoryBackend};
    use crate::types::topics;
    use prometheus::Registry;

    fn dispatcher() -> (Dispatcher, InMemoryBackend) {
        let backend = InMemoryBackend::new();
        (Dispatcher::new(Box::new(backend.clone())), backend)
    }

    fn padded(len: usize) -> Payload {
        // `{"data":"` + body + `"}` is 11 bytes of framing
        Payload::new().with_text("data", "x".repeat(len - 11))
    }

    #[test]
    fn oversized_payload_never_reaches_backend() {
        let (dispatcher, backend) = dispatcher();
        let payload = padded(MAX_PAYLOAD_BYTES + 1);
        for command in [
            Command::broadcast(payload.clone()),
            Command::sync(topics::W_CONFIG, payload.clone(), Duration::from_millis(5)),
            Command::sync_rows(topics::R_QUERY, payload, Duration::from_millis(5)),
        ] {
            let err = dispatcher.dispatch(&command).unwrap_err();
            assert!(matches!(
                err,
                DaqError::PayloadTooLarge {
                    size,
                    limit: MAX_PAYLOAD_BYTES
                } if size == MAX_PAYLOAD_BYTES + 1
            ));
        }
        assert_eq!(backend.call_count(), 0);
        assert_eq!(dispatcher.metrics().rejected, 3);
    }

    #[test]
    fn payload_at_limit_is_sent() {
        let (dispatcher, backend) = dispatcher();
        let payload = padded(MAX_PAYLOAD_BYTES);
        assert_eq!(payload.to_wire().len(), MAX_PAYLOAD_BYTES);
        dispatcher.send_broadcast(payload).expect("at limit");
        assert_eq!(backend.calls()[0].kind, CallKind::Multicast);
        assert_eq!(dispatcher.metrics().sent, 1);
    }

    #[test]
    fn modes_route_to_matching_primitive() {
        let (dispatcher, backend) = dispatcher();
        backend.push_single("one");
        backend.push_reply(Ok(Reply::Rows(vec!["a".into(), "b".into()])));

        let timeout = Duration::from_millis(42);
        let single = dispatcher
            .send_sync(topics::R_CONFIG, Payload::new(), timeout)
            .unwrap();
        let rows = dispatcher
            .send_sync_rows(topics::R_QUERY, Payload::new(), timeout)
            .unwrap();
        dispatcher
            .send_broadcast(Payload::new().with_text("topic", topics::LOGGING))
            .unwrap();

        assert_eq!(single, "one");
        assert_eq!(rows, vec!["a".to_owned(), "b".to_owned()]);
        let calls = backend.calls();
        assert_eq!(calls[0].kind, CallKind::Command);
        assert_eq!(calls[0].timeout, Some(timeout));
        assert_eq!(calls[1].kind, CallKind::CommandRows);
        assert_eq!(calls[1].topic.as_deref(), Some(topics::R_QUERY));
        assert_eq!(calls[2].kind, CallKind::Multicast);
        assert_eq!(calls[2].payload, r#"{"topic":"logging"}"#);
    }

    #[test]
    fn backend_failures_are_counted_and_exported() {
        let registry = Registry::new();
        let exporter = DispatchMetricsExporter::register(&registry).unwrap();
        let backend = InMemoryBackend::new();
        let dispatcher = Dispatcher::new(Box::new(backend.clone())).with_metrics(exporter);
        backend.push_reply(Err(DaqError::Timeout {
            topic: topics::R_CONFIG.into(),
            waited: Duration::from_millis(1),
        }));

        let err = dispatcher
            .send_sync(topics::R_CONFIG, Payload::new(), Duration::from_millis(1))
            .unwrap_err();
        assert_eq!(err.category(), crate::ErrorCategory::Timeout);
        assert_eq!(dispatcher.metrics().failed, 1);
        let families = registry.gather();
        let failed = families
            .iter()
            .find(|f| f.get_name() == "daqlink_commands_failed_total")
            .expect("failed family");
        assert_eq!(failed.get_metric()[0].get_counter().get_value() as u64, 1);
    }

    #[test]
    fn lifecycle_calls_reach_backend() {
        let (dispatcher, backend) = dispatcher();
        let context = MessagingContext::new();
        dispatcher.setup(&context);
        dispatcher.initialize(&BackendConfig::default()).unwrap();
        assert!(dispatcher.is_ready());
        dispatcher.finalize();
        assert_eq!(dispatcher.backend_name(), "in_memory");
        assert!(backend.is_initialized());
        assert!(backend.is_finalized());
    }
}
