//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Wire codec, transport backends and command dispatch."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use daqlink_common::config::BackendConfig;
use parking_lot::Mutex;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::codec::{escape, extract_version};
use crate::types::{topics, Reply, Version};
use crate::{DaqError, Result};

/// Shared messaging resource handed to backends, discovery and the
/// slow-control receiver.
///
/// Background workers poll [`MessagingContext::is_terminated`] and stop once
/// the owner terminates the context.
#[derive(Debug)]
pub struct MessagingContext {
    id: Uuid,
    created_at: DateTime<Utc>,
    terminated: AtomicBool,
}

impl MessagingContext {
    /// Create a fresh context.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            terminated: AtomicBool::new(false),
        })
    }

    /// Unique identifier of this context.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Creation time of the context.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Signal every worker bound to this context to stop.
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }

    /// Whether [`terminate`](Self::terminate) has been called.
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

/// Backend that physically moves command payloads.
///
/// Implementations are driven through the dispatcher, which serialises all
/// calls; they need `Send` but not internal locking.
pub trait TransportBackend: Send {
    /// Human-readable backend name for logging/metrics.
    fn name(&self) -> &'static str;

    /// Bind the backend to the shared messaging context.
    fn setup(&mut self, context: &Arc<MessagingContext>);

    /// Prepare sockets from configuration. Failure is fatal to interface start-up.
    fn initialize(&mut self, config: &BackendConfig) -> Result<()>;

    /// Whether the backend can currently accept commands.
    fn is_ready(&self) -> bool {
        true
    }

    /// Synchronous request expecting a single result string.
    fn send_command(&mut self, topic: &str, payload: &str, timeout: Duration) -> Result<String>;

    /// Synchronous request expecting one result string per row.
    fn send_command_rows(
        &mut self,
        topic: &str,
        payload: &str,
        timeout: Duration,
    ) -> Result<Vec<String>>;

    /// Unacknowledged broadcast.
    fn send_multicast(&mut self, payload: &str) -> Result<()>;

    /// Release sockets. Called once when the owning interface is dropped.
    fn finalize(&mut self);
}

/// Kind of call recorded by [`InMemoryBackend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    /// `send_command`.
    Command,
    /// `send_command_rows`.
    CommandRows,
    /// `send_multicast`.
    Multicast,
}

/// Call recorded by [`InMemoryBackend`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendCall {
    /// Which primitive was invoked.
    pub kind: CallKind,
    /// Dispatcher topic, absent for broadcasts.
    pub topic: Option<String>,
    /// Payload exactly as it was handed over.
    pub payload: String,
    /// Timeout of synchronous calls.
    pub timeout: Option<Duration>,
}

impl BackendCall {
    /// Parse the recorded payload as JSON.
    pub fn payload_json(&self) -> Result<JsonValue> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}

#[derive(Debug, Clone)]
struct StoredEntry {
    data: String,
    draw_options: String,
    timestamp: i64,
}

#[derive(Default)]
struct InMemoryState {
    calls: Vec<BackendCall>,
    scripted: VecDeque<Result<Reply>>,
    store: HashMap<(String, String), Vec<StoredEntry>>,
    query_rows: Vec<String>,
    fail_initialize: Option<String>,
    ready: bool,
    initialized: bool,
    finalized: bool,
    context: Option<Uuid>,
}

/// In-process backend that records every call.
///
/// Scripted replies are consumed first. Without a scripted reply the backend
/// acts as a small versioned store: writes append and answer
/// `{"version":"N"}`, reads answer in the shape the middleman uses. Clones
/// share state, so a test can keep a handle after boxing one copy.
#[derive(Clone)]
pub struct InMemoryBackend {
    state: Arc<Mutex<InMemoryState>>,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(InMemoryState {
                ready: true,
                ..InMemoryState::default()
            })),
        }
    }
}

impl InMemoryBackend {
    /// Create an empty echoing backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply for the next synchronous call.
    pub fn push_reply(&self, reply: Result<Reply>) {
        self.state.lock().scripted.push_back(reply);
    }

    /// Queue a single-string reply.
    pub fn push_single(&self, value: impl Into<String>) {
        self.push_reply(Ok(Reply::Single(value.into())));
    }

    /// Rows answered to every `R_QUERY` without a scripted reply.
    pub fn set_query_rows(&self, rows: Vec<String>) {
        self.state.lock().query_rows = rows;
    }

    /// Make the next `initialize` fail with the given reason.
    pub fn fail_initialize(&self, reason: impl Into<String>) {
        self.state.lock().fail_initialize = Some(reason.into());
    }

    /// Toggle the readiness reported to the interface.
    pub fn set_ready(&self, ready: bool) {
        self.state.lock().ready = ready;
    }

    /// All calls recorded so far.
    pub fn calls(&self) -> Vec<BackendCall> {
        self.state.lock().calls.clone()
    }

    /// Number of calls recorded so far.
    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    /// Whether `initialize` succeeded.
    pub fn is_initialized(&self) -> bool {
        self.state.lock().initialized
    }

    /// Whether `finalize` has run.
    pub fn is_finalized(&self) -> bool {
        self.state.lock().finalized
    }

    /// Identifier of the context passed to `setup`.
    pub fn context_id(&self) -> Option<Uuid> {
        self.state.lock().context
    }

    fn record(&self, kind: CallKind, topic: Option<&str>, payload: &str, timeout: Option<Duration>) {
        self.state.lock().calls.push(BackendCall {
            kind,
            topic: topic.map(str::to_owned),
            payload: payload.to_owned(),
            timeout,
        });
    }

    fn scripted(&self) -> Option<Result<Reply>> {
        self.state.lock().scripted.pop_front()
    }

    fn answer(&self, topic: &str, payload: &str) -> Result<Reply> {
        let request: JsonValue = serde_json::from_str(payload)?;
        let text = |name: &str| request.get(name).and_then(JsonValue::as_str).unwrap_or("");
        let mut state = self.state.lock();
        match topic {
            topics::W_CONFIG | topics::W_CALIBRATION => {
                let key = (resource_of(topic), text("device").to_owned());
                let entry = StoredEntry {
                    data: text("data").to_owned(),
                    draw_options: String::new(),
                    timestamp: request.get("time").and_then(JsonValue::as_i64).unwrap_or(0),
                };
                Ok(Reply::Single(append(&mut state.store, key, entry)))
            }
            topics::W_ROOTPLOT => {
                let key = (resource_of(topic), text("plot_name").to_owned());
                let entry = StoredEntry {
                    data: text("data").to_owned(),
                    draw_options: text("draw_options").to_owned(),
                    timestamp: request.get("time").and_then(JsonValue::as_i64).unwrap_or(0),
                };
                Ok(Reply::Single(append(&mut state.store, key, entry)))
            }
            topics::R_CONFIG | topics::R_CALIBRATION => {
                let key = (resource_of(topic), text("device").to_owned());
                let version = request.get("version").and_then(JsonValue::as_i64).unwrap_or(-1);
                let (_, entry) = lookup(&state.store, &key, version)?;
                Ok(Reply::Single(format!("{{\"data\":\"{}\"}}", escape(&entry.data))))
            }
            topics::R_ROOTPLOT => {
                let key = (resource_of(topic), text("plot_name").to_owned());
                let version = request.get("version").and_then(JsonValue::as_i64).unwrap_or(-1);
                let (found, entry) = lookup(&state.store, &key, version)?;
                Ok(Reply::Single(format!(
                    "{{\"draw_options\":\"{}\",\"timestamp\":{},\"version\":{},\"data\":\"{}\"}}",
                    escape(&entry.draw_options),
                    entry.timestamp,
                    found,
                    entry.data
                )))
            }
            topics::R_QUERY => Ok(Reply::Rows(state.query_rows.clone())),
            _ => Ok(Reply::Single(String::new())),
        }
    }
}

fn resource_of(topic: &str) -> String {
    topic.get(2..).unwrap_or(topic).to_owned()
}

fn append(
    store: &mut HashMap<(String, String), Vec<StoredEntry>>,
    key: (String, String),
    entry: StoredEntry,
) -> String {
    let versions = store.entry(key).or_default();
    versions.push(entry);
    format!("{{\"version\":\"{}\"}}", versions.len() - 1)
}

fn lookup<'a>(
    store: &'a HashMap<(String, String), Vec<StoredEntry>>,
    key: &(String, String),
    version: i64,
) -> Result<(Version, &'a StoredEntry)> {
    let versions = store
        .get(key)
        .ok_or_else(|| DaqError::Transport(format!("no {} entries for '{}'", key.0, key.1)))?;
    let index = if version < 0 {
        versions.len().saturating_sub(1)
    } else {
        usize::try_from(version).unwrap_or(usize::MAX)
    };
    let entry = versions.get(index).ok_or_else(|| {
        DaqError::Transport(format!("{} '{}' has no version {version}", key.0, key.1))
    })?;
    let found = Version::try_from(index)
        .map_err(|_| DaqError::Transport("version index overflow".to_owned()))?;
    Ok((found, entry))
}

impl TransportBackend for InMemoryBackend {
    fn name(&self) -> &'static str {
        "in_memory"
    }

    fn setup(&mut self, context: &Arc<MessagingContext>) {
        self.state.lock().context = Some(context.id());
    }

    fn initialize(&mut self, _config: &BackendConfig) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(reason) = state.fail_initialize.take() {
            return Err(DaqError::Transport(reason));
        }
        state.initialized = true;
        Ok(())
    }

    fn is_ready(&self) -> bool {
        self.state.lock().ready
    }

    fn send_command(&mut self, topic: &str, payload: &str, timeout: Duration) -> Result<String> {
        self.record(CallKind::Command, Some(topic), payload, Some(timeout));
        match self.scripted() {
            Some(reply) => reply?.into_single(),
            None => self.answer(topic, payload)?.into_single(),
        }
    }

    fn send_command_rows(
        &mut self,
        topic: &str,
        payload: &str,
        timeout: Duration,
    ) -> Result<Vec<String>> {
        self.record(CallKind::CommandRows, Some(topic), payload, Some(timeout));
        match self.scripted() {
            Some(reply) => reply?.into_rows(),
            None => self.answer(topic, payload)?.into_rows(),
        }
    }

    fn send_multicast(&mut self, payload: &str) -> Result<()> {
        self.record(CallKind::Multicast, None, payload, None);
        match self.scripted() {
            Some(Err(err)) => Err(err),
            _ => Ok(()),
        }
    }

    fn finalize(&mut self) {
        self.state.lock().finalized = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{extract_wrapped_field, Payload, PlotRecord};

    fn write_config(backend: &mut InMemoryBackend, data: &str) -> Version {
        let payload = Payload::new()
            .with_int("time", 0)
            .with_text("device", "pump")
            .with_text("author", "ops")
            .with_text("description", "baseline")
            .with_text("data", data)
            .to_wire();
        let reply = backend
            .send_command(topics::W_CONFIG, &payload, Duration::from_millis(10))
            .expect("write");
        extract_version(&reply).expect("version")
    }

    #[test]
    fn echo_store_versions_writes_and_serves_reads() {
        let mut backend = InMemoryBackend::new();
        assert_eq!(write_config(&mut backend, r#"{"v":1}"#), 0);
        assert_eq!(write_config(&mut backend, r#"{"v":2}"#), 1);

        let read = |backend: &mut InMemoryBackend, version: i64| {
            let payload = Payload::new()
                .with_text("device", "pump")
                .with_int("version", version)
                .to_wire();
            backend.send_command(topics::R_CONFIG, &payload, Duration::from_millis(10))
        };
        let latest = read(&mut backend, -1).expect("latest");
        assert_eq!(extract_wrapped_field(&latest, "data").unwrap(), r#"{"v":2}"#);
        let first = read(&mut backend, 0).expect("first");
        assert_eq!(extract_wrapped_field(&first, "data").unwrap(), r#"{"v":1}"#);
        assert!(read(&mut backend, 9).is_err());
        assert_eq!(backend.call_count(), 5);
    }

    #[test]
    fn echo_store_serves_plots_with_raw_data() {
        let mut backend = InMemoryBackend::new();
        let write = Payload::new()
            .with_int("time", 1000)
            .with_text("plot_name", "sine")
            .with_text("draw_options", "ALP")
            .with_text("data", r#"{"_typename":"TGraph"}"#)
            .to_wire();
        backend
            .send_command(topics::W_ROOTPLOT, &write, Duration::from_millis(10))
            .expect("plot write");
        let read = Payload::new()
            .with_text("plot_name", "sine")
            .with_int("version", -1)
            .to_wire();
        let reply = backend
            .send_command(topics::R_ROOTPLOT, &read, Duration::from_millis(10))
            .expect("plot read");
        let record = PlotRecord::from_response(&reply).expect("plot record");
        assert_eq!(record.version, 0);
        assert_eq!(record.timestamp, Some(1000));
        assert_eq!(record.data, r#"{"_typename":"TGraph"}"#);
    }

    #[test]
    fn scripted_replies_take_precedence() {
        let mut backend = InMemoryBackend::new();
        backend.push_single("{\"version\":\"3\"}");
        backend.push_reply(Err(DaqError::Transport("link down".into())));
        let first = backend
            .send_command(topics::W_CONFIG, "{}", Duration::from_millis(1))
            .unwrap();
        assert_eq!(first, "{\"version\":\"3\"}");
        let second = backend.send_command(topics::W_CONFIG, "{}", Duration::from_millis(1));
        assert!(matches!(second, Err(DaqError::Transport(_))));
    }

    #[test]
    fn lifecycle_flags_are_tracked() {
        let mut backend = InMemoryBackend::new();
        let handle = backend.clone();
        let context = MessagingContext::new();
        backend.setup(&context);
        backend.fail_initialize("no config");
        assert!(backend.initialize(&BackendConfig::default()).is_err());
        assert!(backend.initialize(&BackendConfig::default()).is_ok());
        backend.finalize();
        assert_eq!(handle.context_id(), Some(context.id()));
        assert!(handle.is_initialized());
        assert!(handle.is_finalized());
    }

    #[test]
    fn context_termination_is_visible() {
        let context = MessagingContext::new();
        assert!(!context.is_terminated());
        context.terminate();
        assert!(context.is_terminated());
        assert!(context.created_at() <= Utc::now());
    }
}
