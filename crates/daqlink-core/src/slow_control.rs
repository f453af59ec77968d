//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Device interface lifecycle, resources, telemetry and slow control."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Registry of remotely controllable variables.
//!
//! Local code registers elements and reads their values. Remote changes and
//! alerts arrive through a [`RemoteHandle`] and are applied on a dedicated
//! dispatch thread, which is also where change callbacks and alert
//! subscribers run. Handlers may call back into the collection.
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use daqlink_common::time::duration_to_millis;
use daqlink_msg::{DaqError, MessagingContext, Result};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, info, warn};

/// Name of the built-in status element present in every collection.
pub const STATUS: &str = "Status";

/// Callback run after a remote change. Receives the element name and returns
/// a human-readable acknowledgement.
pub type ChangeHandler = Arc<dyn Fn(&str) -> String + Send + Sync>;

/// Callback run when an alert is received. Receives the alert payload.
pub type AlertHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Behaviour of a slow-control element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    /// Momentary boolean.
    Button,
    /// Numeric value with optional bounds and step.
    Variable,
    /// One of a fixed list of string options.
    Options,
    /// Free text, read-only from the remote side.
    Info,
}

/// Typed value held by an element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl ScValue {
    fn as_f64(&self) -> Option<f64> {
        match self {
            ScValue::Int(value) => Some(*value as f64),
            ScValue::Float(value) => Some(*value),
            ScValue::Text(text) => text.trim().parse().ok(),
            ScValue::Bool(_) => None,
        }
    }

    fn as_text(&self) -> String {
        match self {
            ScValue::Bool(flag) => (if *flag { "1" } else { "0" }).to_owned(),
            ScValue::Int(value) => value.to_string(),
            ScValue::Float(value) => value.to_string(),
            ScValue::Text(text) => text.clone(),
        }
    }
}

impl fmt::Display for ScValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_text())
    }
}

impl From<bool> for ScValue {
    fn from(value: bool) -> Self {
        ScValue::Bool(value)
    }
}

impl From<i64> for ScValue {
    fn from(value: i64) -> Self {
        ScValue::Int(value)
    }
}

impl From<i32> for ScValue {
    fn from(value: i32) -> Self {
        ScValue::Int(i64::from(value))
    }
}

impl From<f64> for ScValue {
    fn from(value: f64) -> Self {
        ScValue::Float(value)
    }
}

impl From<&str> for ScValue {
    fn from(value: &str) -> Self {
        ScValue::Text(value.to_owned())
    }
}

impl From<String> for ScValue {
    fn from(value: String) -> Self {
        ScValue::Text(value)
    }
}

/// Conversion out of an [`ScValue`], used by [`SlowControlCollection::value`].
pub trait FromScValue: Sized {
    fn from_sc_value(value: &ScValue) -> Option<Self>;
}

impl FromScValue for bool {
    fn from_sc_value(value: &ScValue) -> Option<Self> {
        match value {
            ScValue::Bool(flag) => Some(*flag),
            ScValue::Int(number) => Some(*number != 0),
            ScValue::Text(text) => match text.trim() {
                "1" | "true" => Some(true),
                "0" | "false" => Some(false),
                _ => None,
            },
            ScValue::Float(_) => None,
        }
    }
}

impl FromScValue for i64 {
    fn from_sc_value(value: &ScValue) -> Option<Self> {
        match value {
            ScValue::Int(number) => Some(*number),
            ScValue::Float(number) if number.fract() == 0.0 => Some(*number as i64),
            ScValue::Bool(flag) => Some(i64::from(*flag)),
            ScValue::Text(text) => text.trim().parse().ok(),
            ScValue::Float(_) => None,
        }
    }
}

impl FromScValue for f64 {
    fn from_sc_value(value: &ScValue) -> Option<Self> {
        value.as_f64()
    }
}

impl FromScValue for String {
    fn from_sc_value(value: &ScValue) -> Option<Self> {
        Some(value.as_text())
    }
}

/// A registered element.
#[derive(Clone, Serialize)]
pub struct SlowControlElement {
    pub name: String,
    pub kind: ElementKind,
    pub value: ScValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<f64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    #[serde(skip)]
    on_change: Option<ChangeHandler>,
}

impl fmt::Debug for SlowControlElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlowControlElement")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("value", &self.value)
            .field("has_callback", &self.on_change.is_some())
            .finish()
    }
}

impl SlowControlElement {
    fn new(name: &str, kind: ElementKind, on_change: Option<ChangeHandler>) -> Self {
        let value = match kind {
            ElementKind::Button => ScValue::Bool(false),
            ElementKind::Variable => ScValue::Float(0.0),
            ElementKind::Options | ElementKind::Info => ScValue::Text(String::new()),
        };
        Self {
            name: name.to_owned(),
            kind,
            value,
            min: None,
            max: None,
            step: None,
            options: Vec::new(),
            on_change,
        }
    }

    /// Typed view of the current value.
    pub fn value<T: FromScValue>(&self) -> Result<T> {
        T::from_sc_value(&self.value).ok_or_else(|| {
            DaqError::Validation(format!(
                "value '{}' of '{}' does not convert to {}",
                self.value,
                self.name,
                std::any::type_name::<T>()
            ))
        })
    }

    fn coerce(&self, value: ScValue) -> Result<ScValue> {
        match self.kind {
            ElementKind::Button => bool::from_sc_value(&value)
                .map(ScValue::Bool)
                .ok_or_else(|| self.rejected(&value, "a boolean")),
            ElementKind::Variable => {
                let mut number = value
                    .as_f64()
                    .ok_or_else(|| self.rejected(&value, "a number"))?;
                // steps count from the lower bound, or from zero without one
                if let Some(step) = self.step {
                    let base = self.min.unwrap_or(0.0);
                    number = base + ((number - base) / step).round() * step;
                }
                if let Some(min) = self.min {
                    number = number.max(min);
                }
                if let Some(max) = self.max {
                    number = number.min(max);
                }
                Ok(ScValue::Float(number))
            }
            ElementKind::Options => {
                let text = value.as_text();
                if self.options.iter().any(|option| *option == text) {
                    Ok(ScValue::Text(text))
                } else {
                    Err(self.rejected(&value, "one of the registered options"))
                }
            }
            ElementKind::Info => Ok(ScValue::Text(value.as_text())),
        }
    }

    fn rejected(&self, value: &ScValue, expected: &str) -> DaqError {
        DaqError::Validation(format!(
            "'{value}' is not valid for {} '{}': expected {expected}",
            kind_label(self.kind),
            self.name
        ))
    }
}

fn kind_label(kind: ElementKind) -> &'static str {
    match kind {
        ElementKind::Button => "button",
        ElementKind::Variable => "variable",
        ElementKind::Options => "options",
        ElementKind::Info => "info",
    }
}

/// Message consumed by the dispatch thread.
#[derive(Debug)]
enum RemoteMessage {
    Set { name: String, value: ScValue },
    Alert { name: String, payload: String },
    Shutdown,
}

/// Sender side used by a transport (or a test) to inject remote activity.
#[derive(Debug, Clone)]
pub struct RemoteHandle {
    sender: UnboundedSender<RemoteMessage>,
}

impl RemoteHandle {
    /// Queue a remote value change. The element's callback runs on the dispatch thread.
    pub fn set(&self, name: &str, value: impl Into<ScValue>) -> Result<()> {
        self.send(RemoteMessage::Set {
            name: name.to_owned(),
            value: value.into(),
        })
    }

    /// Queue an alert for local subscribers.
    pub fn alert(&self, name: &str, payload: &str) -> Result<()> {
        self.send(RemoteMessage::Alert {
            name: name.to_owned(),
            payload: payload.to_owned(),
        })
    }

    fn send(&self, message: RemoteMessage) -> Result<()> {
        self.sender
            .send(message)
            .map_err(|_| DaqError::Lifecycle("slow-control receiver has stopped".to_owned()))
    }
}

struct Receiver {
    handle: RemoteHandle,
    worker: JoinHandle<()>,
}

#[derive(Default)]
struct Registry {
    elements: Mutex<IndexMap<String, SlowControlElement>>,
    alerts: Mutex<HashMap<String, Vec<AlertHandler>>>,
}

/// Thread-safe registry of slow-control elements and alert subscriptions.
pub struct SlowControlCollection {
    registry: Arc<Registry>,
    receiver: Mutex<Option<Receiver>>,
}

impl Default for SlowControlCollection {
    fn default() -> Self {
        Self::new()
    }
}

impl SlowControlCollection {
    /// Create a collection holding only the built-in [`STATUS`] element.
    pub fn new() -> Self {
        let registry = Registry::default();
        registry.elements.lock().insert(
            STATUS.to_owned(),
            SlowControlElement::new(STATUS, ElementKind::Info, None),
        );
        Self {
            registry: Arc::new(registry),
            receiver: Mutex::new(None),
        }
    }

    /// Register an element. Fails if the name is empty or already taken.
    pub fn add(&self, name: &str, kind: ElementKind, on_change: Option<ChangeHandler>) -> Result<()> {
        if name.trim().is_empty() {
            return Err(DaqError::Validation("element name must not be empty".to_owned()));
        }
        let mut elements = self.registry.elements.lock();
        if elements.contains_key(name) {
            return Err(DaqError::Validation(format!("element '{name}' already exists")));
        }
        elements.insert(name.to_owned(), SlowControlElement::new(name, kind, on_change));
        debug!(name, kind = kind_label(kind), "slow-control element added");
        Ok(())
    }

    /// Remove an element. The built-in status element cannot be removed.
    pub fn remove(&self, name: &str) -> bool {
        if name == STATUS {
            return false;
        }
        self.registry.elements.lock().shift_remove(name).is_some()
    }

    /// Remove every element and subscription except the status element.
    pub fn clear(&self) {
        self.registry
            .elements
            .lock()
            .retain(|name, _| name.as_str() == STATUS);
        self.registry.alerts.lock().clear();
    }

    pub fn contains(&self, name: &str) -> bool {
        self.registry.elements.lock().contains_key(name)
    }

    /// Element names in registration order.
    pub fn names(&self) -> Vec<String> {
        self.registry.elements.lock().keys().cloned().collect()
    }

    /// Snapshot of an element.
    pub fn get(&self, name: &str) -> Option<SlowControlElement> {
        self.registry.elements.lock().get(name).cloned()
    }

    /// Typed current value of an element.
    pub fn value<T: FromScValue>(&self, name: &str) -> Result<T> {
        let elements = self.registry.elements.lock();
        lookup(&elements, name)?.value()
    }

    /// Set a value locally. Validated against the element kind, bounds and
    /// options; callbacks are not run.
    pub fn set_value(&self, name: &str, value: impl Into<ScValue>) -> Result<()> {
        self.registry.apply(name, value.into()).map(|_| ())
    }

    pub fn set_min(&self, name: &str, min: f64) -> Result<()> {
        self.registry.update_numeric(name, |element| element.min = Some(min))
    }

    pub fn set_max(&self, name: &str, max: f64) -> Result<()> {
        self.registry.update_numeric(name, |element| element.max = Some(max))
    }

    /// Values are rounded to the nearest multiple of `step` counted from the
    /// minimum (or zero), then clamped.
    pub fn set_step(&self, name: &str, step: f64) -> Result<()> {
        if step <= 0.0 {
            return Err(DaqError::Validation(format!("step for '{name}' must be positive")));
        }
        self.registry.update_numeric(name, |element| element.step = Some(step))
    }

    /// Append a selectable option to an options element.
    pub fn add_option(&self, name: &str, option: &str) -> Result<()> {
        let mut elements = self.registry.elements.lock();
        let element = lookup_mut(&mut elements, name)?;
        if element.kind != ElementKind::Options {
            return Err(DaqError::Validation(format!("'{name}' is not an options element")));
        }
        if !element.options.iter().any(|existing| existing == option) {
            element.options.push(option.to_owned());
        }
        Ok(())
    }

    /// Register a callback for a named alert.
    pub fn alert_subscribe(&self, alert: &str, handler: AlertHandler) {
        self.registry
            .alerts
            .lock()
            .entry(alert.to_owned())
            .or_default()
            .push(handler);
    }

    /// Queue an alert on the dispatch thread. Returns whether anyone is subscribed.
    ///
    /// Delivery is local to this process: only subscribers of this collection
    /// are run. Alerts from other devices arrive when a network receiver feeds
    /// them in through [`RemoteHandle::alert`].
    pub fn alert_send(&self, alert: &str, payload: &str) -> Result<bool> {
        let subscribed = self.registry.alerts.lock().contains_key(alert);
        self.remote_handle()?.alert(alert, payload)?;
        Ok(subscribed)
    }

    /// JSON listing of all elements in registration order.
    pub fn print(&self) -> String {
        let elements = self.registry.elements.lock();
        let listing: Vec<JsonValue> = elements
            .values()
            .map(|element| serde_json::to_value(element).unwrap_or_else(|_| json!({})))
            .collect();
        JsonValue::Array(listing).to_string()
    }

    /// Start the dispatch thread that applies remote changes and runs handlers.
    ///
    /// The thread exits when the collection is dropped or the context is
    /// terminated; termination is noticed within `poll_interval`.
    pub fn init_threaded_receiver(
        &self,
        context: Arc<MessagingContext>,
        poll_interval: Duration,
    ) -> Result<RemoteHandle> {
        let mut slot = self.receiver.lock();
        if let Some(receiver) = slot.as_ref() {
            return Ok(receiver.handle.clone());
        }
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        let (sender, inbox) = mpsc::unbounded_channel();
        let registry = Arc::clone(&self.registry);
        let worker = thread::Builder::new()
            .name("daqlink-slow-control".into())
            .spawn(move || {
                runtime.block_on(dispatch_loop(registry, inbox, context, poll_interval))
            })?;
        let handle = RemoteHandle { sender };
        *slot = Some(Receiver {
            handle: handle.clone(),
            worker,
        });
        info!(poll_ms = duration_to_millis(poll_interval), "slow-control receiver started");
        Ok(handle)
    }

    /// Handle for injecting remote activity. Fails before the receiver is started.
    pub fn remote_handle(&self) -> Result<RemoteHandle> {
        self.receiver
            .lock()
            .as_ref()
            .map(|receiver| receiver.handle.clone())
            .ok_or_else(|| DaqError::Lifecycle("slow-control receiver not started".to_owned()))
    }

    /// Stop the dispatch thread and wait for it to finish.
    pub fn stop_receiver(&self) {
        let Some(receiver) = self.receiver.lock().take() else {
            return;
        };
        let _ = receiver.handle.send(RemoteMessage::Shutdown);
        if receiver.worker.thread().id() == thread::current().id() {
            // stopping from inside a handler; the loop exits after this message
            return;
        }
        if receiver.worker.join().is_err() {
            warn!("slow-control receiver panicked");
        }
    }
}

impl Drop for SlowControlCollection {
    fn drop(&mut self) {
        self.stop_receiver();
    }
}

impl Registry {
    fn apply(&self, name: &str, value: ScValue) -> Result<Option<ChangeHandler>> {
        let mut elements = self.elements.lock();
        let element = lookup_mut(&mut elements, name)?;
        element.value = element.coerce(value)?;
        Ok(element.on_change.clone())
    }

    fn update_numeric(&self, name: &str, update: impl FnOnce(&mut SlowControlElement)) -> Result<()> {
        let mut elements = self.elements.lock();
        let element = lookup_mut(&mut elements, name)?;
        if element.kind != ElementKind::Variable {
            return Err(DaqError::Validation(format!("'{name}' is not a variable")));
        }
        update(element);
        if let (Some(min), Some(max)) = (element.min, element.max) {
            if min > max {
                return Err(DaqError::Validation(format!(
                    "'{name}' has min {min} above max {max}"
                )));
            }
        }
        let current = element.value.clone();
        element.value = element.coerce(current)?;
        Ok(())
    }

    fn handle(&self, message: RemoteMessage) {
        match message {
            RemoteMessage::Set { name, value } => {
                if self.elements.lock().get(&name).map(|e| e.kind) == Some(ElementKind::Info) {
                    warn!(%name, "remote write to info element ignored");
                    return;
                }
                match self.apply(&name, value) {
                    Ok(Some(handler)) => {
                        let reply = handler(&name);
                        debug!(%name, %reply, "slow-control callback finished");
                    }
                    Ok(None) => debug!(%name, "slow-control value updated"),
                    Err(err) => warn!(%name, error = %err, "remote change rejected"),
                }
            }
            RemoteMessage::Alert { name, payload } => {
                let handlers = self.alerts.lock().get(&name).cloned().unwrap_or_default();
                if handlers.is_empty() {
                    debug!(alert = %name, "alert without subscribers");
                }
                for handler in handlers {
                    handler(&payload);
                }
            }
            RemoteMessage::Shutdown => {}
        }
    }
}

async fn dispatch_loop(
    registry: Arc<Registry>,
    mut inbox: UnboundedReceiver<RemoteMessage>,
    context: Arc<MessagingContext>,
    poll_interval: Duration,
) {
    loop {
        match tokio::time::timeout(poll_interval, inbox.recv()).await {
            Ok(Some(RemoteMessage::Shutdown)) | Ok(None) => break,
            Ok(Some(message)) => registry.handle(message),
            Err(_) => {
                if context.is_terminated() {
                    break;
                }
            }
        }
    }
    debug!("slow-control receiver stopped");
}

fn lookup<'a>(
    elements: &'a IndexMap<String, SlowControlElement>,
    name: &str,
) -> Result<&'a SlowControlElement> {
    elements
        .get(name)
        .ok_or_else(|| DaqError::Validation(format!("no slow-control element '{name}'")))
}

fn lookup_mut<'a>(
    elements: &'a mut IndexMap<String, SlowControlElement>,
    name: &str,
) -> Result<&'a mut SlowControlElement> {
    elements
        .get_mut(name)
        .ok_or_else(|| DaqError::Validation(format!("no slow-control element '{name}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc as std_mpsc;

    #[test]
    fn status_is_built_in_and_permanent() {
        let collection = SlowControlCollection::new();
        assert_eq!(collection.names(), vec![STATUS.to_owned()]);
        collection.set_value(STATUS, "Initialising").unwrap();
        assert!(!collection.remove(STATUS));
        collection.clear();
        assert_eq!(collection.value::<String>(STATUS).unwrap(), "Initialising");
    }

    #[test]
    fn variables_clamp_to_bounds() {
        let collection = SlowControlCollection::new();
        collection.add("voltage_1", ElementKind::Variable, None).unwrap();
        collection.set_min("voltage_1", 0.0).unwrap();
        collection.set_max("voltage_1", 5000.0).unwrap();
        collection.set_value("voltage_1", 3500.3).unwrap();
        assert_eq!(collection.value::<f64>("voltage_1").unwrap(), 3500.3);
        collection.set_value("voltage_1", 9000).unwrap();
        assert_eq!(collection.value::<f64>("voltage_1").unwrap(), 5000.0);
        assert!(collection.set_value("voltage_1", "high").is_err());
        assert!(collection.set_step("voltage_1", 0.0).is_err());
    }

    #[test]
    fn variables_snap_to_step() {
        let collection = SlowControlCollection::new();
        collection.add("threshold", ElementKind::Variable, None).unwrap();
        collection.set_step("threshold", 0.5).unwrap();
        collection.set_value("threshold", 3.3).unwrap();
        assert_eq!(collection.value::<f64>("threshold").unwrap(), 3.5);
        collection.set_value("threshold", -1.2).unwrap();
        assert_eq!(collection.value::<f64>("threshold").unwrap(), -1.0);

        collection.set_min("threshold", 1.0).unwrap();
        collection.set_step("threshold", 4.0).unwrap();
        collection.set_value("threshold", 6.5).unwrap();
        assert_eq!(collection.value::<f64>("threshold").unwrap(), 5.0);
    }

    #[test]
    fn options_and_buttons_validate_input() {
        let collection = SlowControlCollection::new();
        collection.add("power_on", ElementKind::Options, None).unwrap();
        collection.add_option("power_on", "1").unwrap();
        collection.add_option("power_on", "0").unwrap();
        collection.set_value("power_on", "0").unwrap();
        assert!(!collection.value::<bool>("power_on").unwrap());
        assert!(collection.set_value("power_on", "2").is_err());

        collection.add("Start", ElementKind::Button, None).unwrap();
        collection.set_value("Start", true).unwrap();
        assert!(collection.value::<bool>("Start").unwrap());
        assert!(collection.set_value("Start", "maybe").is_err());
        assert!(collection.add("Start", ElementKind::Button, None).is_err());
        assert!(collection.add_option("Start", "x").is_err());
    }

    #[test]
    fn info_keeps_arbitrary_characters() {
        let collection = SlowControlCollection::new();
        collection.add("Info", ElementKind::Info, None).unwrap();
        let text = " hello this is an information message ,.!{}[]<>?/`~'@\" ";
        collection.set_value("Info", text).unwrap();
        assert_eq!(collection.value::<String>("Info").unwrap(), text);
        let listing: JsonValue = serde_json::from_str(&collection.print()).unwrap();
        assert_eq!(listing[1]["value"], text);
        assert_eq!(listing[1]["kind"], "info");
    }

    #[test]
    fn remote_changes_run_callbacks_on_dispatch_thread() {
        let collection = Arc::new(SlowControlCollection::new());
        let (tx, rx) = std_mpsc::channel();
        let reentrant = Arc::clone(&collection);
        let callback: ChangeHandler = Arc::new(move |name: &str| {
            let value = reentrant.value::<f64>(name).unwrap_or_default();
            tx.send((name.to_owned(), value, thread::current().name().map(str::to_owned)))
                .unwrap();
            format!("Changed {name} to {value}")
        });
        collection
            .add("voltage_3", ElementKind::Variable, Some(callback))
            .unwrap();

        let remote = collection
            .init_threaded_receiver(MessagingContext::new(), Duration::from_millis(20))
            .unwrap();
        remote.set("voltage_3", 3800.0).unwrap();
        let (name, value, thread_name) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name, "voltage_3");
        assert_eq!(value, 3800.0);
        assert_eq!(thread_name.as_deref(), Some("daqlink-slow-control"));
        collection.stop_receiver();
    }

    #[test]
    fn alerts_reach_every_subscriber() {
        let collection = SlowControlCollection::new();
        assert!(collection.alert_send("new_event", "").is_err());
        let (tx, rx) = std_mpsc::channel();
        for id in 0..2 {
            let tx = tx.clone();
            collection.alert_subscribe(
                "new_event",
                Arc::new(move |payload: &str| tx.send((id, payload.to_owned())).unwrap()),
            );
        }
        collection
            .init_threaded_receiver(MessagingContext::new(), Duration::from_millis(20))
            .unwrap();
        assert!(collection.alert_send("new_event", "run 7").unwrap());
        let mut seen = vec![
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
        ];
        seen.sort();
        assert_eq!(seen, vec![(0, "run 7".to_owned()), (1, "run 7".to_owned())]);
        assert!(!collection.alert_send("unknown", "").unwrap());
    }

    #[test]
    fn terminated_context_stops_receiver() {
        let collection = SlowControlCollection::new();
        let context = MessagingContext::new();
        let remote = collection
            .init_threaded_receiver(Arc::clone(&context), Duration::from_millis(10))
            .unwrap();
        context.terminate();
        let mut stopped = false;
        for _ in 0..100 {
            if remote.alert("x", "").is_err() {
                stopped = true;
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert!(stopped);
    }
}
