//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Device interface lifecycle, resources, telemetry and slow control."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use daqlink_common::config::{BackendConfig, DiscoveryConfig, InterfaceConfig, InterfaceSettings};
use daqlink_msg::{
    DaqError, DispatchMetrics, DispatchMetricsExporter, Dispatcher, MessagingContext, Result,
    TransportBackend,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::discovery::{MulticastDiscovery, PeerDiscovery, PeerRecord};
use crate::slow_control::{
    AlertHandler, ChangeHandler, ElementKind, FromScValue, RemoteHandle, SlowControlCollection,
};

const READINESS_POLL: Duration = Duration::from_millis(50);
const RECEIVER_POLL: Duration = Duration::from_millis(100);

/// Where the interface is in its start-up sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Initializing,
    Ready,
    /// `init` aborted; it may be retried.
    Failed,
}

impl LifecycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleState::Uninitialized => "uninitialized",
            LifecycleState::Initializing => "initializing",
            LifecycleState::Ready => "ready",
            LifecycleState::Failed => "failed",
        }
    }
}

enum ContextHandle {
    Owned(Arc<MessagingContext>),
    Borrowed(Arc<MessagingContext>),
}

impl ContextHandle {
    fn get(&self) -> &Arc<MessagingContext> {
        match self {
            ContextHandle::Owned(context) | ContextHandle::Borrowed(context) => context,
        }
    }
}

enum DiscoverySource {
    Multicast(DiscoveryConfig),
    Custom(Box<dyn PeerDiscovery>),
    Disabled,
}

/// A device's handle onto the slow-control network.
///
/// Build one around a [`TransportBackend`], adjust it with the `with_*`
/// methods, then call [`init`](Self::init). Every operation other than the
/// slow-control passthroughs requires a successful `init`. Dropping the
/// interface finalises the backend, stops discovery and the slow-control
/// receiver, and terminates the messaging context if the interface owns it.
pub struct DaqInterface {
    name: String,
    database: String,
    identity: Uuid,
    state: LifecycleState,
    settings: InterfaceSettings,
    dispatcher: Dispatcher,
    context: ContextHandle,
    discovery_source: DiscoverySource,
    discovery: Option<Box<dyn PeerDiscovery>>,
    slow_control: Arc<SlowControlCollection>,
    remote: RemoteHandle,
}

impl DaqInterface {
    /// Create an interface that owns a fresh messaging context.
    pub fn new(backend: Box<dyn TransportBackend>) -> Result<Self> {
        Self::build(backend, ContextHandle::Owned(MessagingContext::new()))
    }

    /// Create an interface on a caller-supplied context. The context is never
    /// terminated by the interface.
    pub fn with_context(
        backend: Box<dyn TransportBackend>,
        context: Arc<MessagingContext>,
    ) -> Result<Self> {
        Self::build(backend, ContextHandle::Borrowed(context))
    }

    /// Create an interface configured from a loaded [`InterfaceConfig`].
    pub fn from_config(config: &InterfaceConfig, backend: Box<dyn TransportBackend>) -> Result<Self> {
        Ok(Self::new(backend)?
            .with_settings(config.interface.clone())
            .with_discovery(config.discovery.clone()))
    }

    fn build(backend: Box<dyn TransportBackend>, context: ContextHandle) -> Result<Self> {
        let dispatcher = Dispatcher::new(backend);
        dispatcher.setup(context.get());
        let slow_control = Arc::new(SlowControlCollection::new());
        let remote = slow_control.init_threaded_receiver(Arc::clone(context.get()), RECEIVER_POLL)?;
        Ok(Self {
            name: String::new(),
            database: InterfaceSettings::default().database,
            identity: Uuid::new_v4(),
            state: LifecycleState::Uninitialized,
            settings: InterfaceSettings::default(),
            dispatcher,
            context,
            discovery_source: DiscoverySource::Multicast(DiscoveryConfig::default()),
            discovery: None,
            slow_control,
            remote,
        })
    }

    /// Replace the timing and identity defaults.
    pub fn with_settings(mut self, settings: InterfaceSettings) -> Self {
        self.database = settings.database.clone();
        self.settings = settings;
        self
    }

    /// Use multicast beacons with the given settings. Disables discovery when
    /// both announce and listen are off.
    pub fn with_discovery(mut self, config: DiscoveryConfig) -> Self {
        self.discovery_source = if config.announce || config.listen {
            DiscoverySource::Multicast(config)
        } else {
            DiscoverySource::Disabled
        };
        self
    }

    /// Use a custom discovery implementation.
    pub fn with_peer_discovery(mut self, discovery: Box<dyn PeerDiscovery>) -> Self {
        self.discovery_source = DiscoverySource::Custom(discovery);
        self
    }

    /// Skip discovery; readiness then depends on the backend alone.
    pub fn without_discovery(mut self) -> Self {
        self.discovery_source = DiscoverySource::Disabled;
        self
    }

    /// Export dispatch metrics through prometheus.
    pub fn with_metrics(mut self, exporter: DispatchMetricsExporter) -> Self {
        self.dispatcher.attach_metrics(exporter);
        self
    }

    /// Bring the interface up.
    ///
    /// Stores the identity, starts peer discovery, initialises the backend and
    /// then waits for readiness for at most the configured readiness timeout.
    /// Backend failure and readiness timeout leave the state at
    /// [`LifecycleState::Failed`].
    pub fn init(&mut self, name: &str, backend_config: &BackendConfig, db_name: &str) -> Result<()> {
        match self.state {
            LifecycleState::Uninitialized | LifecycleState::Failed => {}
            state => {
                return Err(DaqError::Lifecycle(format!(
                    "init called while {}",
                    state.as_str()
                )))
            }
        }
        if name.trim().is_empty() {
            return Err(DaqError::Validation("device name must not be empty".to_owned()));
        }
        self.state = LifecycleState::Initializing;
        self.name = name.to_owned();
        if !db_name.is_empty() {
            self.database = db_name.to_owned();
        }
        info!(device = %self.name, database = %self.database, identity = %self.identity, "initialising interface");

        let outcome = self.start_discovery().and_then(|()| {
            self.dispatcher.initialize(backend_config).map_err(|err| {
                error!(device = %self.name, error = %err, "transport backend initialisation failed");
                err
            })
        });
        let outcome = outcome.and_then(|()| self.wait_ready());
        match outcome {
            Ok(()) => {
                self.state = LifecycleState::Ready;
                info!(device = %self.name, backend = self.dispatcher.backend_name(), "interface ready");
                Ok(())
            }
            Err(err) => {
                self.state = LifecycleState::Failed;
                Err(err)
            }
        }
    }

    fn start_discovery(&mut self) -> Result<()> {
        if self.discovery.is_some() {
            return Ok(());
        }
        let source = std::mem::replace(&mut self.discovery_source, DiscoverySource::Disabled);
        self.discovery = match source {
            DiscoverySource::Multicast(config) => Some(Box::new(MulticastDiscovery::start(
                &config,
                Arc::clone(self.context.get()),
                self.identity,
                &self.name,
            )?)),
            DiscoverySource::Custom(discovery) => Some(discovery),
            DiscoverySource::Disabled => None,
        };
        Ok(())
    }

    fn wait_ready(&self) -> Result<()> {
        let timeout = self.settings.readiness_timeout;
        let deadline = Instant::now() + timeout;
        let latch = self.discovery.as_ref().map(|discovery| discovery.readiness());
        loop {
            let discovered = latch.as_ref().map_or(true, |latch| latch.is_set());
            if discovered && self.dispatcher.is_ready() {
                return Ok(());
            }
            let now = Instant::now();
            if now >= deadline {
                warn!(device = %self.name, waited = ?timeout, discovered, "interface did not become ready");
                return Err(DaqError::Lifecycle(format!(
                    "not ready after {timeout:?} (discovery handshake: {discovered})"
                )));
            }
            let slice = (deadline - now).min(READINESS_POLL);
            match &latch {
                Some(latch) if !discovered => {
                    latch.wait_timeout(slice);
                }
                _ => thread::sleep(slice),
            }
        }
    }

    pub(crate) fn ensure_ready(&self) -> Result<()> {
        if self.state == LifecycleState::Ready {
            Ok(())
        } else {
            Err(DaqError::Lifecycle(format!(
                "interface is {}, not ready",
                self.state.as_str()
            )))
        }
    }

    /// Empty or absent device names fall back to the interface identity.
    pub(crate) fn resolve_device<'a>(&'a self, device: Option<&'a str>) -> &'a str {
        match device {
            Some(device) if !device.is_empty() => device,
            _ => &self.name,
        }
    }

    pub(crate) fn timeout_or_default(&self, timeout: Option<Duration>) -> Duration {
        timeout.unwrap_or(self.settings.command_timeout)
    }

    pub(crate) fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Device name passed to `init`.
    pub fn device_name(&self) -> &str {
        &self.name
    }

    /// Default database for queries.
    pub fn database(&self) -> &str {
        &self.database
    }

    /// Identity announced by discovery.
    pub fn identity(&self) -> Uuid {
        self.identity
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Shared messaging context.
    pub fn context(&self) -> &Arc<MessagingContext> {
        self.context.get()
    }

    /// Peers known to discovery.
    pub fn peers(&self) -> Vec<PeerRecord> {
        self.discovery
            .as_ref()
            .map(|discovery| discovery.peers())
            .unwrap_or_default()
    }

    /// Counters of the command dispatcher.
    pub fn dispatch_metrics(&self) -> DispatchMetrics {
        self.dispatcher.metrics()
    }

    pub fn slow_control(&self) -> &Arc<SlowControlCollection> {
        &self.slow_control
    }

    /// Handle that feeds remote changes and alerts into the slow-control receiver.
    pub fn remote_handle(&self) -> RemoteHandle {
        self.remote.clone()
    }

    pub fn add_slow_control_variable(
        &self,
        name: &str,
        kind: ElementKind,
        on_change: Option<ChangeHandler>,
    ) -> Result<()> {
        self.slow_control.add(name, kind, on_change)
    }

    pub fn remove_slow_control_variable(&self, name: &str) -> bool {
        self.slow_control.remove(name)
    }

    pub fn clear_slow_control_variables(&self) {
        self.slow_control.clear();
    }

    pub fn slow_control_value<T: FromScValue>(&self, name: &str) -> Result<T> {
        self.slow_control.value(name)
    }

    pub fn alert_subscribe(&self, alert: &str, handler: AlertHandler) {
        self.slow_control.alert_subscribe(alert, handler);
    }

    pub fn alert_send(&self, alert: &str, payload: &str) -> Result<bool> {
        self.slow_control.alert_send(alert, payload)
    }

    pub fn print_slow_control_variables(&self) -> String {
        self.slow_control.print()
    }
}

impl Drop for DaqInterface {
    fn drop(&mut self) {
        if let Some(mut discovery) = self.discovery.take() {
            discovery.shutdown();
        }
        self.slow_control.stop_receiver();
        self.dispatcher.finalize();
        match &self.context {
            ContextHandle::Owned(context) => context.terminate(),
            ContextHandle::Borrowed(context) => {
                debug!(context = %context.id(), "leaving borrowed messaging context running")
            }
        }
        debug!(device = %self.name, "interface torn down");
    }
}
