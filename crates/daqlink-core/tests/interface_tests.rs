//! ---
//! ems_section: "15-testing-qa-runbook"
//! ems_subsection: "integration-tests"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Integration tests for the device interface."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use daqlink_common::config::{BackendConfig, InterfaceSettings};
use daqlink_core::{
    DaqError, DaqInterface, ElementKind, ErrorCategory, LifecycleState, PeerDiscovery,
    PlotArtifact, ReadinessLatch, LATEST_VERSION,
};
use daqlink_msg::{topics, CallKind, InMemoryBackend, MessagingContext, Reply};

fn fast_settings() -> InterfaceSettings {
    InterfaceSettings {
        command_timeout: Duration::from_millis(300),
        readiness_timeout: Duration::from_millis(200),
        ..InterfaceSettings::default()
    }
}

fn unready_interface(backend: &InMemoryBackend) -> DaqInterface {
    DaqInterface::new(Box::new(backend.clone()))
        .expect("construct interface")
        .with_settings(fast_settings())
        .without_discovery()
}

fn ready_interface(name: &str) -> (DaqInterface, InMemoryBackend) {
    let backend = InMemoryBackend::new();
    let mut interface = unready_interface(&backend);
    interface
        .init(name, &BackendConfig::default(), "daq")
        .expect("init");
    (interface, backend)
}

struct ManualDiscovery {
    latch: ReadinessLatch,
    stopped: Arc<AtomicBool>,
}

impl PeerDiscovery for ManualDiscovery {
    fn readiness(&self) -> ReadinessLatch {
        self.latch.clone()
    }

    fn shutdown(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

#[test]
fn oversized_log_is_rejected_without_backend_calls() {
    let (interface, backend) = ready_interface("pump");
    let message = "x".repeat(700_000);
    let err = interface
        .send_log(&message, None, None, None)
        .expect_err("oversize log");
    assert!(matches!(err, DaqError::PayloadTooLarge { .. }));
    assert_eq!(err.category(), ErrorCategory::Validation);
    assert_eq!(backend.call_count(), 0);
}

#[test]
fn quoted_version_reply_is_parsed() {
    let (interface, backend) = ready_interface("pump");
    backend.push_single(r#"{"version":"3"}"#);
    let version = interface
        .send_config(r#"{"gain":2}"#, "ops", "tuned", None, None, None)
        .expect("version");
    assert_eq!(version, 3);
}

#[test]
fn unparseable_write_reply_fails() {
    let (interface, backend) = ready_interface("pump");
    backend.push_single(r#"{"status":"ok"}"#);
    let err = interface
        .send_calibration("{}", "baseline", None, None, None)
        .expect_err("no version");
    assert_eq!(err.category(), ErrorCategory::Protocol);
}

#[test]
fn config_round_trip_returns_exact_bytes() -> anyhow::Result<()> {
    let (interface, _backend) = ready_interface("pump");
    let config = "{\"label\":\"tank \\\"A\\\"\",\"path\":\"C:\\\\daq\",\"notes\":\"line1\\nline2\"}";
    let first = interface.send_config(config, "ops", "first", None, None, None)?;
    let second = interface.send_config(r#"{"v":2}"#, "ops", "second", None, None, None)?;
    assert_eq!((first, second), (0, 1));
    assert_eq!(interface.get_config(0, None, None)?, config);
    assert_eq!(interface.get_config(LATEST_VERSION, None, None)?, r#"{"v":2}"#);
    Ok(())
}

#[test]
fn empty_device_defaults_to_interface_name() -> anyhow::Result<()> {
    let (interface, backend) = ready_interface("hv-crate");
    interface.send_log("default", None, None, None)?;
    interface.send_log("empty", Some(9), Some(""), None)?;
    interface.send_log("explicit", Some(0), Some("other"), None)?;
    interface.send_monitoring_data(r#"{"temp":21.5}"#, None, Some(1000))?;
    interface.send_config(r#"{"gain":1}"#, "ops", "defaults", None, None, None)?;
    interface.send_calibration("[0.1]", "pedestals", Some(""), None, None)?;
    interface.send_alarm("trip", 0, Some(""), None, None)?;

    let devices: Vec<String> = backend
        .calls()
        .iter()
        .map(|call| call.payload_json().expect("json")["device"].as_str().unwrap_or("").to_owned())
        .collect();
    assert_eq!(
        devices,
        vec![
            "hv-crate", "hv-crate", "other", "hv-crate", "hv-crate", "hv-crate", "hv-crate",
            "hv-crate"
        ]
    );
    let topics_seen: Vec<Option<String>> =
        backend.calls().iter().map(|call| call.topic.clone()).collect();
    assert_eq!(topics_seen[4].as_deref(), Some(topics::W_CONFIG));
    assert_eq!(topics_seen[5].as_deref(), Some(topics::W_CALIBRATION));
    assert_eq!(topics_seen[6].as_deref(), Some(topics::W_ALARM));
    assert_eq!(topics_seen[7], None);
    assert_eq!(interface.get_config(LATEST_VERSION, Some("hv-crate"), None)?, r#"{"gain":1}"#);

    let calls = backend.calls();
    let first = calls[0].payload_json()?;
    assert_eq!(first["topic"], "logging");
    assert_eq!(first["severity"], 2);
    let monitoring = calls[3].payload_json()?;
    assert_eq!(monitoring["topic"], "monitoring");
    assert_eq!(monitoring["data"], r#"{"temp":21.5}"#);
    assert_eq!(monitoring["time"], 1000);
    Ok(())
}

#[test]
fn alarm_level_is_clamped_and_mirrored() -> anyhow::Result<()> {
    let (interface, backend) = ready_interface("pump");
    for level in [5, 1, 0, -2] {
        interface.send_alarm("High current on channel 3", level, None, None, None)?;
    }
    let calls = backend.calls();
    assert_eq!(calls.len(), 8);
    let levels: Vec<i64> = calls
        .iter()
        .filter(|call| call.topic.as_deref() == Some(topics::W_ALARM))
        .map(|call| call.payload_json().expect("json")["level"].as_i64().expect("level"))
        .collect();
    assert_eq!(levels, vec![1, 1, 0, 0]);

    for pair in calls.chunks(2) {
        assert_eq!(pair[0].kind, CallKind::Command);
        assert_eq!(pair[1].kind, CallKind::Multicast);
        let mirror = pair[1].payload_json()?;
        assert_eq!(mirror["topic"], "logging");
        assert_eq!(mirror["severity"], 0);
        assert_eq!(mirror["message"], "High current on channel 3");
    }
    Ok(())
}

#[test]
fn alarm_result_follows_the_mirror() {
    let (interface, backend) = ready_interface("pump");
    backend.push_reply(Err(DaqError::Transport("middleman down".into())));
    interface
        .send_alarm("primary fails", 0, None, None, None)
        .expect("mirror succeeded");

    backend.push_single("");
    backend.push_reply(Err(DaqError::Transport("multicast down".into())));
    let err = interface
        .send_alarm("mirror fails", 0, None, None, None)
        .expect_err("mirror failed");
    assert_eq!(err.category(), ErrorCategory::Transport);
    assert_eq!(backend.call_count(), 4);
}

#[test]
fn plots_store_or_broadcast() -> anyhow::Result<()> {
    let (interface, backend) = ready_interface("pump");
    let mut plot = PlotArtifact {
        name: "energy".into(),
        draw_options: "HIST".into(),
        data: r#"{"_typename":"TH1F","fArray":[1,2]}"#.into(),
        timestamp: Some(1700),
        persistent: false,
    };
    assert_eq!(interface.send_plot(&plot, None)?, None);
    let live = backend.calls()[0].payload_json()?;
    assert_eq!(live["topic"], "rootplot");
    assert_eq!(live["plot_name"], "energy");

    plot.persistent = true;
    assert_eq!(interface.send_plot(&plot, None)?, Some(0));
    let record = interface.get_plot("energy", LATEST_VERSION, None)?;
    assert_eq!(record.version, 0);
    assert_eq!(record.draw_options, "HIST");
    assert_eq!(record.timestamp, Some(1700));
    assert_eq!(record.data, plot.data);
    Ok(())
}

#[test]
fn calibration_accepts_unwrapped_reply() -> anyhow::Result<()> {
    let (interface, backend) = ready_interface("pump");
    backend.push_single("[1.0,2.0,3.5]");
    assert_eq!(interface.get_calibration(2, None, None)?, "[1.0,2.0,3.5]");

    interface.send_calibration("[0.5]", "pedestals", Some("adc-1"), None, None)?;
    assert_eq!(interface.get_calibration(LATEST_VERSION, Some("adc-1"), None)?, "[0.5]");
    Ok(())
}

#[test]
fn sql_queries_return_rows_or_first_row() -> anyhow::Result<()> {
    let (interface, backend) = ready_interface("pump");
    backend.set_query_rows(vec![r#"{"n":1}"#.into(), r#"{"n":2}"#.into()]);
    let rows = interface.sql_query_rows(None, "select n from t", None)?;
    assert_eq!(rows.len(), 2);
    assert_eq!(interface.sql_query(Some("runs"), "select n from t", None)?, r#"{"n":1}"#);

    let calls = backend.calls();
    assert_eq!(calls[0].kind, CallKind::CommandRows);
    assert_eq!(calls[0].payload_json()?["database"], "daq");
    assert_eq!(calls[1].payload_json()?["database"], "runs");

    backend.push_reply(Ok(Reply::Rows(Vec::new())));
    assert_eq!(interface.sql_query(None, "select 1 where false", None)?, "");
    assert!(interface.sql_query(None, "  ", None).is_err());
    Ok(())
}

#[test]
fn operations_before_init_are_lifecycle_errors() {
    let backend = InMemoryBackend::new();
    let interface = unready_interface(&backend);
    assert_eq!(interface.state(), LifecycleState::Uninitialized);
    let err = interface
        .send_log("too early", None, None, None)
        .expect_err("not ready");
    assert_eq!(err.category(), ErrorCategory::Lifecycle);
    assert_eq!(backend.call_count(), 0);
}

#[test]
fn backend_failure_aborts_init() {
    let backend = InMemoryBackend::new();
    backend.fail_initialize("no middleman configured");
    let mut interface = unready_interface(&backend);
    let err = interface
        .init("pump", &BackendConfig::default(), "daq")
        .expect_err("init fails");
    assert_eq!(err.category(), ErrorCategory::Transport);
    assert_eq!(interface.state(), LifecycleState::Failed);

    interface
        .init("pump", &BackendConfig::default(), "daq")
        .expect("retry succeeds");
    assert_eq!(interface.state(), LifecycleState::Ready);
    assert!(interface.init("pump", &BackendConfig::default(), "daq").is_err());
}

#[test]
fn readiness_wait_is_bounded() {
    let backend = InMemoryBackend::new();
    backend.set_ready(false);
    let mut interface = unready_interface(&backend);
    let err = interface
        .init("pump", &BackendConfig::default(), "daq")
        .expect_err("never ready");
    assert_eq!(err.category(), ErrorCategory::Lifecycle);
    assert_eq!(interface.state(), LifecycleState::Failed);

    backend.set_ready(true);
    interface
        .init("pump", &BackendConfig::default(), "daq")
        .expect("ready now");
}

#[test]
fn init_waits_for_discovery_handshake() {
    let backend = InMemoryBackend::new();
    let latch = ReadinessLatch::new();
    let stopped = Arc::new(AtomicBool::new(false));
    let discovery = ManualDiscovery {
        latch: latch.clone(),
        stopped: Arc::clone(&stopped),
    };
    let mut interface = DaqInterface::new(Box::new(backend.clone()))
        .expect("construct")
        .with_settings(InterfaceSettings {
            readiness_timeout: Duration::from_secs(10),
            ..InterfaceSettings::default()
        })
        .with_peer_discovery(Box::new(discovery));

    let trigger = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        latch.set();
    });
    interface
        .init("pump", &BackendConfig::default(), "daq")
        .expect("handshake arrives");
    trigger.join().expect("trigger");
    assert_eq!(interface.state(), LifecycleState::Ready);

    drop(interface);
    assert!(stopped.load(Ordering::SeqCst));
    assert!(backend.is_finalized());
}

#[test]
fn drop_terminates_only_owned_contexts() {
    let backend = InMemoryBackend::new();
    let (interface, _) = ready_interface("owned");
    let owned = Arc::clone(interface.context());
    drop(interface);
    assert!(owned.is_terminated());

    let shared = MessagingContext::new();
    let interface = DaqInterface::with_context(Box::new(backend.clone()), Arc::clone(&shared))
        .expect("construct");
    assert_eq!(backend.context_id(), Some(shared.id()));
    drop(interface);
    assert!(!shared.is_terminated());
    assert!(backend.is_finalized());
}

#[test]
fn slow_control_callbacks_can_use_the_interface() {
    let (interface, backend) = ready_interface("pump");
    let interface = Arc::new(interface);
    let handle = Arc::downgrade(&interface);
    let (tx, rx) = mpsc::channel();
    interface
        .add_slow_control_variable(
            "Start",
            ElementKind::Button,
            Some(Arc::new(move |name: &str| {
                if let Some(interface) = handle.upgrade() {
                    let sent = interface.send_log("Device started", None, None, None);
                    tx.send(sent.is_ok()).expect("report");
                }
                format!("{name} pressed")
            })),
        )
        .expect("add button");

    interface.remote_handle().set("Start", true).expect("queue");
    assert!(rx.recv_timeout(Duration::from_secs(5)).expect("callback ran"));
    assert!(interface.slow_control_value::<bool>("Start").expect("value"));
    let log = backend.calls()[0].payload_json().expect("json");
    assert_eq!(log["message"], "Device started");

    let listing = interface.print_slow_control_variables();
    assert!(listing.contains("\"Start\""));
    assert!(interface.remove_slow_control_variable("Start"));
    interface.clear_slow_control_variables();
    assert_eq!(interface.slow_control().names(), vec!["Status".to_owned()]);
}
