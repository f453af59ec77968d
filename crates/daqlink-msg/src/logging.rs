//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Wire codec, transport backends and command dispatch."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use daqlink_common::time::duration_to_millis;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use tracing::debug;

use crate::types::Command;

/// Direction of a dispatch event, used for consistent logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    /// Command handed to the backend.
    Outbound,
    /// Reply received from the backend.
    Inbound,
    /// Command refused before reaching the backend.
    Rejected,
}

/// Emit a structured log entry for dispatcher activity.
pub fn log_command(direction: MessageDirection, command: &Command, size: usize) {
    debug!(
        topic = command.label(),
        mode = command.mode.as_str(),
        size,
        timeout_ms = duration_to_millis(command.timeout),
        direction = ?direction,
        "dispatch activity"
    );
}

/// Prometheus metric handles for dispatcher activity, labelled by delivery mode.
#[derive(Clone)]
pub struct DispatchMetricsExporter {
    sent: IntCounterVec,
    failed: IntCounterVec,
    rejected: IntCounterVec,
    latency: HistogramVec,
}

impl DispatchMetricsExporter {
    /// Register dispatch metrics with the provided registry.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let sent = IntCounterVec::new(
            Opts::new("daqlink_commands_sent_total", "Commands accepted by the backend"),
            &["mode"],
        )?;
        let failed = IntCounterVec::new(
            Opts::new(
                "daqlink_commands_failed_total",
                "Commands the backend failed to deliver",
            ),
            &["mode", "category"],
        )?;
        let rejected = IntCounterVec::new(
            Opts::new(
                "daqlink_commands_rejected_total",
                "Commands refused by the local size guard",
            ),
            &["mode"],
        )?;
        let latency = HistogramVec::new(
            HistogramOpts::new(
                "daqlink_command_latency_seconds",
                "Time spent inside the transport backend per command",
            ),
            &["mode"],
        )?;

        registry.register(Box::new(sent.clone()))?;
        registry.register(Box::new(failed.clone()))?;
        registry.register(Box::new(rejected.clone()))?;
        registry.register(Box::new(latency.clone()))?;

        Ok(Self {
            sent,
            failed,
            rejected,
            latency,
        })
    }

    /// Record a delivered command.
    pub fn observe_sent(&self, mode: &str) {
        self.sent.with_label_values(&[mode]).inc();
    }

    /// Record a failed command.
    pub fn observe_failed(&self, mode: &str, category: &str) {
        self.failed.with_label_values(&[mode, category]).inc();
    }

    /// Record a command refused before sending.
    pub fn observe_rejected(&self, mode: &str) {
        self.rejected.with_label_values(&[mode]).inc();
    }

    /// Record backend latency.
    pub fn observe_latency(&self, mode: &str, duration: Duration) {
        self.latency
            .with_label_values(&[mode])
            .observe(duration.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metrics_exporter_records_counts() {
        let registry = Registry::new();
        let metrics = DispatchMetricsExporter::register(&registry).expect("register metrics");
        metrics.observe_sent("sync_single");
        metrics.observe_failed("sync_single", "timeout");
        metrics.observe_rejected("multicast");
        metrics.observe_latency("sync_single", Duration::from_millis(10));

        let families = registry.gather();
        for name in [
            "daqlink_commands_sent_total",
            "daqlink_commands_failed_total",
            "daqlink_commands_rejected_total",
            "daqlink_command_latency_seconds",
        ] {
            assert!(families.iter().any(|f| f.get_name() == name), "{name}");
        }
    }

    #[test]
    fn double_registration_is_refused() {
        let registry = Registry::new();
        DispatchMetricsExporter::register(&registry).expect("first");
        assert!(DispatchMetricsExporter::register(&registry).is_err());
    }
}
