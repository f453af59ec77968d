//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Device interface lifecycle, resources, telemetry and slow control."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Duration;

use daqlink_common::time::BACKEND_ASSIGNED;
use daqlink_msg::{topics, AlarmLevel, Payload, Result};
use tracing::{debug, error, warn};

use crate::interface::DaqInterface;

/// Severity used by [`DaqInterface::send_log`] when none is given.
pub const DEFAULT_SEVERITY: u8 = 2;

/// Severity of the log record mirroring every alarm.
pub const ALARM_MIRROR_SEVERITY: u8 = 0;

impl DaqInterface {
    /// Broadcast a log line. Severity 0 is the most severe; 9 the least.
    pub fn send_log(
        &self,
        message: &str,
        severity: Option<u8>,
        device: Option<&str>,
        timestamp: Option<i64>,
    ) -> Result<()> {
        self.ensure_ready()?;
        let device = self.resolve_device(device);
        let severity = severity.unwrap_or(DEFAULT_SEVERITY);
        self.dispatcher()
            .send_broadcast(log_payload(message, severity, device, timestamp))
    }

    /// Broadcast an opaque JSON monitoring sample.
    pub fn send_monitoring_data(
        &self,
        json_data: &str,
        device: Option<&str>,
        timestamp: Option<i64>,
    ) -> Result<()> {
        self.ensure_ready()?;
        let device = self.resolve_device(device);
        let payload = Payload::new()
            .with_text("topic", topics::MONITORING)
            .with_int("time", timestamp.unwrap_or(BACKEND_ASSIGNED))
            .with_text("device", device)
            .with_text("data", json_data);
        self.dispatcher().send_broadcast(payload)
    }

    /// Raise an alarm.
    ///
    /// The alarm is stored through `W_ALARM` with `level` collapsed to
    /// critical (0) or normal (1), then mirrored as a severity-0 log broadcast
    /// whatever the store outcome. The returned result is the mirror's; a
    /// failed store is only logged.
    pub fn send_alarm(
        &self,
        message: &str,
        level: i32,
        device: Option<&str>,
        timestamp: Option<i64>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        self.ensure_ready()?;
        let device = self.resolve_device(device);
        let level = AlarmLevel::from_raw(level);
        let payload = Payload::new()
            .with_int("time", timestamp.unwrap_or(BACKEND_ASSIGNED))
            .with_text("device", device)
            .with_int("level", level.as_wire())
            .with_text("message", message);
        match self
            .dispatcher()
            .send_sync(topics::W_ALARM, payload, self.timeout_or_default(timeout))
        {
            Ok(_) => debug!(device, level = ?level, "alarm stored"),
            Err(err) => warn!(
                device,
                level = ?level,
                category = err.category().as_str(),
                error = %err,
                "alarm store failed, mirroring to log only"
            ),
        }

        let mirror = self.dispatcher().send_broadcast(log_payload(
            message,
            ALARM_MIRROR_SEVERITY,
            device,
            timestamp,
        ));
        if let Err(err) = &mirror {
            error!(device, error = %err, "alarm log mirror failed");
        }
        mirror
    }
}

fn log_payload(message: &str, severity: u8, device: &str, timestamp: Option<i64>) -> Payload {
    Payload::new()
        .with_text("topic", topics::LOGGING)
        .with_int("time", timestamp.unwrap_or(BACKEND_ASSIGNED))
        .with_text("device", device)
        .with_int("severity", i64::from(severity))
        .with_text("message", message)
}
