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

use serde::{Deserialize, Serialize};

use crate::codec::Payload;
use crate::{DaqError, Result};

/// Backend-assigned resource version. Reads use [`LATEST_VERSION`].
pub type Version = i32;

/// Version number requesting the most recent entry of a resource.
pub const LATEST_VERSION: Version = -1;

/// Topic names understood by the database middleman.
pub mod topics {
    /// Alarm insertion.
    pub const W_ALARM: &str = "W_ALARM";
    /// Device configuration write.
    pub const W_CONFIG: &str = "W_CONFIG";
    /// Device configuration read.
    pub const R_CONFIG: &str = "R_CONFIG";
    /// Calibration data write.
    pub const W_CALIBRATION: &str = "W_CALIBRATION";
    /// Calibration data read.
    pub const R_CALIBRATION: &str = "R_CALIBRATION";
    /// Persistent plot write.
    pub const W_ROOTPLOT: &str = "W_ROOTPLOT";
    /// Plot read.
    pub const R_ROOTPLOT: &str = "R_ROOTPLOT";
    /// Free-form SQL query.
    pub const R_QUERY: &str = "R_QUERY";

    /// Embedded topic for broadcast log messages.
    pub const LOGGING: &str = "logging";
    /// Embedded topic for broadcast monitoring samples.
    pub const MONITORING: &str = "monitoring";
    /// Embedded topic for broadcast temporary plots.
    pub const ROOTPLOT: &str = "rootplot";
}

/// Delivery contract selected for a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Unacknowledged best-effort broadcast; no response.
    Multicast,
    /// Request/response with exactly one result string.
    SyncSingle,
    /// Request/response with one result string per row.
    SyncMulti,
}

impl DeliveryMode {
    /// Whether the mode waits for a reply.
    pub fn is_sync(&self) -> bool {
        !matches!(self, DeliveryMode::Multicast)
    }

    /// Label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMode::Multicast => "multicast",
            DeliveryMode::SyncSingle => "sync_single",
            DeliveryMode::SyncMulti => "sync_multi",
        }
    }
}

/// Outbound command handed to the dispatcher.
#[derive(Debug, Clone, PartialEq)]
pub struct Command {
    /// Dispatcher topic; broadcasts carry their topic inside the payload instead.
    pub topic: Option<String>,
    /// Ordered payload fields.
    pub payload: Payload,
    /// Delivery contract.
    pub mode: DeliveryMode,
    /// Per-call timeout, only meaningful for synchronous modes.
    pub timeout: Duration,
}

impl Command {
    /// Build a synchronous command expecting a single result.
    pub fn sync(topic: impl Into<String>, payload: Payload, timeout: Duration) -> Self {
        Self {
            topic: Some(topic.into()),
            payload,
            mode: DeliveryMode::SyncSingle,
            timeout,
        }
    }

    /// Build a synchronous command expecting one result per row.
    pub fn sync_rows(topic: impl Into<String>, payload: Payload, timeout: Duration) -> Self {
        Self {
            topic: Some(topic.into()),
            payload,
            mode: DeliveryMode::SyncMulti,
            timeout,
        }
    }

    /// Build a fire-and-forget broadcast.
    pub fn broadcast(payload: Payload) -> Self {
        Self {
            topic: None,
            payload,
            mode: DeliveryMode::Multicast,
            timeout: Duration::ZERO,
        }
    }

    /// Topic label for logging, falling back to the embedded payload topic.
    pub fn label(&self) -> &str {
        self.topic
            .as_deref()
            .or_else(|| self.payload.text("topic"))
            .unwrap_or("multicast")
    }
}

/// Reply produced by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Broadcasts have no reply.
    None,
    /// Single result string.
    Single(String),
    /// One result string per matched row.
    Rows(Vec<String>),
}

impl Reply {
    /// Extract the single result, failing on any other shape.
    pub fn into_single(self) -> Result<String> {
        match self {
            Reply::Single(value) => Ok(value),
            other => Err(DaqError::protocol(format!(
                "expected a single result, got {}",
                other.describe()
            ))),
        }
    }

    /// Extract the row results, failing on any other shape.
    pub fn into_rows(self) -> Result<Vec<String>> {
        match self {
            Reply::Rows(rows) => Ok(rows),
            other => Err(DaqError::protocol(format!(
                "expected row results, got {}",
                other.describe()
            ))),
        }
    }

    fn describe(&self) -> String {
        match self {
            Reply::None => "no reply".to_owned(),
            Reply::Single(_) => "a single result".to_owned(),
            Reply::Rows(rows) => format!("{} rows", rows.len()),
        }
    }
}

/// Alarm severity as carried on the wire: 0 critical, 1 normal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmLevel {
    /// Level 0.
    Critical,
    /// Level 1.
    Normal,
}

impl AlarmLevel {
    /// Collapse an arbitrary caller level onto the two wire values.
    ///
    /// Anything above zero is normal; zero and negative inputs are critical.
    pub fn from_raw(level: i32) -> Self {
        if level > 0 {
            AlarmLevel::Normal
        } else {
            AlarmLevel::Critical
        }
    }

    /// Wire representation.
    pub fn as_wire(&self) -> i64 {
        match self {
            AlarmLevel::Critical => 0,
            AlarmLevel::Normal => 1,
        }
    }
}
