//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Wire codec, transport backends and command dispatch."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Command/response protocol layer shared by DAQ-Link devices.
//!
//! Payloads are built by [`codec`], routed through the [`Dispatcher`] and
//! delivered by a [`TransportBackend`]. Responses come back as strings and are
//! parsed by the extractors in [`codec`].
#![warn(missing_docs)]

use std::time::Duration;

pub mod codec;
pub mod dispatcher;
pub mod logging;
pub mod net;
pub mod transport;
pub mod types;

/// Shared result type for protocol operations.
pub type Result<T> = std::result::Result<T, DaqError>;

/// Coarse classification of a [`DaqError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Rejected locally before anything was sent.
    Validation,
    /// The backend failed to send or connect.
    Transport,
    /// A synchronous call did not complete in time.
    Timeout,
    /// A response arrived but did not have the expected shape.
    Protocol,
    /// The interface was used outside of its ready state or failed to start.
    Lifecycle,
}

impl ErrorCategory {
    /// Stable lowercase label used in logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Validation => "validation",
            ErrorCategory::Transport => "transport",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Protocol => "protocol",
            ErrorCategory::Lifecycle => "lifecycle",
        }
    }
}

/// Errors surfaced by the protocol layer.
#[derive(Debug, thiserror::Error)]
pub enum DaqError {
    /// The serialized payload is larger than the backend accepts.
    #[error("payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge {
        /// Serialized payload length.
        size: usize,
        /// Configured ceiling.
        limit: usize,
    },
    /// An argument failed local validation.
    #[error("invalid request: {0}")]
    Validation(String),
    /// The backend reported a send or connect failure.
    #[error("transport failure: {0}")]
    Transport(String),
    /// No reply arrived within the per-call timeout.
    #[error("no reply to {topic} within {waited:?}")]
    Timeout {
        /// Topic of the command that timed out.
        topic: String,
        /// Timeout that elapsed.
        waited: Duration,
    },
    /// A reply did not match the expected wrapper or field shape.
    #[error("malformed response: {0}")]
    Protocol(String),
    /// Lifecycle violation or startup failure.
    #[error("lifecycle error: {0}")]
    Lifecycle(String),
    /// Wrapper for IO errors raised by socket backends.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON serialization or deserialization problems.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DaqError {
    /// Shorthand for a [`DaqError::Protocol`] error.
    pub fn protocol(message: impl Into<String>) -> Self {
        DaqError::Protocol(message.into())
    }

    /// Classify the error for callers that only care about the taxonomy.
    pub fn category(&self) -> ErrorCategory {
        match self {
            DaqError::PayloadTooLarge { .. } | DaqError::Validation(_) => {
                ErrorCategory::Validation
            }
            DaqError::Transport(_) | DaqError::Io(_) => ErrorCategory::Transport,
            DaqError::Timeout { .. } => ErrorCategory::Timeout,
            DaqError::Protocol(_) | DaqError::Json(_) => ErrorCategory::Protocol,
            DaqError::Lifecycle(_) => ErrorCategory::Lifecycle,
        }
    }
}

pub use codec::{
    escape, extract_multi_field, extract_version, extract_wrapped_field, unescape, FieldValue,
    Payload, PlotRecord,
};
pub use dispatcher::{DispatchMetrics, Dispatcher, MAX_PAYLOAD_BYTES};
pub use logging::{log_command, DispatchMetricsExporter, MessageDirection};
pub use net::NetBackend;
pub use transport::{BackendCall, CallKind, InMemoryBackend, MessagingContext, TransportBackend};
pub use types::{topics, AlarmLevel, Command, DeliveryMode, Reply, Version, LATEST_VERSION};
