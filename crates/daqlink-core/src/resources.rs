//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Device interface lifecycle, resources, telemetry and slow control."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Versioned database-backed resources.
//!
//! Writes go to `W_<KIND>` and answer with the version the backend assigned;
//! reads go to `R_<KIND>` and ask for a version, [`LATEST_VERSION`] meaning
//! the newest. The client never picks a version itself.
use std::time::Duration;

use daqlink_common::time::BACKEND_ASSIGNED;
use daqlink_msg::{
    extract_version, extract_wrapped_field, topics, DaqError, ErrorCategory, Payload, PlotRecord,
    Result, Version, LATEST_VERSION,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::interface::DaqInterface;

/// Family of versioned resources sharing the write/read convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Config,
    Calibration,
    Plot,
}

impl ResourceKind {
    pub fn write_topic(self) -> &'static str {
        match self {
            ResourceKind::Config => topics::W_CONFIG,
            ResourceKind::Calibration => topics::W_CALIBRATION,
            ResourceKind::Plot => topics::W_ROOTPLOT,
        }
    }

    pub fn read_topic(self) -> &'static str {
        match self {
            ResourceKind::Config => topics::R_CONFIG,
            ResourceKind::Calibration => topics::R_CALIBRATION,
            ResourceKind::Plot => topics::R_ROOTPLOT,
        }
    }

    /// Payload field naming the resource owner.
    pub fn key_field(self) -> &'static str {
        match self {
            ResourceKind::Config | ResourceKind::Calibration => "device",
            ResourceKind::Plot => "plot_name",
        }
    }
}

/// A plot to publish.
///
/// Persistent plots are stored and versioned; temporary ones are broadcast
/// for live display only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlotArtifact {
    pub name: String,
    pub draw_options: String,
    pub data: String,
    #[serde(default)]
    pub timestamp: Option<i64>,
    #[serde(default)]
    pub persistent: bool,
}

impl DaqInterface {
    fn write_resource(
        &self,
        kind: ResourceKind,
        key: &str,
        extra: &[(&'static str, &str)],
        data: &str,
        timestamp: Option<i64>,
        timeout: Option<Duration>,
    ) -> Result<Version> {
        self.ensure_ready()?;
        let mut payload = Payload::new()
            .with_int("time", timestamp.unwrap_or(BACKEND_ASSIGNED))
            .with_text(kind.key_field(), key);
        for &(name, value) in extra {
            payload = payload.with_text(name, value);
        }
        let payload = payload.with_text("data", data);

        let topic = kind.write_topic();
        let reply = self
            .dispatcher()
            .send_sync(topic, payload, self.timeout_or_default(timeout))?;
        let version = extract_version(&reply).map_err(|err| {
            warn!(topic, key, response = %reply, error = %err, "write reply carried no version");
            err
        })?;
        debug!(topic, key, version, "resource written");
        Ok(version)
    }

    fn read_resource(
        &self,
        kind: ResourceKind,
        key: &str,
        version: Version,
        timeout: Option<Duration>,
    ) -> Result<String> {
        self.ensure_ready()?;
        let payload = Payload::new()
            .with_text(kind.key_field(), key)
            .with_int("version", i64::from(version));
        self.dispatcher()
            .send_sync(kind.read_topic(), payload, self.timeout_or_default(timeout))
    }

    /// Store a device configuration and return its new version.
    pub fn send_config(
        &self,
        data: &str,
        author: &str,
        description: &str,
        device: Option<&str>,
        timestamp: Option<i64>,
        timeout: Option<Duration>,
    ) -> Result<Version> {
        let device = self.resolve_device(device);
        self.write_resource(
            ResourceKind::Config,
            device,
            &[("author", author), ("description", description)],
            data,
            timestamp,
            timeout,
        )
    }

    /// Fetch a configuration. Pass [`LATEST_VERSION`] for the newest.
    pub fn get_config(
        &self,
        version: Version,
        device: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<String> {
        let device = self.resolve_device(device);
        let reply = self.read_resource(ResourceKind::Config, device, version, timeout)?;
        extract_wrapped_field(&reply, "data")
    }

    /// Store calibration data and return its new version.
    pub fn send_calibration(
        &self,
        data: &str,
        description: &str,
        device: Option<&str>,
        timestamp: Option<i64>,
        timeout: Option<Duration>,
    ) -> Result<Version> {
        let device = self.resolve_device(device);
        self.write_resource(
            ResourceKind::Calibration,
            device,
            &[("description", description)],
            data,
            timestamp,
            timeout,
        )
    }

    /// Fetch calibration data.
    ///
    /// Middlemen that answer with the bare blob instead of `{"data":"..."}`
    /// are accepted; the reply is then returned unchanged.
    pub fn get_calibration(
        &self,
        version: Version,
        device: Option<&str>,
        timeout: Option<Duration>,
    ) -> Result<String> {
        let device = self.resolve_device(device);
        let reply = self.read_resource(ResourceKind::Calibration, device, version, timeout)?;
        match extract_wrapped_field(&reply, "data") {
            Ok(data) => Ok(data),
            Err(err) if err.category() == ErrorCategory::Protocol => {
                debug!(device, error = %err, "calibration reply is unwrapped, returning as-is");
                Ok(reply)
            }
            Err(err) => Err(err),
        }
    }

    /// Publish a plot. Persistent plots return their stored version.
    pub fn send_plot(&self, plot: &PlotArtifact, timeout: Option<Duration>) -> Result<Option<Version>> {
        if plot.name.is_empty() {
            return Err(DaqError::Validation("plot name must not be empty".to_owned()));
        }
        if !plot.persistent {
            self.send_temporary_plot(&plot.name, &plot.draw_options, &plot.data, plot.timestamp)?;
            return Ok(None);
        }
        self.write_resource(
            ResourceKind::Plot,
            &plot.name,
            &[("draw_options", plot.draw_options.as_str())],
            &plot.data,
            plot.timestamp,
            timeout,
        )
        .map(Some)
    }

    /// Broadcast a plot for live display without storing it.
    pub fn send_temporary_plot(
        &self,
        name: &str,
        draw_options: &str,
        data: &str,
        timestamp: Option<i64>,
    ) -> Result<()> {
        self.ensure_ready()?;
        let payload = Payload::new()
            .with_text("topic", topics::ROOTPLOT)
            .with_int("time", timestamp.unwrap_or(BACKEND_ASSIGNED))
            .with_text("plot_name", name)
            .with_text("draw_options", draw_options)
            .with_text("data", data);
        self.dispatcher().send_broadcast(payload)
    }

    /// Fetch a stored plot with its draw options and confirmed version.
    pub fn get_plot(&self, name: &str, version: Version, timeout: Option<Duration>) -> Result<PlotRecord> {
        let reply = self.read_resource(ResourceKind::Plot, name, version, timeout)?;
        let record = PlotRecord::from_response(&reply)?;
        if version != LATEST_VERSION && record.version != version {
            warn!(plot = name, requested = version, received = record.version, "plot version mismatch");
        }
        Ok(record)
    }

    /// Run a query and return one JSON map string per row.
    pub fn sql_query_rows(
        &self,
        database: Option<&str>,
        query: &str,
        timeout: Option<Duration>,
    ) -> Result<Vec<String>> {
        self.ensure_ready()?;
        if query.trim().is_empty() {
            return Err(DaqError::Validation("query must not be empty".to_owned()));
        }
        let database = match database {
            Some(database) if !database.is_empty() => database,
            _ => self.database(),
        };
        let payload = Payload::new()
            .with_text("database", database)
            .with_text("query", query);
        self.dispatcher()
            .send_sync_rows(topics::R_QUERY, payload, self.timeout_or_default(timeout))
    }

    /// Run a query expected to return a single row.
    ///
    /// Returns the first row, or an empty string when nothing matched. Extra
    /// rows are dropped with a warning.
    pub fn sql_query(
        &self,
        database: Option<&str>,
        query: &str,
        timeout: Option<Duration>,
    ) -> Result<String> {
        let mut rows = self.sql_query_rows(database, query, timeout)?;
        if rows.len() > 1 {
            warn!(rows = rows.len(), query, "single-row query returned several rows, using the first");
        }
        if rows.is_empty() {
            Ok(String::new())
        } else {
            Ok(rows.swap_remove(0))
        }
    }
}
