//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Command-line device for the DAQ-Link slow-control network."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use anyhow::{bail, Result};
use clap::Args;
use daqlink_core::DaqInterface;

/// Options shared by the broadcast commands.
#[derive(Debug, Args)]
pub struct SourceOptions {
    /// Report on behalf of another device.
    #[arg(long = "as", value_name = "DEVICE")]
    pub source: Option<String>,
    /// Unix timestamp in milliseconds. Omit to let the backend stamp the record.
    #[arg(long, value_name = "MILLIS")]
    pub timestamp: Option<i64>,
}

#[derive(Debug, Args)]
pub struct LogArgs {
    pub message: String,
    /// 0 is the most severe, 9 the least.
    #[arg(long, short = 's', value_parser = clap::value_parser!(u8).range(0..=9))]
    pub severity: Option<u8>,
    #[command(flatten)]
    pub source: SourceOptions,
}

#[derive(Debug, Args)]
pub struct AlarmArgs {
    pub message: String,
    /// Negative or zero raises a critical alarm; positive a normal one.
    #[arg(long, short = 'l', default_value_t = 0, allow_negative_numbers = true)]
    pub level: i32,
    #[command(flatten)]
    pub source: SourceOptions,
}

#[derive(Debug, Args)]
pub struct MonitorArgs {
    /// JSON document to publish.
    pub json: String,
    #[command(flatten)]
    pub source: SourceOptions,
}

pub fn log(interface: &DaqInterface, args: LogArgs) -> Result<()> {
    interface.send_log(
        &args.message,
        args.severity,
        args.source.source.as_deref(),
        args.source.timestamp,
    )?;
    Ok(())
}

pub fn alarm(interface: &DaqInterface, args: AlarmArgs) -> Result<()> {
    interface.send_alarm(
        &args.message,
        args.level,
        args.source.source.as_deref(),
        args.source.timestamp,
        None,
    )?;
    Ok(())
}

pub fn monitor(interface: &DaqInterface, args: MonitorArgs) -> Result<()> {
    if let Err(err) = serde_json::from_str::<serde_json::Value>(&args.json) {
        bail!("monitoring sample is not valid JSON: {err}");
    }
    interface.send_monitoring_data(
        &args.json,
        args.source.source.as_deref(),
        args.source.timestamp,
    )?;
    Ok(())
}
