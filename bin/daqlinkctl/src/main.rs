//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Command-line device for the DAQ-Link slow-control network."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use daqlink_common::config::InterfaceConfig;
use daqlink_common::logging::{init_tracing, LogFormat};
use daqlink_core::DaqInterface;
use daqlink_msg::{DispatchMetricsExporter, InMemoryBackend, NetBackend, TransportBackend};
use prometheus::{Encoder, Registry, TextEncoder};
use tracing::info;

mod query;
mod resource;
mod telemetry;

const DEFAULT_CONFIG_CANDIDATES: &[&str] = &["daqlink.toml", "/etc/daqlink/daqlink.toml"];

#[derive(Debug, Parser)]
#[command(author, version, about = "DAQ-Link device command-line client", long_about = None)]
struct Cli {
    /// Interface configuration file (TOML). Falls back to DAQLINK_CONFIG, then the default locations.
    #[arg(long, short = 'c', value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Device name announced and used as the default source.
    #[arg(long, value_name = "NAME", global = true)]
    device: Option<String>,

    /// Record commands in memory instead of touching the network.
    #[arg(long = "dry-run", action = ArgAction::SetTrue, global = true)]
    dry_run: bool,

    /// Log format for stdout.
    #[arg(long = "log-format", value_enum, global = true)]
    log_format: Option<LogFormatArg>,

    /// Print dispatcher metrics in prometheus text format on exit.
    #[arg(long, action = ArgAction::SetTrue, global = true)]
    metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Broadcast a log line")]
    Log(telemetry::LogArgs),
    #[command(about = "Raise an alarm and mirror it to the log")]
    Alarm(telemetry::AlarmArgs),
    #[command(about = "Broadcast a JSON monitoring sample")]
    Monitor(telemetry::MonitorArgs),
    #[command(subcommand, about = "Versioned device configuration")]
    Config(resource::ConfigCommand),
    #[command(subcommand, about = "Versioned calibration data")]
    Calibration(resource::CalibrationCommand),
    #[command(about = "Run a SQL query against the device database")]
    Query(query::QueryArgs),
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormatArg {
    Pretty,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(value: LogFormatArg) -> Self {
        match value {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Json => LogFormat::StructuredJson,
        }
    }
}

/// Defaults apply only when no file is configured anywhere; a broken file is an error.
fn load_config(path: Option<&Path>, candidates: &[&str]) -> Result<InterfaceConfig> {
    match path {
        Some(path) => InterfaceConfig::from_path(path),
        None => Ok(InterfaceConfig::find(candidates)?
            .map(|loaded| loaded.config)
            .unwrap_or_default()),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref(), DEFAULT_CONFIG_CANDIDATES)?;
    config.logging.file_enabled = false;
    if let Some(format) = cli.log_format {
        config.logging.format = format.into();
    }
    init_tracing("daqlinkctl", &config.logging)?;

    let device = cli
        .device
        .clone()
        .or_else(|| config.interface.device_name.clone())
        .unwrap_or_else(|| "daqlinkctl".to_owned());

    let recorder = InMemoryBackend::new();
    let backend: Box<dyn TransportBackend> = if cli.dry_run {
        Box::new(recorder.clone())
    } else {
        Box::new(NetBackend::new())
    };
    let registry = Registry::new();
    let mut interface = DaqInterface::from_config(&config, backend)?
        .with_metrics(DispatchMetricsExporter::register(&registry)?);
    if cli.dry_run {
        interface = interface.without_discovery();
    }
    let database = config.interface.database.clone();
    interface
        .init(&device, &config.backend, &database)
        .with_context(|| format!("failed to bring up interface for {device}"))?;
    info!(device = %device, dry_run = cli.dry_run, "interface up");

    let outcome = match cli.command {
        Commands::Log(args) => telemetry::log(&interface, args),
        Commands::Alarm(args) => telemetry::alarm(&interface, args),
        Commands::Monitor(args) => telemetry::monitor(&interface, args),
        Commands::Config(cmd) => resource::run_config(&interface, cmd),
        Commands::Calibration(cmd) => resource::run_calibration(&interface, cmd),
        Commands::Query(args) => query::run(&interface, args),
    };

    if cli.dry_run {
        for call in recorder.calls() {
            println!(
                "{}",
                serde_json::json!({
                    "kind": format!("{:?}", call.kind),
                    "topic": call.topic,
                    "payload": call.payload,
                })
            );
        }
    }
    if cli.metrics {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
        print!("{}", String::from_utf8_lossy(&buffer));
    }
    outcome
}
