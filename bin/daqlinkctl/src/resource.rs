//! ---
//! ems_section: "05-networking-external-interfaces"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Command-line device for the DAQ-Link slow-control network."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use daqlink_core::{DaqInterface, Version, LATEST_VERSION};

/// Configuration actions.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Print a stored configuration.
    Get(ReadOptions),
    /// Store a new configuration version.
    Set(ConfigWriteOptions),
}

/// Calibration actions.
#[derive(Debug, Subcommand)]
pub enum CalibrationCommand {
    /// Print stored calibration data.
    Get(ReadOptions),
    /// Store a new calibration version.
    Set(CalibrationWriteOptions),
}

#[derive(Debug, Args)]
pub struct ReadOptions {
    /// Version to fetch. Defaults to the newest.
    #[arg(long, default_value_t = LATEST_VERSION, allow_negative_numbers = true)]
    pub version: Version,
    /// Owning device when it differs from this one.
    #[arg(long = "for", value_name = "DEVICE")]
    pub owner: Option<String>,
}

#[derive(Debug, Args)]
pub struct ConfigWriteOptions {
    /// File holding the document, or `-` for stdin.
    pub file: PathBuf,
    #[arg(long, default_value = "")]
    pub author: String,
    #[arg(long, default_value = "")]
    pub description: String,
    #[arg(long = "for", value_name = "DEVICE")]
    pub owner: Option<String>,
}

#[derive(Debug, Args)]
pub struct CalibrationWriteOptions {
    /// File holding the calibration, or `-` for stdin.
    pub file: PathBuf,
    #[arg(long, default_value = "")]
    pub description: String,
    #[arg(long = "for", value_name = "DEVICE")]
    pub owner: Option<String>,
}

pub fn run_config(interface: &DaqInterface, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Get(opts) => {
            let data = interface.get_config(opts.version, opts.owner.as_deref(), None)?;
            println!("{data}");
        }
        ConfigCommand::Set(opts) => {
            let data = read_document(&opts.file)?;
            let version = interface.send_config(
                &data,
                &opts.author,
                &opts.description,
                opts.owner.as_deref(),
                None,
                None,
            )?;
            println!("stored configuration version {version}");
        }
    }
    Ok(())
}

pub fn run_calibration(interface: &DaqInterface, command: CalibrationCommand) -> Result<()> {
    match command {
        CalibrationCommand::Get(opts) => {
            let data = interface.get_calibration(opts.version, opts.owner.as_deref(), None)?;
            println!("{data}");
        }
        CalibrationCommand::Set(opts) => {
            let data = read_document(&opts.file)?;
            let version = interface.send_calibration(
                &data,
                &opts.description,
                opts.owner.as_deref(),
                None,
                None,
            )?;
            println!("stored calibration version {version}");
        }
    }
    Ok(())
}

fn read_document(path: &Path) -> Result<String> {
    if path.as_os_str() == "-" {
        let mut buffer = String::new();
        std::io::stdin()
            .read_to_string(&mut buffer)
            .context("failed to read document from stdin")?;
        return Ok(buffer);
    }
    std::fs::read_to_string(path).with_context(|| format!("unable to read {}", path.display()))
}
