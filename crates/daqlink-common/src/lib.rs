//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the interface runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Shared primitives for the DAQ-Link workspace.
//! This crate exposes configuration loading, logging and clock helpers
//! consumed by the messaging and interface crates.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{
    BackendConfig, DiscoveryConfig, InterfaceConfig, InterfaceSettings, LoadedInterfaceConfig,
    LoggingConfig,
};
pub use logging::{init_tracing, LogFormat};
