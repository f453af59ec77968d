//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the interface runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

const SLOW_CONTROL_GROUP: Ipv4Addr = Ipv4Addr::new(239, 192, 1, 1);

fn default_database() -> String {
    "daq".to_owned()
}

fn default_command_timeout() -> Duration {
    Duration::from_millis(300)
}

fn default_readiness_timeout() -> Duration {
    Duration::from_secs(15)
}

fn default_sync_endpoint() -> SocketAddr {
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 5555))
}

fn default_multicast_group() -> Ipv4Addr {
    SLOW_CONTROL_GROUP
}

fn default_telemetry_port() -> u16 {
    5554
}

fn default_discovery_port() -> u16 {
    5000
}

fn default_service_port() -> u16 {
    38888
}

fn default_multicast_ttl() -> u32 {
    1
}

fn default_connect_timeout() -> Duration {
    Duration::from_millis(1000)
}

fn default_announce_interval() -> Duration {
    Duration::from_millis(5000)
}

fn default_peer_ttl() -> u32 {
    5
}

fn default_peer_cache() -> Duration {
    Duration::from_secs(60)
}

fn default_true() -> bool {
    true
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

/// Top-level configuration consumed by the device interface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InterfaceConfig {
    #[serde(default)]
    pub interface: InterfaceSettings,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Metadata describing where an [`InterfaceConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedInterfaceConfig {
    pub config: InterfaceConfig,
    pub source: PathBuf,
}

impl InterfaceConfig {
    pub const ENV_CONFIG_PATH: &str = "DAQLINK_CONFIG";

    /// Load configuration from disk, respecting the `DAQLINK_CONFIG` override.
    pub fn load<P: AsRef<Path>>(candidates: &[P]) -> Result<Self> {
        Ok(Self::load_with_source(candidates)?.config)
    }

    /// Load configuration from disk together with the effective source path.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedInterfaceConfig> {
        Self::find(candidates)?.ok_or_else(|| {
            anyhow!(
                "no configuration files found. inspected: {}",
                candidates
                    .iter()
                    .map(|p| p.as_ref().display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        })
    }

    /// Like [`load_with_source`](Self::load_with_source), but `Ok(None)` when
    /// `DAQLINK_CONFIG` is unset and no candidate exists. A file that exists
    /// but fails to parse or validate is still an error.
    pub fn find<P: AsRef<Path>>(candidates: &[P]) -> Result<Option<LoadedInterfaceConfig>> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(Some(LoadedInterfaceConfig {
                    config,
                    source: path,
                }));
            }
        }

        for candidate in candidates {
            if candidate.as_ref().exists() {
                let path = candidate.as_ref().to_path_buf();
                let config = Self::from_path(&path)?;
                return Ok(Some(LoadedInterfaceConfig {
                    config,
                    source: path,
                }));
            }
        }
        Ok(None)
    }

    /// Read and validate a single configuration file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        let config = toml::from_str::<InterfaceConfig>(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.interface.validate()?;
        self.backend.validate()?;
        self.discovery.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for InterfaceConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: InterfaceConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Identity and timing defaults applied to every command.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceSettings {
    /// Device identity; the name passed to `init` wins when both are set.
    #[serde(default)]
    pub device_name: Option<String>,
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(default = "default_command_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub command_timeout: Duration,
    #[serde(default = "default_readiness_timeout")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub readiness_timeout: Duration,
}

impl Default for InterfaceSettings {
    fn default() -> Self {
        Self {
            device_name: None,
            database: default_database(),
            command_timeout: default_command_timeout(),
            readiness_timeout: default_readiness_timeout(),
        }
    }
}

impl InterfaceSettings {
    pub fn validate(&self) -> Result<()> {
        if let Some(name) = &self.device_name {
            if name.trim().is_empty() {
                return Err(anyhow!("interface.device_name must not be blank"));
            }
        }
        if self.database.trim().is_empty() {
            return Err(anyhow!("interface.database must not be blank"));
        }
        if self.command_timeout.is_zero() {
            return Err(anyhow!("interface.command_timeout must be non-zero"));
        }
        Ok(())
    }
}

/// Endpoints used by the network transport backend.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Request/response endpoint of the database middleman.
    #[serde(default = "default_sync_endpoint")]
    pub sync_endpoint: SocketAddr,
    /// Multicast group receiving logs, monitoring and temporary plots.
    #[serde(default = "default_multicast_group")]
    pub multicast_group: Ipv4Addr,
    #[serde(default = "default_telemetry_port")]
    pub multicast_port: u16,
    #[serde(default = "default_multicast_ttl")]
    pub multicast_ttl: u32,
    #[serde(default = "default_connect_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub connect_timeout: Duration,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            sync_endpoint: default_sync_endpoint(),
            multicast_group: default_multicast_group(),
            multicast_port: default_telemetry_port(),
            multicast_ttl: default_multicast_ttl(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl BackendConfig {
    /// Read a standalone backend section from a TOML file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read backend config {}", path.display()))?;
        let config = toml::from_str::<BackendConfig>(&contents)
            .with_context(|| format!("failed to parse backend config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn multicast_target(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.multicast_group, self.multicast_port))
    }

    pub fn validate(&self) -> Result<()> {
        if !self.multicast_group.is_multicast() {
            return Err(anyhow!(
                "backend.multicast_group {} is not a multicast address",
                self.multicast_group
            ));
        }
        if self.multicast_port == 0 {
            return Err(anyhow!("backend.multicast_port must be non-zero"));
        }
        if self.connect_timeout.is_zero() {
            return Err(anyhow!("backend.connect_timeout must be non-zero"));
        }
        Ok(())
    }
}

/// Peer discovery beacon settings.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default = "default_true")]
    pub announce: bool,
    #[serde(default)]
    pub listen: bool,
    /// Port advertised for the slow-control receiver of this device.
    #[serde(default = "default_service_port")]
    pub service_port: u16,
    #[serde(default = "default_multicast_group")]
    pub multicast_group: Ipv4Addr,
    #[serde(default = "default_discovery_port")]
    pub multicast_port: u16,
    #[serde(default = "default_announce_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub interval: Duration,
    #[serde(default = "default_peer_ttl")]
    pub ttl: u32,
    #[serde(default = "default_peer_cache")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub cache: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            announce: true,
            listen: false,
            service_port: default_service_port(),
            multicast_group: default_multicast_group(),
            multicast_port: default_discovery_port(),
            interval: default_announce_interval(),
            ttl: default_peer_ttl(),
            cache: default_peer_cache(),
        }
    }
}

impl DiscoveryConfig {
    pub fn multicast_target(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.multicast_group, self.multicast_port))
    }

    pub fn validate(&self) -> Result<()> {
        if !self.multicast_group.is_multicast() {
            return Err(anyhow!(
                "discovery.multicast_group {} is not a multicast address",
                self.multicast_group
            ));
        }
        if self.interval.is_zero() {
            return Err(anyhow!("discovery.interval must be non-zero"));
        }
        if self.cache < self.interval {
            return Err(anyhow!(
                "discovery.cache ({:?}) must cover at least one announce interval ({:?})",
                self.cache,
                self.interval
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
    /// Disable the rolling file layer, e.g. for short-lived CLI invocations.
    #[serde(default = "default_true")]
    pub file_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
            file_enabled: true,
        }
    }
}
