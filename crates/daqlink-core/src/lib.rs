//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Device interface lifecycle, resources, telemetry and slow control."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Device-side interface to the DAQ-Link slow-control network.
//!
//! [`DaqInterface`] ties a transport backend, peer discovery and the
//! slow-control registry together and exposes the versioned resource and
//! telemetry operations a device process needs.

pub mod discovery;
pub mod interface;
pub mod resources;
pub mod slow_control;
pub mod telemetry;

pub use discovery::{Beacon, MulticastDiscovery, PeerDiscovery, PeerRecord, ReadinessLatch};
pub use interface::{DaqInterface, LifecycleState};
pub use resources::{PlotArtifact, ResourceKind};
pub use slow_control::{
    AlertHandler, ChangeHandler, ElementKind, FromScValue, RemoteHandle, ScValue,
    SlowControlCollection, SlowControlElement, STATUS,
};
pub use telemetry::{ALARM_MIRROR_SEVERITY, DEFAULT_SEVERITY};

pub use daqlink_msg::{DaqError, ErrorCategory, PlotRecord, Result, Version, LATEST_VERSION};
