//! Device model and health tracking.
//!
//! - [`DeviceBackend`]: the seam to hardware-specific enumeration
//! - [`DeviceHealthTracker`]: polls a backend and publishes [`DeviceSnapshot`]s
//! - [`InventoryBackend`]: a backend driven by a static YAML inventory

pub mod backend;
pub mod health;
pub mod inventory;

use std::collections::BTreeMap;
use std::fmt;

pub use backend::DeviceBackend;
pub use health::DeviceHealthTracker;
pub use health::SnapshotReceiver;
pub use inventory::InventoryBackend;

/// Health of a single device as reported to kubelet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Health {
    Healthy,
    Unhealthy,
}

impl Health {
    /// The string kubelet expects on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            Health::Healthy => "Healthy",
            Health::Unhealthy => "Unhealthy",
        }
    }
}

impl fmt::Display for Health {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Topology hints, passed through to kubelet untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Topology {
    pub numa_node: Option<i64>,
    pub pci_address: Option<String>,
}

/// Identity of a physical device as produced by enumeration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceInfo {
    pub id: String,
    pub topology: Topology,
}

impl DeviceInfo {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            topology: Topology::default(),
        }
    }

    pub fn with_numa_node(mut self, numa_node: i64) -> Self {
        self.topology.numa_node = Some(numa_node);
        self
    }
}

/// A device together with its last observed health.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    pub info: DeviceInfo,
    pub health: Health,
}

impl Device {
    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn is_healthy(&self) -> bool {
        self.health == Health::Healthy
    }
}

/// The complete device list at one point in time.
///
/// Snapshots are immutable once published; readers hold an `Arc` to one and
/// never observe a partially applied update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSnapshot {
    /// Monotonic publication counter, starts at 0 for the empty initial snapshot.
    pub generation: u64,
    pub devices: Vec<Device>,
}

impl DeviceSnapshot {
    pub fn get(&self, id: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.id() == id)
    }

    /// Compares device content, ignoring the generation counter.
    pub fn same_devices(&self, devices: &[Device]) -> bool {
        self.devices == devices
    }
}

/// A host device node to expose inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceNode {
    pub host_path: String,
    pub container_path: String,
    /// cgroup permissions, any of `r`, `w`, `m`.
    pub permissions: String,
}

/// A host path to bind-mount into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub host_path: String,
    pub container_path: String,
    pub read_only: bool,
}

/// Hardware-specific facts a container needs to use one device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceBindings {
    pub device_nodes: Vec<DeviceNode>,
    pub mounts: Vec<Mount>,
    pub envs: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}
