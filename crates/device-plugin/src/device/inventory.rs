//! Static device inventory loaded from YAML.
//!
//! Lets the plugin advertise hardware without vendor-specific discovery code:
//! every device lists its device nodes, and a device is healthy while all of
//! them exist on the host.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::io;
use std::path::Path;

use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
use tracing::debug;

use super::DeviceBackend;
use super::DeviceBindings;
use super::DeviceInfo;
use super::DeviceNode;
use super::Health;
use super::Mount;
use super::Topology;
use crate::config::KUBELET_SOCKET_NAME;
use crate::error::BackendError;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Inventory {
    pub resources: Vec<InventoryResource>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryResource {
    /// Schedulable resource name, e.g. `vendor.com/accelerator`.
    pub name: String,
    #[serde(default)]
    pub socket_name: Option<String>,
    /// Env var receiving the comma-joined allocated device IDs.
    #[serde(default)]
    pub visible_devices_env: Option<String>,
    #[serde(default)]
    pub envs: BTreeMap<String, String>,
    #[serde(default)]
    pub mounts: Vec<MountSpec>,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
    #[serde(default)]
    pub devices: Vec<InventoryDevice>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventoryDevice {
    pub id: String,
    #[serde(default)]
    pub numa_node: Option<i64>,
    #[serde(default)]
    pub pci_address: Option<String>,
    #[serde(default)]
    pub device_nodes: Vec<DeviceNodeSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceNodeSpec {
    pub host_path: String,
    /// Defaults to `host_path`.
    #[serde(default)]
    pub container_path: Option<String>,
    #[serde(default = "default_permissions")]
    pub permissions: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountSpec {
    pub host_path: String,
    pub container_path: String,
    #[serde(default)]
    pub read_only: bool,
}

fn default_permissions() -> String {
    "rw".to_string()
}

impl Inventory {
    pub fn load(path: &Path) -> Result<Self, Report<BackendError>> {
        let content = std::fs::read_to_string(path).change_context(BackendError::Inventory {
            message: format!("failed to read inventory file: {}", path.display()),
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, Report<BackendError>> {
        let inventory: Inventory =
            serde_yaml::from_str(content).change_context(BackendError::Inventory {
                message: "failed to parse inventory YAML".to_string(),
            })?;
        inventory.validate()?;
        Ok(inventory)
    }

    fn validate(&self) -> Result<(), Report<BackendError>> {
        let mut names = HashSet::new();
        let mut sockets = HashSet::new();
        for resource in &self.resources {
            if !resource.name.contains('/') {
                return Err(Report::new(BackendError::Inventory {
                    message: format!(
                        "resource name {} must be of the form <domain>/<name>",
                        resource.name
                    ),
                }));
            }
            if !names.insert(resource.name.as_str()) {
                return Err(Report::new(BackendError::Inventory {
                    message: format!("duplicate resource {}", resource.name),
                }));
            }

            let socket_name = resource.socket_name();
            validate_socket_name(&socket_name).attach_printable_lazy(|| {
                format!("socket of resource {}", resource.name)
            })?;
            if !sockets.insert(socket_name.clone()) {
                return Err(Report::new(BackendError::Inventory {
                    message: format!(
                        "socket {socket_name} of {} is already used by another resource",
                        resource.name
                    ),
                }));
            }

            let mut ids = HashSet::new();
            for device in &resource.devices {
                if device.id.is_empty() || !ids.insert(device.id.as_str()) {
                    return Err(Report::new(BackendError::Inventory {
                        message: format!(
                            "device ids of {} must be unique and non-empty, offending id: {:?}",
                            resource.name, device.id
                        ),
                    }));
                }
            }
        }
        Ok(())
    }
}

impl InventoryResource {
    /// Socket file name inside the plugin directory.
    pub fn socket_name(&self) -> String {
        self.socket_name
            .clone()
            .unwrap_or_else(|| default_socket_name(&self.name))
    }
}

/// A socket name must be a plain file name inside the plugin directory that
/// does not shadow kubelet's own socket.
fn validate_socket_name(socket_name: &str) -> Result<(), Report<BackendError>> {
    let invalid = |reason: &str| -> Result<(), Report<BackendError>> {
        Err(Report::new(BackendError::Inventory {
            message: format!("invalid socket name {socket_name:?}: {reason}"),
        }))
    };

    if socket_name.is_empty() || socket_name == "." || socket_name == ".." {
        return invalid("not a file name");
    }
    if socket_name.contains(['/', '\\', '\0']) {
        return invalid("must not contain path separators");
    }
    if socket_name == KUBELET_SOCKET_NAME {
        return invalid("reserved for kubelet");
    }
    Ok(())
}

/// `vendor.com/accelerator` becomes `vendor-com-accelerator.sock`.
pub fn default_socket_name(resource_name: &str) -> String {
    format!("{}.sock", resource_name.replace(['/', '.'], "-"))
}

/// Backend serving one [`InventoryResource`].
#[derive(Debug)]
pub struct InventoryBackend {
    resource: InventoryResource,
}

impl InventoryBackend {
    pub fn new(resource: InventoryResource) -> Self {
        Self { resource }
    }

    fn device(&self, id: &str) -> Result<&InventoryDevice, Report<BackendError>> {
        self.resource
            .devices
            .iter()
            .find(|d| d.id == id)
            .ok_or_else(|| {
                Report::new(BackendError::DeviceRead {
                    id: id.to_string(),
                    message: "device is not in the inventory".to_string(),
                })
            })
    }
}

impl DeviceBackend for InventoryBackend {
    fn enumerate(&self) -> Result<Vec<DeviceInfo>, Report<BackendError>> {
        Ok(self
            .resource
            .devices
            .iter()
            .map(|d| DeviceInfo {
                id: d.id.clone(),
                topology: Topology {
                    numa_node: d.numa_node,
                    pci_address: d.pci_address.clone(),
                },
            })
            .collect())
    }

    fn check_health(&self, device: &DeviceInfo) -> Result<Health, Report<BackendError>> {
        let spec = self.device(&device.id)?;
        for node in &spec.device_nodes {
            match std::fs::metadata(&node.host_path) {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    debug!(device = %device.id, path = %node.host_path, "device node missing");
                    return Ok(Health::Unhealthy);
                }
                Err(e) => {
                    return Err(Report::new(e).change_context(BackendError::DeviceRead {
                        id: device.id.clone(),
                        message: format!("failed to stat {}", node.host_path),
                    }));
                }
            }
        }
        Ok(Health::Healthy)
    }

    fn bindings(&self, device: &DeviceInfo) -> Result<DeviceBindings, Report<BackendError>> {
        let spec = self.device(&device.id)?;
        Ok(DeviceBindings {
            device_nodes: spec
                .device_nodes
                .iter()
                .map(|n| DeviceNode {
                    host_path: n.host_path.clone(),
                    container_path: n
                        .container_path
                        .clone()
                        .unwrap_or_else(|| n.host_path.clone()),
                    permissions: n.permissions.clone(),
                })
                .collect(),
            mounts: self
                .resource
                .mounts
                .iter()
                .map(|m| Mount {
                    host_path: m.host_path.clone(),
                    container_path: m.container_path.clone(),
                    read_only: m.read_only,
                })
                .collect(),
            envs: self.resource.envs.clone(),
            annotations: self.resource.annotations.clone(),
        })
    }
}
