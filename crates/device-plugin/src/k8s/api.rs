//! Generated kubelet `v1beta1` types and conversions from the domain model.
#![allow(clippy::doc_markdown)]

mod generated {
    #![allow(clippy::doc_overindented_list_items)]
    tonic::include_proto!("v1beta1");
}

pub use generated::*;

use crate::device;
use crate::resource::AllocationDirective;

impl From<&device::Device> for Device {
    fn from(device: &device::Device) -> Self {
        Self {
            id: device.id().to_string(),
            health: device.health.as_str().to_string(),
            topology: device.info.topology.numa_node.map(|id| TopologyInfo {
                nodes: vec![NumaNode { id }],
            }),
        }
    }
}

impl From<&device::DeviceSnapshot> for ListAndWatchResponse {
    fn from(snapshot: &device::DeviceSnapshot) -> Self {
        Self {
            devices: snapshot.devices.iter().map(Device::from).collect(),
        }
    }
}

impl From<AllocationDirective> for ContainerAllocateResponse {
    fn from(directive: AllocationDirective) -> Self {
        Self {
            envs: directive.envs.into_iter().collect(),
            mounts: directive
                .mounts
                .into_iter()
                .map(|m| Mount {
                    container_path: m.container_path,
                    host_path: m.host_path,
                    read_only: m.read_only,
                })
                .collect(),
            devices: directive
                .devices
                .into_iter()
                .map(|d| DeviceSpec {
                    container_path: d.container_path,
                    host_path: d.host_path,
                    permissions: d.permissions,
                })
                .collect(),
            annotations: directive.annotations.into_iter().collect(),
            cdi_devices: Vec::new(),
        }
    }
}
