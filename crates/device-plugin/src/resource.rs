//! The seam between hardware discovery and the kubelet wire protocol.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use error_stack::Report;
use tracing::info;
use tracing::warn;

use crate::device::Device;
use crate::device::DeviceHealthTracker;
use crate::device::DeviceNode;
use crate::device::Mount;
use crate::device::SnapshotReceiver;
use crate::error::PluginError;

/// Name and socket of one resource kind, fixed for the plugin's lifetime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub resource_name: String,
    pub socket_path: PathBuf,
}

/// Device IDs requested together for one container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRequest {
    pub device_ids: Vec<String>,
}

impl AllocationRequest {
    pub fn new<I, S>(device_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            device_ids: device_ids.into_iter().map(Into::into).collect(),
        }
    }
}

/// Runtime bindings for one container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AllocationDirective {
    pub envs: BTreeMap<String, String>,
    pub devices: Vec<DeviceNode>,
    pub mounts: Vec<Mount>,
    pub annotations: BTreeMap<String, String>,
}

/// A resource kind as seen by the plugin server.
pub trait Resource: Send + Sync + 'static {
    fn resource_name(&self) -> &str;

    fn socket_path(&self) -> &Path;

    /// Devices of the latest snapshot. Never blocks on hardware I/O.
    fn list_devices(&self) -> Vec<Device>;

    /// Produces one directive per request, or fails as a whole.
    fn allocate(
        &self,
        requests: &[AllocationRequest],
    ) -> Result<Vec<AllocationDirective>, Report<PluginError>>;

    /// Snapshot stream backing `ListAndWatch`.
    fn watch(&self) -> SnapshotReceiver;

    /// Picks `size` devices out of `available`, always including `must_include`.
    fn preferred_allocation(
        &self,
        available: &[String],
        must_include: &[String],
        size: usize,
    ) -> Vec<String> {
        let mut chosen: Vec<String> = Vec::with_capacity(size);
        for id in must_include.iter().chain(available) {
            if chosen.len() >= size {
                break;
            }
            if !chosen.contains(id) {
                chosen.push(id.clone());
            }
        }
        chosen
    }
}

/// [`Resource`] backed by a [`DeviceHealthTracker`].
pub struct ResourcePlugin {
    descriptor: ResourceDescriptor,
    tracker: Arc<DeviceHealthTracker>,
    visible_devices_env: Option<String>,
}

impl ResourcePlugin {
    pub fn new(
        descriptor: ResourceDescriptor,
        tracker: Arc<DeviceHealthTracker>,
        visible_devices_env: Option<String>,
    ) -> Self {
        Self {
            descriptor,
            tracker,
            visible_devices_env,
        }
    }
}

impl Resource for ResourcePlugin {
    fn resource_name(&self) -> &str {
        &self.descriptor.resource_name
    }

    fn socket_path(&self) -> &Path {
        &self.descriptor.socket_path
    }

    fn list_devices(&self) -> Vec<Device> {
        self.tracker.snapshot().devices.clone()
    }

    fn allocate(
        &self,
        requests: &[AllocationRequest],
    ) -> Result<Vec<AllocationDirective>, Report<PluginError>> {
        if let Some(position) = requests.iter().position(|r| r.device_ids.is_empty()) {
            return Err(Report::new(PluginError::InvalidRequest {
                message: format!("container request {position} names no devices"),
            }));
        }

        // Validate against the snapshot current at call time, not the last push.
        let snapshot = self.tracker.snapshot();
        let mut unavailable: Vec<String> = Vec::new();
        for id in requests.iter().flat_map(|r| &r.device_ids) {
            let healthy = snapshot.get(id).is_some_and(Device::is_healthy);
            if !healthy && !unavailable.contains(id) {
                unavailable.push(id.clone());
            }
        }
        if !unavailable.is_empty() {
            warn!(
                resource = %self.descriptor.resource_name,
                "rejecting allocation of unavailable devices: {unavailable:?}"
            );
            return Err(Report::new(PluginError::DeviceUnavailable { ids: unavailable }));
        }

        let backend = self.tracker.backend();
        let mut failed: Vec<String> = Vec::new();
        let mut causes: Vec<String> = Vec::new();
        let mut directives = Vec::with_capacity(requests.len());

        for request in requests {
            let mut directive = AllocationDirective::default();
            for id in &request.device_ids {
                let Some(device) = snapshot.get(id) else {
                    continue;
                };
                match backend.bindings(&device.info) {
                    Ok(bindings) => {
                        for node in bindings.device_nodes {
                            if !directive
                                .devices
                                .iter()
                                .any(|d| d.container_path == node.container_path)
                            {
                                directive.devices.push(node);
                            }
                        }
                        for mount in bindings.mounts {
                            if !directive
                                .mounts
                                .iter()
                                .any(|m| m.container_path == mount.container_path)
                            {
                                directive.mounts.push(mount);
                            }
                        }
                        directive.envs.extend(bindings.envs);
                        directive.annotations.extend(bindings.annotations);
                    }
                    Err(e) => {
                        if !failed.contains(id) {
                            failed.push(id.clone());
                        }
                        causes.push(format!("{e:?}"));
                    }
                }
            }
            if let Some(env) = &self.visible_devices_env {
                directive
                    .envs
                    .insert(env.clone(), request.device_ids.join(","));
            }
            directives.push(directive);
        }

        if !failed.is_empty() {
            let mut report = Report::new(PluginError::BindingLookupFailed { ids: failed });
            for cause in causes {
                report = report.attach_printable(cause);
            }
            return Err(report);
        }

        info!(
            resource = %self.descriptor.resource_name,
            containers = directives.len(),
            "allocated devices: {:?}",
            requests.iter().map(|r| &r.device_ids).collect::<Vec<_>>()
        );
        Ok(directives)
    }

    fn watch(&self) -> SnapshotReceiver {
        self.tracker.watch()
    }

    /// Prefers healthy devices sharing a NUMA node with those already chosen.
    fn preferred_allocation(
        &self,
        available: &[String],
        must_include: &[String],
        size: usize,
    ) -> Vec<String> {
        let snapshot = self.tracker.snapshot();
        let numa_of = |id: &str| snapshot.get(id).and_then(|d| d.info.topology.numa_node);

        let mut chosen: Vec<String> = Vec::with_capacity(size);
        for id in must_include {
            if chosen.len() < size && !chosen.contains(id) {
                chosen.push(id.clone());
            }
        }

        let mut candidates: Vec<&String> = available
            .iter()
            .filter(|id| !chosen.contains(*id))
            .filter(|id| snapshot.get(id).is_some_and(Device::is_healthy))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        let mut preferred_nodes: HashSet<i64> = chosen
            .iter()
            .filter_map(|id| numa_of(id.as_str()))
            .collect();
        if preferred_nodes.is_empty() {
            // Start on the node offering the most candidates, lowest node first on ties.
            let mut per_node: HashMap<i64, usize> = HashMap::new();
            for id in &candidates {
                if let Some(node) = numa_of(id.as_str()) {
                    *per_node.entry(node).or_default() += 1;
                }
            }
            if let Some((node, _)) = per_node
                .into_iter()
                .max_by(|(na, ca), (nb, cb)| ca.cmp(cb).then(nb.cmp(na)))
            {
                preferred_nodes.insert(node);
            }
        }

        candidates.sort_by_key(|id| {
            let node = numa_of(id.as_str());
            let on_preferred = node.is_some_and(|n| preferred_nodes.contains(&n));
            (!on_preferred, node, (*id).clone())
        });

        for id in candidates {
            if chosen.len() >= size {
                break;
            }
            chosen.push(id.clone());
        }
        chosen
    }
}
