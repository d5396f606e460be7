use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use parking_lot::Mutex;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::Device;
use super::DeviceBackend;
use super::DeviceInfo;
use super::DeviceSnapshot;
use super::Health;
use crate::error::PluginError;

/// Receiving half of a [`DeviceHealthTracker::watch`] subscription.
pub type SnapshotReceiver = mpsc::UnboundedReceiver<Arc<DeviceSnapshot>>;

struct Subscribers {
    senders: Vec<mpsc::UnboundedSender<Arc<DeviceSnapshot>>>,
    /// Devices kept in the snapshot as unhealthy after they stopped being enumerated.
    vanished: HashSet<String>,
}

/// Tracks health of every device of one resource kind.
///
/// The current snapshot is replaced wholesale on each change. Subscribers get
/// the snapshot current at subscription time followed by every later one, in
/// publication order.
pub struct DeviceHealthTracker {
    resource_name: String,
    backend: Arc<dyn DeviceBackend>,
    poll_interval: Duration,
    current: RwLock<Arc<DeviceSnapshot>>,
    subscribers: Mutex<Subscribers>,
}

impl DeviceHealthTracker {
    pub fn new(
        resource_name: impl Into<String>,
        backend: Arc<dyn DeviceBackend>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            resource_name: resource_name.into(),
            backend,
            poll_interval,
            current: RwLock::new(Arc::new(DeviceSnapshot::default())),
            subscribers: Mutex::new(Subscribers {
                senders: Vec::new(),
                vanished: HashSet::new(),
            }),
        }
    }

    pub fn backend(&self) -> &Arc<dyn DeviceBackend> {
        &self.backend
    }

    /// Returns the latest published snapshot without touching hardware.
    pub fn snapshot(&self) -> Arc<DeviceSnapshot> {
        self.current.read().clone()
    }

    /// Subscribes to snapshot updates, starting with the current snapshot.
    ///
    /// Dropping the receiver ends the subscription; the sender is pruned on the
    /// next publication.
    pub fn watch(&self) -> SnapshotReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.subscribers.lock();
        // Holding the subscriber lock keeps publication from slipping in between.
        let _ = tx.send(self.snapshot());
        subscribers.senders.push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.senders.retain(|tx| !tx.is_closed());
        subscribers.senders.len()
    }

    /// Runs one poll cycle. Returns `true` when a new snapshot was published.
    pub fn refresh(&self) -> bool {
        let probed = self.probe();

        let mut subscribers = self.subscribers.lock();
        let previous = self.snapshot();
        let devices = Self::merge_vanished(&previous, probed, &mut subscribers.vanished);

        if previous.same_devices(&devices) {
            debug!(resource = %self.resource_name, "device state unchanged");
            return false;
        }

        let snapshot = Arc::new(DeviceSnapshot {
            generation: previous.generation + 1,
            devices,
        });
        info!(
            resource = %self.resource_name,
            generation = snapshot.generation,
            healthy = snapshot.devices.iter().filter(|d| d.is_healthy()).count(),
            total = snapshot.devices.len(),
            "publishing device snapshot"
        );

        *self.current.write() = snapshot.clone();
        subscribers
            .senders
            .retain(|tx| tx.send(snapshot.clone()).is_ok());
        true
    }

    /// Runs [`refresh`](Self::refresh) on the blocking pool, the backend may
    /// block on hardware I/O.
    pub async fn refresh_blocking(self: &Arc<Self>) -> bool {
        let tracker = self.clone();
        match tokio::task::spawn_blocking(move || tracker.refresh()).await {
            Ok(published) => published,
            Err(e) => {
                warn!(resource = %self.resource_name, "device poll task failed: {e}");
                false
            }
        }
    }

    /// Polls the backend until cancelled.
    #[tracing::instrument(skip(self, cancellation_token), fields(resource = %self.resource_name))]
    pub async fn run(self: Arc<Self>, cancellation_token: CancellationToken) {
        info!("starting device health tracker");
        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => {
                    info!("device health tracker shutdown requested");
                    break;
                }
                _ = ticker.tick() => {
                    self.refresh_blocking().await;
                }
            }
        }
    }

    /// Reads the backend. Enumeration failure yields an empty list and read
    /// failures yield unhealthy devices.
    fn probe(&self) -> Vec<Device> {
        let infos = match self.enumerate() {
            Ok(infos) => infos,
            Err(e) => {
                warn!(resource = %self.resource_name, "treating as no devices: {e:?}");
                Vec::new()
            }
        };

        infos
            .into_iter()
            .map(|info| {
                let health = match self.backend.check_health(&info) {
                    Ok(health) => health,
                    Err(e) => {
                        warn!(
                            resource = %self.resource_name,
                            device = %info.id,
                            "health check failed, marking unhealthy: {e:?}"
                        );
                        Health::Unhealthy
                    }
                };
                Device { info, health }
            })
            .collect()
    }

    fn enumerate(&self) -> Result<Vec<DeviceInfo>, Report<PluginError>> {
        self.backend
            .enumerate()
            .change_context_lazy(|| PluginError::EnumerationFailure {
                message: format!("backend of {} returned no device list", self.resource_name),
            })
    }

    /// A device missing from enumeration stays one cycle as unhealthy before removal.
    fn merge_vanished(
        previous: &DeviceSnapshot,
        mut devices: Vec<Device>,
        vanished: &mut HashSet<String>,
    ) -> Vec<Device> {
        let present: HashSet<String> = devices.iter().map(|d| d.id().to_string()).collect();
        vanished.retain(|id| !present.contains(id));

        for old in &previous.devices {
            if present.contains(old.id()) {
                continue;
            }
            if vanished.remove(old.id()) {
                info!(device = %old.id(), "removing vanished device");
                continue;
            }
            warn!(device = %old.id(), "device disappeared, marking unhealthy");
            vanished.insert(old.id().to_string());
            devices.push(Device {
                info: old.info.clone(),
                health: Health::Unhealthy,
            });
        }

        devices.sort_by(|a, b| a.id().cmp(b.id()));
        devices
    }
}
