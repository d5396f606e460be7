//! Process-wide lifecycle of every resource kind's plugin.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use backoff::backoff::Backoff;
use error_stack::Report;
use tokio::task::JoinHandle;
use tokio::task::JoinSet;
use tokio::time::interval;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;

use crate::config::PluginManagerConfig;
use crate::device::inventory::InventoryResource;
use crate::device::DeviceBackend;
use crate::device::DeviceHealthTracker;
use crate::device::InventoryBackend;
use crate::error::PluginError;
use crate::k8s::registration::RegistrationRecord;
use crate::k8s::server::ServerHandle;
use crate::k8s::PluginServer;
use crate::k8s::RegistrationClient;
use crate::k8s::RegistrationState;
use crate::resource::ResourceDescriptor;
use crate::resource::ResourcePlugin;

/// One advertised resource kind and the backend discovering its devices.
#[derive(Clone)]
pub struct ResourceKind {
    pub resource_name: String,
    /// Socket file name inside the plugin directory.
    pub socket_name: String,
    pub backend: Arc<dyn DeviceBackend>,
    pub visible_devices_env: Option<String>,
}

impl From<InventoryResource> for ResourceKind {
    fn from(resource: InventoryResource) -> Self {
        Self {
            resource_name: resource.name.clone(),
            socket_name: resource.socket_name(),
            visible_devices_env: resource.visible_devices_env.clone(),
            backend: Arc::new(InventoryBackend::new(resource)),
        }
    }
}

/// Starts one tracker, server and registration client per resource kind and
/// rebuilds all three from scratch whenever the server dies.
pub struct PluginManager {
    config: PluginManagerConfig,
    kinds: Vec<ResourceKind>,
}

impl PluginManager {
    pub fn new(config: PluginManagerConfig, kinds: Vec<ResourceKind>) -> Self {
        Self { config, kinds }
    }

    /// Runs until cancelled. Fails only when a resource kind exhausts its
    /// restart budget; the other kinds are stopped in that case.
    pub async fn run(
        &self,
        cancellation_token: CancellationToken,
    ) -> Result<(), Report<PluginError>> {
        info!(
            "starting plugin manager for {} resource kinds in {:?}",
            self.kinds.len(),
            self.config.plugin_dir
        );

        let mut supervisors = JoinSet::new();
        for kind in &self.kinds {
            let supervisor = Supervisor {
                config: self.config.clone(),
                kind: kind.clone(),
            };
            let token = cancellation_token.clone();
            supervisors.spawn(async move { supervisor.run(token).await });
        }

        let mut outcome = Ok(());
        while let Some(joined) = supervisors.join_next().await {
            let result = match joined {
                Ok(result) => result,
                Err(e) => Err(Report::new(PluginError::ServerTerminated {
                    resource_name: "unknown".to_string(),
                    message: format!("supervisor task failed: {e}"),
                })),
            };
            if let Err(e) = result {
                error!("resource supervisor gave up: {e:?}");
                cancellation_token.cancel();
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }

        info!("plugin manager stopped");
        outcome
    }
}

enum Exit {
    Shutdown,
    ServerStopped(String),
    SocketRemoved,
}

struct Supervisor {
    config: PluginManagerConfig,
    kind: ResourceKind,
}

impl Supervisor {
    fn socket_path(&self) -> PathBuf {
        self.config.plugin_dir.join(&self.kind.socket_name)
    }

    #[tracing::instrument(skip(self, cancellation_token), fields(resource = %self.kind.resource_name))]
    async fn run(&self, cancellation_token: CancellationToken) -> Result<(), Report<PluginError>> {
        let mut backoff = self.config.restart_backoff.build();
        let mut failures: u32 = 0;

        loop {
            let instance_token = cancellation_token.child_token();
            match self.launch(instance_token.clone()).await {
                Ok(mut instance) => {
                    let started = Instant::now();
                    let exit = instance.supervise(&self.socket_path(), &self.config).await;
                    instance_token.cancel();
                    instance.join().await;

                    match exit {
                        Exit::Shutdown => break,
                        Exit::ServerStopped(reason) => {
                            warn!("plugin server terminated unexpectedly: {reason}");
                        }
                        Exit::SocketRemoved => {
                            warn!("plugin socket {:?} was removed", self.socket_path());
                        }
                    }

                    if started.elapsed() >= self.config.stable_after {
                        failures = 0;
                        backoff.reset();
                    }
                    failures += 1;
                }
                Err(e) => {
                    instance_token.cancel();
                    failures += 1;
                    error!("failed to start plugin (attempt {failures}): {e:?}");
                    if failures > self.config.max_restarts {
                        return Err(e.attach_printable(format!(
                            "giving up after {failures} consecutive failed starts"
                        )));
                    }
                }
            }

            if failures > self.config.max_restarts {
                return Err(Report::new(PluginError::ServerTerminated {
                    resource_name: self.kind.resource_name.clone(),
                    message: format!("restarted {failures} times without becoming stable"),
                }));
            }

            let delay = backoff
                .next_backoff()
                .unwrap_or(self.config.restart_backoff.max_interval);
            info!("restarting plugin from scratch in {delay:?}");
            tokio::select! {
                _ = cancellation_token.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        info!("resource supervisor stopped");
        Ok(())
    }

    /// Builds a fresh tracker, plugin, server and registration client.
    async fn launch(&self, token: CancellationToken) -> Result<Instance, Report<PluginError>> {
        let tracker = Arc::new(DeviceHealthTracker::new(
            self.kind.resource_name.clone(),
            self.kind.backend.clone(),
            self.config.poll_interval,
        ));
        // the first snapshot is ready before kubelet can connect
        tracker.refresh_blocking().await;

        let plugin = Arc::new(ResourcePlugin::new(
            ResourceDescriptor {
                resource_name: self.kind.resource_name.clone(),
                socket_path: self.socket_path(),
            },
            tracker.clone(),
            self.kind.visible_devices_env.clone(),
        ));

        let server = PluginServer::new(plugin, token.clone());
        let server_handle = server.start().await?;

        let tracker_handle = {
            let token = token.clone();
            tokio::spawn(async move { tracker.run(token).await })
        };

        let registration = Arc::new(RegistrationClient::new(
            self.config.kubelet_socket.clone(),
            RegistrationRecord::new(
                self.kind.resource_name.clone(),
                self.kind.socket_name.clone(),
                server.options(),
            ),
            self.config.registration_backoff,
            self.config.socket_watch_interval,
        )
        .with_plugin_socket(self.socket_path()));
        let registration_handle = {
            let registration = registration.clone();
            let token = token.clone();
            tokio::spawn(async move { registration.run(token).await })
        };

        Ok(Instance {
            server,
            server_handle,
            tracker_handle,
            registration,
            registration_handle,
            token,
        })
    }
}

/// One running `{tracker, server, registration}` triple.
struct Instance {
    server: PluginServer,
    server_handle: ServerHandle,
    tracker_handle: JoinHandle<()>,
    registration: Arc<RegistrationClient>,
    registration_handle: JoinHandle<()>,
    token: CancellationToken,
}

impl Instance {
    /// Waits for shutdown, server termination, or removal of the plugin socket.
    async fn supervise(&mut self, socket_path: &Path, config: &PluginManagerConfig) -> Exit {
        let mut ticker = interval(config.socket_watch_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.token.cancelled() => return Exit::Shutdown,
                joined = &mut self.server_handle => {
                    let reason = match joined {
                        Ok(Ok(())) => "server stopped".to_string(),
                        Ok(Err(e)) => format!("{e:?}"),
                        Err(e) => format!("server task failed: {e}"),
                    };
                    return Exit::ServerStopped(reason);
                }
                _ = ticker.tick() => {
                    if tokio::fs::symlink_metadata(socket_path).await.is_err() {
                        return Exit::SocketRemoved;
                    }
                }
            }
        }
    }

    async fn join(self) {
        self.server.stop();
        if self.registration.state() == RegistrationState::Registered {
            info!("tearing down registered plugin");
        }
        if !self.server_handle.is_finished() {
            if let Err(e) = self.server_handle.await {
                warn!("server task failed: {e}");
            }
        }
        let _ = self.tracker_handle.await;
        let _ = self.registration_handle.await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use similar_asserts::assert_eq;
    use tempfile::TempDir;
    use test_log::test;

    use super::*;
    use crate::config::BackoffConfig;
    use crate::device::backend::mock::MockBackend;

    fn fast_config(plugin_dir: &Path) -> PluginManagerConfig {
        let fast = BackoffConfig {
            initial_interval: Duration::from_millis(20),
            max_interval: Duration::from_millis(50),
        };
        PluginManagerConfig {
            poll_interval: Duration::from_millis(50),
            registration_backoff: fast,
            socket_watch_interval: Duration::from_millis(20),
            restart_backoff: fast,
            max_restarts: 2,
            ..PluginManagerConfig::new(plugin_dir)
        }
    }

    fn kind() -> ResourceKind {
        ResourceKind {
            resource_name: "vendor.com/accelerator".to_string(),
            socket_name: "accel.sock".to_string(),
            backend: MockBackend::with_healthy(&["dev0"]),
            visible_devices_env: None,
        }
    }

    async fn wait_for_socket(path: &Path) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !path.exists() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("socket should appear");
    }

    #[test(tokio::test)]
    async fn bind_failures_exhaust_restart_budget() {
        let dir = TempDir::new().expect("should create temp dir");
        let config = fast_config(&dir.path().join("does-not-exist"));
        let manager = PluginManager::new(config, vec![kind()]);

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            manager.run(CancellationToken::new()),
        )
        .await
        .expect("manager should give up");
        let err = result.expect_err("binding can never succeed");
        assert!(matches!(
            err.current_context(),
            PluginError::SocketBindFailure { .. }
        ));
    }

    #[test(tokio::test)]
    async fn removed_socket_is_recreated() {
        let dir = TempDir::new().expect("should create temp dir");
        let config = fast_config(dir.path());
        let socket = dir.path().join("accel.sock");
        let manager = Arc::new(PluginManager::new(config, vec![kind()]));
        let token = CancellationToken::new();

        let handle = {
            let manager = manager.clone();
            let token = token.clone();
            tokio::spawn(async move { manager.run(token).await })
        };

        wait_for_socket(&socket).await;
        std::fs::remove_file(&socket).expect("should remove plugin socket");
        wait_for_socket(&socket).await;

        token.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("manager should stop")
            .expect("manager task should not panic");
        assert!(result.is_ok());
        assert_eq!(socket.exists(), false, "socket removed on shutdown");
    }
}
