use std::fmt;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use backoff::backoff::Backoff;
use error_stack::Report;
use error_stack::ResultExt;
use notify::Event;
use notify::RecommendedWatcher;
use notify::RecursiveMode;
use notify::Watcher;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::time::interval;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::api::registration_client;
use super::api::DevicePluginOptions;
use super::api::RegisterRequest;
use super::connect_uds;
use super::API_VERSION;
use crate::config::BackoffConfig;
use crate::error::PluginError;

/// Registration lifecycle with kubelet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Unregistered,
    Registering,
    Registered,
}

impl fmt::Display for RegistrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RegistrationState::Unregistered => "unregistered",
            RegistrationState::Registering => "registering",
            RegistrationState::Registered => "registered",
        };
        f.write_str(s)
    }
}

/// What gets sent to kubelet on each registration attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationRecord {
    pub resource_name: String,
    /// Socket file name relative to the plugin directory.
    pub endpoint: String,
    pub version: String,
    pub options: DevicePluginOptions,
}

impl RegistrationRecord {
    pub fn new(
        resource_name: impl Into<String>,
        endpoint: impl Into<String>,
        options: DevicePluginOptions,
    ) -> Self {
        Self {
            resource_name: resource_name.into(),
            endpoint: endpoint.into(),
            version: API_VERSION.to_string(),
            options,
        }
    }
}

/// Identity of the kubelet socket a registration was made against.
/// A kubelet restart recreates the socket, changing its inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SocketIdentity {
    dev: u64,
    ino: u64,
}

impl SocketIdentity {
    async fn of(path: &Path) -> io::Result<Self> {
        let metadata = tokio::fs::metadata(path).await?;
        Ok(Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        })
    }
}

/// Registers one plugin with kubelet and keeps it registered.
pub struct RegistrationClient {
    kubelet_socket: PathBuf,
    record: RegistrationRecord,
    backoff: BackoffConfig,
    watch_interval: Duration,
    /// Socket of the plugin being registered, when known.
    plugin_socket: Option<PathBuf>,
    state: watch::Sender<RegistrationState>,
}

impl RegistrationClient {
    pub fn new(
        kubelet_socket: impl Into<PathBuf>,
        record: RegistrationRecord,
        backoff: BackoffConfig,
        watch_interval: Duration,
    ) -> Self {
        let (state, _) = watch::channel(RegistrationState::Unregistered);
        Self {
            kubelet_socket: kubelet_socket.into(),
            record,
            backoff,
            watch_interval,
            plugin_socket: None,
            state,
        }
    }

    /// Only registers while `plugin_socket` is the socket that existed when
    /// [`run`](Self::run) started. Kubelet wipes the plugin directory when it
    /// restarts; a client whose socket is gone stops and leaves recovery to
    /// whoever rebuilds the server.
    pub fn with_plugin_socket(mut self, plugin_socket: impl Into<PathBuf>) -> Self {
        self.plugin_socket = Some(plugin_socket.into());
        self
    }

    pub fn state(&self) -> RegistrationState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<RegistrationState> {
        self.state.subscribe()
    }

    /// Registers, then re-registers whenever the kubelet socket is replaced,
    /// until cancelled.
    #[tracing::instrument(skip(self, cancellation_token), fields(resource = %self.record.resource_name))]
    pub async fn run(&self, cancellation_token: CancellationToken) {
        let plugin_identity = match &self.plugin_socket {
            Some(path) => match SocketIdentity::of(path).await {
                Ok(identity) => Some(identity),
                Err(e) => {
                    warn!("plugin socket {:?} is not present, not registering: {e}", path);
                    self.transition(RegistrationState::Unregistered);
                    return;
                }
            },
            None => None,
        };

        loop {
            self.transition(RegistrationState::Unregistered);

            let Some(identity) = self
                .register_with_backoff(plugin_identity, &cancellation_token)
                .await
            else {
                break;
            };
            self.transition(RegistrationState::Registered);

            if !self
                .wait_for_kubelet_restart(identity, &cancellation_token)
                .await
            {
                break;
            }
            info!("kubelet socket was replaced, registering again");
        }
        self.transition(RegistrationState::Unregistered);
        info!("registration client stopped");
    }

    fn transition(&self, next: RegistrationState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!("registration state: {previous} -> {next}");
        }
    }

    /// Retries until registration succeeds. Returns `None` when cancelled or
    /// when the plugin socket was removed or replaced.
    async fn register_with_backoff(
        &self,
        plugin_identity: Option<SocketIdentity>,
        cancellation_token: &CancellationToken,
    ) -> Option<SocketIdentity> {
        self.transition(RegistrationState::Registering);
        let mut backoff = self.backoff.build();

        loop {
            if !self.plugin_socket_intact(plugin_identity).await {
                info!("plugin socket is gone, giving up registration");
                return None;
            }

            match self.register_once().await {
                Ok(identity) => {
                    info!(
                        endpoint = %self.record.endpoint,
                        "registered with kubelet at {:?}", self.kubelet_socket
                    );
                    return Some(identity);
                }
                Err(e) => {
                    let delay = backoff.next_backoff().unwrap_or(self.backoff.max_interval);
                    warn!("registration failed, retrying in {delay:?}: {e:?}");
                    tokio::select! {
                        _ = cancellation_token.cancelled() => return None,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    async fn plugin_socket_intact(&self, expected: Option<SocketIdentity>) -> bool {
        let (Some(path), Some(expected)) = (&self.plugin_socket, expected) else {
            return true;
        };
        matches!(SocketIdentity::of(path).await, Ok(current) if current == expected)
    }

    async fn register_once(&self) -> Result<SocketIdentity, Report<PluginError>> {
        let failed = |message: &str| PluginError::RegistrationFailed {
            message: message.to_string(),
        };

        let identity = SocketIdentity::of(&self.kubelet_socket)
            .await
            .change_context_lazy(|| failed("kubelet socket is not present"))?;

        let channel = connect_uds(&self.kubelet_socket)
            .await
            .change_context_lazy(|| failed("failed to connect to kubelet socket"))?;
        let mut client = registration_client::RegistrationClient::new(channel);

        let request = RegisterRequest {
            version: self.record.version.clone(),
            endpoint: self.record.endpoint.clone(),
            resource_name: self.record.resource_name.clone(),
            options: Some(self.record.options),
        };
        client
            .register(tonic::Request::new(request))
            .await
            .change_context_lazy(|| failed("kubelet rejected registration"))?;

        Ok(identity)
    }

    /// Waits until the kubelet socket disappears or is replaced. Filesystem
    /// events give fast detection, the interval covers missed events.
    /// Returns `false` when cancelled.
    async fn wait_for_kubelet_restart(
        &self,
        identity: SocketIdentity,
        cancellation_token: &CancellationToken,
    ) -> bool {
        let (fs_tx, mut fs_rx) = mpsc::unbounded_channel();
        let _watcher = match self.watch_socket_dir(fs_tx) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!("failed to set up filesystem watcher, falling back to polling only: {e:?}");
                None
            }
        };

        let mut ticker = interval(self.watch_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancellation_token.cancelled() => return false,
                Some(()) = fs_rx.recv() => {}
                _ = ticker.tick() => {}
            }

            match SocketIdentity::of(&self.kubelet_socket).await {
                Ok(current) if current == identity => {}
                Ok(_) => {
                    info!("kubelet socket {:?} was recreated", self.kubelet_socket);
                    self.transition(RegistrationState::Unregistered);
                    return true;
                }
                Err(e) => {
                    info!("kubelet socket {:?} is gone: {e}", self.kubelet_socket);
                    self.transition(RegistrationState::Unregistered);
                    return true;
                }
            }
        }
    }

    fn watch_socket_dir(
        &self,
        fs_tx: mpsc::UnboundedSender<()>,
    ) -> Result<RecommendedWatcher, Report<PluginError>> {
        let dir = self
            .kubelet_socket
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let mut watcher = RecommendedWatcher::new(
            move |res: Result<Event, notify::Error>| match res {
                Ok(event) => {
                    debug!("filesystem event: {:?}", event);
                    // the receiver is gone once the wait is over
                    let _ = fs_tx.send(());
                }
                Err(e) => {
                    warn!("filesystem watch error: {:?}", e);
                }
            },
            notify::Config::default(),
        )
        .change_context(PluginError::RegistrationFailed {
            message: "failed to create filesystem watcher".to_string(),
        })?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .change_context(PluginError::RegistrationFailed {
                message: format!("failed to watch {}", dir.display()),
            })?;
        Ok(watcher)
    }
}
