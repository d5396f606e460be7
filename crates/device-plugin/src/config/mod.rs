pub mod cli;

use std::path::PathBuf;
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::ExponentialBackoffBuilder;

pub use cli::*;

/// Default directory shared between kubelet and device plugins.
pub const DEFAULT_PLUGIN_DIR: &str = "/var/lib/kubelet/device-plugins";
/// Kubelet registration socket name inside the plugin directory.
pub const KUBELET_SOCKET_NAME: &str = "kubelet.sock";

/// Exponential backoff bounds. Retries are unbounded in count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffConfig {
    pub initial_interval: Duration,
    pub max_interval: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(30),
        }
    }
}

impl BackoffConfig {
    pub fn build(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_interval)
            .with_max_interval(self.max_interval)
            .with_multiplier(2.0)
            .with_randomization_factor(0.1)
            .with_max_elapsed_time(None)
            .build()
    }
}

/// Process-wide settings injected into [`crate::manager::PluginManager`].
#[derive(Debug, Clone)]
pub struct PluginManagerConfig {
    /// Directory holding plugin sockets, shared with kubelet.
    pub plugin_dir: PathBuf,
    pub kubelet_socket: PathBuf,
    /// Health poll interval of every device tracker.
    pub poll_interval: Duration,
    pub registration_backoff: BackoffConfig,
    /// Fallback polling interval for kubelet and plugin socket watches.
    pub socket_watch_interval: Duration,
    pub restart_backoff: BackoffConfig,
    /// Consecutive failed restarts tolerated per resource kind.
    pub max_restarts: u32,
    /// A server living this long resets the restart budget.
    pub stable_after: Duration,
}

impl PluginManagerConfig {
    pub fn new(plugin_dir: impl Into<PathBuf>) -> Self {
        let plugin_dir = plugin_dir.into();
        Self {
            kubelet_socket: plugin_dir.join(KUBELET_SOCKET_NAME),
            plugin_dir,
            poll_interval: Duration::from_secs(5),
            registration_backoff: BackoffConfig::default(),
            socket_watch_interval: Duration::from_secs(1),
            restart_backoff: BackoffConfig::default(),
            max_restarts: 5,
            stable_after: Duration::from_secs(60),
        }
    }
}

impl Default for PluginManagerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_PLUGIN_DIR)
    }
}

impl From<&DaemonArgs> for PluginManagerConfig {
    fn from(args: &DaemonArgs) -> Self {
        let mut config = Self::new(&args.plugin_dir);
        if let Some(kubelet_socket) = &args.kubelet_socket {
            config.kubelet_socket = kubelet_socket.clone();
        }
        config.poll_interval = Duration::from_secs(args.poll_interval_secs.max(1));
        config.max_restarts = args.max_restarts;
        config
    }
}
