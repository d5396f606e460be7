use std::path::PathBuf;

use clap::Parser;
use clap::Subcommand;
use utils::version;

use super::DEFAULT_PLUGIN_DIR;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the device plugin daemon
    Daemon(DaemonArgs),
}

#[derive(Parser, Debug, Clone)]
pub struct DaemonArgs {
    #[arg(
        long,
        env = "DEVICE_PLUGIN_DIR",
        value_hint = clap::ValueHint::DirPath,
        default_value = DEFAULT_PLUGIN_DIR,
        help = "Directory shared with kubelet holding device plugin sockets"
    )]
    pub plugin_dir: PathBuf,

    #[arg(
        long,
        env = "KUBELET_SOCKET",
        value_hint = clap::ValueHint::FilePath,
        help = "Kubelet registration socket, defaults to <plugin-dir>/kubelet.sock"
    )]
    pub kubelet_socket: Option<PathBuf>,

    #[arg(
        long,
        env = "DEVICE_PLUGIN_INVENTORY",
        value_hint = clap::ValueHint::FilePath,
        help = "Path for the device inventory, e.g. /etc/device-plugin/inventory.yaml"
    )]
    pub inventory: PathBuf,

    #[arg(
        long,
        env = "DEVICE_PLUGIN_POLL_INTERVAL_SECS",
        default_value = "5",
        help = "Seconds between device health checks"
    )]
    pub poll_interval_secs: u64,

    #[arg(
        long,
        default_value = "5",
        help = "Consecutive failed server restarts tolerated per resource before giving up"
    )]
    pub max_restarts: u32,

    #[arg(
        long,
        env = "DEVICE_PLUGIN_LOG_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "Optional log file, rotated daily, in addition to stderr"
    )]
    pub log_file: Option<PathBuf>,
}
