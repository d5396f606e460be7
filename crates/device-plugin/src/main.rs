use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use device_plugin::config::Cli;
use device_plugin::config::Commands;
use device_plugin::config::DaemonArgs;
use device_plugin::config::PluginManagerConfig;
use device_plugin::device::inventory::Inventory;
use device_plugin::PluginManager;
use device_plugin::ResourceKind;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tokio_util::sync::CancellationToken;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Daemon(daemon_args) => run_daemon(daemon_args).await,
    }
}

async fn run_daemon(daemon_args: DaemonArgs) -> Result<()> {
    let _guard = utils::logging::init(daemon_args.log_file.as_deref());

    tracing::info!("Starting device plugin daemon {}", &**version::VERSION);

    let inventory = Inventory::load(&daemon_args.inventory)
        .map_err(|e| anyhow::anyhow!("{e:?}"))
        .context("load device inventory failed")?;
    let kinds: Vec<ResourceKind> = inventory
        .resources
        .into_iter()
        .map(ResourceKind::from)
        .collect();
    if kinds.is_empty() {
        tracing::warn!("inventory declares no resources, nothing to advertise");
    }

    let config = PluginManagerConfig::from(&daemon_args);
    let manager = PluginManager::new(config, kinds);

    let token = CancellationToken::new();
    spawn_signal_handler(token.clone())?;

    manager
        .run(token)
        .await
        .map_err(|e| anyhow::anyhow!("{e:?}"))
        .context("device plugin manager failed")?;

    tracing::info!("device plugin daemon stopped");
    Ok(())
}

/// Cancels `token` on SIGINT or SIGTERM.
fn spawn_signal_handler(token: CancellationToken) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("install SIGTERM handler failed")?;
    let mut sigint = signal(SignalKind::interrupt()).context("install SIGINT handler failed")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("received SIGTERM"),
            _ = sigint.recv() => tracing::info!("received SIGINT"),
        }
        token.cancel();
    });
    Ok(())
}
