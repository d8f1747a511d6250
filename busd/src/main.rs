use std::io;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
#[cfg(unix)]
use tokio::signal;
#[cfg(unix)]
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use busd::config::{BrokerConfig, TrackerMode};

#[derive(Parser, Debug)]
#[command(name = "busd", version)]
#[command(about = "Local task-dispatch broker for long-polling workers")]
struct Cli {
    /// Socket path (default: derived from the working directory)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Path to busd.toml (or use BUSD_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    /// Tracker backend: command or memory
    #[arg(long)]
    tracker_mode: Option<TrackerMode>,

    /// Tracker executable for command mode
    #[arg(long)]
    tracker_command: Option<String>,
}

fn init_logging(debug: bool) {
    let fallback = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn load_config(cli: &Cli) -> BrokerConfig {
    let path = BrokerConfig::locate(cli.config.clone());
    let mut config = BrokerConfig::load(path.as_deref());
    config.apply_env(|key| std::env::var(key).ok());

    if let Some(socket) = &cli.socket {
        config.broker.socket = Some(socket.clone());
    }
    if let Some(command) = &cli.tracker_command {
        config.tracker.command = command.clone();
    }
    if let Some(mode) = cli.tracker_mode {
        config.tracker.mode = mode;
    }
    config
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);
    info!("busd version {}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&cli);
    run(config).await
}

#[cfg(unix)]
async fn run(config: BrokerConfig) -> Result<()> {
    use anyhow::Context;
    use busd::Broker;

    match config.tracker.mode {
        TrackerMode::Command => info!(
            "Task tracker: {} (timeout {}ms)",
            config.tracker.command, config.tracker.timeout_ms
        ),
        TrackerMode::Memory => warn!("Using in-memory tracker; every task id is accepted"),
    }

    let tracker = config.build_tracker();
    let broker = Broker::bind(config, tracker).context("failed to start busd")?;
    println!("{}", broker.endpoint().socket.display());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    spawn_signal_handlers(shutdown_tx);

    let report = broker.run(shutdown_rx).await;
    if !report.drained {
        warn!("Some requests were still running at exit");
    }
    Ok(())
}

#[cfg(not(unix))]
async fn run(_config: BrokerConfig) -> Result<()> {
    anyhow::bail!("busd requires Unix domain sockets and is not supported on this platform")
}

#[cfg(unix)]
fn spawn_signal_handlers(shutdown: watch::Sender<bool>) {
    let ctrl_c = shutdown.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C; shutting down broker");
            let _ = ctrl_c.send(true);
        }
    });

    let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            warn!("Failed to install SIGTERM handler: {}", err);
            return;
        }
    };
    tokio::spawn(async move {
        if sigterm.recv().await.is_some() {
            info!("Received SIGTERM; shutting down broker");
            let _ = shutdown.send(true);
        }
    });
}
