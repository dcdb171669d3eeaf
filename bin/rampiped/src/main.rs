//! RamPipe daemon
//!
//! Transparently relocates hot files and directories into RAM-backed
//! storage, keeps them bound over their original paths, and reconciles
//! changes back to persistent storage before unpinning.

mod daemon;
mod server;
mod watcher;

use anyhow::{bail, Context, Result};
use clap::Parser;
use daemon::Daemon;
use rampipe_backend::{staging, BackendSet, HostSystem, SystemOps};
use rampipe_common::Config;
use rampipe_estimator::WorkloadEstimator;
use rampipe_state::StateStore;
use rampipe_sync::SyncEngine;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UnixListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "rampiped")]
#[command(about = "RamPipe daemon - transparent RAM pinning for hot paths")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "/etc/rampipe/rampiped.toml")]
    config: PathBuf,

    /// Control socket path (overrides configuration)
    #[arg(long)]
    socket: Option<PathBuf>,

    /// State file path (overrides configuration)
    #[arg(long)]
    state_file: Option<PathBuf>,

    /// Additional paths to watch for automatic pinning
    #[arg(long)]
    watch: Vec<PathBuf>,

    /// Unpin everything recorded in the state file, then exit
    #[arg(long)]
    unpin_all: bool,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn load_config(args: &Args) -> Result<Config> {
    let mut config: Config = if args.config.exists() {
        let raw = std::fs::read_to_string(&args.config)
            .with_context(|| format!("cannot read {}", args.config.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("cannot parse {}", args.config.display()))?
    } else {
        Config::default()
    };
    if let Some(socket) = &args.socket {
        config.daemon.socket_path = socket.clone();
    }
    if let Some(state_file) = &args.state_file {
        config.daemon.state_file = state_file.clone();
    }
    config.daemon.watch_paths.extend(args.watch.iter().cloned());
    Ok(config)
}

fn require_root() -> Result<()> {
    if !nix::unistd::geteuid().is_root() {
        bail!("rampiped requires root privileges (mount and device-mapper operations)");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| args.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    config
        .validate()
        .map_err(|e| anyhow::anyhow!("{e} (in {})", args.config.display()))?;
    require_root()?;

    info!("Starting RamPipe daemon");
    info!("Config file: {}", args.config.display());
    info!("State file: {}", config.daemon.state_file.display());

    let state = Arc::new(StateStore::open(&config.daemon.state_file)?);
    let ops: Arc<dyn SystemOps> = Arc::new(HostSystem);
    let backends = Arc::new(BackendSet::new(ops.clone(), &config));
    let sync = Arc::new(SyncEngine::new(state.clone(), backends.clone()));
    let (estimator, actions) = WorkloadEstimator::new(config.thresholds.clone());
    let estimator = Arc::new(estimator);
    let daemon = Arc::new(Daemon::new(
        state.clone(),
        backends,
        sync.clone(),
        estimator.clone(),
    ));

    if args.unpin_all {
        let failures = daemon.unpin_all().await;
        if failures > 0 {
            bail!("{failures} item(s) could not be unpinned");
        }
        info!("all items unpinned");
        return Ok(());
    }

    staging::ensure_ramdisk(ops.as_ref(), &config.staging)
        .await
        .context("cannot provision RAM staging")?;
    staging::ensure_thinpool(ops.as_ref(), &config.snapshot)
        .await
        .context("cannot provision snapshot thin pool")?;

    if state.len() > 0 {
        info!("{} item(s) still pinned from a previous run", state.len());
    }

    // Stale socket from an unclean exit; a live daemon would hold the path
    if config.daemon.socket_path.exists() {
        std::fs::remove_file(&config.daemon.socket_path)?;
    }
    let listener = UnixListener::bind(&config.daemon.socket_path)
        .with_context(|| format!("cannot bind {}", config.daemon.socket_path.display()))?;
    info!("Listening on {}", config.daemon.socket_path.display());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let grace = Duration::from_secs(config.daemon.shutdown_grace_secs);

    let periodic = {
        let sync = sync.clone();
        let interval = Duration::from_secs(config.sync.interval_secs);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { sync.run_periodic(interval, shutdown).await })
    };

    let consumer = {
        let daemon = daemon.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { watcher::run_actions(daemon, actions, shutdown).await })
    };

    // Automatic mode runs only when watch paths are configured; the watcher
    // must outlive this scope to keep delivering events
    let _watcher = if config.daemon.watch_paths.is_empty() {
        info!("no watch paths configured; manual pinning only");
        None
    } else {
        info!(
            "watching {} path(s) for write activity",
            config.daemon.watch_paths.len()
        );
        Some(
            watcher::start(&config.daemon.watch_paths, estimator)
                .context("cannot start filesystem watcher")?,
        )
    };

    let server = {
        let daemon = daemon.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { server::run(daemon, listener, shutdown, grace).await })
    };

    let mut sigterm = signal(SignalKind::terminate())?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("interrupt received"),
        _ = sigterm.recv() => info!("termination signal received"),
    }

    info!("Shutting down...");
    if shutdown_tx.send(true).is_err() {
        warn!("all shutdown listeners already gone");
    }
    for (name, task) in [("server", server), ("periodic sync", periodic), ("actions", consumer)] {
        if let Err(e) = task.await {
            error!("{name} task failed: {e}");
        }
    }

    // Best-effort final reconciliation; pinned items stay pinned across
    // restarts via the state file
    let failures = sync.sync_all().await;
    if failures > 0 {
        warn!("final sync left {failures} item(s) unreconciled");
    }
    if let Err(e) = std::fs::remove_file(&config.daemon.socket_path) {
        warn!("cannot remove socket: {e}");
    }
    info!("RamPipe daemon shut down gracefully");
    Ok(())
}
