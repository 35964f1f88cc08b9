//! Mount Connector Daemon
//!
//! Listens on a Unix socket and runs mount helpers (a user-space filesystem
//! client or an object-store sync tool) on behalf of its clients.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::info;

use connector_core::config::load_config;
use connector_core::tracing_init::default_filter;
use connector_daemon::mount::{HelperDirs, MountLauncher};
use connector_daemon::preflight::{probe_tool_version, resolve_helpers, user_agent};
use connector_daemon::server::{ServerConfig, SocketServer};

#[derive(Parser, Debug)]
#[command(name = "mount-connector")]
#[command(version, about = "Mount connector daemon - runs mount helpers for socket clients")]
struct Args {
    /// Settings file (JSON). Defaults to /etc/mount-connector/settings.json if present.
    #[arg(long, env = "MOUNT_CONNECTOR_CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Unix socket path
    #[arg(long, env = "MOUNT_CONNECTOR_SOCKET_PATH")]
    socket_path: Option<PathBuf>,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long, env = "MOUNT_CONNECTOR_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "MOUNT_CONNECTOR_LOG_JSON")]
    log_json: bool,

    /// Run the helper checks and exit without binding the socket.
    #[arg(long)]
    check: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = load_config(args.config.as_deref())?;
    if let Some(path) = args.socket_path {
        config.daemon.socket_path = path;
    }
    if let Some(level) = args.log_level {
        config.daemon.log_level = level;
    }

    connector_core::tracing_init::init_tracing(
        &default_filter(&config.daemon.log_level),
        args.log_json,
    );

    info!(
        version = env!("CARGO_PKG_VERSION"),
        socket = %config.daemon.socket_path.display(),
        "Starting mount-connector"
    );

    let helpers = resolve_helpers(&config.helpers)?;
    let tool = probe_tool_version(&helpers.binaries.sync_tool).await?;
    let user_agent = user_agent(
        &config.helpers.user_agent_product,
        &helpers.binaries.sync_tool,
        &tool,
    );
    info!(user_agent = %user_agent, "Sync tool version probed");

    if args.check {
        info!("Preflight checks passed");
        return Ok(());
    }

    let dirs = HelperDirs::from_config(&config.helpers);
    for dir in [&dirs.config_dir, &dirs.cache_dir, &dirs.log_dir] {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create helper directory {}", dir.display()))?;
    }

    let launcher = Arc::new(MountLauncher::new(helpers.binaries, dirs, user_agent));
    let server = SocketServer::bind(ServerConfig::from_config(&config), launcher)?;

    let shutdown = CancellationToken::new();
    let mut serve = tokio::spawn(server.serve(shutdown.clone()));
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    info!("Mount connector ready");

    tokio::select! {
        result = &mut serve => {
            result??;
            info!("Daemon stopped");
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    shutdown.cancel();
    serve.await??;

    info!("Daemon stopped");
    Ok(())
}
