//! termhub-server binary.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use termhub_core::terminal_path;
use termhub_server::{ServerConfig, SessionRegistry, TerminalServer};
use tracing::{error, info, warn};

/// Extra time the whole shutdown sequence gets beyond one graceful timeout.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// termhub-server: supervise terminal sessions and stream them over WebSocket
#[derive(Parser, Debug)]
#[command(name = "termhub-server", version, about = "Terminal session server")]
struct Cli {
    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Bind address
    #[arg(long)]
    bind: Option<String>,

    /// Config file path
    #[arg(long, default_value = "~/.termhub/config.toml")]
    config: String,

    /// Maximum concurrently active sessions
    #[arg(long)]
    max_sessions: Option<usize>,

    /// Milliseconds to wait after the terminate signal before force killing
    #[arg(long)]
    graceful_timeout_ms: Option<u64>,

    /// Spawn a session in this directory at startup (repeatable)
    #[arg(long = "spawn", value_name = "DIR")]
    spawn: Vec<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting termhub-server");

    let config_path = PathBuf::from(&cli.config);
    let config = match ServerConfig::load(
        Some(&config_path),
        cli.bind.as_deref(),
        cli.port,
        cli.max_sessions,
        cli.graceful_timeout_ms,
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let addr = match config.listen_addr() {
        Ok(addr) => addr,
        Err(e) => {
            error!(error = %e, "invalid listen address");
            std::process::exit(1);
        }
    };

    let graceful_timeout = config.registry.graceful_timeout;
    let registry = Arc::new(SessionRegistry::new(config.registry));
    let server = Arc::new(TerminalServer::new(registry.clone(), config.exited_retention));

    let (local, serve_handle) = match server.start(addr).await {
        Ok(started) => started,
        Err(e) => {
            error!(error = %e, "failed to start listener");
            std::process::exit(1);
        }
    };
    info!(
        addr = %local,
        max_sessions = registry.config().max_sessions,
        graceful_timeout_ms = graceful_timeout.as_millis() as u64,
        "listening"
    );

    for dir in &cli.spawn {
        match registry.create(dir).await {
            Ok(summary) => info!(
                session_id = %summary.id,
                cwd = %summary.cwd.display(),
                url = %format!("ws://{local}{}", terminal_path(&summary.id)),
                "session ready"
            ),
            Err(e) => warn!(cwd = %dir.display(), error = %e, "could not spawn startup session"),
        }
    }

    tokio::select! {
        _ = serve_handle => {
            warn!("server task ended unexpectedly");
        }
        _ = shutdown_signal() => {
            info!("received shutdown signal");
        }
    }

    // Watchdog: the process must not outlive a stuck shutdown.
    let deadline = graceful_timeout + SHUTDOWN_GRACE;
    if tokio::time::timeout(deadline, server.shutdown()).await.is_err() {
        error!(
            timeout_ms = deadline.as_millis() as u64,
            "sessions did not settle in time, forcing exit"
        );
        std::process::exit(1);
    }

    info!("termhub-server stopped");
}

/// Wait for SIGTERM or SIGINT (Ctrl+C).
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
