//! termhub: attach to terminal sessions served by termhub-server.

mod commands;
mod config;
mod terminal;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// termhub: terminal session client
#[derive(Parser)]
#[command(name = "termhub", version, about = "Attach to terminal sessions served by termhub-server")]
struct Cli {
    /// Server host used when attaching by session id
    #[arg(long, global = true)]
    host: Option<String>,

    /// Server port used when attaching by session id
    #[arg(short, long, global = true)]
    port: Option<u16>,

    /// Config file path
    #[arg(long = "config", global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Attach this terminal to a running session
    Attach {
        /// Stream URL (ws://host:port/terminal/<id>) or a bare session id
        target: String,

        /// Override the maximum number of reconnect attempts
        #[arg(long)]
        max_attempts: Option<u32>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize tracing.
    let default_filter = if cli.verbose {
        "termhub=debug,termhub_client=debug,termhub_core=debug"
    } else {
        "termhub=warn,termhub_client=warn"
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(cli.verbose)
        .with_writer(std::io::stderr)
        .init();

    // Load config file.
    let config_path = cli.config.clone().unwrap_or_else(|| {
        let home = dirs::home_dir().unwrap_or_default();
        home.join(".termhub").join("client.toml")
    });
    let cfg = match config::Config::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("termhub: {e:#}");
            std::process::exit(1);
        }
    };

    let host = cli.host.clone().unwrap_or_else(|| cfg.default.host.clone());
    let port = cli.port.unwrap_or(cfg.default.port);

    let result = match cli.command {
        Command::Attach {
            target,
            max_attempts,
        } => {
            let mut policy = cfg.reconnect.clone();
            if let Some(n) = max_attempts {
                policy.max_attempts = n;
            }
            match config::resolve_stream_url(&target, &host, port) {
                Ok(url) => commands::attach::run(&url, policy).await,
                Err(e) => Err(e),
            }
        }
    };

    match result {
        Ok(0) => {}
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("termhub: {e:#}");
            std::process::exit(1);
        }
    }
}
