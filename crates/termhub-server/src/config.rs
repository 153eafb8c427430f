//! Server configuration: TOML file + CLI overrides.

use crate::session::{ActivityConfig, RegistryConfig, SpawnConfig};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use termhub_core::{TermError, TermResult, DEFAULT_COLS, DEFAULT_ROWS};
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub activity: ActivitySection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_graceful_timeout_ms")]
    pub graceful_timeout_ms: u64,
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
    #[serde(default = "default_exited_retention_secs")]
    pub exited_retention_secs: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            max_sessions: default_max_sessions(),
            graceful_timeout_ms: default_graceful_timeout_ms(),
            subscriber_buffer: default_subscriber_buffer(),
            exited_retention_secs: default_exited_retention_secs(),
        }
    }
}

/// `[session]` section: what every session runs.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSection {
    /// Command to launch. Falls back to `$SHELL`, then `/bin/sh`.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default = "default_cols")]
    pub cols: u16,
    #[serde(default = "default_rows")]
    pub rows: u16,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            env: HashMap::new(),
            cols: default_cols(),
            rows: default_rows(),
        }
    }
}

/// `[activity]` section: waiting-for-input detection.
#[derive(Debug, Clone, Deserialize)]
pub struct ActivitySection {
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_buffer_chars")]
    pub buffer_chars: usize,
    #[serde(default = "default_window_lines")]
    pub window_lines: usize,
}

impl Default for ActivitySection {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            buffer_chars: default_buffer_chars(),
            window_lines: default_window_lines(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    7681
}
fn default_max_sessions() -> usize {
    5
}
fn default_graceful_timeout_ms() -> u64 {
    5000
}
fn default_subscriber_buffer() -> usize {
    256
}
fn default_exited_retention_secs() -> u64 {
    60
}
fn default_cols() -> u16 {
    DEFAULT_COLS
}
fn default_rows() -> u16 {
    DEFAULT_ROWS
}
fn default_debounce_ms() -> u64 {
    150
}
fn default_buffer_chars() -> usize {
    2000
}
fn default_window_lines() -> usize {
    5
}

/// Resolved server configuration (paths expanded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub exited_retention: Duration,
    pub registry: RegistryConfig,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    pub fn load(
        config_path: Option<&Path>,
        cli_bind: Option<&str>,
        cli_port: Option<u16>,
        cli_max_sessions: Option<usize>,
        cli_graceful_timeout_ms: Option<u64>,
    ) -> TermResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| TermError::Other(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Ok(Self::resolve(
            file_config,
            cli_bind,
            cli_port,
            cli_max_sessions,
            cli_graceful_timeout_ms,
        ))
    }

    fn resolve(
        file_config: ConfigFile,
        cli_bind: Option<&str>,
        cli_port: Option<u16>,
        cli_max_sessions: Option<usize>,
        cli_graceful_timeout_ms: Option<u64>,
    ) -> Self {
        let ConfigFile {
            server,
            session,
            activity,
        } = file_config;

        let graceful_timeout_ms = cli_graceful_timeout_ms.unwrap_or(server.graceful_timeout_ms);
        let command = session.command.unwrap_or_else(default_shell);

        Self {
            bind: cli_bind.map(str::to_string).unwrap_or(server.bind),
            port: cli_port.unwrap_or(server.port),
            exited_retention: Duration::from_secs(server.exited_retention_secs),
            registry: RegistryConfig {
                max_sessions: cli_max_sessions.unwrap_or(server.max_sessions),
                graceful_timeout: Duration::from_millis(graceful_timeout_ms),
                subscriber_buffer: server.subscriber_buffer.max(1),
                spawn: SpawnConfig {
                    command,
                    args: session.args,
                    env: session.env,
                    cols: session.cols,
                    rows: session.rows,
                },
                activity: ActivityConfig {
                    debounce: Duration::from_millis(activity.debounce_ms),
                    buffer_chars: activity.buffer_chars,
                    window_lines: activity.window_lines,
                },
            },
        }
    }

    /// Socket address to listen on.
    pub fn listen_addr(&self) -> TermResult<SocketAddr> {
        format!("{}:{}", self.bind, self.port)
            .parse()
            .map_err(|e| TermError::Other(format!("invalid listen address: {e}")))
    }
}

/// The user's login shell, or `/bin/sh`.
pub fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
