//! Client configuration at `~/.termhub/client.toml`.
//!
//! Provides the default server address and the reconnect policy.
//! CLI flags always override config file values.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;
use termhub_client::ReconnectPolicy;
use termhub_core::{parse_terminal_path, terminal_path};
use tracing::debug;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub default: DefaultConfig,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

/// Default server address.
#[derive(Debug, Clone, Deserialize)]
pub struct DefaultConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for DefaultConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    7681
}

impl Config {
    /// Load configuration from a TOML file, returning defaults if the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;

        debug!(path = %path.display(), "loaded config");
        Ok(config)
    }
}

/// Turn an attach target into a stream URL.
///
/// Accepts a full `ws://` / `wss://` URL, or a bare session id that is
/// combined with `host` and `port`.
pub fn resolve_stream_url(target: &str, host: &str, port: u16) -> Result<String> {
    if target.is_empty() {
        anyhow::bail!("empty attach target");
    }
    if let Some((scheme, rest)) = target.split_once("://") {
        if scheme != "ws" && scheme != "wss" {
            anyhow::bail!("unsupported scheme '{scheme}' (expected ws or wss)");
        }
        let path = rest.find('/').map(|i| &rest[i..]).unwrap_or("");
        if parse_terminal_path(path).is_none() {
            anyhow::bail!("'{target}' does not address a terminal stream (/terminal/<id>)");
        }
        return Ok(target.to_string());
    }

    let path = terminal_path(target);
    if parse_terminal_path(&path).is_none() {
        anyhow::bail!("invalid session id '{target}'");
    }
    Ok(format!("ws://{host}:{port}{path}"))
}
