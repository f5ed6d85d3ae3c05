//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `NATFWD_LISTEN`, `NATFWD_IDENTITY`,
//!    `NATFWD_FORWARDERS` (comma separated `host:port` list)
//! 2. **Config file** — path via `--config <path>`, or `natfwd.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [forwarder]
//! listen = "0.0.0.0:12345"
//! identity = "FFFFFFFFFFFF"
//! max_clients_per_server = 32
//! max_frame_size = 67108864   # 64 MiB
//! read_chunk = 16384
//! outbound_queue = 256
//! stats_interval_secs = 60
//!
//! [natlayer]
//! default_credit = 131072     # 128 KiB
//! connect_timeout_secs = 5
//! persist_interval_secs = 10
//! forwarders = ["203.0.113.7:12345"]
//!
//! [logging]
//! level = "info"
//!
//! [supervisor]
//! max_backoff = 60
//! stable_threshold = 60
//! ```

use serde::Deserialize;
use std::path::Path;

use crate::error::ConfigError;
use crate::frame::{DEFAULT_MAX_FRAME_SIZE, FORWARDER_ID};

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub forwarder: ForwarderConfig,
    #[serde(default)]
    pub natlayer: NatConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

/// Relay settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ForwarderConfig {
    /// Socket address servers and clients connect to (default `0.0.0.0:12345`).
    #[serde(default = "default_listen")]
    pub listen: String,
    /// Identity placed on forwarder-originated frames. Override with `NATFWD_IDENTITY`.
    #[serde(default = "default_identity")]
    pub identity: String,
    /// Concurrent clients admitted per server session (default 32).
    #[serde(default = "default_max_clients_per_server")]
    pub max_clients_per_server: usize,
    /// Largest frame content accepted from a peer (default 64 MiB).
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    /// Largest single read from a client socket (default 16 KiB).
    #[serde(default = "default_read_chunk")]
    pub read_chunk: usize,
    /// Depth of each server's outbound frame queue (default 256).
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
    /// Seconds between statistics log lines; 0 disables (default 60).
    #[serde(default = "default_stats_interval")]
    pub stats_interval_secs: u64,
}

/// Client-library settings used by `NatLayer` and `natfwd probe`.
#[derive(Debug, Clone, Deserialize)]
pub struct NatConfig {
    /// Credit announced in `INIT_SERVER` (default 128 KiB).
    #[serde(default = "default_credit")]
    pub default_credit: u32,
    /// Timeout for each TCP connect to a forwarder (default 5).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Forwarders served by the static discovery backend.
    #[serde(default)]
    pub forwarders: Vec<String>,
    /// Seconds between checks that each listening handle is still registered,
    /// re-registering after a lost link; 0 disables (default 10).
    #[serde(default = "default_persist_interval")]
    pub persist_interval_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Supervisor settings for `natfwd supervise`.
#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    /// Maximum seconds between restart attempts (default 60).
    #[serde(default = "default_supervisor_max_backoff")]
    pub max_backoff: u64,
    /// Seconds of uptime before resetting backoff (default 60).
    #[serde(default = "default_supervisor_stable_threshold")]
    pub stable_threshold: u64,
}

fn default_listen() -> String {
    "0.0.0.0:12345".to_string()
}
fn default_identity() -> String {
    FORWARDER_ID.to_string()
}
fn default_max_clients_per_server() -> usize {
    32
}
fn default_max_frame_size() -> usize {
    DEFAULT_MAX_FRAME_SIZE
}
fn default_read_chunk() -> usize {
    16 * 1024
}
fn default_outbound_queue() -> usize {
    256
}
fn default_stats_interval() -> u64 {
    60
}
fn default_credit() -> u32 {
    128 * 1024
}
fn default_connect_timeout() -> u64 {
    5
}
fn default_persist_interval() -> u64 {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_supervisor_max_backoff() -> u64 {
    60
}
fn default_supervisor_stable_threshold() -> u64 {
    60
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            identity: default_identity(),
            max_clients_per_server: default_max_clients_per_server(),
            max_frame_size: default_max_frame_size(),
            read_chunk: default_read_chunk(),
            outbound_queue: default_outbound_queue(),
            stats_interval_secs: default_stats_interval(),
        }
    }
}

impl Default for NatConfig {
    fn default() -> Self {
        Self {
            default_credit: default_credit(),
            connect_timeout_secs: default_connect_timeout(),
            forwarders: Vec::new(),
            persist_interval_secs: default_persist_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_backoff: default_supervisor_max_backoff(),
            stable_threshold: default_supervisor_stable_threshold(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `natfwd.toml` in the
    /// current directory is used when present, falling back to compiled defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new("natfwd.toml").exists() => Self::from_file("natfwd.toml")?,
            None => Config::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(listen) = var("NATFWD_LISTEN") {
            self.forwarder.listen = listen;
        }
        if let Some(identity) = var("NATFWD_IDENTITY") {
            self.forwarder.identity = identity;
        }
        if let Some(list) = var("NATFWD_FORWARDERS") {
            self.natlayer.forwarders = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [forwarder]
            listen = "127.0.0.1:9000"

            [natlayer]
            forwarders = ["10.0.0.1:12345"]
            "#,
        )
        .unwrap();
        assert_eq!(config.forwarder.listen, "127.0.0.1:9000");
        assert_eq!(config.forwarder.max_clients_per_server, 32);
        assert_eq!(config.natlayer.default_credit, 128 * 1024);
        assert_eq!(config.natlayer.forwarders, vec!["10.0.0.1:12345"]);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_env_overrides_file() {
        let mut config = Config::default();
        config.apply_env(|key| match key {
            "NATFWD_LISTEN" => Some("0.0.0.0:4000".into()),
            "NATFWD_FORWARDERS" => Some("a:1, b:2,,".into()),
            _ => None,
        });
        assert_eq!(config.forwarder.listen, "0.0.0.0:4000");
        assert_eq!(config.forwarder.identity, FORWARDER_ID);
        assert_eq!(config.natlayer.forwarders, vec!["a:1", "b:2"]);
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let err = Config::load(Some("/nonexistent/natfwd.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
