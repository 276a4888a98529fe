//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `TERMCAST_LISTEN_ADDRESS`,
//!    `TERMCAST_SESSION_STORAGE_DIR`, `TERMCAST_LOG_LEVEL`
//! 2. **Config file** — path via `--config <path>`, or `termcast.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! Unknown keys anywhere in the file are rejected at load time rather than
//! silently ignored, so a typo'd field surfaces at startup instead of as a
//! puzzling runtime default.
//!
//! ```toml
//! listen_address = "0.0.0.0:7890"
//! session_storage_dir = "/var/lib/termcast/sessions"
//! max_sessions = 64
//! post_exit_retention_seconds = 30
//! subscriber_queue_capacity = 256
//! idle_timeout_seconds = 60
//! heartbeat_interval_seconds = 30
//! sweep_interval_seconds = 15
//! shutdown_grace_seconds = 10
//!
//! [logging]
//! level = "info"
//!
//! [supervisor]
//! max_backoff_seconds = 60
//! stable_threshold_seconds = 60
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

/// Top-level configuration, deserialized from TOML. Unknown top-level keys
/// are rejected rather than silently ignored.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Socket address the HTTP/WebSocket/SSE server binds (default `0.0.0.0:7890`).
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    /// Directory holding one subdirectory per session (`<id>/cast`, `<id>/meta.json`).
    #[serde(default = "default_session_storage_dir")]
    pub session_storage_dir: PathBuf,
    /// Maximum number of concurrently-running sessions. `None` means unlimited.
    #[serde(default)]
    pub max_sessions: Option<usize>,
    /// How long an exited session (and its transcript handle) stays in the
    /// registry before `sweep` evicts it, once it has no subscribers left.
    #[serde(default = "default_post_exit_retention_seconds")]
    pub post_exit_retention_seconds: u64,
    /// Default per-subscriber bounded-queue capacity, in chunks.
    #[serde(default = "default_subscriber_queue_capacity")]
    pub subscriber_queue_capacity: usize,
    /// WebSocket idle timeout: ping cadence and max silence before disconnect.
    #[serde(default = "default_idle_timeout_seconds")]
    pub idle_timeout_seconds: u64,
    /// SSE keep-alive comment interval.
    #[serde(default = "default_heartbeat_interval_seconds")]
    pub heartbeat_interval_seconds: u64,
    /// How often the background sweep task runs to evict retired sessions.
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
    /// Grace period given to sessions between SIGTERM and SIGKILL during
    /// server shutdown.
    #[serde(default = "default_shutdown_grace_seconds")]
    pub shutdown_grace_seconds: u64,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Supervisor settings for `termcast supervise`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SupervisorConfig {
    /// Maximum seconds between restart attempts (default 60).
    #[serde(default = "default_supervisor_max_backoff")]
    pub max_backoff_seconds: u64,
    /// Seconds of uptime before resetting backoff (default 60).
    #[serde(default = "default_supervisor_stable_threshold")]
    pub stable_threshold_seconds: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            max_backoff_seconds: default_supervisor_max_backoff(),
            stable_threshold_seconds: default_supervisor_stable_threshold(),
        }
    }
}

fn default_listen_address() -> String {
    "0.0.0.0:7890".to_string()
}
fn default_session_storage_dir() -> PathBuf {
    PathBuf::from("/var/lib/termcast/sessions")
}
fn default_post_exit_retention_seconds() -> u64 {
    30
}
fn default_subscriber_queue_capacity() -> usize {
    256
}
fn default_idle_timeout_seconds() -> u64 {
    60
}
fn default_heartbeat_interval_seconds() -> u64 {
    30
}
fn default_sweep_interval_seconds() -> u64 {
    15
}
fn default_shutdown_grace_seconds() -> u64 {
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

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            session_storage_dir: default_session_storage_dir(),
            max_sessions: None,
            post_exit_retention_seconds: default_post_exit_retention_seconds(),
            subscriber_queue_capacity: default_subscriber_queue_capacity(),
            idle_timeout_seconds: default_idle_timeout_seconds(),
            heartbeat_interval_seconds: default_heartbeat_interval_seconds(),
            sweep_interval_seconds: default_sweep_interval_seconds(),
            shutdown_grace_seconds: default_shutdown_grace_seconds(),
            logging: LoggingConfig::default(),
            supervisor: SupervisorConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file. Otherwise looks for
    /// `termcast.toml` in the current directory, falling back to compiled
    /// defaults. Returns an error instead of panicking on a missing or
    /// malformed file so callers (tests included) can report it cleanly.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut config = if let Some(p) = path {
            let content = std::fs::read_to_string(p)
                .with_context(|| format!("failed to read config file {p}"))?;
            toml::from_str(&content).with_context(|| format!("failed to parse config file {p}"))?
        } else if Path::new("termcast.toml").exists() {
            let content = std::fs::read_to_string("termcast.toml")
                .context("failed to read termcast.toml")?;
            toml::from_str(&content).context("failed to parse termcast.toml")?
        } else {
            Config::default()
        };

        if let Ok(listen) = std::env::var("TERMCAST_LISTEN_ADDRESS") {
            config.listen_address = listen;
        }
        if let Ok(dir) = std::env::var("TERMCAST_SESSION_STORAGE_DIR") {
            config.session_storage_dir = PathBuf::from(dir);
        }
        if let Ok(level) = std::env::var("TERMCAST_LOG_LEVEL") {
            config.logging.level = level;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_internally_consistent() {
        let config = Config::default();
        assert_eq!(config.listen_address, "0.0.0.0:7890");
        assert!(config.max_sessions.is_none());
        assert_eq!(config.subscriber_queue_capacity, 256);
    }

    #[test]
    fn unknown_top_level_key_is_rejected() {
        let toml = r#"
            listen_address = "0.0.0.0:9999"
            bogus_field = true
        "#;
        let result: Result<Config, _> = toml::from_str(toml);
        assert!(result.is_err());
    }

    #[test]
    fn env_override_wins_over_file_and_defaults() {
        std::env::set_var("TERMCAST_LISTEN_ADDRESS", "127.0.0.1:1234");
        let config = Config::load(None).unwrap();
        assert_eq!(config.listen_address, "127.0.0.1:1234");
        std::env::remove_var("TERMCAST_LISTEN_ADDRESS");
    }
}
