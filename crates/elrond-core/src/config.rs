//! Server configuration.
//!
//! Loaded from an optional TOML file; the server binary layers CLI flag
//! overrides on top. Timing constants are configuration rather than
//! hard-coded so tests can compress them.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Errors loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top-level server configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ElrondConfig {
    /// Interface and port the HTTP API listens on.
    pub listen: String,

    /// Path of the SQLite database backing the server.
    pub database: PathBuf,

    /// Interval in seconds between supervisor ticks. 0 disables the
    /// periodic tick; supervisors then run only when poked by the API.
    pub poll_seconds: u64,

    /// Whether this instance runs the ring supervisor.
    pub ring_supervisor: bool,

    /// Whether this instance runs the installation group supervisor.
    pub installation_group_supervisor: bool,

    /// Value reported as `Environment` in webhook payload extra data.
    pub environment: String,

    /// Base URL of the external provisioner API.
    pub provisioner_server: String,

    /// Seconds to wait for a provisioner group release to converge.
    pub provisioner_group_release_timeout_seconds: u64,

    /// Seconds between provisioner group status polls.
    pub provisioner_poll_seconds: u64,

    /// Seconds a release-pending installation group may stay locked with
    /// no legitimate reason before the lock is reclaimed.
    pub stale_lock_threshold_seconds: u64,

    /// Seconds the ring supervisor sleeps between soak checks.
    pub soak_check_sleep_seconds: u64,

    /// Prometheus-compatible endpoint for SLO queries. Unset skips the
    /// SLO gate.
    pub slo_endpoint: Option<String>,

    /// Grafana base URL for release annotations. Unset disables the
    /// annotation sink.
    pub grafana_url: Option<String>,

    /// Grafana API tokens, one annotation is posted per token.
    pub grafana_tokens: Vec<String>,
}

impl Default for ElrondConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:3018".to_string(),
            database: PathBuf::from("elrond.db"),
            poll_seconds: 30,
            ring_supervisor: true,
            installation_group_supervisor: true,
            environment: String::new(),
            provisioner_server: "http://localhost:8075".to_string(),
            provisioner_group_release_timeout_seconds: 3600,
            provisioner_poll_seconds: 60,
            stale_lock_threshold_seconds: 300,
            soak_check_sleep_seconds: 30,
            slo_endpoint: None,
            grafana_url: None,
            grafana_tokens: Vec::new(),
        }
    }
}

impl ElrondConfig {
    /// Loads configuration from the given TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_seconds)
    }

    #[must_use]
    pub fn provisioner_group_release_timeout(&self) -> Duration {
        Duration::from_secs(self.provisioner_group_release_timeout_seconds)
    }

    #[must_use]
    pub fn provisioner_poll_interval(&self) -> Duration {
        Duration::from_secs(self.provisioner_poll_seconds)
    }

    #[must_use]
    pub fn stale_lock_threshold(&self) -> Duration {
        Duration::from_secs(self.stale_lock_threshold_seconds)
    }

    #[must_use]
    pub fn soak_check_sleep(&self) -> Duration {
        Duration::from_secs(self.soak_check_sleep_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_server_conventions() {
        let config = ElrondConfig::default();
        assert_eq!(config.listen, "0.0.0.0:3018");
        assert_eq!(config.poll_seconds, 30);
        assert_eq!(config.provisioner_group_release_timeout_seconds, 3600);
        assert_eq!(config.provisioner_poll_seconds, 60);
        assert_eq!(config.stale_lock_threshold_seconds, 300);
        assert!(config.slo_endpoint.is_none());
    }

    #[test]
    fn partial_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "listen = \"127.0.0.1:4000\"\npoll_seconds = 5\nslo_endpoint = \"http://thanos:9090\""
        )
        .unwrap();

        let config = ElrondConfig::from_file(file.path()).unwrap();
        assert_eq!(config.listen, "127.0.0.1:4000");
        assert_eq!(config.poll_seconds, 5);
        assert_eq!(config.slo_endpoint.as_deref(), Some("http://thanos:9090"));
        // Untouched fields keep their defaults.
        assert_eq!(config.provisioner_poll_seconds, 60);
    }
}
