//! Orchestrator configuration.
//!
//! Loaded from a TOML file and/or the environment. Every field has a default
//! so an empty file is a valid configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ShipwrightError};
use crate::testrun::TestSettings;

/// Timeouts and polling of the remote execution channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Deadline for the start marker to appear
    pub connect_timeout_secs: u64,
    /// Execution deadline when the caller does not pass one
    pub default_timeout_secs: u64,
    pub poll_interval_ms: u64,
    /// Give up waiting for exit this long after the stop marker was seen
    pub stop_marker_grace_secs: u64,
    /// Wait for a missing stop marker this long after the process exited
    pub exit_grace_secs: u64,
    /// Suggested backoff for connection timeouts and handshake failures
    pub connection_retry_delay_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 60,
            default_timeout_secs: 6 * 3600,
            poll_interval_ms: 50,
            stop_marker_grace_secs: 10,
            exit_grace_secs: 5,
            connection_retry_delay_secs: 20,
        }
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn connection_retry_delay(&self) -> Duration {
        Duration::from_secs(self.connection_retry_delay_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    /// Suggested delay when a named lock is held elsewhere
    pub retry_delay_secs: u64,
    /// Lifetime of a lease in the shared store; outlives the longest command
    pub lease_ttl_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            retry_delay_secs: 5,
            lease_ttl_secs: 8 * 3600,
        }
    }
}

impl LockConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub poll_interval_ms: u64,
    pub max_jobs_per_tick: usize,
    /// Stop branch instances nobody touched for this long
    pub branch_idle_hours: i64,
    /// Attempts before a job is marked failed
    pub max_attempts: u32,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            max_jobs_per_tick: 8,
            branch_idle_hours: 2,
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TicketConfig {
    /// Endpoint receiving state notifications and comments as JSON
    pub webhook_url: Option<String>,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub session: SessionConfig,
    pub tests: TestSettings,
    pub locks: LockConfig,
    pub worker: WorkerConfig,
    pub ticket: TicketConfig,
}

impl OrchestratorConfig {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| ShipwrightError::Validation(format!("invalid config: {e}")))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// File named by `SHIPWRIGHT_CONFIG` (defaults otherwise), then env overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var("SHIPWRIGHT_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Apply `SHIPWRIGHT_*` overrides.
    pub fn apply_env(&mut self) {
        if let Some(secs) = std::env::var("SHIPWRIGHT_SESSION_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            self.session.default_timeout_secs = secs;
        }
        if let Ok(url) = std::env::var("SHIPWRIGHT_TICKET_WEBHOOK") {
            if !url.is_empty() {
                self.ticket.webhook_url = Some(url);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let cfg = OrchestratorConfig::from_toml_str("").unwrap();
        assert_eq!(cfg, OrchestratorConfig::default());
        assert_eq!(cfg.session.connect_timeout_secs, 60);
        assert_eq!(cfg.session.default_timeout_secs, 21_600);
        assert_eq!(cfg.tests.timeout_secs, 600);
        assert_eq!(cfg.tests.retry_count, 3);
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg = OrchestratorConfig::from_toml_str(
            r#"
            [session]
            poll_interval_ms = 10

            [tests]
            robot_parallel = "1,4"

            [ticket]
            webhook_url = "http://tickets.local/hook"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.session.poll_interval_ms, 10);
        assert_eq!(cfg.session.exit_grace_secs, 5);
        assert_eq!(cfg.tests.robot_parallel, "1,4");
        assert_eq!(cfg.tests.hash_workers, 4);
        assert_eq!(
            cfg.ticket.webhook_url.as_deref(),
            Some("http://tickets.local/hook")
        );
    }

    #[test]
    fn malformed_file_is_validation_error() {
        let err = OrchestratorConfig::from_toml_str("[session\n").unwrap_err();
        assert!(matches!(err, ShipwrightError::Validation(_)));
    }
}
