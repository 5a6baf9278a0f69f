//! Orchestrator configuration
//!
//! Every component receives its limits through these structs at construction.
//! Nothing in the library reads the environment on its own; `Settings::from_env`
//! exists for the binary.

use crate::error::{FleetError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Platform limit on workspaces named by a single cross-workspace query.
pub const DEFAULT_MAX_FANOUT: usize = 20;

/// Fan-out engine limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FanoutConfig {
    /// Maximum workspaces per grouped call
    pub max_fanout: usize,

    /// Concurrent individual calls while a batch is degraded
    pub fallback_workers: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            max_fanout: DEFAULT_MAX_FANOUT,
            fallback_workers: 8,
        }
    }
}

/// Linear backoff schedule for transient remote failures
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub step_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 1_000,
            step_delay_ms: 2_000,
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts. Used by tests and dry runs.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay_ms: 0,
            step_delay_ms: 0,
        }
    }

    /// Delay after the failed attempt with zero-based index `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let step = self.step_delay_ms.saturating_mul(u64::from(attempt));
        Duration::from_millis(self.base_delay_ms.saturating_add(step))
    }
}

/// Ingestion scheduler limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestConfig {
    pub max_workers: usize,

    /// How often a progress line is logged while jobs are outstanding
    pub progress_interval_ms: u64,

    /// Failure log lines are cut to this many characters
    pub error_excerpt_chars: usize,

    /// Shuffle jobs before submission
    pub shuffle: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_workers: 6,
            progress_interval_ms: 30_000,
            error_excerpt_chars: 300,
            shuffle: true,
        }
    }
}

impl IngestConfig {
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms.max(1))
    }
}

/// Top-level settings for the binary and for wiring components together
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub fanout: FanoutConfig,
    pub retry: RetryPolicy,
    pub ingest: IngestConfig,

    /// Per remote call time budget
    pub remote_timeout_ms: u64,

    /// TTL for memoized remote calls
    pub cache_ttl_secs: u64,

    /// Base URL for `kql://` query references
    pub kql_base_url: Option<String>,

    /// Directory holding `kql/` query references
    pub kql_dir: PathBuf,

    /// `<cluster url>/<database>` that ingestion statements run against
    pub data_explorer: Option<String>,

    /// Bearer token for the cluster; taken from the `az` session when unset
    #[serde(default, skip_serializing)]
    pub data_explorer_token: Option<String>,

    pub log_level: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            fanout: FanoutConfig::default(),
            retry: RetryPolicy::default(),
            ingest: IngestConfig::default(),
            remote_timeout_ms: 300_000,
            cache_ttl_secs: 60,
            kql_base_url: None,
            kql_dir: PathBuf::from("."),
            data_explorer: None,
            data_explorer_token: None,
            log_level: "info".to_string(),
        }
    }
}

impl Settings {
    /// Build settings from environment variables, falling back to defaults.
    pub fn from_env() -> Result<Self> {
        let defaults = Settings::default();
        let settings = Self {
            fanout: FanoutConfig {
                max_fanout: env_or("FLEET_MAX_FANOUT", defaults.fanout.max_fanout)?,
                fallback_workers: env_or(
                    "FLEET_FALLBACK_WORKERS",
                    defaults.fanout.fallback_workers,
                )?,
            },
            retry: RetryPolicy {
                max_attempts: env_or("FLEET_RETRY_MAX_ATTEMPTS", defaults.retry.max_attempts)?,
                base_delay_ms: env_or("FLEET_RETRY_BASE_MS", defaults.retry.base_delay_ms)?,
                step_delay_ms: env_or("FLEET_RETRY_STEP_MS", defaults.retry.step_delay_ms)?,
            },
            ingest: IngestConfig {
                max_workers: env_or("FLEET_INGEST_WORKERS", defaults.ingest.max_workers)?,
                progress_interval_ms: env_or(
                    "FLEET_PROGRESS_INTERVAL_MS",
                    defaults.ingest.progress_interval_ms,
                )?,
                ..defaults.ingest
            },
            remote_timeout_ms: env_or("FLEET_REMOTE_TIMEOUT_MS", defaults.remote_timeout_ms)?,
            cache_ttl_secs: env_or("FLEET_CACHE_TTL_SECS", defaults.cache_ttl_secs)?,
            kql_base_url: std::env::var("KQL_BASEURL").ok().filter(|v| !v.is_empty()),
            kql_dir: std::env::var("FLEET_KQL_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.kql_dir),
            data_explorer: std::env::var("AZURE_DATAEXPLORER").ok().filter(|v| !v.is_empty()),
            data_explorer_token: std::env::var("AZURE_DATAEXPLORER_TOKEN")
                .ok()
                .filter(|v| !v.is_empty()),
            log_level: std::env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.fanout.max_fanout == 0 {
            return Err(FleetError::Config("max_fanout must be at least 1".to_string()));
        }
        if self.fanout.fallback_workers == 0 {
            return Err(FleetError::Config("fallback_workers must be at least 1".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(FleetError::Config("retry max_attempts must be at least 1".to_string()));
        }
        if self.ingest.max_workers == 0 {
            return Err(FleetError::Config("ingest max_workers must be at least 1".to_string()));
        }
        if let Some(setting) = &self.data_explorer {
            if !setting.trim_end_matches('/').contains('/') {
                return Err(FleetError::Config(format!(
                    "AZURE_DATAEXPLORER must be <cluster url>/<database>, got {}",
                    setting
                )));
            }
        }
        Ok(())
    }

    pub fn remote_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_timeout_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

fn env_or<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|e| FleetError::Config(format!("{}={:?}: {}", key, raw, e))),
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_schedule_is_linear() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(1), Duration::from_secs(3));
        assert_eq!(policy.delay_for(4), Duration::from_secs(9));
    }

    #[test]
    fn test_defaults_match_platform_limits() {
        let settings = Settings::default();
        assert_eq!(settings.fanout.max_fanout, 20);
        assert_eq!(settings.fanout.fallback_workers, 8);
        assert_eq!(settings.retry.max_attempts, 5);
        assert_eq!(settings.ingest.max_workers, 6);
        assert_eq!(settings.ingest.error_excerpt_chars, 300);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_limits() {
        let mut settings = Settings::default();
        settings.fanout.max_fanout = 0;
        assert!(matches!(settings.validate(), Err(FleetError::Config(_))));

        let mut settings = Settings::default();
        settings.ingest.max_workers = 0;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.data_explorer = Some("fleet-cluster".to_string());
        assert!(matches!(settings.validate(), Err(FleetError::Config(_))));
        settings.data_explorer = Some("https://fleet.kusto.windows.net/SecOps".to_string());
        assert!(settings.validate().is_ok());
    }
}
