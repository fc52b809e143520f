//! Worker configuration
//!
//! Values come from an optional TOML file, then environment variables, then
//! command-line flags, each layer overriding the one before it.

use std::path::{Path, PathBuf};

use oncall_coordination::{ExecutorConfig, SchedulerConfig};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value for {name}: {value:?}")]
    InvalidVar { name: String, value: String },

    #[error("{0} is not set")]
    Missing(&'static str),

    #[error("invalid scheduler settings: {0}")]
    Invalid(String),
}

/// Outbound notification provider
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// Endpoint receiving one POST per page; pages are only logged when unset
    pub webhook_url: Option<String>,
    /// Sent as a bearer token
    pub webhook_token: Option<String>,
    pub timeout_secs: u64,
    /// Outbox entries re-sent per tick
    pub retry_batch_size: usize,
    /// Attempts before a delivery is abandoned, counting the first send
    pub max_attempts: u32,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            webhook_token: None,
            timeout_secs: 10,
            retry_batch_size: 100,
            max_attempts: 3,
        }
    }
}

impl NotifyConfig {
    pub fn timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.timeout_secs)
    }
}

/// Which SQL housekeeping sweeps run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub auto_unsnooze: bool,
    pub stale_token_cleanup: bool,
    pub sla_breach_check: bool,
    pub daily_rollup: bool,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            auto_unsnooze: true,
            stale_token_cleanup: true,
            sla_breach_check: true,
            daily_rollup: true,
        }
    }
}

/// Everything the worker process needs
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub database_url: Option<String>,
    /// Create the worker-owned tables on boot
    pub apply_schema: bool,
    pub notify: NotifyConfig,
    pub sweeps: SweepConfig,
    pub scheduler: SchedulerConfig,
    pub executor: ExecutorConfig,
}

impl WorkerConfig {
    /// Load from an optional TOML file, then apply process environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.with_env_overrides(|key| std::env::var(key).ok())
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `DATABASE_URL`, `NOTIFY_WEBHOOK_*` and `CRON_*` variables
    pub fn with_env_overrides(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = lookup("DATABASE_URL") {
            self.database_url = Some(url);
        }
        if let Some(url) = lookup("NOTIFY_WEBHOOK_URL") {
            self.notify.webhook_url = Some(url);
        }
        if let Some(token) = lookup("NOTIFY_WEBHOOK_TOKEN") {
            self.notify.webhook_token = Some(token);
        }

        let scheduler = &mut self.scheduler;
        override_num(&lookup, "CRON_MIN_DELAY_SECS", &mut scheduler.min_delay_secs)?;
        override_num(&lookup, "CRON_MAX_DELAY_SECS", &mut scheduler.max_delay_secs)?;
        override_num(&lookup, "CRON_LOCK_RETRY_SECS", &mut scheduler.lock_retry_secs)?;
        override_num(&lookup, "CRON_STALE_LOCK_SECS", &mut scheduler.stale_lock_secs)?;
        override_num(&lookup, "CRON_BATCH_SIZE", &mut scheduler.escalation_batch_size)?;
        override_num(
            &lookup,
            "CRON_MAX_ESCALATIONS_PER_PASS",
            &mut scheduler.max_escalations_per_pass,
        )?;
        override_num(
            &lookup,
            "CRON_INVALID_TARGET_RETRY_SECS",
            &mut self.executor.invalid_target_retry_secs,
        )?;

        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scheduler.validate().map_err(ConfigError::Invalid)?;
        if self.notify.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "notify.max_attempts must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::Missing("DATABASE_URL"))
    }
}

fn override_num<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    slot: &mut T,
) -> Result<(), ConfigError> {
    if let Some(value) = lookup(name) {
        *slot = value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidVar {
                name: name.to_string(),
                value,
            })?;
    }
    Ok(())
}
