//! # Reprocessor Configuration
//!
//! Layered configuration for the reprocessing loop, the task fan-out, the Postgres
//! work source and logging.
//!
//! ## Sources (later layers win)
//!
//! 1. Built-in defaults ([`ReprocessorConfig::default`])
//! 2. `<config_dir>/reprocessor.toml`
//! 3. `<config_dir>/reprocessor.<environment>.toml`
//! 4. Environment variables shaped `REPROCESSOR__<SECTION>__<KEY>`
//!
//! ## Usage
//!
//! ```rust,no_run
//! use reprocessor_core::config::ConfigManager;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let reprocessing = &manager.config().reprocessing;
//! println!("claiming {} items at a time", reprocessing.max_results_to_load);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod loader;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::constants;
use crate::fan_out::DetachMode;
use crate::retry_policy::RetryPolicy;

pub use error::{ConfigResult, ConfigurationError};
pub use loader::ConfigManager;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ReprocessorConfig {
    /// Claim-and-dispatch loop settings
    pub reprocessing: ReprocessingConfig,
    /// Detached child task settings
    pub fan_out: FanOutConfig,
    /// Postgres-backed work source settings
    pub work_source: WorkSourceConfig,
    /// Log level and output format
    pub logging: LoggingConfig,
}

/// Reprocessing loop configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ReprocessingConfig {
    pub max_results_to_load: usize,
    pub max_concurrent: usize,
    /// Pause after an empty claim; 0 re-polls immediately
    pub empty_poll_interval_ms: u64,
    /// Per-item processing deadline; unset means no deadline
    pub item_timeout_ms: Option<u64>,
    /// Backoff applied when `claim_batch` fails
    pub claim_retry: RetryPolicy,
}

impl Default for ReprocessingConfig {
    fn default() -> Self {
        Self {
            max_results_to_load: constants::reprocessing::MAX_RESULTS_TO_LOAD,
            max_concurrent: constants::reprocessing::MAX_CONCURRENT,
            empty_poll_interval_ms: constants::reprocessing::EMPTY_POLL_INTERVAL_MS,
            item_timeout_ms: None,
            claim_retry: RetryPolicy::claim_retry_default(),
        }
    }
}

impl ReprocessingConfig {
    pub fn empty_poll_interval(&self) -> Duration {
        Duration::from_millis(self.empty_poll_interval_ms)
    }

    pub fn item_timeout(&self) -> Option<Duration> {
        self.item_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_results_to_load == 0 {
            return Err(ConfigurationError::invalid_value(
                "reprocessing.max_results_to_load",
                "0",
                "batch size must be greater than 0",
            ));
        }
        if self.max_concurrent == 0 {
            return Err(ConfigurationError::invalid_value(
                "reprocessing.max_concurrent",
                "0",
                "admission ceiling must be greater than 0",
            ));
        }
        if self.item_timeout_ms == Some(0) {
            return Err(ConfigurationError::invalid_value(
                "reprocessing.item_timeout_ms",
                "0",
                "omit the timeout instead of setting it to 0",
            ));
        }
        self.claim_retry
            .validate()
            .map_err(|e| ConfigurationError::invalid_retry_policy("reprocessing.claim_retry", e))
    }
}

/// Task fan-out configuration
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FanOutConfig {
    /// Registered child task launched for every unit
    pub task_ref: String,
    /// Deadline for a whole child execution, retries included
    pub execution_timeout_seconds: u64,
    pub retry: RetryPolicy,
    pub detach_mode: DetachMode,
    /// Relaunches of a completed key inside this window are deduplicated
    pub completed_dedup_window_seconds: u64,
    /// Terminal child records older than this are pruned
    pub terminal_retention_seconds: u64,
}

impl Default for FanOutConfig {
    fn default() -> Self {
        Self {
            task_ref: "process_unit".to_string(),
            execution_timeout_seconds: constants::fan_out::EXECUTION_TIMEOUT_SECONDS,
            retry: RetryPolicy::default(),
            detach_mode: DetachMode::Abandon,
            completed_dedup_window_seconds: constants::fan_out::COMPLETED_DEDUP_WINDOW_SECONDS,
            terminal_retention_seconds: constants::fan_out::TERMINAL_RETENTION_SECONDS,
        }
    }
}

impl FanOutConfig {
    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_seconds)
    }

    pub fn completed_dedup_window(&self) -> Duration {
        Duration::from_secs(self.completed_dedup_window_seconds)
    }

    pub fn terminal_retention(&self) -> Duration {
        Duration::from_secs(self.terminal_retention_seconds)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        if self.task_ref.trim().is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "fan_out.task_ref",
                "fan-out configuration",
            ));
        }
        if self.execution_timeout_seconds == 0 {
            return Err(ConfigurationError::invalid_value(
                "fan_out.execution_timeout_seconds",
                "0",
                "execution timeout must be greater than 0",
            ));
        }
        if self.terminal_retention_seconds < self.completed_dedup_window_seconds {
            return Err(ConfigurationError::invalid_value(
                "fan_out.terminal_retention_seconds",
                self.terminal_retention_seconds.to_string(),
                "retention must cover the completed dedup window",
            ));
        }
        self.retry
            .validate()
            .map_err(|e| ConfigurationError::invalid_retry_policy("fan_out.retry", e))
    }
}

/// Postgres work source configuration.
///
/// `claimable_predicate` is trusted SQL spliced into the claim query; the
/// identifiers are validated.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkSourceConfig {
    pub database_url: Option<String>,
    pub table: String,
    pub id_column: String,
    pub touched_column: String,
    pub claimable_predicate: String,
    /// Seconds a claim keeps an item from being selected again
    pub lease_seconds: u64,
    pub max_connections: u32,
}

impl Default for WorkSourceConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            table: "work_items".to_string(),
            id_column: constants::work_source::ID_COLUMN.to_string(),
            touched_column: constants::work_source::TOUCHED_COLUMN.to_string(),
            claimable_predicate: "TRUE".to_string(),
            lease_seconds: constants::work_source::LEASE_SECONDS,
            max_connections: 5,
        }
    }
}

impl WorkSourceConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_seconds)
    }

    pub fn validate(&self) -> ConfigResult<()> {
        for (field, value) in [
            ("work_source.table", &self.table),
            ("work_source.id_column", &self.id_column),
            ("work_source.touched_column", &self.touched_column),
        ] {
            if !is_safe_identifier(value) {
                return Err(ConfigurationError::invalid_value(
                    field,
                    value.as_str(),
                    "expected a plain SQL identifier, optionally schema-qualified",
                ));
            }
        }
        if self.claimable_predicate.trim().is_empty() {
            return Err(ConfigurationError::missing_required_field(
                "work_source.claimable_predicate",
                "work source configuration",
            ));
        }
        if self.claimable_predicate.contains(';') {
            return Err(ConfigurationError::invalid_value(
                "work_source.claimable_predicate",
                self.claimable_predicate.as_str(),
                "predicate must be a single SQL expression",
            ));
        }
        if self.max_connections == 0 {
            return Err(ConfigurationError::invalid_value(
                "work_source.max_connections",
                "0",
                "pool size must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; falls back to the environment default
    pub level: Option<String>,
    pub format: LogFormat,
}

impl LoggingConfig {
    /// Effective filter directive for an environment
    pub fn level_for(&self, environment: &str) -> String {
        if let Some(level) = &self.level {
            return level.clone();
        }
        match environment {
            "production" => "info".to_string(),
            _ => "debug".to_string(),
        }
    }
}

impl ReprocessorConfig {
    /// Validate every section
    pub fn validate(&self) -> ConfigResult<()> {
        self.reprocessing.validate()?;
        self.fan_out.validate()?;
        self.work_source.validate()?;
        Ok(())
    }
}

/// `name` or `schema.name`, ASCII letters, digits and underscores only
pub(crate) fn is_safe_identifier(value: &str) -> bool {
    let parts: Vec<&str> = value.split('.').collect();
    if parts.is_empty() || parts.len() > 2 {
        return false;
    }
    parts.iter().all(|part| {
        let mut chars = part.chars();
        match chars.next() {
            Some(first) if first.is_ascii_alphabetic() || first == '_' => {
                chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
            }
            _ => false,
        }
    })
}
