//! Typed engine configuration.
//!
//! Every section has defaults; `EngineConfig::from_env` overrides them from
//! `JOBFLOW_*` environment variables. In local dev, call
//! `dotenvy::dotenv().ok()` before loading.

use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, EngineError};
use crate::queue::{Backoff, RetryPolicy};

/// Queue behaviour. Immutable once handed to a `Queue`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Global ceiling on simultaneously processing jobs.
    pub max_concurrency: usize,
    /// Used when `JobOptions::max_retries` is not given.
    pub default_max_retries: u32,
    /// Base delay for the retry backoff.
    pub retry_delay_base_ms: u64,
    pub health_check_interval_ms: u64,
    pub backoff: Backoff,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            default_max_retries: 3,
            retry_delay_base_ms: 1_000,
            health_check_interval_ms: 30_000,
            backoff: Backoff::Linear,
        }
    }
}

impl QueueConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.retry_delay_base_ms),
            backoff: self.backoff,
        }
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_concurrency == 0 {
            return Err(EngineError::InvalidConfig(
                "max_concurrency must be at least 1".to_string(),
            ));
        }
        if let Backoff::Exponential { multiplier } = self.backoff
            && !(multiplier.is_finite() && multiplier >= 1.0)
        {
            return Err(EngineError::InvalidConfig(format!(
                "exponential backoff multiplier must be >= 1.0, got {multiplier}"
            )));
        }
        Ok(())
    }
}

/// Thresholds for health verdicts and retention sizes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Pending jobs at or above this count make the engine unhealthy.
    pub max_queue_size: usize,
    /// `failed / (failed + completed)` at or above this ratio is unhealthy.
    pub max_failure_rate: f64,
    pub history_capacity: usize,
    pub sample_capacity: usize,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 1_000,
            max_failure_rate: 0.10,
            history_capacity: 1_000,
            sample_capacity: 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Reported as `service` on every log line.
    pub service_name: String,
    pub queue: QueueConfig,
    pub monitoring: MonitoringConfig,
    /// Per-step delay of the built-in simulated workflow.
    pub simulated_step_delay_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            service_name: "jobflow".to_string(),
            queue: QueueConfig::default(),
            monitoring: MonitoringConfig::default(),
            simulated_step_delay_ms: 100,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `JOBFLOW_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(name) = lookup("JOBFLOW_SERVICE_NAME") {
            config.service_name = name;
        }
        if let Some(v) = parse_var(&lookup, "JOBFLOW_MAX_CONCURRENCY")? {
            config.queue.max_concurrency = v;
        }
        if let Some(v) = parse_var(&lookup, "JOBFLOW_DEFAULT_MAX_RETRIES")? {
            config.queue.default_max_retries = v;
        }
        if let Some(v) = parse_var(&lookup, "JOBFLOW_RETRY_DELAY_BASE_MS")? {
            config.queue.retry_delay_base_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "JOBFLOW_HEALTH_CHECK_INTERVAL_MS")? {
            config.queue.health_check_interval_ms = v;
        }
        if let Some(v) = parse_var(&lookup, "JOBFLOW_SIMULATED_STEP_DELAY_MS")? {
            config.simulated_step_delay_ms = v;
        }

        Ok(config)
    }
}

fn parse_var<F, T>(lookup: &F, var: &str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: Display,
{
    let Some(value) = lookup(var) else {
        return Ok(None);
    };
    let parsed = value.trim().parse::<T>();
    match parsed {
        Ok(parsed) => Ok(Some(parsed)),
        Err(e) => Err(ConfigError::InvalidValue {
            var: var.to_string(),
            value,
            reason: e.to_string(),
        }),
    }
}
