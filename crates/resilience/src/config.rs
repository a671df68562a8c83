//! Engine configuration.

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::circuit_breaker::BreakerConfig;
use crate::dead_letter::DeadLetterPolicy;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

/// Resilience engine tuning.
///
/// Durations are whole seconds when loaded from the environment.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ResilienceConfig {
    pub failure_threshold: u32,
    pub open_timeout: Duration,
    pub breaker_sweep_interval: Duration,
    pub dead_letter_sweep_interval: Duration,
    pub max_job_age: Duration,
    /// Failed sweep re-enqueues before an entry is marked exhausted.
    pub max_sweep_attempts: u32,
    /// Dead letters loaded from the store on startup.
    pub hydrate_limit: usize,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(60),
            breaker_sweep_interval: Duration::from_secs(30),
            dead_letter_sweep_interval: Duration::from_secs(60),
            max_job_age: Duration::from_secs(24 * 60 * 60),
            max_sweep_attempts: 5,
            hydrate_limit: 1_000,
        }
    }
}

impl ResilienceConfig {
    /// Load from `ANGELHUB_*` environment variables, defaulting what is unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(v) = parse(&lookup, "ANGELHUB_BREAKER_FAILURE_THRESHOLD")? {
            cfg.failure_threshold = v;
        }
        if let Some(v) = parse_secs(&lookup, "ANGELHUB_BREAKER_OPEN_TIMEOUT_SECS")? {
            cfg.open_timeout = v;
        }
        if let Some(v) = parse_secs(&lookup, "ANGELHUB_BREAKER_SWEEP_INTERVAL_SECS")? {
            cfg.breaker_sweep_interval = v;
        }
        if let Some(v) = parse_secs(&lookup, "ANGELHUB_DLQ_SWEEP_INTERVAL_SECS")? {
            cfg.dead_letter_sweep_interval = v;
        }
        if let Some(v) = parse_secs(&lookup, "ANGELHUB_DLQ_MAX_JOB_AGE_SECS")? {
            cfg.max_job_age = v;
        }
        if let Some(v) = parse(&lookup, "ANGELHUB_DLQ_MAX_SWEEP_ATTEMPTS")? {
            cfg.max_sweep_attempts = v;
        }
        if let Some(v) = parse(&lookup, "ANGELHUB_DLQ_HYDRATE_LIMIT")? {
            cfg.hydrate_limit = v;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values the engine cannot run with: zero thresholds, budgets or
    /// sweep intervals.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let zero_checks = [
            ("ANGELHUB_BREAKER_FAILURE_THRESHOLD", self.failure_threshold == 0),
            ("ANGELHUB_BREAKER_SWEEP_INTERVAL_SECS", self.breaker_sweep_interval.is_zero()),
            ("ANGELHUB_DLQ_SWEEP_INTERVAL_SECS", self.dead_letter_sweep_interval.is_zero()),
            ("ANGELHUB_DLQ_MAX_SWEEP_ATTEMPTS", self.max_sweep_attempts == 0),
            ("ANGELHUB_DLQ_HYDRATE_LIMIT", self.hydrate_limit == 0),
        ];
        match zero_checks.into_iter().find(|(_, is_zero)| *is_zero) {
            Some((key, _)) => Err(ConfigError::Invalid {
                key,
                value: "0".to_string(),
            }),
            None => Ok(()),
        }
    }

    pub fn breaker(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.failure_threshold,
            open_timeout: self.open_timeout,
        }
    }

    pub fn dead_letter_policy(&self) -> DeadLetterPolicy {
        DeadLetterPolicy {
            max_job_age: self.max_job_age,
        }
    }
}

fn parse<F, T>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}

fn parse_secs<F>(lookup: &F, key: &'static str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(parse::<F, u64>(lookup, key)?.map(Duration::from_secs))
}
