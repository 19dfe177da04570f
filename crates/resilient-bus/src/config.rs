//! Event bus configuration with validation and environment overrides.

use crate::batcher::BatcherConfig;
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::rate_limit::RateLimitConfig;
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid circuit breaker configuration: {0}")]
    InvalidCircuitBreaker(String),

    #[error("Invalid retry policy: {0}")]
    InvalidRetry(String),

    #[error("Invalid rate limit: {0}")]
    InvalidRateLimit(String),

    #[error("Invalid batcher configuration: {0}")]
    InvalidBatcher(String),

    #[error("Invalid dead letter configuration: {0}")]
    InvalidDeadLetter(String),
}

/// Main event bus configuration
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventBusConfig {
    /// Record published events in the history buffer
    pub history_enabled: bool,
    pub history_size: usize,
    /// Dead-letter events whose retries are exhausted
    pub dlq_enabled: bool,
    pub dlq_size: usize,
    /// Interval of the dead letter reprocessing loop
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub dlq_interval: Duration,
    /// Handler timeout for subscriptions that do not set one
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub default_timeout: Duration,
    /// Retry budget for subscriptions that do not set one
    pub max_retries: u32,
    /// How long `stop` waits for in-flight asynchronous dispatch
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub drain_timeout: Duration,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryPolicy,
    pub rate_limit: RateLimitConfig,
    /// Used when a batch sink is attached
    pub batcher: BatcherConfig,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            history_enabled: true,
            history_size: 1000,
            dlq_enabled: true,
            dlq_size: 1000,
            dlq_interval: Duration::from_secs(30),
            default_timeout: Duration::from_secs(30),
            max_retries: 3,
            drain_timeout: Duration::from_secs(5),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryPolicy::default(),
            rate_limit: RateLimitConfig::default(),
            batcher: BatcherConfig::default(),
        }
    }
}

impl EventBusConfig {
    /// Defaults overridden by environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `RB_HISTORY_ENABLED`, `RB_HISTORY_SIZE`
    /// - `RB_DLQ_ENABLED`, `RB_DLQ_SIZE`, `RB_DLQ_INTERVAL_MS`
    /// - `RB_DEFAULT_TIMEOUT_MS`, `RB_MAX_RETRIES`, `RB_DRAIN_TIMEOUT_MS`
    /// - `RB_CIRCUIT_ENABLED`, `RB_CIRCUIT_THRESHOLD`, `RB_CIRCUIT_TIMEOUT_MS`
    /// - `RB_RETRY_INITIAL_MS`, `RB_RETRY_MAX_MS`, `RB_RETRY_FACTOR`, `RB_RETRY_JITTER`
    /// - `RB_RATE_LIMIT_ENABLED`, `RB_RATE_LIMIT_PER_SECOND`, `RB_RATE_LIMIT_BURST`,
    ///   `RB_RATE_LIMIT_IDLE_MS`
    /// - `RB_BATCH_SIZE`, `RB_BATCH_MAX_WAIT_MS`, `RB_BATCH_FLUSH_INTERVAL_MS`
    ///
    /// Unparseable values are ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parse = |key: &str| lookup(key);
        let mut config = Self::default();

        set(&mut config.history_enabled, parse("RB_HISTORY_ENABLED").map(|v| flag(&v)));
        set(&mut config.history_size, number(parse("RB_HISTORY_SIZE")));
        set(&mut config.dlq_enabled, parse("RB_DLQ_ENABLED").map(|v| flag(&v)));
        set(&mut config.dlq_size, number(parse("RB_DLQ_SIZE")));
        set(&mut config.dlq_interval, millis(parse("RB_DLQ_INTERVAL_MS")));
        set(&mut config.default_timeout, millis(parse("RB_DEFAULT_TIMEOUT_MS")));
        set(&mut config.max_retries, number(parse("RB_MAX_RETRIES")));
        set(&mut config.drain_timeout, millis(parse("RB_DRAIN_TIMEOUT_MS")));

        let cb = &mut config.circuit_breaker;
        set(&mut cb.enabled, parse("RB_CIRCUIT_ENABLED").map(|v| flag(&v)));
        set(&mut cb.failure_threshold, number(parse("RB_CIRCUIT_THRESHOLD")));
        set(&mut cb.timeout, millis(parse("RB_CIRCUIT_TIMEOUT_MS")));

        let retry = &mut config.retry;
        set(&mut retry.initial_delay, millis(parse("RB_RETRY_INITIAL_MS")));
        set(&mut retry.max_delay, millis(parse("RB_RETRY_MAX_MS")));
        set(&mut retry.backoff_factor, number(parse("RB_RETRY_FACTOR")));
        set(&mut retry.jitter, parse("RB_RETRY_JITTER").map(|v| flag(&v)));

        let rate = &mut config.rate_limit;
        set(&mut rate.enabled, parse("RB_RATE_LIMIT_ENABLED").map(|v| flag(&v)));
        set(&mut rate.per_second, number(parse("RB_RATE_LIMIT_PER_SECOND")));
        set(&mut rate.burst, number(parse("RB_RATE_LIMIT_BURST")));
        set(&mut rate.idle_timeout, millis(parse("RB_RATE_LIMIT_IDLE_MS")));

        let batcher = &mut config.batcher;
        set(&mut batcher.max_batch_size, number(parse("RB_BATCH_SIZE")));
        set(&mut batcher.max_wait, millis(parse("RB_BATCH_MAX_WAIT_MS")));
        set(&mut batcher.flush_interval, millis(parse("RB_BATCH_FLUSH_INTERVAL_MS")));

        config
    }

    /// Validate configuration. Called by `EventBus::start`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dlq_enabled && self.dlq_interval.is_zero() {
            return Err(ConfigError::InvalidDeadLetter(
                "dlq_interval cannot be 0".into(),
            ));
        }

        if self.circuit_breaker.enabled && self.circuit_breaker.failure_threshold == 0 {
            return Err(ConfigError::InvalidCircuitBreaker(
                "failure_threshold cannot be 0".into(),
            ));
        }

        if !self.retry.backoff_factor.is_finite() || self.retry.backoff_factor < 0.0 {
            return Err(ConfigError::InvalidRetry(
                "backoff_factor must be a non-negative number".into(),
            ));
        }
        if self.retry.initial_delay > self.retry.max_delay {
            return Err(ConfigError::InvalidRetry(
                "initial_delay cannot exceed max_delay".into(),
            ));
        }

        if self.rate_limit.enabled && self.rate_limit.per_second == 0 {
            return Err(ConfigError::InvalidRateLimit(
                "per_second cannot be 0".into(),
            ));
        }
        if self.rate_limit.enabled && self.rate_limit.idle_timeout.is_zero() {
            return Err(ConfigError::InvalidRateLimit(
                "idle_timeout cannot be 0".into(),
            ));
        }

        if self.batcher.max_batch_size == 0 {
            return Err(ConfigError::InvalidBatcher(
                "max_batch_size cannot be 0".into(),
            ));
        }
        if self.batcher.flush_interval.is_zero() {
            return Err(ConfigError::InvalidBatcher(
                "flush_interval cannot be 0".into(),
            ));
        }

        Ok(())
    }
}

fn set<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}

fn flag(value: &str) -> bool {
    value.to_lowercase() == "true" || value == "1"
}

fn number<T: FromStr>(value: Option<String>) -> Option<T> {
    value.and_then(|v| v.trim().parse().ok())
}

fn millis(value: Option<String>) -> Option<Duration> {
    number::<u64>(value).map(Duration::from_millis)
}
