//! # Retry Policy
//!
//! Backoff calculator for failed handler invocations.
//!
//! ```text
//! delay(attempt) = min(initial_delay * attempt * backoff_factor, max_delay)
//! ```
//!
//! With jitter enabled the result is perturbed by up to ±10% and clamped to
//! `max_delay`, which spreads retries of subscribers that failed together.

use crate::error::BusError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Maximum relative perturbation applied by jitter.
pub const JITTER_RATIO: f64 = 0.1;

#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay unit for the first retry.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub initial_delay: Duration,
    /// Upper bound for any computed delay.
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_delay: Duration,
    /// Multiplier applied on top of the linear attempt growth.
    pub backoff_factor: f64,
    /// Perturb delays by up to ±10%.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy without jitter, used where timings must be reproducible.
    #[must_use]
    pub fn fixed(initial_delay: Duration, max_delay: Duration, backoff_factor: f64) -> Self {
        Self {
            initial_delay,
            max_delay,
            backoff_factor,
            jitter: false,
        }
    }

    /// Deterministic delay before retry number `attempt` (1-based).
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.max(0.0);
        let nanos = self.initial_delay.as_nanos() as f64 * f64::from(attempt) * factor;
        let max = self.max_delay.as_nanos() as f64;
        if !nanos.is_finite() || nanos >= max {
            return self.max_delay;
        }
        Duration::from_nanos(nanos as u64)
    }

    /// Delay before retry number `attempt`, jittered when enabled.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if !self.jitter || base.is_zero() {
            return base;
        }

        let offset = rand::thread_rng().gen_range(-JITTER_RATIO..=JITTER_RATIO);
        let jittered = base.as_secs_f64() * (1.0 + offset);
        Duration::from_secs_f64(jittered.max(0.0)).min(self.max_delay)
    }
}

/// Sleep for `delay`, returning early with `Cancelled` if `ctx` fires.
pub async fn backoff(ctx: &CancellationToken, delay: Duration) -> Result<(), BusError> {
    tokio::select! {
        biased;
        _ = ctx.cancelled() => Err(BusError::Cancelled),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}
