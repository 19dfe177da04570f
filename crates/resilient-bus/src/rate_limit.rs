//! Per-event-type rate limiting using a token bucket.
//!
//! Each event type gets its own bucket, created lazily on first publish.
//! Buckets idle for longer than `idle_timeout` are pruned by
//! [`cleanup_task`], which the bus runs while it is started.

use dashmap::DashMap;
use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use std::collections::BTreeMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::debug;

/// Decides whether a publish of `event_type` may proceed.
pub trait EventRateLimiter: Send + Sync {
    fn allow(&self, event_type: &str) -> bool;

    /// Drop per-type state that has gone idle.
    fn cleanup(&self) {}

    /// Period of [`cleanup`](Self::cleanup) while the bus runs; `None` disables it.
    fn cleanup_interval(&self) -> Option<Duration> {
        None
    }
}

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Sustained events per second per event type
    pub per_second: u32,
    /// Bucket size
    pub burst: u32,
    /// Per-type overrides of `per_second`
    pub overrides: BTreeMap<String, u32>,
    /// Buckets unused for this long are removed
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub idle_timeout: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            per_second: 1_000,
            burst: 2_000,
            overrides: BTreeMap::new(),
            idle_timeout: Duration::from_secs(300),
        }
    }
}

struct TokenBucket {
    limiter: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    last_access: Instant,
}

impl TokenBucket {
    fn new(per_second: u32, burst: u32) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(per_second).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(burst.max(1)).unwrap_or(NonZeroU32::MIN));
        Self {
            limiter: RateLimiter::direct(quota),
            last_access: Instant::now(),
        }
    }
}

/// Token bucket per event type.
pub struct TokenBucketLimiter {
    buckets: DashMap<String, TokenBucket>,
    config: RateLimitConfig,
}

impl TokenBucketLimiter {
    #[must_use]
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            buckets: DashMap::new(),
            config,
        }
    }

    /// Drop buckets idle for longer than `max_idle`.
    pub fn remove_idle(&self, max_idle: Duration) {
        let now = Instant::now();
        self.buckets.retain(|event_type, bucket| {
            let idle = now.duration_since(bucket.last_access);
            if idle > max_idle {
                debug!(event_type = %event_type, "Removing idle rate limit bucket");
                false
            } else {
                true
            }
        });
    }

    #[must_use]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }
}

impl EventRateLimiter for TokenBucketLimiter {
    fn allow(&self, event_type: &str) -> bool {
        if !self.config.enabled {
            return true;
        }

        let mut bucket = self
            .buckets
            .entry(event_type.to_string())
            .or_insert_with(|| {
                let per_second = self
                    .config
                    .overrides
                    .get(event_type)
                    .copied()
                    .unwrap_or(self.config.per_second);
                debug!(event_type, per_second, "Creating rate limit bucket");
                TokenBucket::new(per_second, self.config.burst)
            });
        bucket.last_access = Instant::now();
        bucket.limiter.check().is_ok()
    }

    fn cleanup(&self) {
        self.remove_idle(self.config.idle_timeout);
    }

    fn cleanup_interval(&self) -> Option<Duration> {
        (self.config.enabled && !self.config.idle_timeout.is_zero())
            .then_some(self.config.idle_timeout)
    }
}

/// Run `limiter.cleanup()` every `interval` until `shutdown` flips to `true`.
pub async fn cleanup_task(
    limiter: Arc<dyn EventRateLimiter>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => limiter.cleanup(),
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    debug!("Rate limit cleanup stopping");
                    break;
                }
            }
        }
    }
}
