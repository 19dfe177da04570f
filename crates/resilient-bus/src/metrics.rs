//! # Bus Metrics
//!
//! Lock-free counters shared by every component. All updates are relaxed
//! atomic increments so concurrent publishes never contend on a lock.

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMicroSeconds, DurationMilliSeconds};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Atomic counters for one bus instance.
#[derive(Debug)]
pub struct BusMetrics {
    published: AtomicU64,
    processed: AtomicU64,
    failed: AtomicU64,
    dropped: AtomicU64,
    rejected: AtomicU64,
    retries: AtomicU64,
    dead_lettered: AtomicU64,
    latency_total_ns: AtomicU64,
    latency_samples: AtomicU64,
    started_at: Instant,
}

impl BusMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self {
            published: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
            latency_total_ns: AtomicU64::new(0),
            latency_samples: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    /// An event made it past the publish-time gates.
    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    /// A handler invocation completed successfully.
    pub fn record_processed(&self, latency: Duration) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.record_latency(latency);
    }

    /// A subscription failed for good (retries exhausted).
    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// A filter silently dropped an event.
    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// A publish was refused by validation, transform, rate limit or breaker.
    pub fn record_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dead_lettered(&self) {
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
    }

    fn record_latency(&self, latency: Duration) {
        let nanos = u64::try_from(latency.as_nanos()).unwrap_or(u64::MAX);
        self.latency_total_ns.fetch_add(nanos, Ordering::Relaxed);
        self.latency_samples.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a point-in-time snapshot.
    ///
    /// Counters are read independently, so a snapshot taken during heavy
    /// publishing may be off by in-flight increments.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let published = self.published.load(Ordering::Relaxed);
        let samples = self.latency_samples.load(Ordering::Relaxed);
        let total_ns = self.latency_total_ns.load(Ordering::Relaxed);
        let avg_latency = if samples == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(total_ns / samples)
        };

        let uptime = self.started_at.elapsed();
        let secs = uptime.as_secs_f64();
        let throughput = if secs > 0.0 {
            published as f64 / secs
        } else {
            0.0
        };

        MetricsSnapshot {
            published,
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            avg_latency,
            throughput,
            uptime,
        }
    }
}

impl Default for BusMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time view of [`BusMetrics`].
#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Events accepted for dispatch.
    pub published: u64,
    /// Successful handler invocations.
    pub processed: u64,
    /// Subscriptions that failed after exhausting retries.
    pub failed: u64,
    /// Events dropped by a filter.
    pub dropped: u64,
    /// Publishes refused before dispatch.
    pub rejected: u64,
    /// Retry attempts scheduled.
    pub retries: u64,
    /// Events pushed to the dead letter queue.
    pub dead_lettered: u64,
    /// Mean latency of successful handler invocations.
    #[serde_as(as = "DurationMicroSeconds<u64>")]
    pub avg_latency: Duration,
    /// Published events per second since the bus was created.
    pub throughput: f64,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub uptime: Duration,
}
