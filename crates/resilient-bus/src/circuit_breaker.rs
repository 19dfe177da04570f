//! Circuit Breaker for Publish-Path Resilience
//!
//! Stops the bus from hammering failing subscribers. Once enough consecutive
//! dispatch failures pile up, publishes fail fast with `CircuitOpen` until a
//! cool-down elapses and a single trial publish decides whether to recover.
//!
//! ## States
//!
//! ```text
//!            failures >= threshold            now >= next_retry
//!  ┌────────┐ ───────────────────► ┌──────┐ ──────────────────► ┌───────────┐
//!  │ CLOSED │                      │ OPEN │                     │ HALF-OPEN │
//!  └────────┘ ◄─────────┐          └──────┘ ◄────────────────── └───────────┘
//!                       │                        failure              │
//!                       └─────────────────────────────────────────────┘
//!                                          success
//! ```
//!
//! All counters and transitions sit behind one mutex. [`CircuitBreaker::is_open`]
//! takes that lock and performs the `Open -> HalfOpen` transition itself when
//! the timeout has elapsed, so it is not a pure read.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use std::time::{Duration, Instant};

/// Circuit breaker configuration
#[serde_as]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// Time spent open before a trial publish is allowed
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub timeout: Duration,
    /// Enable/disable circuit breaker
    pub enabled: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            timeout: Duration::from_secs(30),
            enabled: true,
        }
    }
}

/// Circuit breaker state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation
    Closed,
    /// Failing fast
    Open,
    /// Testing recovery
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

struct CircuitInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
    next_retry: Option<Instant>,
    total_failures: u64,
    total_successes: u64,
    trips: u64,
}

/// Outcome of a gate check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// Closed, or the trial publish after the cool-down.
    Allowed,
    /// Still open; carries the remaining cool-down.
    Rejected { retry_in: Duration },
}

/// Circuit breaker guarding the publish path.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<CircuitInner>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CircuitInner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
                next_retry: None,
                total_failures: 0,
                total_successes: 0,
                trips: 0,
            }),
        }
    }

    /// Check whether a publish may proceed.
    ///
    /// Transitions `Open -> HalfOpen` when the cool-down has elapsed.
    pub fn admit(&self) -> Admission {
        if !self.config.enabled {
            return Admission::Allowed;
        }

        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Open {
            return Admission::Allowed;
        }

        let now = Instant::now();
        match inner.next_retry {
            Some(next_retry) if now < next_retry => Admission::Rejected {
                retry_in: next_retry - now,
            },
            _ => {
                inner.state = CircuitState::HalfOpen;
                inner.success_count = 0;
                tracing::info!("[circuit-breaker] transitioning to half-open");
                Admission::Allowed
            }
        }
    }

    /// Whether publishes are currently rejected.
    pub fn is_open(&self) -> bool {
        matches!(self.admit(), Admission::Rejected { .. })
    }

    /// Record a successful dispatch
    pub fn record_success(&self) {
        if !self.config.enabled {
            return;
        }

        let mut inner = self.inner.lock();
        inner.total_successes += 1;

        match inner.state {
            CircuitState::Closed => {
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.success_count = 1;
                inner.next_retry = None;
                tracing::info!("[circuit-breaker] recovered, transitioning to closed");
            }
            CircuitState::Open => {
                // Dispatches admitted before the trip may still finish.
                inner.success_count += 1;
            }
        }
    }

    /// Record a failed dispatch
    pub fn record_failure(&self) {
        if !self.config.enabled {
            return;
        }

        let mut inner = self.inner.lock();
        let now = Instant::now();
        inner.total_failures += 1;
        inner.failure_count += 1;
        inner.success_count = 0;
        inner.last_failure = Some(now);

        match inner.state {
            CircuitState::Closed => {
                if inner.failure_count >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.next_retry = Some(now + self.config.timeout);
                    inner.trips += 1;
                    tracing::warn!(
                        failures = inner.failure_count,
                        "[circuit-breaker] opened after consecutive failures"
                    );
                }
            }
            CircuitState::HalfOpen => {
                inner.state = CircuitState::Open;
                inner.next_retry = Some(now + self.config.timeout);
                inner.trips += 1;
                tracing::warn!("[circuit-breaker] failed in half-open, returning to open");
            }
            CircuitState::Open => {
                // Already open; the cool-down keeps its original deadline.
            }
        }
    }

    /// Get the current state without triggering a transition
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Get statistics for the circuit
    pub fn stats(&self) -> CircuitStats {
        let inner = self.inner.lock();
        CircuitStats {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            total_failures: inner.total_failures,
            total_successes: inner.total_successes,
            trips: inner.trips,
        }
    }

    /// Force the circuit closed
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.next_retry = None;
        tracing::info!("[circuit-breaker] manually reset");
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }
}

/// Statistics for the circuit
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitStats {
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures
    pub failure_count: u32,
    /// Consecutive successes
    pub success_count: u32,
    /// Total failures since start
    pub total_failures: u64,
    /// Total successes since start
    pub total_successes: u64,
    /// Number of times the circuit opened
    pub trips: u64,
}
