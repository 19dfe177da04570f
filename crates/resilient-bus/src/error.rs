//! # Bus Errors
//!
//! Typed error taxonomy for publish-time and dispatch-time failures.
//!
//! Publish-time errors (validation, transform, rate limit, circuit open) are
//! returned to the caller of `publish` before any handler runs. Dispatch-time
//! errors from synchronous subscribers are aggregated and returned; errors
//! from asynchronous subscribers never reach the publisher and only surface
//! through metrics, the error reporter and the dead letter queue.

use crate::config::ConfigError;
use crate::subscription::SubscriptionId;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Error type returned by handlers, validators, transformers and sinks.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result alias for bus operations.
pub type BusResult<T> = Result<T, BusError>;

/// Discriminant of a [`BusError`], stable for matching in outer layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Validation,
    Transform,
    RateLimited,
    CircuitOpen,
    Handler,
    Timeout,
    DeadLetterExhausted,
    Cancelled,
    SubscriptionNotFound,
    InvalidSubscription,
    AlreadyStarted,
    NotStarted,
    Dispatch,
    Bridge,
    Config,
}

/// Errors produced by the event bus.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BusError {
    /// A validator rejected the event. Not retryable.
    #[error("Validation failed in {validator}: {reason}")]
    Validation { validator: String, reason: String },

    /// A transformer failed. Not retryable.
    #[error("Transform failed in {transformer}: {reason}")]
    Transform { transformer: String, reason: String },

    /// The rate limiter denied the event type.
    #[error("Rate limit exceeded for event type '{event_type}'")]
    RateLimited { event_type: String },

    /// The circuit breaker is open; the bus is in degraded mode.
    #[error("Circuit breaker open, retry in {retry_in:?}")]
    CircuitOpen { retry_in: Duration },

    /// A subscriber handler returned an error (or panicked).
    #[error("Handler for subscription {subscription_id} failed: {reason}")]
    Handler {
        subscription_id: SubscriptionId,
        reason: String,
    },

    /// A subscriber handler exceeded its timeout.
    #[error("Handler for subscription {subscription_id} timed out after {timeout:?}")]
    Timeout {
        subscription_id: SubscriptionId,
        timeout: Duration,
    },

    /// Retries for a subscription were exhausted. Only visible via the DLQ.
    #[error("Retries exhausted for subscription {subscription_id} after {attempts} attempts: {last_error}")]
    DeadLetterExhausted {
        subscription_id: SubscriptionId,
        attempts: u32,
        last_error: Box<BusError>,
    },

    /// The caller's context was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// `unsubscribe` was called with an unknown id.
    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(SubscriptionId),

    /// Subscription options were rejected.
    #[error("Invalid subscription: {reason}")]
    InvalidSubscription { reason: String },

    #[error("Event bus already started")]
    AlreadyStarted,

    #[error("Event bus not started")]
    NotStarted,

    /// Several synchronous subscribers failed.
    #[error("{} subscriber(s) failed for destination '{destination}'", errors.len())]
    Dispatch {
        destination: String,
        errors: Vec<BusError>,
    },

    /// A bridge failed to start, stop or forward.
    #[error("Bridge {bridge} failed: {reason}")]
    Bridge { bridge: String, reason: String },

    /// `start` refused an invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl BusError {
    /// Get the kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Transform { .. } => ErrorKind::Transform,
            Self::RateLimited { .. } => ErrorKind::RateLimited,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::Handler { .. } => ErrorKind::Handler,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::DeadLetterExhausted { .. } => ErrorKind::DeadLetterExhausted,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::SubscriptionNotFound(_) => ErrorKind::SubscriptionNotFound,
            Self::InvalidSubscription { .. } => ErrorKind::InvalidSubscription,
            Self::AlreadyStarted => ErrorKind::AlreadyStarted,
            Self::NotStarted => ErrorKind::NotStarted,
            Self::Dispatch { .. } => ErrorKind::Dispatch,
            Self::Bridge { .. } => ErrorKind::Bridge,
            Self::Config(_) => ErrorKind::Config,
        }
    }

    /// Whether a subscription retry policy applies to this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Handler { .. } | Self::Timeout { .. })
    }

    /// Collapse a list of failures into a single error.
    ///
    /// Returns `None` for an empty list and the error itself when there is
    /// exactly one; otherwise a [`BusError::Dispatch`] carrying all of them.
    #[must_use]
    pub fn aggregate(destination: &str, mut errors: Vec<BusError>) -> Option<BusError> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Self::Dispatch {
                destination: destination.to_string(),
                errors,
            }),
        }
    }

    /// Flatten nested dispatch errors into their leaf failures.
    #[must_use]
    pub fn leaves(&self) -> Vec<&BusError> {
        match self {
            Self::Dispatch { errors, .. } => errors.iter().flat_map(BusError::leaves).collect(),
            other => vec![other],
        }
    }
}
