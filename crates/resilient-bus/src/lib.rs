//! # Resilient Bus - In-Process Event Dispatch
//!
//! A publish/subscribe engine that routes typed events to prioritized,
//! filterable, retryable subscribers and protects itself from cascading
//! failure with a circuit breaker and a dead letter queue.
//!
//! ## Flow
//!
//! ```text
//!              ┌──────────────────────── EventBus ─────────────────────────┐
//! publish() ──►│ pipeline ─► rate limit ─► breaker ─► history ─► router    │
//!              │                                                  │        │
//!              │            ┌─────────────────────────────────────┘        │
//!              │            ▼                                              │
//!              │   per destination: middleware ─► handler (retry, timeout) │
//!              │            │ exhausted                                    │
//!              │            ▼                                              │
//!              │   dead letter queue ─► reprocessing loop                  │
//!              └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust,ignore
//! use resilient_bus::{handler_fn, Envelope, EventBus, EventBusConfig};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! let bus = EventBus::<Envelope>::new(EventBusConfig::from_env());
//! bus.subscribe("user.created", Arc::new(handler_fn("welcome", |event: Envelope| async move {
//!     println!("welcome {:?}", event.payload);
//!     Ok(())
//! })))?;
//!
//! let ctx = CancellationToken::new();
//! bus.start(&ctx).await?;
//! bus.publish(&ctx, Envelope::text("user.created", "alice")).await?;
//! bus.stop(&ctx).await?;
//! ```

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod batcher;
pub mod bridge;
pub mod bus;
pub mod circuit_breaker;
pub mod config;
mod dispatch;
pub mod dlq;
pub mod error;
pub mod event;
pub mod history;
pub mod metrics;
pub mod middleware;
pub mod pattern;
pub mod pipeline;
pub mod rate_limit;
pub mod retry;
pub mod router;
pub mod subscription;

// Re-export main types
pub use batcher::{BatchSink, Batcher, BatcherConfig, EventBatch};
pub use bridge::{Bridge, BroadcastBridge};
pub use bus::{ErrorReporter, EventBus, TracingErrorReporter};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState, CircuitStats};
pub use config::{ConfigError, EventBusConfig};
pub use dlq::{dead_letter_fn, DeadLetterHandler, DeadLetterQueue, FailedEvent};
pub use error::{BoxError, BusError, BusResult, ErrorKind};
pub use event::{Envelope, Event, Payload};
pub use history::{EventHistory, HistoricalEvent};
pub use metrics::{BusMetrics, MetricsSnapshot};
pub use middleware::{EventMiddleware, Next, TracingMiddleware};
pub use pipeline::{filter_fn, transform_fn, validate_fn, EventFilter, EventTransformer, EventValidator};
pub use rate_limit::{EventRateLimiter, RateLimitConfig, TokenBucketLimiter};
pub use retry::RetryPolicy;
pub use router::{Route, Router};
pub use subscription::{
    handler_fn, EventHandler, SubscriptionId, SubscriptionInfo, SubscriptionOptions,
};

/// Crate version, reported by telemetry.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
