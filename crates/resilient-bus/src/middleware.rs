//! # Middleware
//!
//! Wrappers around every handler invocation. The first registered middleware
//! is the outermost layer:
//!
//! ```text
//! m1 ─► m2 ─► … ─► handler
//! m1 ◄─ m2 ◄─ … ◄─┘
//! ```
//!
//! A middleware continues the chain through [`Next::run`]; returning without
//! calling it short-circuits the handler.

use crate::error::BoxError;
use crate::event::Event;
use crate::subscription::EventHandler;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, warn, Instrument};

#[async_trait]
pub trait EventMiddleware<E: Event>: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(
        &self,
        ctx: &CancellationToken,
        event: &E,
        next: Next<'_, E>,
    ) -> Result<(), BoxError>;
}

/// The remainder of the chain after the current middleware.
pub struct Next<'a, E> {
    middleware: &'a [Arc<dyn EventMiddleware<E>>],
    handler: &'a dyn EventHandler<E>,
}

impl<'a, E: Event> Next<'a, E> {
    #[must_use]
    pub fn new(middleware: &'a [Arc<dyn EventMiddleware<E>>], handler: &'a dyn EventHandler<E>) -> Self {
        Self {
            middleware,
            handler,
        }
    }

    /// Name of the handler at the end of the chain.
    #[must_use]
    pub fn handler_name(&self) -> &str {
        self.handler.name()
    }

    pub async fn run(self, ctx: &CancellationToken, event: &E) -> Result<(), BoxError> {
        match self.middleware.split_first() {
            Some((current, rest)) => {
                current
                    .handle(ctx, event, Next::new(rest, self.handler))
                    .await
            }
            None => self.handler.handle(ctx, event).await,
        }
    }
}

/// Append-only list of middleware.
pub struct MiddlewareChain<E> {
    layers: RwLock<Vec<Arc<dyn EventMiddleware<E>>>>,
}

impl<E: Event> MiddlewareChain<E> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            layers: RwLock::new(Vec::new()),
        }
    }

    pub fn push(&self, middleware: Arc<dyn EventMiddleware<E>>) {
        self.layers.write().push(middleware);
    }

    /// Current layers; the lock is not held while the chain runs.
    #[must_use]
    pub fn snapshot(&self) -> Arc<[Arc<dyn EventMiddleware<E>>]> {
        Arc::from(self.layers.read().as_slice())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.read().is_empty()
    }
}

impl<E: Event> Default for MiddlewareChain<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Wraps each invocation in a span and logs its latency.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMiddleware;

#[async_trait]
impl<E: Event> EventMiddleware<E> for TracingMiddleware {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn handle(
        &self,
        ctx: &CancellationToken,
        event: &E,
        next: Next<'_, E>,
    ) -> Result<(), BoxError> {
        let span = debug_span!(
            "handle_event",
            event_type = %event.event_type(),
            handler = %next.handler_name()
        );
        let started = Instant::now();
        let result = next.run(ctx, event).instrument(span.clone()).await;
        let latency_us = started.elapsed().as_micros() as u64;

        span.in_scope(|| match &result {
            Ok(()) => debug!(latency_us, "Handler completed"),
            Err(e) => warn!(latency_us, error = %e, "Handler failed"),
        });
        result
    }
}
