//! # Fan-out & Delivery
//!
//! Delivers one routed event to the subscriptions of one destination.
//!
//! ```text
//!                   ┌─ sync ──► deliver ─► deliver ─► …   (inline, priority order)
//! subscriptions ────┤                                     errors aggregated → publisher
//!                   └─ async ─► JoinSet ◄── supervisor     (tracked by the bus)
//!                                                         errors → reporter, metrics, DLQ
//! ```
//!
//! Every delivery runs the middleware chain under the subscription timeout,
//! converts handler panics into `Handler` errors and retries retryable
//! failures with backoff. A subscription that exhausts its retries is
//! dead-lettered with `DeadLetterExhausted` wrapping the last error.

use crate::bus::ErrorReporter;
use crate::dlq::{DeadLetterQueue, FailedEvent};
use crate::error::BusError;
use crate::event::Event;
use crate::metrics::BusMetrics;
use crate::middleware::{EventMiddleware, Next};
use crate::retry::{self, RetryPolicy};
use crate::subscription::Subscription;
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub(crate) type Layers<E> = Arc<[Arc<dyn EventMiddleware<E>>]>;

/// State shared between the publisher and spawned async deliveries.
pub(crate) struct Dispatcher<E> {
    pub(crate) metrics: Arc<BusMetrics>,
    pub(crate) dlq: Arc<DeadLetterQueue<E>>,
    pub(crate) dlq_enabled: bool,
    pub(crate) retry: RetryPolicy,
    pub(crate) reporter: Arc<dyn ErrorReporter>,
}

impl<E: Event> Dispatcher<E> {
    /// Fan `event` out to `subscriptions` of `destination`.
    ///
    /// Async subscriptions are spawned into a task group whose supervisor is
    /// placed in `in_flight`; only synchronous failures are returned.
    pub(crate) async fn fan_out(
        self: &Arc<Self>,
        ctx: &CancellationToken,
        destination: &str,
        event: E,
        subscriptions: Vec<Arc<Subscription<E>>>,
        layers: Layers<E>,
        in_flight: &Mutex<JoinSet<()>>,
    ) -> Result<(), BusError> {
        let (asynchronous, synchronous): (Vec<_>, Vec<_>) = subscriptions
            .into_iter()
            .filter(|sub| sub.accepts(&event))
            .partition(|sub| sub.is_async());

        if !asynchronous.is_empty() {
            self.spawn_group(ctx, destination, &event, asynchronous, &layers, in_flight);
        }

        let mut errors = Vec::new();
        for sub in &synchronous {
            if let Err(e) = self.deliver(ctx, destination, sub, &event, &layers).await {
                errors.push(e);
            }
        }

        match BusError::aggregate(destination, errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn spawn_group(
        self: &Arc<Self>,
        ctx: &CancellationToken,
        destination: &str,
        event: &E,
        subscriptions: Vec<Arc<Subscription<E>>>,
        layers: &Layers<E>,
        in_flight: &Mutex<JoinSet<()>>,
    ) {
        let mut group = JoinSet::new();
        for sub in subscriptions {
            let this = Arc::clone(self);
            let ctx = ctx.clone();
            let destination = destination.to_string();
            let event = event.clone();
            let layers = Arc::clone(layers);
            group.spawn(async move {
                if let Err(e) = this.deliver(&ctx, &destination, &sub, &event, &layers).await {
                    this.reporter.report("async-dispatch", event.event_type(), &e);
                }
            });
        }

        let destination = destination.to_string();
        let mut in_flight = in_flight.lock();
        // Reap finished supervisors so the set does not grow between stops.
        while in_flight.try_join_next().is_some() {}
        in_flight.spawn(async move {
            let mut completed = 0usize;
            while let Some(joined) = group.join_next().await {
                match joined {
                    Ok(()) => completed += 1,
                    Err(e) if e.is_cancelled() => {}
                    Err(e) => warn!(destination = %destination, error = %e, "Async delivery task failed"),
                }
            }
            debug!(destination = %destination, completed, "Async fan-out complete");
        });
    }

    /// Deliver to one subscription, retrying per its budget.
    pub(crate) async fn deliver(
        &self,
        ctx: &CancellationToken,
        destination: &str,
        sub: &Subscription<E>,
        event: &E,
        layers: &[Arc<dyn EventMiddleware<E>>],
    ) -> Result<(), BusError> {
        sub.record_use();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;
            let started = Instant::now();
            let err = match self.invoke(ctx, sub, event, layers).await {
                Ok(()) => {
                    self.metrics.record_processed(started.elapsed());
                    sub.record_success();
                    return Ok(());
                }
                Err(err) => err,
            };

            let retry_count = attempts;
            if err.is_retryable() && retry_count <= sub.max_retries() {
                sub.record_retry(retry_count, &err);
                self.metrics.record_retry();
                let delay = self.retry.delay(retry_count);
                debug!(
                    subscription_id = %sub.id(),
                    retry_count,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying handler"
                );
                if let Err(cancelled) = retry::backoff(ctx, delay).await {
                    sub.record_error(&cancelled);
                    self.metrics.record_failed();
                    return Err(cancelled);
                }
                continue;
            }

            sub.record_error(&err);
            self.metrics.record_failed();
            if err.is_retryable() {
                self.dead_letter(destination, sub, event, attempts, &err);
            }
            return Err(err);
        }
    }

    fn dead_letter(
        &self,
        destination: &str,
        sub: &Subscription<E>,
        event: &E,
        attempts: u32,
        last_error: &BusError,
    ) {
        if !self.dlq_enabled {
            return;
        }

        let exhausted = BusError::DeadLetterExhausted {
            subscription_id: sub.id(),
            attempts,
            last_error: Box::new(last_error.clone()),
        };
        warn!(
            subscription_id = %sub.id(),
            event_type = %event.event_type(),
            attempts,
            "Retries exhausted, dead-lettering event"
        );
        let failed = FailedEvent::new(event.clone(), exhausted, attempts)
            .with_metadata("subscription_id", sub.id().to_string())
            .with_metadata("destination", destination)
            .with_metadata("handler", sub.handler().name());
        self.dlq.add(failed);
        self.metrics.record_dead_lettered();
    }

    /// One handler invocation through the middleware chain.
    async fn invoke(
        &self,
        ctx: &CancellationToken,
        sub: &Subscription<E>,
        event: &E,
        layers: &[Arc<dyn EventMiddleware<E>>],
    ) -> Result<(), BusError> {
        let next = Next::new(layers, sub.handler().as_ref());
        let guarded = AssertUnwindSafe(next.run(ctx, event)).catch_unwind();
        let timeout = sub.timeout();

        let outcome = tokio::select! {
            biased;
            _ = ctx.cancelled() => return Err(BusError::Cancelled),
            outcome = with_timeout(timeout, guarded) => outcome,
        };

        match outcome {
            None => Err(BusError::Timeout {
                subscription_id: sub.id(),
                timeout,
            }),
            Some(Err(panic)) => Err(BusError::Handler {
                subscription_id: sub.id(),
                reason: format!("handler panicked: {}", panic_message(panic.as_ref())),
            }),
            Some(Ok(Err(e))) => Err(BusError::Handler {
                subscription_id: sub.id(),
                reason: e.to_string(),
            }),
            Some(Ok(Ok(()))) => Ok(()),
        }
    }
}

/// `None` on timeout. A zero timeout disables the limit.
async fn with_timeout<F: std::future::Future>(timeout: Duration, fut: F) -> Option<F::Output> {
    if timeout.is_zero() {
        Some(fut.await)
    } else {
        tokio::time::timeout(timeout, fut).await.ok()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
