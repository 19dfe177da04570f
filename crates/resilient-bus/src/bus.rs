//! # Event Bus
//!
//! The orchestrator tying the components together.
//!
//! ## Publish path
//!
//! ```text
//! publish(ctx, event)
//!   │
//!   ├─ pipeline: validators → transformers → filters   (Validation / Transform / silent drop)
//!   ├─ rate limiter                                     (RateLimited)
//!   ├─ circuit breaker                                  (CircuitOpen)
//!   ├─ history.record
//!   ├─ router.resolve ──► for each destination:
//!   │      fan_out → breaker.record_success / record_failure
//!   ├─ bridge.forward (while started), batcher.add      (reported, never returned)
//!   └─ metrics.published, aggregated sync errors
//! ```
//!
//! ## Lifecycle
//!
//! `start` validates the configuration, starts the bridge and spawns the
//! dead letter, batcher and rate limit cleanup loops, all bound to one
//! `watch` shutdown signal. `stop` flips the signal, stops the bridge, waits
//! for the loops (the batcher flushes on exit) and drains in-flight
//! asynchronous deliveries within `drain_timeout`. Both hold the lifecycle
//! lock for the whole transition.

use crate::batcher::{BatchSink, Batcher};
use crate::bridge::Bridge;
use crate::circuit_breaker::{Admission, CircuitBreaker, CircuitState, CircuitStats};
use crate::config::EventBusConfig;
use crate::dispatch::Dispatcher;
use crate::dlq::{DeadLetterHandler, DeadLetterQueue};
use crate::error::{BusError, BusResult};
use crate::event::Event;
use crate::history::EventHistory;
use crate::metrics::{BusMetrics, MetricsSnapshot};
use crate::middleware::{EventMiddleware, MiddlewareChain};
use crate::pipeline::{EventFilter, EventTransformer, EventValidator, Pipeline, PipelineOutcome};
use crate::rate_limit::{self, EventRateLimiter, TokenBucketLimiter};
use crate::router::{Route, Router};
use crate::subscription::{
    EventHandler, Subscription, SubscriptionId, SubscriptionInfo, SubscriptionOptions,
    SubscriptionRegistry,
};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Receives failures that have no caller to return to: asynchronous
/// deliveries, bridge forwarding and batch flushing.
pub trait ErrorReporter: Send + Sync {
    fn report(&self, source: &str, event_type: &str, error: &BusError);
}

/// Default reporter: logs at `error` level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorReporter;

impl ErrorReporter for TracingErrorReporter {
    fn report(&self, source: &str, event_type: &str, error: &BusError) {
        error!(source, event_type, kind = ?error.kind(), error = %error, "Event bus error");
    }
}

struct Running {
    shutdown: watch::Sender<bool>,
    loops: Vec<JoinHandle<()>>,
}

/// In-process publish/subscribe bus over events of type `E`.
pub struct EventBus<E: Event> {
    config: EventBusConfig,
    registry: SubscriptionRegistry<E>,
    pipeline: Pipeline<E>,
    middleware: MiddlewareChain<E>,
    router: Router<E>,
    rate_limiter: Option<Arc<dyn EventRateLimiter>>,
    breaker: CircuitBreaker,
    history: EventHistory<E>,
    dispatcher: Arc<Dispatcher<E>>,
    bridge: Option<Arc<dyn Bridge<E>>>,
    batcher: Option<Arc<Batcher<E>>>,
    started: AtomicBool,
    running: tokio::sync::Mutex<Option<Running>>,
    in_flight: Mutex<JoinSet<()>>,
}

impl<E: Event> EventBus<E> {
    #[must_use]
    pub fn new(config: EventBusConfig) -> Self {
        let rate_limiter: Option<Arc<dyn EventRateLimiter>> = if config.rate_limit.enabled {
            Some(Arc::new(TokenBucketLimiter::new(config.rate_limit.clone())))
        } else {
            None
        };
        let history_size = if config.history_enabled {
            config.history_size
        } else {
            0
        };

        let dispatcher = Arc::new(Dispatcher {
            metrics: Arc::new(BusMetrics::new()),
            dlq: Arc::new(DeadLetterQueue::new(config.dlq_size)),
            dlq_enabled: config.dlq_enabled,
            retry: config.retry.clone(),
            reporter: Arc::new(TracingErrorReporter),
        });

        Self {
            registry: SubscriptionRegistry::new(),
            pipeline: Pipeline::new(),
            middleware: MiddlewareChain::new(),
            router: Router::new(),
            rate_limiter,
            breaker: CircuitBreaker::new(config.circuit_breaker.clone()),
            history: EventHistory::new(history_size),
            dispatcher,
            bridge: None,
            batcher: None,
            started: AtomicBool::new(false),
            running: tokio::sync::Mutex::new(None),
            in_flight: Mutex::new(JoinSet::new()),
            config,
        }
    }

    /// Replace the default [`TracingErrorReporter`].
    #[must_use]
    pub fn with_error_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.rebuild_dispatcher(|d| d.reporter = reporter);
        self
    }

    /// Replace the rate limiter derived from the configuration.
    #[must_use]
    pub fn with_rate_limiter(mut self, limiter: Arc<dyn EventRateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    #[must_use]
    pub fn with_bridge(mut self, bridge: Arc<dyn Bridge<E>>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    /// Batch accepted events per destination into `sink`.
    #[must_use]
    pub fn with_batch_sink(mut self, sink: Arc<dyn BatchSink<E>>) -> Self {
        self.batcher = Some(Arc::new(Batcher::new(self.config.batcher.clone(), sink)));
        self
    }

    fn rebuild_dispatcher(&mut self, update: impl FnOnce(&mut Dispatcher<E>)) {
        let mut dispatcher = Dispatcher {
            metrics: Arc::clone(&self.dispatcher.metrics),
            dlq: Arc::clone(&self.dispatcher.dlq),
            dlq_enabled: self.dispatcher.dlq_enabled,
            retry: self.dispatcher.retry.clone(),
            reporter: Arc::clone(&self.dispatcher.reporter),
        };
        update(&mut dispatcher);
        self.dispatcher = Arc::new(dispatcher);
    }

    // ------------------------------------------------------------------
    // Publishing
    // ------------------------------------------------------------------

    /// Publish an event.
    ///
    /// # Errors
    ///
    /// - `Validation` / `Transform` from the pipeline
    /// - `RateLimited` when the limiter denies the event type
    /// - `CircuitOpen` while the breaker is open
    /// - `Cancelled` when `ctx` is cancelled
    /// - the failures of synchronous subscribers, aggregated
    pub async fn publish(&self, ctx: &CancellationToken, event: E) -> BusResult<()> {
        self.publish_with_metadata(ctx, event, BTreeMap::new()).await
    }

    /// [`publish`](Self::publish) attaching `metadata` to the history entry.
    pub async fn publish_with_metadata(
        &self,
        ctx: &CancellationToken,
        event: E,
        metadata: BTreeMap<String, String>,
    ) -> BusResult<()> {
        let metrics = &self.dispatcher.metrics;
        if ctx.is_cancelled() {
            return Err(BusError::Cancelled);
        }

        let event = match self.pipeline.process(ctx, event).await {
            Ok(PipelineOutcome::Accepted(event)) => event,
            Ok(PipelineOutcome::Dropped { .. }) => {
                metrics.record_dropped();
                return Ok(());
            }
            Err(e) => {
                if !matches!(e, BusError::Cancelled) {
                    metrics.record_rejected();
                }
                debug!(error = %e, "Event rejected by pipeline");
                return Err(e);
            }
        };
        let event_type = event.event_type().to_string();

        if let Some(limiter) = &self.rate_limiter {
            if !limiter.allow(&event_type) {
                metrics.record_rejected();
                warn!(event_type = %event_type, "Event rate limited");
                return Err(BusError::RateLimited { event_type });
            }
        }

        if let Admission::Rejected { retry_in } = self.breaker.admit() {
            metrics.record_rejected();
            debug!(event_type = %event_type, ?retry_in, "Publish rejected, circuit open");
            return Err(BusError::CircuitOpen { retry_in });
        }

        if self.config.history_enabled {
            self.history.record(event.clone(), metadata);
        }

        let layers = self.middleware.snapshot();
        let mut errors = Vec::new();
        for (destination, routed) in self.router.resolve(&event) {
            if let Some(batcher) = &self.batcher {
                if let Err(e) = batcher.add(&destination, routed.clone()).await {
                    self.report_external("batcher", &event_type, e.to_string());
                }
            }

            let subscriptions = self.registry.lookup(&destination);
            let result = self
                .dispatcher
                .fan_out(
                    ctx,
                    &destination,
                    routed,
                    subscriptions,
                    Arc::clone(&layers),
                    &self.in_flight,
                )
                .await;

            match result {
                Ok(()) => self.breaker.record_success(),
                Err(e) => {
                    self.breaker.record_failure();
                    debug!(destination = %destination, error = %e, "Destination dispatch failed");
                    errors.push(e);
                }
            }
        }

        if let Some(bridge) = self.bridge.as_ref().filter(|_| self.is_running()) {
            if let Err(e) = bridge.forward(&event).await {
                self.dispatcher.reporter.report("bridge", &event_type, &e);
            }
        }

        metrics.record_published();

        // Several failing destinations are flattened into one aggregate.
        let errors = if errors.len() > 1 {
            errors.iter().flat_map(BusError::leaves).cloned().collect()
        } else {
            errors
        };
        match BusError::aggregate(&event_type, errors) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn report_external(&self, source: &str, event_type: &str, reason: String) {
        let err = BusError::Bridge {
            bridge: source.to_string(),
            reason,
        };
        self.dispatcher.reporter.report(source, event_type, &err);
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Subscribe with default options.
    ///
    /// # Errors
    ///
    /// `InvalidSubscription` for an empty event type.
    pub fn subscribe(
        &self,
        event_type: &str,
        handler: Arc<dyn EventHandler<E>>,
    ) -> BusResult<SubscriptionId> {
        self.subscribe_with_options(event_type, handler, SubscriptionOptions::new())
    }

    /// Subscribe with explicit options.
    ///
    /// # Errors
    ///
    /// `InvalidSubscription` for an empty event type or pattern.
    pub fn subscribe_with_options(
        &self,
        event_type: &str,
        handler: Arc<dyn EventHandler<E>>,
        options: SubscriptionOptions<E>,
    ) -> BusResult<SubscriptionId> {
        let subscription = Subscription::new(
            event_type,
            handler,
            options,
            self.config.default_timeout,
            self.config.max_retries,
        )?;
        Ok(self.registry.insert(subscription))
    }

    /// Remove a subscription.
    ///
    /// # Errors
    ///
    /// `SubscriptionNotFound` when the id is unknown, including a second call.
    pub fn unsubscribe(&self, id: SubscriptionId) -> BusResult<()> {
        self.registry.remove(id).map(|_| ())
    }

    #[must_use]
    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.registry.infos()
    }

    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.registry.len()
    }

    // ------------------------------------------------------------------
    // Components
    // ------------------------------------------------------------------

    pub fn add_filter(&self, filter: Arc<dyn EventFilter<E>>) {
        self.pipeline.add_filter(filter);
    }

    pub fn add_transformer(&self, transformer: Arc<dyn EventTransformer<E>>) {
        self.pipeline.add_transformer(transformer);
    }

    pub fn add_validator(&self, validator: Arc<dyn EventValidator<E>>) {
        self.pipeline.add_validator(validator);
    }

    pub fn add_middleware(&self, middleware: Arc<dyn EventMiddleware<E>>) {
        self.middleware.push(middleware);
    }

    pub fn add_route(&self, route: Route<E>) {
        self.router.add_route(route);
    }

    pub fn add_dead_letter_handler(&self, handler: Arc<dyn DeadLetterHandler<E>>) {
        self.dispatcher.dlq.register_handler(handler);
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Start background work.
    ///
    /// # Errors
    ///
    /// - `AlreadyStarted` on a second call
    /// - `Cancelled` when `ctx` is cancelled
    /// - `Config` when the configuration fails validation
    /// - the bridge's start error
    pub async fn start(&self, ctx: &CancellationToken) -> BusResult<()> {
        if ctx.is_cancelled() {
            return Err(BusError::Cancelled);
        }
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(BusError::AlreadyStarted);
        }
        self.config.validate()?;

        if let Some(bridge) = &self.bridge {
            bridge.start().await?;
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut loops = Vec::new();

        if self.config.dlq_enabled {
            let dlq = Arc::clone(&self.dispatcher.dlq);
            loops.push(tokio::spawn(
                dlq.run(self.config.dlq_interval, shutdown_rx.clone()),
            ));
        }
        if let Some(batcher) = &self.batcher {
            loops.push(tokio::spawn(Arc::clone(batcher).run(shutdown_rx.clone())));
        }
        let cleanup = self
            .rate_limiter
            .as_ref()
            .and_then(|limiter| Some((limiter, limiter.cleanup_interval()?)))
            .filter(|(_, period)| !period.is_zero());
        if let Some((limiter, period)) = cleanup {
            loops.push(tokio::spawn(rate_limit::cleanup_task(
                Arc::clone(limiter),
                period,
                shutdown_rx.clone(),
            )));
        }

        *running = Some(Running { shutdown, loops });
        self.started.store(true, Ordering::Release);
        info!(
            subscriptions = self.registry.len(),
            dlq = self.config.dlq_enabled,
            bridge = self.bridge.is_some(),
            batcher = self.batcher.is_some(),
            "[event-bus] started"
        );
        Ok(())
    }

    /// Stop background work and drain in-flight asynchronous deliveries.
    ///
    /// Cancelling `ctx` aborts the drain early.
    ///
    /// # Errors
    ///
    /// `NotStarted` when the bus is not running, including a second call.
    pub async fn stop(&self, ctx: &CancellationToken) -> BusResult<()> {
        let mut guard = self.running.lock().await;
        let Some(running) = guard.take() else {
            return Err(BusError::NotStarted);
        };
        self.started.store(false, Ordering::Release);

        // Receivers may already be gone; the loops then exit on their own.
        let _ = running.shutdown.send(true);
        for handle in running.loops {
            if let Err(e) = handle.await {
                warn!(error = %e, "[event-bus] background loop failed");
            }
        }

        if let Some(bridge) = &self.bridge {
            if let Err(e) = bridge.stop().await {
                warn!(error = %e, "[event-bus] bridge failed to stop");
            }
        }

        let mut in_flight = std::mem::take(&mut *self.in_flight.lock());
        let pending = in_flight.len();
        let drained = tokio::select! {
            biased;
            _ = ctx.cancelled() => false,
            res = tokio::time::timeout(self.config.drain_timeout, async {
                while in_flight.join_next().await.is_some() {}
            }) => res.is_ok(),
        };
        if !drained {
            warn!(
                remaining = in_flight.len(),
                "[event-bus] drain incomplete, aborting in-flight deliveries"
            );
            in_flight.shutdown().await;
        }

        info!(drained_groups = pending, "[event-bus] stopped");
        Ok(())
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    #[must_use]
    pub fn metrics(&self) -> MetricsSnapshot {
        self.dispatcher.metrics.snapshot()
    }

    #[must_use]
    pub fn history(&self) -> &EventHistory<E> {
        &self.history
    }

    #[must_use]
    pub fn dead_letters(&self) -> &DeadLetterQueue<E> {
        &self.dispatcher.dlq
    }

    /// Current breaker state, without triggering a transition.
    #[must_use]
    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    #[must_use]
    pub fn circuit_stats(&self) -> CircuitStats {
        self.breaker.stats()
    }

    pub fn reset_circuit(&self) {
        self.breaker.reset();
    }

    #[must_use]
    pub fn config(&self) -> &EventBusConfig {
        &self.config
    }
}

impl<E: Event> Default for EventBus<E> {
    fn default() -> Self {
        Self::new(EventBusConfig::default())
    }
}
