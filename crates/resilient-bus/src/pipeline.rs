//! # Publish Pipeline
//!
//! Pre-publish chain run on every event before it reaches the router:
//!
//! ```text
//! event ──► validators ──► transformers ──► filters ──► (rate limit, breaker, dispatch)
//!             │ error         │ error          │ reject
//!             ▼               ▼                ▼
//!         Validation       Transform       silent drop
//! ```
//!
//! Components are append-only; registration order is execution order.

use crate::error::{BoxError, BusError};
use crate::event::Event;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Decides whether an event continues through the bus.
pub trait EventFilter<E: Event>: Send + Sync {
    fn name(&self) -> &str;

    /// `false` drops the event without error.
    fn accept(&self, event: &E) -> bool;
}

/// Rewrites an event before dispatch.
#[async_trait]
pub trait EventTransformer<E: Event>: Send + Sync {
    fn name(&self) -> &str;

    async fn transform(&self, ctx: &CancellationToken, event: E) -> Result<E, BoxError>;
}

/// Rejects malformed events before dispatch.
#[async_trait]
pub trait EventValidator<E: Event>: Send + Sync {
    fn name(&self) -> &str;

    async fn validate(&self, ctx: &CancellationToken, event: &E) -> Result<(), BoxError>;
}

/// [`EventFilter`] backed by a closure.
pub struct FnFilter<F> {
    name: String,
    f: F,
}

/// Build an [`EventFilter`] from a predicate.
pub fn filter_fn<E, F>(name: impl Into<String>, f: F) -> FnFilter<F>
where
    E: Event,
    F: Fn(&E) -> bool + Send + Sync,
{
    FnFilter {
        name: name.into(),
        f,
    }
}

impl<E, F> EventFilter<E> for FnFilter<F>
where
    E: Event,
    F: Fn(&E) -> bool + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn accept(&self, event: &E) -> bool {
        (self.f)(event)
    }
}

/// [`EventTransformer`] backed by a synchronous closure.
pub struct FnTransformer<F> {
    name: String,
    f: F,
}

/// Build an [`EventTransformer`] from a synchronous closure.
pub fn transform_fn<E, F>(name: impl Into<String>, f: F) -> FnTransformer<F>
where
    E: Event,
    F: Fn(E) -> Result<E, BoxError> + Send + Sync,
{
    FnTransformer {
        name: name.into(),
        f,
    }
}

#[async_trait]
impl<E, F> EventTransformer<E> for FnTransformer<F>
where
    E: Event,
    F: Fn(E) -> Result<E, BoxError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn transform(&self, _ctx: &CancellationToken, event: E) -> Result<E, BoxError> {
        (self.f)(event)
    }
}

/// [`EventValidator`] backed by a synchronous closure.
pub struct FnValidator<F> {
    name: String,
    f: F,
}

/// Build an [`EventValidator`] from a synchronous closure.
pub fn validate_fn<E, F>(name: impl Into<String>, f: F) -> FnValidator<F>
where
    E: Event,
    F: Fn(&E) -> Result<(), BoxError> + Send + Sync,
{
    FnValidator {
        name: name.into(),
        f,
    }
}

#[async_trait]
impl<E, F> EventValidator<E> for FnValidator<F>
where
    E: Event,
    F: Fn(&E) -> Result<(), BoxError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn validate(&self, _ctx: &CancellationToken, event: &E) -> Result<(), BoxError> {
        (self.f)(event)
    }
}

/// Result of running the pipeline.
#[derive(Debug)]
pub enum PipelineOutcome<E> {
    /// The (possibly transformed) event continues.
    Accepted(E),
    /// A filter rejected the event.
    Dropped { filter: String },
}

/// Ordered validators, transformers and filters.
pub struct Pipeline<E> {
    validators: RwLock<Vec<Arc<dyn EventValidator<E>>>>,
    transformers: RwLock<Vec<Arc<dyn EventTransformer<E>>>>,
    filters: RwLock<Vec<Arc<dyn EventFilter<E>>>>,
}

impl<E: Event> Pipeline<E> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            validators: RwLock::new(Vec::new()),
            transformers: RwLock::new(Vec::new()),
            filters: RwLock::new(Vec::new()),
        }
    }

    pub fn add_validator(&self, validator: Arc<dyn EventValidator<E>>) {
        self.validators.write().push(validator);
    }

    pub fn add_transformer(&self, transformer: Arc<dyn EventTransformer<E>>) {
        self.transformers.write().push(transformer);
    }

    pub fn add_filter(&self, filter: Arc<dyn EventFilter<E>>) {
        self.filters.write().push(filter);
    }

    /// Run validators, then transformers, then filters.
    ///
    /// # Errors
    ///
    /// - `BusError::Validation` from the first failing validator
    /// - `BusError::Transform` from the first failing transformer
    /// - `BusError::Cancelled` if `ctx` is cancelled between steps
    pub async fn process(
        &self,
        ctx: &CancellationToken,
        event: E,
    ) -> Result<PipelineOutcome<E>, BusError> {
        let validators = self.validators.read().clone();
        for validator in &validators {
            check_cancelled(ctx)?;
            validator
                .validate(ctx, &event)
                .await
                .map_err(|e| BusError::Validation {
                    validator: validator.name().to_string(),
                    reason: e.to_string(),
                })?;
        }

        let transformers = self.transformers.read().clone();
        let mut event = event;
        for transformer in &transformers {
            check_cancelled(ctx)?;
            event = transformer
                .transform(ctx, event)
                .await
                .map_err(|e| BusError::Transform {
                    transformer: transformer.name().to_string(),
                    reason: e.to_string(),
                })?;
        }

        let filters = self.filters.read().clone();
        for filter in &filters {
            if !filter.accept(&event) {
                debug!(
                    event_type = %event.event_type(),
                    filter = filter.name(),
                    "Event dropped by filter"
                );
                return Ok(PipelineOutcome::Dropped {
                    filter: filter.name().to_string(),
                });
            }
        }

        Ok(PipelineOutcome::Accepted(event))
    }
}

impl<E: Event> Default for Pipeline<E> {
    fn default() -> Self {
        Self::new()
    }
}

fn check_cancelled(ctx: &CancellationToken) -> Result<(), BusError> {
    if ctx.is_cancelled() {
        Err(BusError::Cancelled)
    } else {
        Ok(())
    }
}
