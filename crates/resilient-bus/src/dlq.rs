//! # Dead Letter Queue
//!
//! Bounded store for events whose subscriber retries were exhausted.
//!
//! A background loop periodically offers every entry to the registered
//! [`DeadLetterHandler`]s in registration order. The first handler that
//! succeeds removes the entry; entries nobody accepts stay for the next
//! cycle.

use crate::error::{BoxError, BusError};
use crate::event::Event;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// An event that could not be delivered.
#[derive(Debug, Clone)]
pub struct FailedEvent<E> {
    pub id: Uuid,
    pub event: E,
    /// The terminal error, normally [`BusError::DeadLetterExhausted`].
    pub error: BusError,
    /// Delivery attempts so far, including reprocessing cycles.
    pub attempts: u32,
    pub first_failed: DateTime<Utc>,
    pub last_failed: DateTime<Utc>,
    pub metadata: BTreeMap<String, String>,
}

impl<E> FailedEvent<E> {
    #[must_use]
    pub fn new(event: E, error: BusError, attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            event,
            error,
            attempts,
            first_failed: now,
            last_failed: now,
            metadata: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Out-of-band consumer of dead letters.
#[async_trait]
pub trait DeadLetterHandler<E: Event>: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    /// Try to process a failed event. `Ok` removes it from the queue.
    async fn handle(&self, failed: &FailedEvent<E>) -> Result<(), BoxError>;
}

/// [`DeadLetterHandler`] backed by an async closure.
pub struct FnDeadLetterHandler<F> {
    name: String,
    f: F,
}

/// Build a [`DeadLetterHandler`] from an async closure.
pub fn dead_letter_fn<E, F, Fut>(name: impl Into<String>, f: F) -> FnDeadLetterHandler<F>
where
    E: Event,
    F: Fn(FailedEvent<E>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxError>> + Send,
{
    FnDeadLetterHandler {
        name: name.into(),
        f,
    }
}

#[async_trait]
impl<E, F, Fut> DeadLetterHandler<E> for FnDeadLetterHandler<F>
where
    E: Event,
    F: Fn(FailedEvent<E>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxError>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, failed: &FailedEvent<E>) -> Result<(), BoxError> {
        (self.f)(failed.clone()).await
    }
}

/// Bounded FIFO of [`FailedEvent`]s.
pub struct DeadLetterQueue<E> {
    max_size: usize,
    entries: Mutex<VecDeque<FailedEvent<E>>>,
    handlers: RwLock<Vec<Arc<dyn DeadLetterHandler<E>>>>,
}

impl<E: Event> DeadLetterQueue<E> {
    #[must_use]
    pub fn new(max_size: usize) -> Self {
        Self {
            max_size,
            entries: Mutex::new(VecDeque::new()),
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Push a failed event, evicting the oldest entry when full.
    ///
    /// Returns the evicted entry, if any.
    pub fn add(&self, failed: FailedEvent<E>) -> Option<FailedEvent<E>> {
        if self.max_size == 0 {
            warn!(event_type = %failed.event.event_type(), "Dead letter queue disabled, dropping event");
            return Some(failed);
        }

        let mut entries = self.entries.lock();
        let evicted = if entries.len() >= self.max_size {
            entries.pop_front()
        } else {
            None
        };
        if let Some(old) = &evicted {
            warn!(
                evicted_id = %old.id,
                event_type = %old.event.event_type(),
                "Dead letter queue full, evicting oldest entry"
            );
        }

        debug!(
            id = %failed.id,
            event_type = %failed.event.event_type(),
            error = %failed.error,
            "Event dead-lettered"
        );
        entries.push_back(failed);
        evicted
    }

    /// Register a handler; handlers are tried in registration order.
    pub fn register_handler(&self, handler: Arc<dyn DeadLetterHandler<E>>) {
        self.handlers.write().push(handler);
    }

    /// Snapshot of the queued entries, oldest first.
    #[must_use]
    pub fn entries(&self) -> Vec<FailedEvent<E>> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Remove and return every entry.
    pub fn drain(&self) -> Vec<FailedEvent<E>> {
        self.entries.lock().drain(..).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Run one reprocessing cycle.
    ///
    /// Returns the number of entries a handler accepted and removed.
    pub async fn process_once(&self) -> usize {
        let handlers = self.handlers.read().clone();
        if handlers.is_empty() {
            return 0;
        }

        // Handlers run without the queue lock held.
        let snapshot = self.entries();
        let mut processed = 0;

        for failed in snapshot {
            let mut accepted = false;
            for handler in &handlers {
                match handler.handle(&failed).await {
                    Ok(()) => {
                        debug!(id = %failed.id, handler = handler.name(), "Dead letter processed");
                        accepted = true;
                        break;
                    }
                    Err(e) => {
                        debug!(
                            id = %failed.id,
                            handler = handler.name(),
                            error = %e,
                            "Dead letter handler failed"
                        );
                    }
                }
            }

            let mut entries = self.entries.lock();
            if accepted {
                entries.retain(|entry| entry.id != failed.id);
                processed += 1;
            } else if let Some(entry) = entries.iter_mut().find(|entry| entry.id == failed.id) {
                entry.attempts += 1;
                entry.last_failed = Utc::now();
            }
        }

        processed
    }

    /// Reprocess on a fixed interval until `shutdown` flips to `true`.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let processed = self.process_once().await;
                    if processed > 0 {
                        info!(processed, remaining = self.len(), "Dead letter reprocessing cycle");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        debug!("Dead letter loop stopping");
                        break;
                    }
                }
            }
        }
    }
}
