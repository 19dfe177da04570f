//! # Batcher
//!
//! Accumulates events per key and hands complete batches to a [`BatchSink`].
//!
//! A batch is flushed when it reaches `max_batch_size`, when it has been
//! open for longer than `max_wait` (checked every `flush_interval` by the
//! background loop), and unconditionally when the loop shuts down.

use crate::error::BoxError;
use crate::event::Event;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

#[serde_as]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatcherConfig {
    pub max_batch_size: usize,
    /// Maximum age of an open batch
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub max_wait: Duration,
    /// How often the loop looks for expired batches
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub flush_interval: Duration,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 100,
            max_wait: Duration::from_millis(500),
            flush_interval: Duration::from_millis(100),
        }
    }
}

/// Events accumulated under one key.
#[derive(Debug, Clone)]
pub struct EventBatch<E> {
    pub key: String,
    pub events: Vec<E>,
    pub start_time: DateTime<Utc>,
    opened: Instant,
}

impl<E> EventBatch<E> {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            events: Vec::new(),
            start_time: Utc::now(),
            opened: Instant::now(),
        }
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.events.len()
    }

    #[must_use]
    pub fn age(&self) -> Duration {
        self.opened.elapsed()
    }
}

/// Receiver of flushed batches.
#[async_trait]
pub trait BatchSink<E: Event>: Send + Sync {
    async fn flush(&self, batch: EventBatch<E>) -> Result<(), BoxError>;
}

pub struct Batcher<E> {
    config: BatcherConfig,
    batches: DashMap<String, EventBatch<E>>,
    sink: Arc<dyn BatchSink<E>>,
}

impl<E: Event> Batcher<E> {
    #[must_use]
    pub fn new(config: BatcherConfig, sink: Arc<dyn BatchSink<E>>) -> Self {
        Self {
            config,
            batches: DashMap::new(),
            sink,
        }
    }

    /// Append `event` to the batch for `key`, flushing it once full.
    ///
    /// # Errors
    ///
    /// Returns the sink error when a size-triggered flush fails. The batch is
    /// dropped in that case.
    pub async fn add(&self, key: &str, event: E) -> Result<(), BoxError> {
        let full = {
            let mut batch = self
                .batches
                .entry(key.to_string())
                .or_insert_with(|| EventBatch::new(key));
            batch.events.push(event);
            batch.size() >= self.config.max_batch_size
        };

        if full {
            if let Some((_, batch)) = self.batches.remove(key) {
                debug!(key, size = batch.size(), "Flushing full batch");
                self.sink.flush(batch).await?;
            }
        }
        Ok(())
    }

    /// Flush batches older than `max_wait`. Returns the number flushed.
    pub async fn flush_expired(&self) -> usize {
        let expired: Vec<String> = self
            .batches
            .iter()
            .filter(|entry| entry.value().age() >= self.config.max_wait)
            .map(|entry| entry.key().clone())
            .collect();
        self.flush_keys(expired).await
    }

    /// Flush every open batch. Returns the number flushed.
    pub async fn flush_all(&self) -> usize {
        let keys: Vec<String> = self.batches.iter().map(|entry| entry.key().clone()).collect();
        self.flush_keys(keys).await
    }

    async fn flush_keys(&self, keys: Vec<String>) -> usize {
        let mut flushed = 0;
        for key in keys {
            let Some((_, batch)) = self.batches.remove(&key) else {
                continue;
            };
            let size = batch.size();
            match self.sink.flush(batch).await {
                Ok(()) => {
                    debug!(key = %key, size, "Batch flushed");
                    flushed += 1;
                }
                Err(e) => warn!(key = %key, size, error = %e, "Batch flush failed"),
            }
        }
        flushed
    }

    /// Number of open batches.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.batches.len()
    }

    /// Flush expired batches every `flush_interval`; flush everything once
    /// `shutdown` flips to `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.flush_interval);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.flush_expired().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        let flushed = self.flush_all().await;
        debug!(flushed, "Batcher stopped");
    }
}
