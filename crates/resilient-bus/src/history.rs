//! # Event History
//!
//! Bounded ring buffer of recently published events with a per-type index.
//!
//! ## Eviction
//!
//! When the buffer is full the oldest entry is evicted. The per-type index
//! stores buffer positions, so eviction shifts every stored position down by
//! one instead of rebuilding the index from scratch.

use crate::event::Event;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, VecDeque};

/// One stored publish attempt.
#[derive(Debug, Clone)]
pub struct HistoricalEvent<E> {
    /// Monotonic sequence number assigned at insertion.
    pub sequence: u64,
    pub event: E,
    pub timestamp: DateTime<Utc>,
    pub metadata: BTreeMap<String, String>,
}

struct HistoryInner<E> {
    entries: VecDeque<HistoricalEvent<E>>,
    /// event type -> ascending positions into `entries`
    index: HashMap<String, VecDeque<usize>>,
    next_sequence: u64,
}

/// Fixed-capacity FIFO of [`HistoricalEvent`]s.
pub struct EventHistory<E> {
    capacity: usize,
    inner: RwLock<HistoryInner<E>>,
}

impl<E: Event> EventHistory<E> {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: RwLock::new(HistoryInner {
                entries: VecDeque::with_capacity(capacity),
                index: HashMap::new(),
                next_sequence: 0,
            }),
        }
    }

    /// Store an event, evicting the oldest entry when full.
    ///
    /// Returns the sequence number assigned to the entry, or `None` when the
    /// history has zero capacity.
    pub fn record(&self, event: E, metadata: BTreeMap<String, String>) -> Option<u64> {
        if self.capacity == 0 {
            return None;
        }

        let mut inner = self.inner.write();

        if inner.entries.len() >= self.capacity {
            if let Some(evicted) = inner.entries.pop_front() {
                let evicted_type = evicted.event.event_type();
                let mut emptied = false;
                if let Some(positions) = inner.index.get_mut(evicted_type) {
                    positions.pop_front();
                    emptied = positions.is_empty();
                }
                if emptied {
                    inner.index.remove(evicted_type);
                }
                for positions in inner.index.values_mut() {
                    for position in positions.iter_mut() {
                        *position -= 1;
                    }
                }
            }
        }

        let sequence = inner.next_sequence;
        inner.next_sequence += 1;

        let position = inner.entries.len();
        inner
            .index
            .entry(event.event_type().to_string())
            .or_default()
            .push_back(position);
        inner.entries.push_back(HistoricalEvent {
            sequence,
            event,
            timestamp: Utc::now(),
            metadata,
        });

        Some(sequence)
    }

    /// All stored entries, oldest first.
    #[must_use]
    pub fn all(&self) -> Vec<HistoricalEvent<E>> {
        self.inner.read().entries.iter().cloned().collect()
    }

    /// The `limit` most recent entries, oldest first.
    #[must_use]
    pub fn recent(&self, limit: usize) -> Vec<HistoricalEvent<E>> {
        let inner = self.inner.read();
        let skip = inner.entries.len().saturating_sub(limit);
        inner.entries.iter().skip(skip).cloned().collect()
    }

    /// Entries of one event type, oldest first.
    #[must_use]
    pub fn by_type(&self, event_type: &str) -> Vec<HistoricalEvent<E>> {
        let inner = self.inner.read();
        inner
            .index
            .get(event_type)
            .map(|positions| {
                positions
                    .iter()
                    .filter_map(|&p| inner.entries.get(p).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Entries recorded at or after `since`, oldest first.
    #[must_use]
    pub fn since(&self, since: DateTime<Utc>) -> Vec<HistoricalEvent<E>> {
        self.inner
            .read()
            .entries
            .iter()
            .filter(|entry| entry.timestamp >= since)
            .cloned()
            .collect()
    }

    /// Number of entries stored per event type.
    #[must_use]
    pub fn type_counts(&self) -> HashMap<String, usize> {
        self.inner
            .read()
            .index
            .iter()
            .map(|(event_type, positions)| (event_type.clone(), positions.len()))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.entries.clear();
        inner.index.clear();
    }
}
