//! # Subscriptions
//!
//! Subscriber handles and the registry the bus routes into.
//!
//! ## Ordering
//!
//! Each exact event type owns a bucket kept sorted by descending priority.
//! Ties keep insertion order: every subscription carries a registry-wide
//! sequence number used as the secondary sort key.
//!
//! Glob subscriptions (`user.*`) live in a separate list and are merged into
//! the exact bucket at lookup time under the same ordering.

use crate::error::{BoxError, BusError};
use crate::event::Event;
use crate::pattern;
use crate::pipeline::EventFilter;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Unique identifier of a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Consumer of events delivered by the bus.
#[async_trait]
pub trait EventHandler<E: Event>: Send + Sync {
    /// Name used in logs and middleware spans.
    fn name(&self) -> &str;

    async fn handle(&self, ctx: &CancellationToken, event: &E) -> Result<(), BoxError>;
}

/// [`EventHandler`] backed by an async closure.
pub struct FnHandler<F> {
    name: String,
    f: F,
}

/// Build an [`EventHandler`] from an async closure receiving an owned event.
pub fn handler_fn<E, F, Fut>(name: impl Into<String>, f: F) -> FnHandler<F>
where
    E: Event,
    F: Fn(E) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxError>> + Send,
{
    FnHandler {
        name: name.into(),
        f,
    }
}

#[async_trait]
impl<E, F, Fut> EventHandler<E> for FnHandler<F>
where
    E: Event,
    F: Fn(E) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), BoxError>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, _ctx: &CancellationToken, event: &E) -> Result<(), BoxError> {
        (self.f)(event.clone()).await
    }
}

/// Options accepted by `subscribe_with_options`.
///
/// `timeout` and `max_retries` fall back to the bus configuration when unset.
pub struct SubscriptionOptions<E> {
    pub pattern: Option<String>,
    pub filter: Option<Arc<dyn EventFilter<E>>>,
    pub priority: i32,
    pub is_async: bool,
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
    pub metadata: BTreeMap<String, String>,
}

impl<E: Event> SubscriptionOptions<E> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            pattern: None,
            filter: None,
            priority: 0,
            is_async: false,
            timeout: None,
            max_retries: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Match destinations with a glob instead of the exact event type.
    #[must_use]
    pub fn pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    #[must_use]
    pub fn filter(mut self, filter: Arc<dyn EventFilter<E>>) -> Self {
        self.filter = Some(filter);
        self
    }

    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Deliver on a spawned task; failures never reach the publisher.
    #[must_use]
    pub fn asynchronous(mut self) -> Self {
        self.is_async = true;
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    #[must_use]
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

impl<E: Event> Default for SubscriptionOptions<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Fields mutated by the dispatch path.
#[derive(Debug, Clone)]
struct SubscriptionStats {
    retry_count: u32,
    last_error: Option<String>,
    last_used: Option<DateTime<Utc>>,
    usage_count: u64,
    active: bool,
}

/// A registered subscriber.
pub struct Subscription<E> {
    id: SubscriptionId,
    event_type: String,
    pattern: Option<String>,
    handler: Arc<dyn EventHandler<E>>,
    filter: Option<Arc<dyn EventFilter<E>>>,
    priority: i32,
    is_async: bool,
    timeout: Duration,
    max_retries: u32,
    created: DateTime<Utc>,
    metadata: BTreeMap<String, String>,
    sequence: u64,
    stats: Mutex<SubscriptionStats>,
}

impl<E: Event> Subscription<E> {
    /// Build a subscription, resolving unset options against the defaults.
    ///
    /// An `event_type` containing glob wildcards becomes the pattern when no
    /// explicit pattern is given.
    ///
    /// # Errors
    ///
    /// `BusError::InvalidSubscription` for an empty event type or pattern.
    pub fn new(
        event_type: impl Into<String>,
        handler: Arc<dyn EventHandler<E>>,
        options: SubscriptionOptions<E>,
        default_timeout: Duration,
        default_max_retries: u32,
    ) -> Result<Self, BusError> {
        let event_type = event_type.into();
        if event_type.trim().is_empty() {
            return Err(BusError::InvalidSubscription {
                reason: "event type must not be empty".into(),
            });
        }

        let pattern = match options.pattern {
            Some(p) if p.trim().is_empty() => {
                return Err(BusError::InvalidSubscription {
                    reason: "pattern must not be empty".into(),
                })
            }
            Some(p) => Some(p),
            None if pattern::is_glob(&event_type) => Some(event_type.clone()),
            None => None,
        };

        Ok(Self {
            id: SubscriptionId::new(),
            event_type,
            pattern,
            handler,
            filter: options.filter,
            priority: options.priority,
            is_async: options.is_async,
            timeout: options.timeout.unwrap_or(default_timeout),
            max_retries: options.max_retries.unwrap_or(default_max_retries),
            created: Utc::now(),
            metadata: options.metadata,
            sequence: 0,
            stats: Mutex::new(SubscriptionStats {
                retry_count: 0,
                last_error: None,
                last_used: None,
                usage_count: 0,
                active: true,
            }),
        })
    }

    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    #[must_use]
    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    #[must_use]
    pub fn pattern(&self) -> Option<&str> {
        self.pattern.as_deref()
    }

    #[must_use]
    pub fn handler(&self) -> &Arc<dyn EventHandler<E>> {
        &self.handler
    }

    #[must_use]
    pub fn priority(&self) -> i32 {
        self.priority
    }

    #[must_use]
    pub fn is_async(&self) -> bool {
        self.is_async
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.stats.lock().active
    }

    /// Whether this subscription should receive `event`.
    #[must_use]
    pub fn accepts(&self, event: &E) -> bool {
        self.is_active() && self.filter.as_ref().map_or(true, |f| f.accept(event))
    }

    pub(crate) fn record_use(&self) {
        let mut stats = self.stats.lock();
        stats.usage_count += 1;
        stats.last_used = Some(Utc::now());
    }

    pub(crate) fn record_retry(&self, retry_count: u32, error: &BusError) {
        let mut stats = self.stats.lock();
        stats.retry_count = retry_count;
        stats.last_error = Some(error.to_string());
    }

    pub(crate) fn record_success(&self) {
        self.stats.lock().retry_count = 0;
    }

    pub(crate) fn record_error(&self, error: &BusError) {
        self.stats.lock().last_error = Some(error.to_string());
    }

    pub(crate) fn deactivate(&self) {
        self.stats.lock().active = false;
    }

    /// Serializable snapshot without the handler.
    #[must_use]
    pub fn info(&self) -> SubscriptionInfo {
        let stats = self.stats.lock().clone();
        SubscriptionInfo {
            id: self.id,
            event_type: self.event_type.clone(),
            pattern: self.pattern.clone(),
            handler: self.handler.name().to_string(),
            priority: self.priority,
            is_async: self.is_async,
            timeout: self.timeout,
            max_retries: self.max_retries,
            retry_count: stats.retry_count,
            last_error: stats.last_error,
            created: self.created,
            last_used: stats.last_used,
            usage_count: stats.usage_count,
            active: stats.active,
            metadata: self.metadata.clone(),
        }
    }

    fn matches_destination(&self, destination: &str) -> bool {
        match &self.pattern {
            Some(p) => pattern::matches(p, destination),
            None => self.event_type == destination,
        }
    }
}

impl<E> fmt::Debug for Subscription<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("event_type", &self.event_type)
            .field("pattern", &self.pattern)
            .field("priority", &self.priority)
            .field("is_async", &self.is_async)
            .finish_non_exhaustive()
    }
}

/// Point-in-time view of a subscription.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub event_type: String,
    pub pattern: Option<String>,
    pub handler: String,
    pub priority: i32,
    pub is_async: bool,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub timeout: Duration,
    pub max_retries: u32,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub created: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
    pub usage_count: u64,
    pub active: bool,
    pub metadata: BTreeMap<String, String>,
}

struct RegistryInner<E> {
    buckets: HashMap<String, Vec<Arc<Subscription<E>>>>,
    wildcards: Vec<Arc<Subscription<E>>>,
    next_sequence: u64,
}

/// Event type -> priority-ordered subscriptions.
pub struct SubscriptionRegistry<E> {
    inner: RwLock<RegistryInner<E>>,
}

fn by_priority<E>(a: &Arc<Subscription<E>>, b: &Arc<Subscription<E>>) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then(a.sequence.cmp(&b.sequence))
}

impl<E: Event> SubscriptionRegistry<E> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(RegistryInner {
                buckets: HashMap::new(),
                wildcards: Vec::new(),
                next_sequence: 0,
            }),
        }
    }

    /// Register a subscription and return its id.
    pub fn insert(&self, mut subscription: Subscription<E>) -> SubscriptionId {
        let mut inner = self.inner.write();
        subscription.sequence = inner.next_sequence;
        inner.next_sequence += 1;

        let id = subscription.id;
        let subscription = Arc::new(subscription);
        debug!(
            subscription_id = %id,
            event_type = %subscription.event_type,
            priority = subscription.priority,
            is_async = subscription.is_async,
            "Subscription registered"
        );

        let list = if subscription.pattern.is_some() {
            &mut inner.wildcards
        } else {
            inner
                .buckets
                .entry(subscription.event_type.clone())
                .or_default()
        };
        list.push(subscription);
        list.sort_by(by_priority);
        id
    }

    /// Remove a subscription.
    ///
    /// # Errors
    ///
    /// `BusError::SubscriptionNotFound` when no subscription has this id.
    pub fn remove(&self, id: SubscriptionId) -> Result<Arc<Subscription<E>>, BusError> {
        let mut inner = self.inner.write();

        let mut found = None;
        for (event_type, bucket) in &mut inner.buckets {
            if let Some(pos) = bucket.iter().position(|s| s.id == id) {
                found = Some((event_type.clone(), bucket.remove(pos)));
                break;
            }
        }

        let removed = match found {
            Some((event_type, removed)) => {
                if inner.buckets.get(&event_type).is_some_and(Vec::is_empty) {
                    inner.buckets.remove(&event_type);
                }
                removed
            }
            None => {
                let pos = inner
                    .wildcards
                    .iter()
                    .position(|s| s.id == id)
                    .ok_or(BusError::SubscriptionNotFound(id))?;
                inner.wildcards.remove(pos)
            }
        };

        removed.deactivate();
        debug!(subscription_id = %id, event_type = %removed.event_type, "Subscription removed");
        Ok(removed)
    }

    /// Subscriptions receiving `destination`, in dispatch order.
    #[must_use]
    pub fn lookup(&self, destination: &str) -> Vec<Arc<Subscription<E>>> {
        let inner = self.inner.read();
        let mut matched: Vec<_> = inner
            .buckets
            .get(destination)
            .cloned()
            .unwrap_or_default();

        let before = matched.len();
        matched.extend(
            inner
                .wildcards
                .iter()
                .filter(|s| s.matches_destination(destination))
                .cloned(),
        );
        if matched.len() != before {
            matched.sort_by(by_priority);
        }
        matched
    }

    /// Snapshots of every subscription.
    #[must_use]
    pub fn infos(&self) -> Vec<SubscriptionInfo> {
        let inner = self.inner.read();
        let mut all: Vec<_> = inner
            .buckets
            .values()
            .flatten()
            .chain(inner.wildcards.iter())
            .collect();
        all.sort_by_key(|s| s.sequence);
        all.into_iter().map(|s| s.info()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        let inner = self.inner.read();
        inner.buckets.values().map(Vec::len).sum::<usize>() + inner.wildcards.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E: Event> Default for SubscriptionRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}
