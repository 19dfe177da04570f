//! # Router
//!
//! Maps a published event to one or more destinations. Rules are evaluated in
//! descending priority (ties in registration order); each matching rule
//! contributes its destination, optionally with a rewritten event. When no
//! rule matches, the event type itself is the destination.

use crate::event::Event;
use crate::pattern;
use crate::pipeline::EventFilter;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::trace;

/// Per-route event rewrite.
pub type RouteTransform<E> = Arc<dyn Fn(E) -> E + Send + Sync>;

/// A routing rule.
pub struct Route<E> {
    pattern: String,
    destination: String,
    priority: i32,
    filter: Option<Arc<dyn EventFilter<E>>>,
    transform: Option<RouteTransform<E>>,
}

impl<E: Event> Route<E> {
    /// Route event types matching the glob `pattern` to `destination`.
    #[must_use]
    pub fn new(pattern: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            destination: destination.into(),
            priority: 0,
            filter: None,
            transform: None,
        }
    }

    #[must_use]
    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub fn filter(mut self, filter: Arc<dyn EventFilter<E>>) -> Self {
        self.filter = Some(filter);
        self
    }

    #[must_use]
    pub fn transform(mut self, transform: impl Fn(E) -> E + Send + Sync + 'static) -> Self {
        self.transform = Some(Arc::new(transform));
        self
    }

    #[must_use]
    pub fn destination(&self) -> &str {
        &self.destination
    }

    fn matches(&self, event: &E) -> bool {
        pattern::matches(&self.pattern, event.event_type())
            && self.filter.as_ref().map_or(true, |f| f.accept(event))
    }
}

/// Ordered set of [`Route`]s.
pub struct Router<E> {
    routes: RwLock<Vec<Arc<Route<E>>>>,
}

impl<E: Event> Router<E> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            routes: RwLock::new(Vec::new()),
        }
    }

    pub fn add_route(&self, route: Route<E>) {
        let mut routes = self.routes.write();
        routes.push(Arc::new(route));
        // Stable: equal priorities keep registration order.
        routes.sort_by(|a, b| b.priority.cmp(&a.priority));
    }

    /// Destinations for `event`, each paired with the event to deliver there.
    ///
    /// Duplicate destinations keep only the first (highest priority) match.
    #[must_use]
    pub fn resolve(&self, event: &E) -> Vec<(String, E)> {
        let routes = self.routes.read().clone();
        let mut seen = HashSet::new();
        let mut resolved = Vec::new();

        for route in routes.iter().filter(|r| r.matches(event)) {
            if !seen.insert(route.destination.clone()) {
                continue;
            }
            let routed = match &route.transform {
                Some(transform) => transform(event.clone()),
                None => event.clone(),
            };
            trace!(
                event_type = %event.event_type(),
                destination = %route.destination,
                "Event routed"
            );
            resolved.push((route.destination.clone(), routed));
        }

        if resolved.is_empty() {
            resolved.push((event.event_type().to_string(), event.clone()));
        }
        resolved
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.read().is_empty()
    }
}

impl<E: Event> Default for Router<E> {
    fn default() -> Self {
        Self::new()
    }
}
