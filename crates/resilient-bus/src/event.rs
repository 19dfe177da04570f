//! # Bus Events
//!
//! The bus is generic over any type implementing [`Event`]. Collaborators
//! usually define their own enum; [`Envelope`] is a ready-made event carrying
//! a tagged [`Payload`] for callers that do not need a dedicated type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// An event that can be published to the bus.
///
/// The type tag is the default routing key: when no route matches, an event
/// is delivered to the subscriptions registered under its type.
pub trait Event: Clone + Send + Sync + 'static {
    /// Get the type tag of this event.
    fn event_type(&self) -> &str;
}

/// Tagged payload carried by an [`Envelope`].
///
/// Handlers narrow with the typed accessors instead of downcasting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Payload {
    #[default]
    Empty,
    Text(String),
    Json(serde_json::Value),
    Binary(Vec<u8>),
}

impl Payload {
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Json(value) => Some(value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Self::Binary(bytes) => Some(bytes),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Empty)
    }
}

/// General-purpose event: a type tag, a tagged payload and string metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique event id.
    pub id: Uuid,
    /// Type tag used for routing.
    pub event_type: String,
    /// Optional producer name.
    pub source: Option<String>,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Event body.
    pub payload: Payload,
    /// Free-form metadata.
    pub metadata: BTreeMap<String, String>,
}

impl Envelope {
    /// Create an envelope with an empty payload.
    #[must_use]
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            source: None,
            timestamp: Utc::now(),
            payload: Payload::Empty,
            metadata: BTreeMap::new(),
        }
    }

    /// Create an envelope carrying a text payload.
    #[must_use]
    pub fn text(event_type: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(event_type).with_payload(Payload::Text(text.into()))
    }

    /// Create an envelope carrying a JSON payload.
    #[must_use]
    pub fn json(event_type: impl Into<String>, value: serde_json::Value) -> Self {
        Self::new(event_type).with_payload(Payload::Json(value))
    }

    #[must_use]
    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

impl Event for Envelope {
    fn event_type(&self) -> &str {
        &self.event_type
    }
}
