//! Events carried by the event bus.
//!
//! Events are immutable and transient: they fan out to zero or more
//! handlers and are never persisted by the bus itself.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// A published state change.
///
/// `event_type` is dot-delimited, e.g. `data.ingested.icustays`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    pub id: Uuid,

    #[serde(rename = "type")]
    pub event_type: String,

    pub payload: Map<String, Value>,

    pub published_at: DateTime<Utc>,
}

impl Event {
    /// Create a new event with the current timestamp
    pub fn new(event_type: impl Into<String>, payload: Map<String, Value>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            payload,
            published_at: Utc::now(),
        }
    }

    /// Dot-separated segments of the event type
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.event_type.split('.')
    }

    /// Look up a payload field
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }
}
