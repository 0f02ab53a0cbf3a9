//! Publish/subscribe dispatcher with trailing-wildcard patterns.
//!
//! `publish` resolves the matching subscribers, enqueues the event on a
//! bounded queue and returns immediately. A background dispatcher drains
//! the queue and runs every matching handler in its own task, so a slow or
//! failing handler never delays its siblings or the publisher. Handler
//! errors and panics are logged and dropped.
//!
//! Patterns are either an exact event type (`model.promoted`) or a prefix
//! ending in a wildcard segment (`data.ingested.*`), which matches exactly
//! one trailing segment.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::domain::Event;

/// Errors from the event bus
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EventBusError {
    #[error("Invalid event pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Event queue is full (capacity {capacity}), dropped '{event_type}'")]
    QueueFull { event_type: String, capacity: usize },

    #[error("Event bus is shut down")]
    Closed,
}

/// Bus settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventBusConfig {
    /// Events that may wait for dispatch before `publish` fails (default: 256)
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_queue_capacity() -> usize {
    256
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Parsed subscription pattern
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPattern {
    /// Matches one event type
    Exact(String),

    /// `prefix.*`: the prefix segments followed by exactly one more segment
    Wildcard(Vec<String>),

    /// Every event (see `EventBus::subscribe_all`)
    Any,
}

impl EventPattern {
    pub fn parse(pattern: &str) -> Result<Self, EventBusError> {
        let invalid = |reason: &str| EventBusError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        };

        if pattern.is_empty() {
            return Err(invalid("pattern is empty"));
        }

        let segments: Vec<&str> = pattern.split('.').collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(invalid("empty segment"));
        }

        let (last, prefix) = match segments.split_last() {
            Some(split) => split,
            None => return Err(invalid("pattern is empty")),
        };

        if prefix.iter().any(|s| s.contains('*')) {
            return Err(invalid("wildcard is only allowed as the last segment"));
        }

        match *last {
            "*" => Ok(Self::Wildcard(prefix.iter().map(|s| s.to_string()).collect())),
            s if s.contains('*') => Err(invalid("wildcard must be a whole segment")),
            _ => Ok(Self::Exact(pattern.to_string())),
        }
    }

    pub fn matches(&self, event_type: &str) -> bool {
        match self {
            Self::Exact(exact) => exact == event_type,
            Self::Wildcard(prefix) => {
                let segments: Vec<&str> = event_type.split('.').collect();
                segments.len() == prefix.len() + 1
                    && prefix.iter().zip(&segments).all(|(p, s)| p == s)
                    && segments.last().map(|s| !s.is_empty()).unwrap_or(false)
            }
            Self::Any => true,
        }
    }
}

impl fmt::Display for EventPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(s) => f.write_str(s),
            Self::Wildcard(prefix) if prefix.is_empty() => f.write_str("*"),
            Self::Wildcard(prefix) => write!(f, "{}.*", prefix.join(".")),
            Self::Any => f.write_str("<all>"),
        }
    }
}

/// Reacts to published events
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> anyhow::Result<()>;
}

/// Adapter so plain closures can subscribe
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F> EventHandler for FnHandler<F>
where
    F: Fn(&Event) -> anyhow::Result<()> + Send + Sync,
{
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        (self.0)(event)
    }
}

struct Subscription {
    id: u64,
    pattern: EventPattern,
    handler: Arc<dyn EventHandler>,
}

type Registry = RwLock<Vec<Subscription>>;

/// Returned by `subscribe`; call `unsubscribe` to stop receiving events.
///
/// Dropping the handle leaves the subscription in place.
#[derive(Debug)]
pub struct SubscriptionHandle {
    id: u64,
    pattern: String,
    registry: Weak<Registry>,
}

impl SubscriptionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Remove the subscription. Returns `false` if it was already gone.
    pub fn unsubscribe(self) -> bool {
        let Some(registry) = self.registry.upgrade() else {
            return false;
        };
        let mut subs = registry
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let before = subs.len();
        subs.retain(|s| s.id != self.id);
        let removed = subs.len() < before;
        if removed {
            debug!(id = self.id, pattern = %self.pattern, "Unsubscribed");
        }
        removed
    }
}

/// An event plus the handlers resolved when it was published
struct Dispatch {
    event: Event,
    handlers: Vec<(u64, Arc<dyn EventHandler>)>,
}

/// Cheap-to-clone publisher/subscriber front end
#[derive(Clone)]
pub struct EventBus {
    registry: Arc<Registry>,
    next_id: Arc<AtomicU64>,
    tx: mpsc::Sender<Dispatch>,
    capacity: usize,
    lifecycle: Arc<Mutex<Lifecycle>>,
}

struct Lifecycle {
    dispatcher: Option<JoinHandle<()>>,
    stop: Option<oneshot::Sender<()>>,
}

impl EventBus {
    /// Start a bus and its dispatcher. Must be called inside a tokio runtime.
    pub fn start(config: &EventBusConfig) -> Self {
        let capacity = config.queue_capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let (stop_tx, stop_rx) = oneshot::channel();
        let dispatcher = tokio::spawn(dispatch_loop(rx, stop_rx));

        info!(capacity, "Event bus started");

        Self {
            registry: Arc::new(RwLock::new(Vec::new())),
            next_id: Arc::new(AtomicU64::new(1)),
            tx,
            capacity,
            lifecycle: Arc::new(Mutex::new(Lifecycle {
                dispatcher: Some(dispatcher),
                stop: Some(stop_tx),
            })),
        }
    }

    /// Subscribe `handler` to events whose type matches `pattern`
    pub fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionHandle, EventBusError> {
        let parsed = EventPattern::parse(pattern)?;
        Ok(self.register(parsed, handler))
    }

    /// Subscribe a closure
    pub fn subscribe_fn<F>(&self, pattern: &str, f: F) -> Result<SubscriptionHandle, EventBusError>
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscribe(pattern, Arc::new(FnHandler(f)))
    }

    /// Subscribe to every event
    pub fn subscribe_all(&self, handler: Arc<dyn EventHandler>) -> SubscriptionHandle {
        self.register(EventPattern::Any, handler)
    }

    fn register(&self, pattern: EventPattern, handler: Arc<dyn EventHandler>) -> SubscriptionHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let shown = pattern.to_string();

        self.registry
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(Subscription {
                id,
                pattern,
                handler,
            });

        debug!(id, pattern = %shown, "Subscribed");

        SubscriptionHandle {
            id,
            pattern: shown,
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    /// Enqueue an event; never waits on handlers
    pub fn publish(
        &self,
        event_type: impl Into<String>,
        payload: Map<String, Value>,
    ) -> Result<(), EventBusError> {
        self.publish_event(Event::new(event_type, payload))
    }

    pub fn publish_event(&self, event: Event) -> Result<(), EventBusError> {
        let handlers: Vec<(u64, Arc<dyn EventHandler>)> = self
            .registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .filter(|s| s.pattern.matches(&event.event_type))
            .map(|s| (s.id, Arc::clone(&s.handler)))
            .collect();

        debug!(event_type = %event.event_type, handlers = handlers.len(), "Publishing event");

        self.tx
            .try_send(Dispatch { event, handlers })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(d) => {
                    warn!(event_type = %d.event.event_type, "Event queue full, event dropped");
                    EventBusError::QueueFull {
                        event_type: d.event.event_type,
                        capacity: self.capacity,
                    }
                }
                mpsc::error::TrySendError::Closed(_) => EventBusError::Closed,
            })
    }

    /// Stop accepting events, drain the queue and wait for running handlers.
    ///
    /// Clones of this bus share the dispatcher; only the first call waits.
    /// Publishing through any clone afterwards fails with `Closed`.
    pub async fn shutdown(self) {
        let (stop, dispatcher) = {
            let mut lifecycle = self
                .lifecycle
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            (lifecycle.stop.take(), lifecycle.dispatcher.take())
        };

        if let Some(stop) = stop {
            let _ = stop.send(());
        }

        if let Some(dispatcher) = dispatcher {
            if let Err(e) = dispatcher.await {
                error!(error = %e, "Event dispatcher crashed");
            }
            info!("Event bus stopped");
        }
    }
}

async fn dispatch_loop(mut rx: mpsc::Receiver<Dispatch>, mut stop: oneshot::Receiver<()>) {
    let mut running: JoinSet<()> = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut stop => {
                rx.close();
                // Deliver whatever was queued before the stop
                while let Some(pending) = rx.recv().await {
                    spawn_handlers(&mut running, pending);
                }
                break;
            }
            next = rx.recv() => {
                let Some(dispatch) = next else { break };
                spawn_handlers(&mut running, dispatch);
            }
            Some(joined) = running.join_next(), if !running.is_empty() => {
                log_join_error(joined);
            }
        }
    }

    while let Some(joined) = running.join_next().await {
        log_join_error(joined);
    }
}

fn log_join_error(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(error = %e, "Event handler panicked");
        }
    }
}

fn spawn_handlers(running: &mut JoinSet<()>, dispatch: Dispatch) {
    let event = Arc::new(dispatch.event);

    for (id, handler) in dispatch.handlers {
        let event = Arc::clone(&event);
        running.spawn(async move {
            if let Err(e) = handler.handle(&event).await {
                warn!(
                    subscription = id,
                    event_type = %event.event_type,
                    error = %e,
                    "Event handler failed"
                );
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_pattern() {
        let p = EventPattern::parse("model.promoted").unwrap();
        assert!(p.matches("model.promoted"));
        assert!(!p.matches("model.promoted.v2"));
        assert!(!p.matches("model"));
    }

    #[test]
    fn test_wildcard_matches_one_trailing_segment() {
        let p = EventPattern::parse("data.ingested.*").unwrap();
        assert!(p.matches("data.ingested.icustays"));
        assert!(p.matches("data.ingested.patients"));
        assert!(!p.matches("data.ingested"));
        assert!(!p.matches("data.ingested.icustays.extra"));
        assert!(!p.matches("data.transformed.icustays"));
    }

    #[test]
    fn test_bare_wildcard_matches_single_segment_types() {
        let p = EventPattern::parse("*").unwrap();
        assert!(p.matches("heartbeat"));
        assert!(!p.matches("data.ingested"));
    }

    #[test]
    fn test_invalid_patterns() {
        assert!(EventPattern::parse("").is_err());
        assert!(EventPattern::parse("data.*.icustays").is_err());
        assert!(EventPattern::parse("data.ingested.ic*").is_err());
        assert!(EventPattern::parse("data..ingested").is_err());
    }

    #[tokio::test]
    async fn test_handle_reports_normalized_pattern() {
        let bus = EventBus::start(&EventBusConfig::default());
        let exact = bus.subscribe_fn("model.trained", |_| Ok(())).unwrap();
        let wildcard = bus.subscribe_fn("data.ingested.*", |_| Ok(())).unwrap();

        assert_eq!(exact.pattern(), "model.trained");
        assert_eq!(wildcard.pattern(), "data.ingested.*");
        assert_ne!(exact.id(), wildcard.id());
        assert_eq!(bus.subscriber_count(), 2);

        bus.shutdown().await;
    }

    #[test]
    fn test_pattern_display() {
        assert_eq!(EventPattern::parse("data.ingested.*").unwrap().to_string(), "data.ingested.*");
        assert_eq!(EventPattern::parse("model.trained").unwrap().to_string(), "model.trained");
    }
}
