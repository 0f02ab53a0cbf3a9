//! Event Bus Integration Tests
//!
//! Tests for delivery guarantees, handler isolation, pattern routing,
//! back-pressure and shutdown.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use carecrew::core::{EventBus, EventBusConfig, EventBusError, EventHandler};
use carecrew::domain::Event;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;

fn payload(pairs: &[(&str, Value)]) -> Map<String, Value> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

fn counter(bus: &EventBus, pattern: &str) -> Arc<AtomicU32> {
    let count = Arc::new(AtomicU32::new(0));
    let c = Arc::clone(&count);
    bus.subscribe_fn(pattern, move |_| {
        c.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
    .unwrap();
    count
}

struct Slow(Duration);

#[async_trait]
impl EventHandler for Slow {
    async fn handle(&self, _event: &Event) -> anyhow::Result<()> {
        tokio::time::sleep(self.0).await;
        Ok(())
    }
}

struct Panics;

#[async_trait]
impl EventHandler for Panics {
    async fn handle(&self, _event: &Event) -> anyhow::Result<()> {
        panic!("handler bug");
    }
}

/// Forwards every event it sees
struct Forward(mpsc::UnboundedSender<Event>);

#[async_trait]
impl EventHandler for Forward {
    async fn handle(&self, event: &Event) -> anyhow::Result<()> {
        self.0.send(event.clone())?;
        Ok(())
    }
}

#[tokio::test]
async fn test_each_matching_subscriber_gets_event_once() {
    let bus = EventBus::start(&EventBusConfig::default());

    let exact = counter(&bus, "data.ingested.icustays");
    let wildcard = counter(&bus, "data.ingested.*");
    let other = counter(&bus, "model.trained");
    let all = Arc::new(AtomicU32::new(0));
    {
        let all = Arc::clone(&all);
        bus.subscribe_fn("*", move |_| {
            all.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();
    }

    bus.publish("data.ingested.icustays", payload(&[("rows", json!(120))]))
        .unwrap();
    bus.shutdown().await;

    assert_eq!(exact.load(Ordering::SeqCst), 1);
    assert_eq!(wildcard.load(Ordering::SeqCst), 1);
    assert_eq!(other.load(Ordering::SeqCst), 0);
    // `*` only matches single-segment types
    assert_eq!(all.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_failing_handlers_do_not_affect_siblings() {
    let bus = EventBus::start(&EventBusConfig::default());

    bus.subscribe_fn("data.ingested", |_| anyhow::bail!("warehouse down"))
        .unwrap();
    bus.subscribe("data.ingested", Arc::new(Panics)).unwrap();
    let healthy = counter(&bus, "data.ingested");

    bus.publish("data.ingested", Map::new()).unwrap();
    bus.publish("data.ingested", Map::new()).unwrap();
    bus.shutdown().await;

    assert_eq!(healthy.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_publish_does_not_wait_for_slow_handlers() {
    let bus = EventBus::start(&EventBusConfig::default());
    bus.subscribe("model.trained", Arc::new(Slow(Duration::from_millis(300))))
        .unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.subscribe("model.trained", Arc::new(Forward(tx))).unwrap();

    let started = Instant::now();
    bus.publish("model.trained", payload(&[("auroc", json!(0.86))]))
        .unwrap();
    assert!(started.elapsed() < Duration::from_millis(100));

    // The fast sibling is not held up by the slow one
    let event = tokio::time::timeout(Duration::from_millis(200), rx.recv())
        .await
        .expect("fast handler delayed by slow sibling")
        .unwrap();
    assert_eq!(event.get("auroc"), Some(&json!(0.86)));

    bus.shutdown().await;
}

#[tokio::test]
async fn test_unsubscribe_stops_delivery() {
    let bus = EventBus::start(&EventBusConfig::default());
    let count = Arc::new(AtomicU32::new(0));

    let handle = {
        let count = Arc::clone(&count);
        bus.subscribe_fn("crew.data.completed", move |_| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap()
    };
    assert_eq!(handle.pattern(), "crew.data.completed");
    assert_eq!(bus.subscriber_count(), 1);

    bus.publish("crew.data.completed", Map::new()).unwrap();
    assert!(handle.unsubscribe());
    assert_eq!(bus.subscriber_count(), 0);
    bus.publish("crew.data.completed", Map::new()).unwrap();

    bus.shutdown().await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_late_subscriber_misses_earlier_events() {
    let bus = EventBus::start(&EventBusConfig::default());

    bus.publish("data.ingested", Map::new()).unwrap();
    let late = counter(&bus, "data.ingested");

    bus.shutdown().await;
    assert_eq!(late.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_full_queue_rejects_publish() {
    let bus = EventBus::start(&EventBusConfig { queue_capacity: 1 });
    let count = counter(&bus, "tick");

    // The dispatcher cannot run until this task yields
    bus.publish("tick", Map::new()).unwrap();
    let err = bus.publish("tick", Map::new()).unwrap_err();
    assert_eq!(
        err,
        EventBusError::QueueFull {
            event_type: "tick".to_string(),
            capacity: 1
        }
    );

    bus.shutdown().await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_publish_after_shutdown_fails() {
    let bus = EventBus::start(&EventBusConfig::default());
    let clone = bus.clone();

    bus.shutdown().await;
    assert_eq!(
        clone.publish("tick", Map::new()).unwrap_err(),
        EventBusError::Closed
    );
}

#[tokio::test]
async fn test_invalid_pattern_rejected() {
    let bus = EventBus::start(&EventBusConfig::default());
    let err = bus.subscribe_fn("data.*.icustays", |_| Ok(())).unwrap_err();
    assert!(matches!(err, EventBusError::InvalidPattern { .. }));
    bus.shutdown().await;
}
