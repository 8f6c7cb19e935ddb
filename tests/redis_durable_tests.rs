//! End-to-end tests for the Redis driver.
//!
//! These need a running Redis server and are ignored by default:
//!
//! ```text
//! cargo test --test redis_durable_tests -- --ignored
//! ```
//!
//! The server address is taken from `EVENT_BUS_REDIS_HOST` /
//! `EVENT_BUS_REDIS_PORT` (default 127.0.0.1:6379). Topics and service
//! names are randomized per test, so runs do not interfere with each other
//! or with leftover state.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use uuid::Uuid;
use wirebus::{
    DriverName, EventBus, EventBusConfig, EventBusResult, EventPayload, RedisConfig, SharedHandler,
};

fn redis_config(service_name: &str) -> EventBusConfig {
    EventBusConfig {
        driver: DriverName::Redis,
        redis: RedisConfig {
            host: std::env::var("EVENT_BUS_REDIS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: std::env::var("EVENT_BUS_REDIS_PORT")
                .ok()
                .and_then(|value| value.parse().ok())
                .unwrap_or(6379),
            password: None,
            db: 0,
            service_name: service_name.to_string(),
            max_log_entries: None,
        },
    }
}

async fn connected_bus(service_name: &str) -> EventBus {
    let bus = EventBus::new(redis_config(service_name)).unwrap();
    bus.connect().await.unwrap();
    bus
}

fn unique(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::now_v7().simple())
}

/// Handler that records the `data` of every event it sees.
fn collector() -> (Arc<Mutex<Vec<serde_json::Value>>>, SharedHandler) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let handler: SharedHandler = Arc::new(move |payload: &EventPayload| -> EventBusResult<()> {
        sink.lock().unwrap().push(payload.data.clone());
        Ok(())
    });
    (seen, handler)
}

#[tokio::test]
#[ignore = "requires a running Redis server"]
async fn offline_consumers_catch_up_independently_and_in_order() {
    let topic = format!("{}.created", unique("orders"));

    let emitter = connected_bus(&unique("emitter")).await;
    for i in 0..5 {
        emitter.emit(&topic, serde_json::json!(i), None).await.unwrap();
    }

    // Both consumers come online only after the events were emitted, under
    // distinct service names.
    let first = connected_bus(&unique("svc")).await;
    let second = connected_bus(&unique("svc")).await;

    let (seen_first, handler_first) = collector();
    let (seen_second, handler_second) = collector();

    first.on_durable(&topic, handler_first).await.unwrap().unwrap();
    second.on_durable(&topic, handler_second).await.unwrap().unwrap();

    let expected: Vec<serde_json::Value> = (0..5).map(|i| serde_json::json!(i)).collect();
    assert_eq!(*seen_first.lock().unwrap(), expected);
    assert_eq!(*seen_second.lock().unwrap(), expected);
}

#[tokio::test]
#[ignore = "requires a running Redis server"]
async fn duplicate_durable_setup_does_not_redeliver() {
    let topic = format!("{}.created", unique("orders"));
    let service = unique("svc");

    let emitter = connected_bus(&unique("emitter")).await;
    for i in 0..3 {
        emitter.emit(&topic, serde_json::json!(i), None).await.unwrap();
    }

    let consumer = connected_bus(&service).await;
    let (seen_first, handler_first) = collector();
    consumer.on_durable(&topic, handler_first).await.unwrap().unwrap();
    assert_eq!(seen_first.lock().unwrap().len(), 3);

    // Same pattern, same service, no intervening emits: nothing to replay.
    let (seen_second, handler_second) = collector();
    consumer.on_durable(&topic, handler_second).await.unwrap().unwrap();
    assert!(seen_second.lock().unwrap().is_empty());
}

#[tokio::test]
#[ignore = "requires a running Redis server"]
async fn restarted_consumer_resumes_from_its_checkpoint() {
    let topic = format!("{}.created", unique("orders"));
    let service = unique("svc");

    let emitter = connected_bus(&unique("emitter")).await;
    for i in 0..3 {
        emitter.emit(&topic, serde_json::json!(i), None).await.unwrap();
    }

    // First incarnation processes the backlog and checkpoints.
    {
        let consumer = connected_bus(&service).await;
        let (seen, handler) = collector();
        consumer.on_durable(&topic, handler).await.unwrap().unwrap();
        assert_eq!(seen.lock().unwrap().len(), 3);
        consumer.disconnect().await.unwrap();
    }

    for i in 3..5 {
        emitter.emit(&topic, serde_json::json!(i), None).await.unwrap();
    }

    // Second incarnation with the same service name sees only the new
    // records, starting right after the checkpoint.
    let restarted = connected_bus(&service).await;
    let (seen, handler) = collector();
    restarted.on_durable(&topic, handler).await.unwrap().unwrap();
    assert_eq!(
        *seen.lock().unwrap(),
        vec![serde_json::json!(3), serde_json::json!(4)]
    );
}

#[tokio::test]
#[ignore = "requires a running Redis server"]
async fn expired_records_are_skipped_during_catch_up() {
    let topic = format!("{}.ping", unique("health"));

    let emitter = connected_bus(&unique("emitter")).await;
    // TTL of zero minutes expires immediately.
    emitter.emit(&topic, serde_json::json!("stale"), Some(0)).await.unwrap();
    emitter.emit(&topic, serde_json::json!("fresh"), None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    let consumer = connected_bus(&unique("svc")).await;
    let (seen, handler) = collector();
    consumer.on_durable(&topic, handler).await.unwrap().unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![serde_json::json!("fresh")]);
}

#[tokio::test]
#[ignore = "requires a running Redis server"]
async fn live_subscribers_receive_only_matching_topics() {
    let ns = unique("orders");
    let bus = connected_bus(&unique("svc")).await;

    let (seen, handler) = collector();
    bus.on(&format!("{ns}.*"), handler);
    // Give the driver task a moment to register the subscription.
    tokio::time::sleep(Duration::from_millis(200)).await;

    bus.emit(&format!("{ns}.created"), serde_json::json!(1), None).await.unwrap();
    bus.emit(&format!("{ns}.created.v2"), serde_json::json!(2), None).await.unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    // `*` spans one segment only, so the v2 topic is filtered out.
    assert_eq!(*seen.lock().unwrap(), vec![serde_json::json!(1)]);
}

#[tokio::test]
#[ignore = "requires a running Redis server"]
async fn remove_all_listeners_empties_the_registry() {
    let ns = unique("orders");
    let bus = connected_bus(&unique("svc")).await;

    let (_, handler) = collector();
    bus.on(&format!("{ns}.created"), handler.clone());
    bus.on(&format!("{ns}.*"), handler.clone());
    bus.on_durable(&format!("{ns}.settled"), handler).await.unwrap().unwrap();
    assert_eq!(bus.event_names().await.len(), 3);

    bus.remove_all_listeners(None);
    assert!(bus.event_names().await.is_empty());
    assert_eq!(bus.listener_count(&format!("{ns}.*")).await, 0);
}
