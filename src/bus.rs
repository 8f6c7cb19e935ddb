//! Driver contract and the event bus facade.
//!
//! The facade selects a driver from configuration at construction and
//! forwards every call. It is a plain value meant to be built once by the
//! composition root and handed to consumers by reference; there is no
//! process-wide instance.

use crate::config::EventBusConfig;
use crate::error::{EventBusError, EventBusResult};
use crate::memory::MemoryEventDriver;
#[cfg(feature = "redis")]
use crate::redis::RedisEventDriver;
use crate::types::{DriverName, SharedHandler};
use async_trait::async_trait;
use tokio::task::JoinHandle;

/// Contract every driver implements.
///
/// Registration and removal never fail: failures beneath them (a lost
/// subscribe connection, say) are logged and retried by the driver, not
/// surfaced to the registrant. Emit is the one operation whose errors the
/// caller must handle.
#[async_trait]
pub trait EventBusDriver: Send + Sync {
    /// Which driver this is.
    fn name(&self) -> DriverName;

    /// Emit an event with optional data and TTL.
    async fn emit(
        &self,
        event: &str,
        data: serde_json::Value,
        ttl_minutes: Option<u64>,
    ) -> EventBusResult<()>;

    /// Subscribe a handler to a topic pattern (real-time only).
    fn on(&self, pattern: &str, handler: SharedHandler);

    /// Subscribe with durable, at-least-once delivery.
    ///
    /// Setup runs in the background; the returned handle may be awaited by
    /// callers that want the outcome, and may be dropped by callers that do
    /// not. Setup errors are logged either way.
    fn on_durable(&self, pattern: &str, handler: SharedHandler) -> JoinHandle<EventBusResult<()>>;

    /// Remove one handler (by `Arc` identity) or every handler for a
    /// pattern.
    fn off(&self, pattern: &str, handler: Option<&SharedHandler>);

    /// Remove the listeners of one pattern, or of every pattern.
    fn remove_all_listeners(&self, pattern: Option<&str>);

    /// Number of handlers registered for a pattern.
    async fn listener_count(&self, pattern: &str) -> usize;

    /// Every pattern that currently has listeners.
    async fn event_names(&self) -> Vec<String>;
}

/// The selected driver, tagged by kind.
///
/// Capability differences between drivers are expressed by matching on
/// this, not by probing for optional methods.
#[derive(Debug)]
pub enum EventDriver {
    /// In-memory driver.
    Memory(MemoryEventDriver),
    /// Redis-backed driver.
    #[cfg(feature = "redis")]
    Redis(RedisEventDriver),
}

/// Event bus facade over the configured driver.
#[derive(Debug)]
pub struct EventBus {
    driver: EventDriver,
}

impl EventBus {
    /// Build an event bus from configuration.
    ///
    /// Must be called from within a Tokio runtime when the Redis driver is
    /// selected, because the driver spawns its background task here. No
    /// connection is opened until [`connect`](Self::connect).
    pub fn new(config: EventBusConfig) -> EventBusResult<Self> {
        let driver = match config.driver {
            DriverName::Memory => EventDriver::Memory(MemoryEventDriver::new()),
            #[cfg(feature = "redis")]
            DriverName::Redis => EventDriver::Redis(RedisEventDriver::new(config.redis)?),
            #[cfg(not(feature = "redis"))]
            DriverName::Redis => {
                return Err(EventBusError::NotSupported {
                    driver: DriverName::Redis,
                    operation: "the redis driver (feature disabled)",
                })
            }
        };
        Ok(Self { driver })
    }

    /// Build an event bus directly over a driver.
    pub fn with_driver(driver: EventDriver) -> Self {
        Self { driver }
    }

    fn driver(&self) -> &dyn EventBusDriver {
        match &self.driver {
            EventDriver::Memory(driver) => driver,
            #[cfg(feature = "redis")]
            EventDriver::Redis(driver) => driver,
        }
    }

    /// The active driver's name.
    pub fn driver_name(&self) -> DriverName {
        self.driver().name()
    }

    /// Emit an event with optional data and TTL.
    pub async fn emit(
        &self,
        event: &str,
        data: serde_json::Value,
        ttl_minutes: Option<u64>,
    ) -> EventBusResult<()> {
        self.driver().emit(event, data, ttl_minutes).await
    }

    /// Emit an event and return only after every matching handler has run.
    ///
    /// Only the memory driver dispatches synchronously; any other driver
    /// yields a capability error.
    pub fn emit_sync(
        &self,
        event: &str,
        data: serde_json::Value,
        ttl_minutes: Option<u64>,
    ) -> EventBusResult<()> {
        match &self.driver {
            EventDriver::Memory(driver) => driver.emit_now(event, data, ttl_minutes),
            #[cfg(feature = "redis")]
            EventDriver::Redis(driver) => Err(EventBusError::NotSupported {
                driver: driver.name(),
                operation: "synchronous emit",
            }),
        }
    }

    /// Subscribe a handler to a topic pattern (real-time only).
    pub fn on(&self, pattern: &str, handler: SharedHandler) {
        self.driver().on(pattern, handler)
    }

    /// Subscribe with durable, at-least-once delivery.
    ///
    /// See [`EventBusDriver::on_durable`]; the memory driver rejects this
    /// with a capability error.
    pub fn on_durable(
        &self,
        pattern: &str,
        handler: SharedHandler,
    ) -> JoinHandle<EventBusResult<()>> {
        self.driver().on_durable(pattern, handler)
    }

    /// Remove one handler (by `Arc` identity) or every handler for a
    /// pattern.
    pub fn off(&self, pattern: &str, handler: Option<&SharedHandler>) {
        self.driver().off(pattern, handler)
    }

    /// Remove the listeners of one pattern, or of every pattern.
    pub fn remove_all_listeners(&self, pattern: Option<&str>) {
        self.driver().remove_all_listeners(pattern)
    }

    /// Number of handlers registered for a pattern.
    pub async fn listener_count(&self, pattern: &str) -> usize {
        self.driver().listener_count(pattern).await
    }

    /// Every pattern that currently has listeners.
    pub async fn event_names(&self) -> Vec<String> {
        self.driver().event_names().await
    }

    /// Connect the driver. A no-op on the memory driver.
    pub async fn connect(&self) -> EventBusResult<()> {
        match &self.driver {
            EventDriver::Memory(_) => Ok(()),
            #[cfg(feature = "redis")]
            EventDriver::Redis(driver) => driver.connect().await,
        }
    }

    /// Disconnect the driver. A no-op on the memory driver.
    pub async fn disconnect(&self) -> EventBusResult<()> {
        match &self.driver {
            EventDriver::Memory(_) => Ok(()),
            #[cfg(feature = "redis")]
            EventDriver::Redis(driver) => driver.disconnect().await,
        }
    }

    /// Whether the driver is connected. The memory driver always is.
    pub fn is_connected(&self) -> bool {
        match &self.driver {
            EventDriver::Memory(_) => true,
            #[cfg(feature = "redis")]
            EventDriver::Redis(driver) => driver.is_connected(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventPayload, EventRecord};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn memory_bus() -> EventBus {
        EventBus::new(EventBusConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_memory_bus_emit_and_emit_sync() {
        let bus = memory_bus();
        assert_eq!(bus.driver_name(), DriverName::Memory);

        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        bus.on(
            "orders.*",
            Arc::new(move |_: &EventPayload| -> EventBusResult<()> {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );

        bus.emit("orders.created", serde_json::json!({"id": 1}), None)
            .await
            .unwrap();
        bus.emit_sync("orders.updated", serde_json::json!({"id": 1}), None)
            .unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_memory_bus_connection_management_is_a_no_op() {
        let bus = memory_bus();
        assert!(bus.is_connected());
        bus.connect().await.unwrap();
        bus.disconnect().await.unwrap();
        assert!(bus.is_connected());
    }

    #[tokio::test]
    async fn test_memory_bus_rejects_durable_subscriptions() {
        let bus = memory_bus();
        let result = bus
            .on_durable(
                "orders.*",
                Arc::new(|_: &EventPayload| -> EventBusResult<()> { Ok(()) }),
            )
            .await
            .unwrap();
        assert!(matches!(
            result,
            Err(EventBusError::NotSupported {
                driver: DriverName::Memory,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_registry_queries_forward_to_the_driver() {
        let bus = memory_bus();
        let handler: SharedHandler = Arc::new(|_: &EventPayload| -> EventBusResult<()> { Ok(()) });

        bus.on("orders.*", handler.clone());
        bus.on("payments.settled", handler.clone());
        assert_eq!(bus.listener_count("orders.*").await, 1);

        let mut names = bus.event_names().await;
        names.sort();
        assert_eq!(names, vec!["orders.*", "payments.settled"]);

        bus.off("orders.*", Some(&handler));
        assert_eq!(bus.listener_count("orders.*").await, 0);

        bus.remove_all_listeners(None);
        assert!(bus.event_names().await.is_empty());
    }

    #[cfg(feature = "redis")]
    #[tokio::test]
    async fn test_redis_bus_rejects_emit_sync() {
        let config = EventBusConfig {
            driver: DriverName::Redis,
            ..EventBusConfig::default()
        };
        let bus = EventBus::new(config).unwrap();
        assert_eq!(bus.driver_name(), DriverName::Redis);
        assert!(!bus.is_connected());

        let result = bus.emit_sync("orders.created", serde_json::json!({}), None);
        assert!(matches!(
            result,
            Err(EventBusError::NotSupported {
                driver: DriverName::Redis,
                ..
            })
        ));
    }

    #[test]
    fn test_handlers_compose_with_wire_records() {
        // A handler can hand the payload straight back to the wire form,
        // e.g. to forward it elsewhere.
        let payload = EventPayload::new("orders.created", serde_json::json!({"id": 9}), None);
        let record = EventRecord::from(payload.clone());
        assert_eq!(record.event, payload.name);
        assert_eq!(record.timestamp, payload.timestamp);
    }
}
