//! In-memory event driver.
//!
//! Single-process, synchronous dispatch with no durability: `emit` returns
//! only after every matching handler has run. Suitable for single-process
//! applications and testing; use the Redis driver for anything distributed.

use crate::bus::EventBusDriver;
use crate::error::{EventBusError, EventBusResult};
use crate::pattern;
use crate::types::{DriverName, EventPayload, SharedHandler};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::task::JoinHandle;

/// Handler registries, split by pattern kind.
///
/// Exact topics are looked up directly; wildcard patterns are scanned and
/// matched per emit.
#[derive(Default)]
struct Registry {
    exact: HashMap<String, Vec<SharedHandler>>,
    wildcard: HashMap<String, Vec<SharedHandler>>,
}

impl Registry {
    fn map_for(&mut self, pattern: &str) -> &mut HashMap<String, Vec<SharedHandler>> {
        if pattern::is_wildcard(pattern) {
            &mut self.wildcard
        } else {
            &mut self.exact
        }
    }
}

/// In-memory event driver.
pub struct MemoryEventDriver {
    registry: Mutex<Registry>,
}

impl std::fmt::Debug for MemoryEventDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEventDriver").finish()
    }
}

impl MemoryEventDriver {
    /// Create a new in-memory driver with empty registries.
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
        }
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Emit an event and synchronously run every matching handler.
    ///
    /// Exact-topic handlers run first, then wildcard handlers in registry
    /// order. A handler error is logged and the remaining handlers still
    /// run.
    pub fn emit_now(
        &self,
        event: &str,
        data: serde_json::Value,
        ttl_minutes: Option<u64>,
    ) -> EventBusResult<()> {
        let payload = EventPayload::new(event, data, ttl_minutes);

        // Snapshot matching handlers so they can re-enter the bus without
        // deadlocking on the registry lock.
        let matching: Vec<(String, SharedHandler)> = {
            let registry = self.registry();
            let exact = registry
                .exact
                .get(event)
                .into_iter()
                .flatten()
                .map(|handler| (event.to_string(), handler.clone()));
            let wildcard = registry
                .wildcard
                .iter()
                .filter(|(pattern, _)| pattern::matches(event, pattern))
                .flat_map(|(pattern, handlers)| {
                    handlers
                        .iter()
                        .map(|handler| (pattern.clone(), handler.clone()))
                });
            exact.chain(wildcard).collect()
        };

        for (registered_as, handler) in &matching {
            if let Err(e) = handler.handle(&payload) {
                tracing::error!(event, pattern = %registered_as, error = %e, "handler error");
            }
        }

        Ok(())
    }
}

impl Default for MemoryEventDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBusDriver for MemoryEventDriver {
    fn name(&self) -> DriverName {
        DriverName::Memory
    }

    async fn emit(
        &self,
        event: &str,
        data: serde_json::Value,
        ttl_minutes: Option<u64>,
    ) -> EventBusResult<()> {
        self.emit_now(event, data, ttl_minutes)
    }

    fn on(&self, pattern: &str, handler: SharedHandler) {
        let mut registry = self.registry();
        registry
            .map_for(pattern)
            .entry(pattern.to_string())
            .or_default()
            .push(handler);
    }

    fn on_durable(&self, pattern: &str, _handler: SharedHandler) -> JoinHandle<EventBusResult<()>> {
        let err = EventBusError::NotSupported {
            driver: DriverName::Memory,
            operation: "durable subscriptions",
        };
        tracing::error!(pattern, error = %err, "durable subscription rejected");
        tokio::spawn(async move { Err(err) })
    }

    fn off(&self, pattern: &str, handler: Option<&SharedHandler>) {
        let mut registry = self.registry();
        let map = registry.map_for(pattern);
        match handler {
            Some(target) => {
                if let Some(handlers) = map.get_mut(pattern) {
                    handlers.retain(|candidate| !std::sync::Arc::ptr_eq(candidate, target));
                    if handlers.is_empty() {
                        map.remove(pattern);
                    }
                }
            }
            None => {
                map.remove(pattern);
            }
        }
    }

    fn remove_all_listeners(&self, pattern: Option<&str>) {
        let mut registry = self.registry();
        match pattern {
            Some(pattern) => {
                registry.map_for(pattern).remove(pattern);
            }
            None => {
                registry.exact.clear();
                registry.wildcard.clear();
            }
        }
    }

    async fn listener_count(&self, pattern: &str) -> usize {
        let mut registry = self.registry();
        registry
            .map_for(pattern)
            .get(pattern)
            .map_or(0, Vec::len)
    }

    async fn event_names(&self) -> Vec<String> {
        let registry = self.registry();
        registry
            .exact
            .keys()
            .chain(registry.wildcard.keys())
            .cloned()
            .collect()
    }
}
