//! # Wirebus
//!
//! A pluggable publish/subscribe event bus offering both ephemeral
//! (at-most-once, in-process) and durable (at-least-once, cross-process)
//! event delivery behind one interface.
//!
//! ## Overview
//!
//! The crate handles:
//! - **Drivers**: in-memory dispatch for single-process apps, Redis-backed
//!   dispatch for distributed systems
//! - **Live delivery**: real-time pub/sub to handlers connected at publish
//!   time
//! - **Durable delivery**: replayable per-topic logs with per-consumer
//!   checkpointing, so offline services catch up on reconnect
//! - **Topic patterns**: dot-delimited topics with wildcard subscriptions
//!
//! ## Features
//!
//! - `memory` (default): in-memory driver
//! - `redis` (default): Redis-backed driver
//!
//! ## Usage
//!
//! ### Publishing and subscribing
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use wirebus::{EventBus, EventBusConfig, EventBusResult, EventPayload};
//!
//! async fn example() -> EventBusResult<()> {
//!     let bus = EventBus::new(EventBusConfig::from_env())?;
//!     bus.connect().await?;
//!
//!     bus.on(
//!         "orders.*",
//!         Arc::new(|payload: &EventPayload| -> EventBusResult<()> {
//!             println!("received {}", payload.name);
//!             Ok(())
//!         }),
//!     );
//!
//!     bus.emit("orders.created", serde_json::json!({"id": 42}), None)
//!         .await?;
//!     Ok(())
//! }
//! ```
//!
//! ### Durable subscriptions
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use wirebus::{EventBus, EventBusConfig, EventBusResult, EventPayload};
//!
//! async fn example(bus: &EventBus) -> EventBusResult<()> {
//!     // Replays everything this service has not processed yet, then keeps
//!     // listening. The handle may be dropped for fire-and-forget setup.
//!     let setup = bus.on_durable(
//!         "invoices.**",
//!         Arc::new(|payload: &EventPayload| -> EventBusResult<()> {
//!             println!("processing {}", payload.name);
//!             Ok(())
//!         }),
//!     );
//!     setup.await.expect("setup task panicked")?;
//!     Ok(())
//! }
//! ```
//!
//! ## Topic Patterns
//!
//! Topics are dot-delimited, e.g. `orders.created`. Patterns may use
//! wildcards:
//! - `*` matches exactly one segment: `orders.*` matches `orders.created`
//!   but not `orders.created.v2`
//! - `**` matches any number of segments: `orders.**` matches both
//!
//! ## Delivery semantics
//!
//! [`EventBus::on`] is at-most-once: handlers receive events published while
//! they are connected, and outages lose messages. [`EventBus::on_durable`]
//! (Redis driver only) is at-least-once: every event is appended to a
//! durable log, and each consumer — identified by the configured
//! `service_name` — tracks its own position through the log. A crash between
//! dispatch and checkpointing redelivers the batch, so durable handlers
//! must be idempotent. Two processes sharing a `service_name` each deliver
//! every batch.

pub mod bus;
pub mod config;
pub mod error;
pub mod pattern;
pub mod retry;
pub mod types;

pub mod memory;

#[cfg(feature = "redis")]
pub mod redis;

// Re-export main types
pub use bus::{EventBus, EventBusDriver, EventDriver};
pub use config::{EventBusConfig, RedisConfig};
pub use error::{EventBusError, EventBusResult};
pub use memory::MemoryEventDriver;
pub use types::{
    ConnectionState, DriverName, EventHandler, EventPayload, EventRecord, SharedHandler,
};

#[cfg(feature = "redis")]
pub use redis::RedisEventDriver;
