//! Core types shared by every driver.
//!
//! This module defines the event payload delivered to handlers, its wire
//! form, the handler trait, and the connection state published by
//! distributed drivers.

use crate::error::EventBusResult;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Identifies which driver backs the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverName {
    /// Single-process, in-memory dispatch.
    Memory,
    /// Redis-backed distributed dispatch.
    Redis,
}

impl DriverName {
    /// Parse a configuration value.
    ///
    /// Unknown values fall back to the memory driver.
    pub fn parse(value: &str) -> Self {
        match value {
            "redis" => DriverName::Redis,
            _ => DriverName::Memory,
        }
    }

    /// The lowercase name used in configuration and log lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            DriverName::Memory => "memory",
            DriverName::Redis => "redis",
        }
    }
}

impl std::fmt::Display for DriverName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection state of a distributed driver.
///
/// The publish and subscribe connections share one state: `Connected` means
/// both sides are ready.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection established.
    Disconnected,
    /// Initial connection in progress.
    Connecting,
    /// Both connections ready.
    Connected,
    /// Connection lost; reconnect attempts in progress.
    Reconnecting,
}

/// Event delivered to handlers.
///
/// Created once per emit and never mutated afterwards.
#[derive(Debug, Clone)]
pub struct EventPayload {
    /// Topic the event was emitted under (e.g. `orders.created`).
    pub name: String,
    /// Emission time, milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Expiry time in epoch milliseconds, if the emitter set a TTL.
    pub expires_at: Option<i64>,
    /// Opaque event data.
    pub data: serde_json::Value,
}

impl EventPayload {
    /// Build a payload for an emit call, stamping the current time.
    pub fn new(name: impl Into<String>, data: serde_json::Value, ttl_minutes: Option<u64>) -> Self {
        let timestamp = now_ms();
        Self {
            name: name.into(),
            timestamp,
            expires_at: ttl_minutes.map(|minutes| timestamp + minutes as i64 * 60_000),
            data,
        }
    }
}

/// Wire and durable-log form of an event.
///
/// Appended as JSON to `durable:<topic>` and published on `live:<topic>`.
/// Records are never rewritten once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Topic the event was emitted under.
    pub event: String,
    /// Opaque event data.
    #[serde(default)]
    pub data: serde_json::Value,
    /// Emission time, milliseconds since the Unix epoch.
    pub timestamp: i64,
    /// Expiry time in epoch milliseconds; `null` on the wire when unset.
    #[serde(rename = "expiresAt")]
    pub expires_at: Option<i64>,
}

impl EventRecord {
    /// Whether the record's TTL has elapsed at `now_ms`.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at.is_some_and(|at| now_ms > at)
    }
}

impl From<EventPayload> for EventRecord {
    fn from(payload: EventPayload) -> Self {
        Self {
            event: payload.name,
            data: payload.data,
            timestamp: payload.timestamp,
            expires_at: payload.expires_at,
        }
    }
}

impl From<EventRecord> for EventPayload {
    fn from(record: EventRecord) -> Self {
        Self {
            name: record.event,
            timestamp: record.timestamp,
            expires_at: record.expires_at,
            data: record.data,
        }
    }
}

/// Handler invoked for each delivered event.
///
/// Implemented for any `Fn(&EventPayload) -> EventBusResult<()>` closure.
/// A handler error is logged by the dispatching driver and never prevents
/// the remaining handlers from running.
pub trait EventHandler: Send + Sync {
    /// Process one delivered event.
    fn handle(&self, payload: &EventPayload) -> EventBusResult<()>;
}

impl<F> EventHandler for F
where
    F: Fn(&EventPayload) -> EventBusResult<()> + Send + Sync,
{
    fn handle(&self, payload: &EventPayload) -> EventBusResult<()> {
        self(payload)
    }
}

/// Shared, clonable handler reference as stored in driver registries.
///
/// Targeted removal via [`off`](crate::EventBus::off) compares `Arc`
/// identity, so keep a clone of the `Arc` you registered.
pub type SharedHandler = Arc<dyn EventHandler>;

/// Current time in milliseconds since the Unix epoch.
pub(crate) fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
