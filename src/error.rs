//! Error types for event bus operations.
//!
//! Every error carries the name of the driver it originated from, so a
//! caller looking at a log line can tell which backend misbehaved.

use crate::types::DriverName;
use thiserror::Error;

/// Event bus error types.
#[derive(Debug, Error)]
pub enum EventBusError {
    /// Failed to emit an event after exhausting retries.
    #[error("[{driver}] failed to emit event \"{event}\": {message}")]
    Emit {
        /// Driver that produced the failure.
        driver: DriverName,
        /// Topic of the event that could not be emitted.
        event: String,
        /// Underlying failure.
        message: String,
    },

    /// Failed to establish or maintain a connection.
    #[error("[{driver}] connection error: {message}")]
    Connection {
        /// Driver that produced the failure.
        driver: DriverName,
        /// Underlying failure.
        message: String,
    },

    /// Failed to serialize or deserialize an event record.
    #[error("[{driver}] serialization error: {message}")]
    Serialization {
        /// Driver that produced the failure.
        driver: DriverName,
        /// Underlying failure.
        message: String,
    },

    /// The operation is not available on the selected driver.
    ///
    /// Distinguishes a missing capability from a transient failure: retrying
    /// will never make the memory driver durable.
    #[error("[{driver}] {operation} is not supported by this driver")]
    NotSupported {
        /// Driver the operation was invoked on.
        driver: DriverName,
        /// Name of the unsupported operation.
        operation: &'static str,
    },

    /// The driver's background task has shut down.
    #[error("[{driver}] driver task is no longer running")]
    DriverClosed {
        /// Driver whose task terminated.
        driver: DriverName,
    },
}

/// Result type for event bus operations.
pub type EventBusResult<T> = Result<T, EventBusError>;

impl EventBusError {
    /// The driver this error originated from.
    pub fn driver(&self) -> DriverName {
        match self {
            EventBusError::Emit { driver, .. }
            | EventBusError::Connection { driver, .. }
            | EventBusError::Serialization { driver, .. }
            | EventBusError::NotSupported { driver, .. }
            | EventBusError::DriverClosed { driver } => *driver,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_includes_driver() {
        let err = EventBusError::Emit {
            driver: DriverName::Redis,
            event: "orders.created".to_string(),
            message: "broken pipe".to_string(),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("[redis]"));
        assert!(rendered.contains("orders.created"));
        assert_eq!(err.driver(), DriverName::Redis);
    }

    #[test]
    fn test_not_supported_display() {
        let err = EventBusError::NotSupported {
            driver: DriverName::Memory,
            operation: "durable subscriptions",
        };
        assert_eq!(
            err.to_string(),
            "[memory] durable subscriptions is not supported by this driver"
        );
    }
}
