//! Event bus configuration.
//!
//! Configuration selects the driver and, for the Redis driver, carries the
//! connection parameters and the consumer identity used for durable
//! checkpointing. Loaded from the environment with defaults suitable for
//! local development.

use crate::types::DriverName;
use serde::{Deserialize, Serialize};

/// Top-level event bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventBusConfig {
    /// Which driver backs the bus.
    pub driver: DriverName,

    /// Redis driver settings; ignored by the memory driver.
    pub redis: RedisConfig,
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            driver: DriverName::Memory,
            redis: RedisConfig::default(),
        }
    }
}

impl EventBusConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `EVENT_BUS_DRIVER`: `memory` or `redis` (default: memory; unknown
    ///   values fall back to memory)
    /// - `EVENT_BUS_REDIS_HOST`: Redis host (default: 127.0.0.1)
    /// - `EVENT_BUS_REDIS_PORT`: Redis port (default: 6379)
    /// - `EVENT_BUS_REDIS_PASSWORD`: Redis password (default: none)
    /// - `EVENT_BUS_REDIS_DB`: Redis database index (default: 0)
    /// - `EVENT_BUS_SERVICE_NAME`: consumer identity for durable
    ///   checkpointing (default: hostname)
    /// - `EVENT_BUS_MAX_LOG_ENTRIES`: durable log cap per topic (default:
    ///   unbounded)
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            driver: std::env::var("EVENT_BUS_DRIVER")
                .map(|value| DriverName::parse(&value))
                .unwrap_or(default.driver),
            redis: RedisConfig {
                host: std::env::var("EVENT_BUS_REDIS_HOST").unwrap_or(default.redis.host),
                port: std::env::var("EVENT_BUS_REDIS_PORT")
                    .ok()
                    .and_then(|value| value.parse().ok())
                    .unwrap_or(default.redis.port),
                password: std::env::var("EVENT_BUS_REDIS_PASSWORD").ok(),
                db: std::env::var("EVENT_BUS_REDIS_DB")
                    .ok()
                    .and_then(|value| value.parse().ok())
                    .unwrap_or(default.redis.db),
                service_name: std::env::var("EVENT_BUS_SERVICE_NAME")
                    .unwrap_or(default.redis.service_name),
                max_log_entries: std::env::var("EVENT_BUS_MAX_LOG_ENTRIES")
                    .ok()
                    .and_then(|value| value.parse().ok()),
            },
        }
    }
}

/// Redis driver settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis host.
    pub host: String,

    /// Redis port.
    pub port: u16,

    /// Redis password, if authentication is required.
    pub password: Option<String>,

    /// Redis database index.
    pub db: i64,

    /// Consumer identity owning the durable checkpoints.
    ///
    /// Two processes sharing a service name both advance the same positions
    /// and both deliver every durable batch; give each logical consumer its
    /// own name.
    pub service_name: String,

    /// Cap on `durable:<topic>` log length, trimmed on emit.
    ///
    /// Unset keeps the full history. Setting it bounds memory at the cost
    /// of dropping the oldest records for consumers that lag behind.
    pub max_log_entries: Option<usize>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            password: None,
            db: 0,
            service_name: default_service_name(),
            max_log_entries: None,
        }
    }
}

impl RedisConfig {
    /// Connection URL in the form `redis://[:password@]host:port/db`.
    pub fn url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

/// Default consumer identity: hostname, or a random identity when the
/// hostname is unavailable.
#[cfg(feature = "redis")]
fn default_service_name() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| uuid::Uuid::now_v7().to_string())
}

#[cfg(not(feature = "redis"))]
fn default_service_name() -> String {
    "default-service".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EventBusConfig::default();
        assert_eq!(config.driver, DriverName::Memory);
        assert_eq!(config.redis.host, "127.0.0.1");
        assert_eq!(config.redis.port, 6379);
        assert_eq!(config.redis.db, 0);
        assert!(config.redis.password.is_none());
        assert!(config.redis.max_log_entries.is_none());
        assert!(!config.redis.service_name.is_empty());
    }

    #[test]
    fn test_redis_url() {
        let mut config = RedisConfig::default();
        assert_eq!(config.url(), "redis://127.0.0.1:6379/0");

        config.host = "cache.internal".to_string();
        config.port = 6380;
        config.db = 3;
        config.password = Some("hunter2".to_string());
        assert_eq!(config.url(), "redis://:hunter2@cache.internal:6380/3");
    }

    #[test]
    fn test_config_serde_round_trip() {
        let config = EventBusConfig {
            driver: DriverName::Redis,
            redis: RedisConfig {
                host: "redis.example.com".to_string(),
                port: 6379,
                password: None,
                db: 1,
                service_name: "billing".to_string(),
                max_log_entries: Some(10_000),
            },
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"driver\":\"redis\""));
        let parsed: EventBusConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.driver, DriverName::Redis);
        assert_eq!(parsed.redis.service_name, "billing");
        assert_eq!(parsed.redis.max_log_entries, Some(10_000));
    }
}
