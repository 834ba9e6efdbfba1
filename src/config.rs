//! Server configuration shared by the pool, its workers, and the monitor.

use std::time::Duration;

use serde::{Deserialize, Deserializer};

use crate::error::ConfigError;

/// Default value of the `Server` response header.
pub const DEFAULT_SERVER_NAME: &str = concat!("hearth/", env!("CARGO_PKG_VERSION"));

/// Tunables for the request-serving core.
///
/// Every field has a default, so a partial JSON document is enough:
///
/// ```
/// use hearth::config::ServerConfig;
///
/// let config = ServerConfig::from_json(r#"{ "read_timeout": 2.5, "max_workers": 8 }"#).unwrap();
/// assert_eq!(config.read_timeout.as_millis(), 2500);
/// assert_eq!(config.max_workers, 8);
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Value stamped into the `Server` header when the application omits it.
    pub server_name: String,

    /// How long a read may block before the connection is considered idle.
    #[serde(deserialize_with = "seconds")]
    pub read_timeout: Duration,

    /// How long a parked connection may sit in the wait-queue before it is flushed.
    #[serde(deserialize_with = "seconds")]
    pub idle_timeout: Duration,

    pub min_workers: usize,
    pub max_workers: usize,

    /// Capacity of each of the active and waiting queues.
    pub queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            server_name: DEFAULT_SERVER_NAME.to_owned(),
            read_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
            min_workers: 10,
            max_workers: 64,
            queue_capacity: 1024,
        }
    }
}

impl ServerConfig {
    /// Parses and validates a JSON configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed JSON and the validation
    /// variants described on [`validate`](Self::validate).
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the pool cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::Zero { field: "queue_capacity" });
        }
        if self.max_workers == 0 {
            return Err(ConfigError::Zero { field: "max_workers" });
        }
        if self.read_timeout.is_zero() {
            return Err(ConfigError::Zero { field: "read_timeout" });
        }
        if self.idle_timeout.is_zero() {
            return Err(ConfigError::Zero { field: "idle_timeout" });
        }
        if self.min_workers > self.max_workers {
            return Err(ConfigError::WorkerBounds {
                min: self.min_workers,
                max: self.max_workers,
            });
        }
        Ok(())
    }
}

/// Reads a duration expressed as (possibly fractional) seconds.
fn seconds<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = f64::deserialize(deserializer)?;
    Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.server_name.starts_with("hearth/"));
    }

    #[test]
    fn empty_document_uses_defaults() {
        let config = ServerConfig::from_json("{}").unwrap();
        assert_eq!(config.read_timeout, Duration::from_secs(5));
        assert_eq!(config.queue_capacity, 1024);
    }

    #[test]
    fn fractional_timeouts() {
        let config = ServerConfig::from_json(r#"{"idle_timeout": 0.25}"#).unwrap();
        assert_eq!(config.idle_timeout, Duration::from_millis(250));
    }

    #[test]
    fn negative_timeout_rejected() {
        let err = ServerConfig::from_json(r#"{"read_timeout": -1}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn worker_bounds_checked() {
        let err = ServerConfig::from_json(r#"{"min_workers": 9, "max_workers": 4}"#).unwrap_err();
        assert!(matches!(err, ConfigError::WorkerBounds { min: 9, max: 4 }));
    }

    #[test]
    fn zero_capacity_rejected() {
        let err = ServerConfig::from_json(r#"{"queue_capacity": 0}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Zero { field: "queue_capacity" }));
    }
}
