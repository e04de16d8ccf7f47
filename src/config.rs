use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::circuit_breaker::CircuitBreakerConfig;
use crate::debounce::DebounceConfig;
use crate::error::QueueError;
use crate::queue::QueueConfig;
use crate::retry::RetryConfig;

/// Every tunable of the sync stack. A partial JSON document overrides only
/// the keys it names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub queue: QueueConfig,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub debounce: DebounceConfig,
}

impl SyncConfig {
    pub fn from_json_str(json: &str) -> Result<Self, QueueError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| QueueError::Config(format!("invalid sync config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| QueueError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config = Self::from_json_str(&json)?;
        info!(path = %path.display(), "loaded sync config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        self.queue.validate()?;
        self.retry.validate()?;
        self.circuit_breaker.validate()?;
        self.debounce.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = SyncConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue.default_max_retries, 3);
        assert_eq!(config.retry.max_delay_ms, 30_000);
        assert_eq!(config.circuit_breaker.failure_threshold, 5);
        assert_eq!(config.debounce.debounce_ms, 2_000);
    }

    #[test]
    fn partial_document_overrides_named_keys() {
        let config = SyncConfig::from_json_str(
            r#"{ "circuit_breaker": { "failure_threshold": 3 }, "queue": { "sweep_interval_ms": 10000 } }"#,
        )
        .unwrap();
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.circuit_breaker.timeout_ms, 60_000);
        assert_eq!(config.queue.sweep_interval_ms, 10_000);
        assert_eq!(config.queue.request_timeout_ms, 30_000);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = SyncConfig::from_json_str(r#"{ "retry": { "jitter_factor": 2.0 } }"#).unwrap_err();
        assert!(matches!(err, QueueError::Config(_)));
        assert!(SyncConfig::from_json_str(r#"{ "retires": {} }"#).is_err());
        assert!(SyncConfig::from_json_str("not json").is_err());
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "debounce": {{ "debounce_ms": 500 }} }}"#).unwrap();

        let config = SyncConfig::load(file.path()).unwrap();
        assert_eq!(config.debounce.debounce_ms, 500);
        assert!(SyncConfig::load("/nonexistent/sync.json").is_err());
    }
}
