//! Coordinator configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the swap coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// How many times a unit of work that lost an optimistic race is re-run
    /// before `Conflict` is surfaced to the caller. Domain-rule failures are
    /// never retried.
    pub max_conflict_retries: u32,

    /// Base delay between conflict retries in milliseconds, multiplied by
    /// the attempt number.
    pub retry_backoff_ms: u64,

    /// Upper bound on one unit of work, storage round-trips included. On
    /// expiry every tentative write is rolled back and the attempt counts
    /// as a conflict.
    pub storage_timeout_ms: u64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_conflict_retries: 3,
            retry_backoff_ms: 10,
            storage_timeout_ms: 5000,
        }
    }
}

impl CoordinatorConfig {
    pub fn storage_timeout(&self) -> Duration {
        Duration::from_millis(self.storage_timeout_ms)
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(attempt as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_fills_defaults() {
        let config: CoordinatorConfig =
            serde_json::from_str(r#"{"max_conflict_retries": 7}"#).unwrap();
        assert_eq!(config.max_conflict_retries, 7);
        assert_eq!(config.storage_timeout_ms, 5000);
    }

    #[test]
    fn test_backoff_grows_linearly() {
        let config = CoordinatorConfig {
            retry_backoff_ms: 20,
            ..Default::default()
        };
        assert_eq!(config.backoff_for(1), Duration::from_millis(20));
        assert_eq!(config.backoff_for(3), Duration::from_millis(60));
    }
}
