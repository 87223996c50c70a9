use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;

/// Timing knobs of a sync session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Inactivity window before local edits are pushed (default: 1000ms)
    pub debounce_ms: u64,
    /// Upper bound for a single repository call (default: 10s)
    pub request_timeout_ms: u64,
    /// Presence refresh period (default: 30s, at least 1s)
    pub heartbeat_interval_secs: u64,
    /// Presence rows older than this are ignored (default: 5min)
    pub presence_ttl_secs: u64,
    pub retry: RetryPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 1_000,
            request_timeout_ms: 10_000,
            heartbeat_interval_secs: 30,
            presence_ttl_secs: 300,
            retry: RetryPolicy::default(),
        }
    }
}

impl SyncConfig {
    /// Short timings for tests; presence still uses production values.
    pub fn for_testing() -> Self {
        Self {
            debounce_ms: 50,
            request_timeout_ms: 500,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay_ms: 10,
                max_delay_ms: 100,
            },
            ..Self::default()
        }
    }

    /// Parse from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Never zero: a zero period would stall the heartbeat timer.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn presence_ttl(&self) -> Duration {
        Duration::from_secs(self.presence_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.debounce(), Duration::from_secs(1));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.presence_ttl(), Duration::from_secs(300));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config =
            SyncConfig::from_json(r#"{"debounce_ms": 250, "retry": {"max_attempts": 2}}"#)
                .unwrap();
        assert_eq!(config.debounce_ms, 250);
        assert_eq!(config.request_timeout_ms, 10_000);
        assert_eq!(config.retry.max_attempts, 2);
        assert_eq!(config.retry.base_delay_ms, 500);
    }

    #[test]
    fn test_zero_heartbeat_is_clamped() {
        let config = SyncConfig::from_json(r#"{"heartbeat_interval_secs": 0}"#).unwrap();
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_invalid_json() {
        assert!(SyncConfig::from_json("{debounce_ms: }").is_err());
    }
}
