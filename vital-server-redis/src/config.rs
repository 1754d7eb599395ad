//! Distributed locker configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;
use vital_shared::config_utils::{require_non_zero, ConfigDefaults};
use vital_shared::{VitalError, VitalResult};

/// Redlock settings shared by every server of a deployment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedlockConfig {
    /// Independent Redis replicas voting on each lock
    pub urls: Vec<String>,
    /// Prefix applied to every lock key
    pub namespace: String,
    /// Lifetime of a grant; bundles must finish within it
    pub lease_ms: u64,
    /// Retries after the first failed attempt
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    /// Random spread applied to `retry_delay_ms` in both directions
    pub retry_jitter_ms: u64,
    /// Clock drift allowance as a fraction of the lease
    pub drift_factor: f64,
}

impl Default for RedlockConfig {
    fn default() -> Self {
        Self {
            urls: vec!["redis://127.0.0.1:6379/".to_string()],
            namespace: "vital:lock:".to_string(),
            lease_ms: 1000,
            retry_count: 10,
            retry_delay_ms: 200,
            retry_jitter_ms: 100,
            drift_factor: 0.01,
        }
    }
}

impl RedlockConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }

    /// Majority of the configured replicas
    pub fn quorum(&self, replicas: usize) -> usize {
        replicas / 2 + 1
    }

    /// Validity lost to clock drift for one grant
    pub fn drift(&self) -> Duration {
        Duration::from_secs_f64(self.lease().as_secs_f64() * self.drift_factor)
            + Duration::from_millis(2)
    }

    /// Delay before the next attempt, jittered
    pub fn retry_delay(&self) -> Duration {
        let jitter = if self.retry_jitter_ms == 0 {
            0
        } else {
            fastrand::i64(-(self.retry_jitter_ms as i64)..=self.retry_jitter_ms as i64)
        };
        Duration::from_millis((self.retry_delay_ms as i64 + jitter).max(0) as u64)
    }

    pub fn with_namespace<S: Into<String>>(mut self, namespace: S) -> Self {
        self.namespace = namespace.into();
        self
    }
}

impl ConfigDefaults for RedlockConfig {
    fn validate(&self) -> VitalResult<()> {
        if self.urls.is_empty() {
            return Err(VitalError::configuration(
                "Redlock needs at least one Redis url",
            ));
        }
        require_non_zero("Redlock lease", self.lease())?;
        if !(0.0..1.0).contains(&self.drift_factor) {
            return Err(VitalError::configuration(
                "Redlock drift factor must be in [0, 1)",
            ));
        }
        if self.drift() >= self.lease() {
            return Err(VitalError::configuration(
                "Redlock lease is shorter than its drift allowance",
            ));
        }
        Ok(())
    }

    fn config_source(&self) -> &'static str {
        "redlock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RedlockConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.lease(), Duration::from_millis(1000));
        assert_eq!(config.drift(), Duration::from_millis(12));
        assert_eq!(config.quorum(1), 1);
        assert_eq!(config.quorum(3), 2);
        assert_eq!(config.quorum(4), 3);
        assert_eq!(config.quorum(5), 3);
    }

    #[test]
    fn test_retry_delay_stays_within_jitter() {
        let config = RedlockConfig::default();
        for _ in 0..100 {
            let delay = config.retry_delay();
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(300));
        }
        let fixed = RedlockConfig {
            retry_jitter_ms: 0,
            ..RedlockConfig::default()
        };
        assert_eq!(fixed.retry_delay(), Duration::from_millis(200));
    }

    #[test]
    fn test_validation() {
        let no_urls = RedlockConfig {
            urls: vec![],
            ..RedlockConfig::default()
        };
        assert!(no_urls.validate().is_err());

        let tiny_lease = RedlockConfig {
            lease_ms: 2,
            ..RedlockConfig::default()
        };
        assert!(tiny_lease.validate().is_err());
    }
}
