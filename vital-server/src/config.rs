//! Server configuration loaded from TOML

use crate::persistence::PersistenceConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use vital_server_redis::RedlockConfig;
use vital_shared::config_utils::ConfigDefaults;
use vital_shared::{ExecutorConfig, LockerConfig, VitalError, VitalResult};

/// Which locker serializes bundle execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LockerSettings {
    /// One server process
    InMemory(LockerConfig),
    /// Several server processes sharing Redis
    Redis(RedlockConfig),
    /// The deployment guarantees a single writer
    Nop,
}

impl Default for LockerSettings {
    fn default() -> Self {
        LockerSettings::InMemory(LockerConfig::default())
    }
}

impl LockerSettings {
    pub fn kind(&self) -> &'static str {
        match self {
            LockerSettings::InMemory(_) => "in_memory",
            LockerSettings::Redis(_) => "redis",
            LockerSettings::Nop => "nop",
        }
    }
}

/// Configuration for the Vital server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VitalServerConfig {
    /// Deployment namespace; prefixes distributed lock keys
    pub namespace: String,
    pub log_level: String,
    pub locker: LockerSettings,
    pub executor: ExecutorConfig,
    pub persistence: PersistenceConfig,
}

impl Default for VitalServerConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            log_level: "info".to_string(),
            locker: LockerSettings::default(),
            executor: ExecutorConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

impl VitalServerConfig {
    pub fn from_toml_str(input: &str) -> VitalResult<Self> {
        let config: Self = toml::from_str(input)
            .map_err(|e| VitalError::configuration(format!("Invalid server config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> VitalResult<Self> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path).map_err(|e| {
            VitalError::configuration(format!("Cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&input)
    }

    /// Prefix of distributed lock keys for this deployment
    pub fn redlock_namespace(&self) -> String {
        format!("{}:lock:", self.namespace)
    }
}

impl ConfigDefaults for VitalServerConfig {
    fn validate(&self) -> VitalResult<()> {
        if self.namespace.is_empty() {
            return Err(VitalError::configuration("Namespace must not be empty"));
        }
        match &self.locker {
            LockerSettings::InMemory(config) => config.validate()?,
            LockerSettings::Redis(config) => config.validate()?,
            LockerSettings::Nop => {}
        }
        self.executor.validate()
    }

    fn config_source(&self) -> &'static str {
        "toml"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = VitalServerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.locker.kind(), "in_memory");
        assert_eq!(config.redlock_namespace(), "default:lock:");
    }

    #[test]
    fn test_parse_redis_locker() {
        let config = VitalServerConfig::from_toml_str(
            r#"
            namespace = "clinic-a"

            [locker]
            kind = "redis"
            urls = ["redis://10.0.0.1:6379/", "redis://10.0.0.2:6379/", "redis://10.0.0.3:6379/"]
            lease_ms = 1500

            [executor]
            lock_batches = false
            "#,
        )
        .unwrap();

        match &config.locker {
            LockerSettings::Redis(redis) => {
                assert_eq!(redis.urls.len(), 3);
                assert_eq!(redis.lease_ms, 1500);
                assert_eq!(redis.retry_count, 10);
            }
            other => panic!("unexpected locker {other:?}"),
        }
        assert!(!config.executor.lock_batches);
        assert_eq!(config.executor.max_entries, 1000);
    }

    #[test]
    fn test_parse_nop_and_in_memory() {
        let nop = VitalServerConfig::from_toml_str("[locker]\nkind = \"nop\"\n").unwrap();
        assert_eq!(nop.locker, LockerSettings::Nop);

        let in_memory = VitalServerConfig::from_toml_str(
            "[locker]\nkind = \"in_memory\"\nmax_attempts = 3\n",
        )
        .unwrap();
        match in_memory.locker {
            LockerSettings::InMemory(config) => {
                assert_eq!(config.max_attempts, 3);
                assert_eq!(config.retry_backoff_ms, 100);
            }
            other => panic!("unexpected locker {other:?}"),
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(VitalServerConfig::from_toml_str("namespace = \"\"").is_err());
        assert!(VitalServerConfig::from_toml_str(
            "[locker]\nkind = \"in_memory\"\nmax_attempts = 0\n"
        )
        .is_err());
        assert!(VitalServerConfig::from_toml_str("[locker]\nkind = \"zookeeper\"\n").is_err());
    }
}
