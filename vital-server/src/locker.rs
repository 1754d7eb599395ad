use crate::config::LockerSettings;
use async_trait::async_trait;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::info;
use vital_server_redis::{RedlockConfig, RedlockLocker};
use vital_shared::{InMemoryLocker, Locker, NopLocker, ResourceKey, VitalResult};

/// The locker variants a server can be configured with
#[derive(Debug, Clone)]
pub enum ServerLocker {
    InMemory(InMemoryLocker),
    Distributed(RedlockLocker),
    Nop(NopLocker),
}

impl ServerLocker {
    /// Build the configured locker. Distributed lock keys are prefixed with `namespace`.
    pub fn from_settings(settings: &LockerSettings, namespace: &str) -> VitalResult<Self> {
        let locker = match settings {
            LockerSettings::InMemory(config) => {
                ServerLocker::InMemory(InMemoryLocker::new(config.clone()))
            }
            LockerSettings::Redis(config) => {
                let config = RedlockConfig {
                    namespace: namespace.to_string(),
                    ..config.clone()
                };
                ServerLocker::Distributed(RedlockLocker::from_config(config)?)
            }
            LockerSettings::Nop => ServerLocker::Nop(NopLocker),
        };
        info!(locker = locker.kind(), "Configured resource locker");
        Ok(locker)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServerLocker::InMemory(_) => "in_memory",
            ServerLocker::Distributed(_) => "redis",
            ServerLocker::Nop(_) => "nop",
        }
    }
}

impl From<InMemoryLocker> for ServerLocker {
    fn from(locker: InMemoryLocker) -> Self {
        ServerLocker::InMemory(locker)
    }
}

impl From<RedlockLocker> for ServerLocker {
    fn from(locker: RedlockLocker) -> Self {
        ServerLocker::Distributed(locker)
    }
}

impl From<NopLocker> for ServerLocker {
    fn from(locker: NopLocker) -> Self {
        ServerLocker::Nop(locker)
    }
}

#[async_trait]
impl Locker for ServerLocker {
    async fn lock<T, F, Fut>(&self, keys: &[ResourceKey], body: F) -> VitalResult<T>
    where
        T: Send,
        F: FnOnce(CancellationToken) -> Fut + Send,
        Fut: Future<Output = VitalResult<T>> + Send,
    {
        match self {
            ServerLocker::InMemory(locker) => locker.lock(keys, body).await,
            ServerLocker::Distributed(locker) => locker.lock(keys, body).await,
            ServerLocker::Nop(locker) => locker.lock(keys, body).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vital_shared::LockerConfig;

    #[test]
    fn test_from_settings() {
        let in_memory =
            ServerLocker::from_settings(&LockerSettings::InMemory(LockerConfig::default()), "ns:")
                .unwrap();
        assert_eq!(in_memory.kind(), "in_memory");

        let nop = ServerLocker::from_settings(&LockerSettings::Nop, "ns:").unwrap();
        assert_eq!(nop.kind(), "nop");

        // Connections are opened lazily, so building needs no running Redis
        let redis =
            ServerLocker::from_settings(&LockerSettings::Redis(RedlockConfig::default()), "ns:")
                .unwrap();
        match redis {
            ServerLocker::Distributed(locker) => assert_eq!(locker.config().namespace, "ns:"),
            other => panic!("unexpected locker {other:?}"),
        }
    }

    #[test]
    fn test_bad_redis_url_is_configuration_error() {
        let settings = LockerSettings::Redis(RedlockConfig {
            urls: vec!["not a url".to_string()],
            ..RedlockConfig::default()
        });
        let err = ServerLocker::from_settings(&settings, "ns:").unwrap_err();
        assert_eq!(err.status_code(), 500);
    }

    #[tokio::test]
    async fn test_dispatches_to_variant() {
        let locker = ServerLocker::from(InMemoryLocker::default());
        let key = ResourceKey::from("Patient/1");
        let held = locker
            .lock(std::slice::from_ref(&key), |_token| {
                let locker = locker.clone();
                let key = key.clone();
                async move {
                    match &locker {
                        ServerLocker::InMemory(inner) => Ok(inner.is_held(&key)),
                        _ => Ok(false),
                    }
                }
            })
            .await
            .unwrap();
        assert!(held);
    }
}
