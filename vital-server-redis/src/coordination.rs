//! Quorum locking across independent replicas (Redlock)

use crate::client::RedisReplica;
use crate::config::RedlockConfig;
use crate::error::{RedlockError, RedlockResult};
use crate::replica::LockReplica;
use async_trait::async_trait;
use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;
use vital_shared::config_utils::ConfigDefaults;
use vital_shared::transactions::locks::normalize_keys;
use vital_shared::{Locker, ResourceKey, VitalError, VitalResult};

/// A grant held on a quorum of replicas until `valid_until`
#[derive(Debug, Clone)]
pub struct Lease {
    pub keys: Vec<String>,
    pub value: String,
    pub valid_until: Instant,
    pub attempts: u32,
}

/// Releases a lease once, from `release` or on drop
struct LeaseGuard {
    replicas: Arc<Vec<Arc<dyn LockReplica>>>,
    lease: Lease,
    timer: Option<JoinHandle<()>>,
    released: bool,
}

impl LeaseGuard {
    async fn release(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        if self.released {
            return;
        }
        self.released = true;
        release_all(&self.replicas, &self.lease.keys, &self.lease.value).await;
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        if self.released {
            return;
        }
        self.released = true;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let replicas = Arc::clone(&self.replicas);
                let keys = std::mem::take(&mut self.lease.keys);
                let value = std::mem::take(&mut self.lease.value);
                handle.spawn(async move { release_all(&replicas, &keys, &value).await });
            }
            // Replicas expire the keys at the end of the lease
            Err(_) => warn!(keys = ?self.lease.keys, "No runtime to release lock on drop"),
        }
    }
}

async fn release_all(replicas: &[Arc<dyn LockReplica>], keys: &[String], value: &str) {
    let results = join_all(replicas.iter().map(|r| r.release(keys, value))).await;
    for (replica, result) in replicas.iter().zip(results) {
        if let Err(e) = result {
            warn!(replica = replica.name(), error = %e, "Failed to release lock");
        }
    }
}

/// Distributed locker over N independent replicas.
///
/// A lock is granted when a majority of replicas accept the whole keyset and enough of the
/// lease remains after acquisition time and clock drift. Failed attempts release whatever
/// partial grants they obtained before retrying.
#[derive(Clone)]
pub struct RedlockLocker {
    replicas: Arc<Vec<Arc<dyn LockReplica>>>,
    config: RedlockConfig,
}

impl RedlockLocker {
    pub fn new(replicas: Vec<Arc<dyn LockReplica>>, config: RedlockConfig) -> RedlockResult<Self> {
        if replicas.is_empty() {
            return Err(RedlockError::Configuration(
                "Redlock needs at least one replica".to_string(),
            ));
        }
        config
            .validate()
            .map_err(|e| RedlockError::Configuration(e.to_string()))?;
        Ok(Self {
            replicas: Arc::new(replicas),
            config,
        })
    }

    /// One `RedisReplica` per configured url
    pub fn from_config(config: RedlockConfig) -> RedlockResult<Self> {
        let replicas = config
            .urls
            .iter()
            .map(|url| RedisReplica::new(url.clone()).map(|r| Arc::new(r) as Arc<dyn LockReplica>))
            .collect::<RedlockResult<Vec<_>>>()?;
        Self::new(replicas, config)
    }

    pub fn config(&self) -> &RedlockConfig {
        &self.config
    }

    pub fn namespaced(&self, key: &ResourceKey) -> String {
        format!("{}{}", self.config.namespace, key)
    }

    /// Acquire `keys` (already namespaced) on a quorum of replicas
    pub async fn acquire(&self, keys: &[String]) -> RedlockResult<Lease> {
        let required = self.config.quorum(self.replicas.len());
        let lease_duration = self.config.lease();
        let drift = self.config.drift();
        let attempts = self.config.retry_count + 1;

        let mut granted = 0;
        let mut last_errors = Vec::new();

        for attempt in 1..=attempts {
            let value = Uuid::new_v4().to_string();
            let start = Instant::now();
            let results = join_all(
                self.replicas
                    .iter()
                    .map(|r| r.try_acquire(keys, &value, lease_duration)),
            )
            .await;

            granted = 0;
            last_errors.clear();
            for (replica, result) in self.replicas.iter().zip(results) {
                match result {
                    Ok(true) => granted += 1,
                    Ok(false) => {}
                    Err(e) => {
                        debug!(replica = replica.name(), error = %e, "Replica refused lock");
                        last_errors.push(e);
                    }
                }
            }

            let elapsed = start.elapsed();
            if granted >= required && elapsed + drift < lease_duration {
                let valid_until = start + (lease_duration - drift);
                debug!(keys = ?keys, attempt, granted, "Quorum lock acquired");
                return Ok(Lease {
                    keys: keys.to_vec(),
                    value,
                    valid_until,
                    attempts: attempt,
                });
            }

            release_all(&self.replicas, keys, &value).await;
            if attempt < attempts {
                tokio::time::sleep(self.config.retry_delay()).await;
            }
        }

        // Every replica failing with an error means the backend is down, not contended
        if last_errors.len() == self.replicas.len() {
            if let Some(error) = last_errors.pop() {
                warn!(keys = ?keys, error = %error, "Lock backend unavailable");
                return Err(error);
            }
        }

        warn!(keys = ?keys, granted, required, "Lock quorum not reached");
        Err(RedlockError::QuorumNotReached { granted, required })
    }

    fn start_timer(token: &CancellationToken, valid_until: Instant) -> JoinHandle<()> {
        let token = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(valid_until).await;
            token.cancel();
        })
    }
}

#[async_trait]
impl Locker for RedlockLocker {
    async fn lock<T, F, Fut>(&self, keys: &[ResourceKey], body: F) -> VitalResult<T>
    where
        T: Send,
        F: FnOnce(CancellationToken) -> Fut + Send,
        Fut: Future<Output = VitalResult<T>> + Send,
    {
        let keys: Vec<String> = normalize_keys(keys)
            .iter()
            .map(|key| self.namespaced(key))
            .collect();
        if keys.is_empty() {
            return body(CancellationToken::new()).await;
        }

        let lease = self.acquire(&keys).await?;
        let token = CancellationToken::new();
        let valid_until = lease.valid_until;
        let mut guard = LeaseGuard {
            replicas: Arc::clone(&self.replicas),
            timer: Some(Self::start_timer(&token, valid_until)),
            lease,
            released: false,
        };

        let result = body(token).await;
        let expired = Instant::now() >= valid_until;
        guard.release().await;

        match result {
            Ok(_) if expired => {
                warn!(keys = ?keys, "Bundle outlived its lock lease");
                Err(VitalError::lease_expired(format!(
                    "lock lease of {}ms expired before completion",
                    self.config.lease_ms
                )))
            }
            other => other,
        }
    }
}

impl std::fmt::Debug for RedlockLocker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.replicas.iter().map(|r| r.name()).collect();
        f.debug_struct("RedlockLocker")
            .field("replicas", &names)
            .field("config", &self.config)
            .finish()
    }
}

/// Same settings with retries disabled
pub fn single_attempt(config: RedlockConfig) -> RedlockConfig {
    RedlockConfig {
        retry_count: 0,
        ..config
    }
}
