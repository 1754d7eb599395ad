use crate::config_utils::ConfigDefaults;
use crate::exception::{VitalError, VitalResult};
use crate::store::ResourceKey;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Mutual exclusion over sets of resource keys for the duration of a callback.
///
/// Acquisition is all-or-nothing: on failure no key of the set is held. Keys are released
/// after `body` completes, fails or is dropped.
#[async_trait]
pub trait Locker: Send + Sync {
    async fn lock<T, F, Fut>(&self, keys: &[ResourceKey], body: F) -> VitalResult<T>
    where
        T: Send,
        F: FnOnce(CancellationToken) -> Fut + Send,
        Fut: Future<Output = VitalResult<T>> + Send;
}

/// Sorted, deduplicated copy of a keyset
pub fn normalize_keys(keys: &[ResourceKey]) -> Vec<ResourceKey> {
    keys.iter().cloned().collect::<BTreeSet<_>>().into_iter().collect()
}

/// Retry policy of the in-process locker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockerConfig {
    /// Acquisition attempts before giving up with a conflict
    pub max_attempts: u32,
    /// Fixed wait between attempts
    pub retry_backoff_ms: u64,
}

impl Default for LockerConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            retry_backoff_ms: 100,
        }
    }
}

impl LockerConfig {
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

impl ConfigDefaults for LockerConfig {
    fn validate(&self) -> VitalResult<()> {
        if self.max_attempts == 0 {
            return Err(VitalError::configuration(
                "Lock max attempts must be greater than 0",
            ));
        }
        Ok(())
    }
}

type HeldKeys = Arc<Mutex<HashSet<ResourceKey>>>;

fn held_guard(held: &HeldKeys) -> MutexGuard<'_, HashSet<ResourceKey>> {
    // The set is only mutated by whole-keyset insert/remove, so a poisoned guard is still consistent.
    held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Keys held by one acquisition. Released exactly once, explicitly or on drop.
#[derive(Debug)]
pub struct LockHandle {
    owner: String,
    keys: Vec<ResourceKey>,
    held: HeldKeys,
    released: bool,
}

impl LockHandle {
    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn keys(&self) -> &[ResourceKey] {
        &self.keys
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Returns true only for the call that actually released the keys.
    pub fn release(&mut self) -> bool {
        if self.released {
            return false;
        }
        let mut held = held_guard(&self.held);
        for key in &self.keys {
            held.remove(key);
        }
        self.released = true;
        debug!(owner = %self.owner, keys = ?self.keys, "Lock released");
        true
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.release();
    }
}

/// Single-process locker: check-then-set of the whole keyset under one mutex,
/// retried with a fixed backoff.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLocker {
    held: HeldKeys,
    config: LockerConfig,
}

impl InMemoryLocker {
    pub fn new(config: LockerConfig) -> Self {
        Self {
            held: Arc::new(Mutex::new(HashSet::new())),
            config,
        }
    }

    pub fn config(&self) -> &LockerConfig {
        &self.config
    }

    pub fn is_held(&self, key: &ResourceKey) -> bool {
        held_guard(&self.held).contains(key)
    }

    pub fn held_count(&self) -> usize {
        held_guard(&self.held).len()
    }

    /// Take every key or none of them.
    pub fn try_acquire(&self, keys: &[ResourceKey]) -> Option<LockHandle> {
        let keys = normalize_keys(keys);
        let mut held = held_guard(&self.held);
        if keys.iter().any(|key| held.contains(key)) {
            return None;
        }
        held.extend(keys.iter().cloned());
        drop(held);

        Some(LockHandle {
            owner: Uuid::new_v4().to_string(),
            keys,
            held: Arc::clone(&self.held),
            released: false,
        })
    }

    /// Retry `try_acquire` up to `max_attempts` times, `retry_backoff` apart.
    pub async fn acquire(&self, keys: &[ResourceKey]) -> VitalResult<LockHandle> {
        let max_attempts = self.config.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            if let Some(handle) = self.try_acquire(keys) {
                debug!(
                    owner = %handle.owner(),
                    keys = ?handle.keys(),
                    attempt,
                    "Lock acquired"
                );
                return Ok(handle);
            }
            if attempt < max_attempts {
                tokio::time::sleep(self.config.retry_backoff()).await;
            }
        }

        warn!(keys = ?keys, attempts = max_attempts, "Failed to acquire lock");
        Err(VitalError::conflict("Failed to acquire lock"))
    }
}

#[async_trait]
impl Locker for InMemoryLocker {
    async fn lock<T, F, Fut>(&self, keys: &[ResourceKey], body: F) -> VitalResult<T>
    where
        T: Send,
        F: FnOnce(CancellationToken) -> Fut + Send,
        Fut: Future<Output = VitalResult<T>> + Send,
    {
        let mut handle = self.acquire(keys).await?;
        let result = body(CancellationToken::new()).await;
        handle.release();
        result
    }
}

/// Locker for deployments with exactly one writer
#[derive(Debug, Clone, Copy, Default)]
pub struct NopLocker;

#[async_trait]
impl Locker for NopLocker {
    async fn lock<T, F, Fut>(&self, _keys: &[ResourceKey], body: F) -> VitalResult<T>
    where
        T: Send,
        F: FnOnce(CancellationToken) -> Fut + Send,
        Fut: Future<Output = VitalResult<T>> + Send,
    {
        body(CancellationToken::new()).await
    }
}
