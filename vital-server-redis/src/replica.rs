//! A single voter in the quorum

use crate::error::{RedlockError, RedlockResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// One independent lock replica.
///
/// `try_acquire` sets every key to `value` with a `ttl` expiry, or none of them if any key
/// is already set. `release` deletes only the keys still holding `value`.
#[async_trait]
pub trait LockReplica: Send + Sync {
    fn name(&self) -> &str;

    async fn try_acquire(&self, keys: &[String], value: &str, ttl: Duration)
        -> RedlockResult<bool>;

    async fn release(&self, keys: &[String], value: &str) -> RedlockResult<()>;
}

/// In-process replica for development and tests
#[derive(Debug)]
pub struct MemoryReplica {
    name: String,
    entries: Mutex<HashMap<String, (String, Instant)>>,
    available: AtomicBool,
}

impl MemoryReplica {
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            entries: Mutex::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the replica going down or coming back
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Owner value of a live key
    pub fn holder(&self, key: &str) -> Option<String> {
        let entries = self.entries.lock().ok()?;
        entries
            .get(key)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(value, _)| value.clone())
    }

    pub fn live_keys(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .map(|entries| entries.values().filter(|(_, e)| *e > now).count())
            .unwrap_or(0)
    }

    fn check_available(&self) -> RedlockResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RedlockError::Unavailable(format!(
                "replica {} is down",
                self.name
            )))
        }
    }
}

#[async_trait]
impl LockReplica for MemoryReplica {
    fn name(&self) -> &str {
        &self.name
    }

    async fn try_acquire(
        &self,
        keys: &[String],
        value: &str,
        ttl: Duration,
    ) -> RedlockResult<bool> {
        self.check_available()?;
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| RedlockError::Unavailable(format!("replica {} poisoned", self.name)))?;

        let now = Instant::now();
        entries.retain(|_, (_, expires)| *expires > now);
        if keys.iter().any(|key| entries.contains_key(key)) {
            return Ok(false);
        }
        for key in keys {
            entries.insert(key.clone(), (value.to_string(), now + ttl));
        }
        Ok(true)
    }

    async fn release(&self, keys: &[String], value: &str) -> RedlockResult<()> {
        self.check_available()?;
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| RedlockError::Unavailable(format!("replica {} poisoned", self.name)))?;
        for key in keys {
            if entries.get(key).is_some_and(|(owner, _)| owner == value) {
                entries.remove(key);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[tokio::test]
    async fn test_all_or_nothing() {
        let replica = MemoryReplica::new("r0");
        let ttl = Duration::from_secs(1);

        assert!(replica.try_acquire(&keys(&["a", "b"]), "one", ttl).await.unwrap());
        assert!(!replica.try_acquire(&keys(&["b", "c"]), "two", ttl).await.unwrap());
        assert_eq!(replica.holder("c"), None);
        assert_eq!(replica.holder("b").as_deref(), Some("one"));
    }

    #[tokio::test]
    async fn test_release_only_own_keys() {
        let replica = MemoryReplica::new("r0");
        let ttl = Duration::from_secs(1);
        replica.try_acquire(&keys(&["a"]), "one", ttl).await.unwrap();

        replica.release(&keys(&["a"]), "two").await.unwrap();
        assert_eq!(replica.holder("a").as_deref(), Some("one"));

        replica.release(&keys(&["a"]), "one").await.unwrap();
        assert_eq!(replica.live_keys(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire() {
        let replica = MemoryReplica::new("r0");
        replica
            .try_acquire(&keys(&["a"]), "one", Duration::from_millis(500))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(501)).await;
        assert_eq!(replica.holder("a"), None);
        assert!(replica
            .try_acquire(&keys(&["a"]), "two", Duration::from_millis(500))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_unavailable_replica_errors() {
        let replica = MemoryReplica::new("r0");
        replica.set_available(false);
        let err = replica
            .try_acquire(&keys(&["a"]), "one", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RedlockError::Unavailable(_)));
    }
}
