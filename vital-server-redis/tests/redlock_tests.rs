//! Redlock Integration Tests
//!
//! Several lockers sharing one set of in-process replicas stand in for several server
//! processes sharing one Redis deployment.

use futures::future::join_all;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use vital_server_redis::coordination::single_attempt;
use vital_server_redis::{LockReplica, MemoryReplica, RedlockConfig, RedlockLocker};
use vital_shared::{Locker, ResourceKey, VitalError};

/// Helper function to create a shared replica set
fn shared_replicas(n: usize) -> Vec<Arc<MemoryReplica>> {
    (0..n)
        .map(|i| Arc::new(MemoryReplica::new(format!("replica-{i}"))))
        .collect()
}

/// Helper function to create one "process" worth of locker
fn process_locker(replicas: &[Arc<MemoryReplica>], config: RedlockConfig) -> RedlockLocker {
    let replicas = replicas
        .iter()
        .map(|r| Arc::clone(r) as Arc<dyn LockReplica>)
        .collect();
    RedlockLocker::new(replicas, config).unwrap()
}

fn key(name: &str) -> Vec<ResourceKey> {
    vec![ResourceKey::from(name)]
}

// ============================================================================
// Mutual Exclusion Tests
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_overlapping_keysets_never_run_concurrently() {
    let replicas = shared_replicas(3);
    let active = Arc::new(AtomicUsize::new(0));
    let max_active = Arc::new(AtomicUsize::new(0));

    let tasks = (0..4).map(|_| {
        let locker = process_locker(&replicas, RedlockConfig::default());
        let active = Arc::clone(&active);
        let max_active = Arc::clone(&max_active);
        tokio::spawn(async move {
            locker
                .lock(&key("Patient?identifier=sys|1"), |_token| async move {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
        })
    });

    for result in join_all(tasks).await {
        assert!(result.unwrap().is_ok());
    }
    assert_eq!(max_active.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_disjoint_keysets_do_not_block() {
    let replicas = shared_replicas(3);
    let first = process_locker(&replicas, single_attempt(RedlockConfig::default()));
    let second = process_locker(&replicas, single_attempt(RedlockConfig::default()));

    let result = first
        .lock(&key("Patient/1"), |_token| async {
            second
                .lock(&key("Patient/2"), |_token| async { Ok("inner") })
                .await
        })
        .await;
    assert_eq!(result.unwrap(), "inner");
}

#[tokio::test]
async fn test_namespaces_isolate_deployments() {
    let replicas = shared_replicas(3);
    let tenant_a = process_locker(
        &replicas,
        single_attempt(RedlockConfig::default().with_namespace("a:")),
    );
    let tenant_b = process_locker(
        &replicas,
        single_attempt(RedlockConfig::default().with_namespace("b:")),
    );

    let result = tenant_a
        .lock(&key("Patient/1"), |_token| async {
            tenant_b.lock(&key("Patient/1"), |_token| async { Ok(()) }).await
        })
        .await;
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_held_key_rejects_second_process() {
    let replicas = shared_replicas(3);
    let first = process_locker(&replicas, single_attempt(RedlockConfig::default()));
    let second = process_locker(&replicas, single_attempt(RedlockConfig::default()));

    let result = first
        .lock(&key("Patient/1"), |_token| async {
            let inner = second
                .lock(&key("Patient/1"), |_token| async { Ok(()) })
                .await;
            Ok(inner)
        })
        .await
        .unwrap();

    assert!(matches!(result, Err(VitalError::Conflict { .. })));
}

// ============================================================================
// Release Tests
// ============================================================================

#[tokio::test]
async fn test_release_after_body_error() {
    let replicas = shared_replicas(3);
    let locker = process_locker(&replicas, RedlockConfig::default());

    let result: Result<(), VitalError> = locker
        .lock(&key("Patient/1"), |_token| async {
            Err(VitalError::validation("rejected payload"))
        })
        .await;

    assert_eq!(result.unwrap_err().status_code(), 400);
    assert!(replicas.iter().all(|r| r.live_keys() == 0));
}

#[tokio::test]
async fn test_release_when_body_is_dropped() {
    let replicas = shared_replicas(3);
    let locker = process_locker(&replicas, RedlockConfig::default());

    let task = tokio::spawn(async move {
        locker
            .lock(&key("Patient/1"), |_token| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await
    });

    while replicas[0].live_keys() == 0 {
        tokio::task::yield_now().await;
    }
    task.abort();
    let _ = task.await;

    // Release on drop runs on a spawned task
    for _ in 0..100 {
        if replicas.iter().all(|r| r.live_keys() == 0) {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert!(replicas.iter().all(|r| r.live_keys() == 0));
}

#[tokio::test(start_paused = true)]
async fn test_expired_grant_frees_key_for_others() {
    let replicas = shared_replicas(3);
    let ttl = Duration::from_millis(300);
    for r in &replicas {
        r.try_acquire(&["vital:lock:Patient/1".to_string()], "crashed-process", ttl)
            .await
            .unwrap();
    }

    // The crashed holder never releases; its grant lapses within the retry window
    let locker = process_locker(&replicas, RedlockConfig::default());
    let result = locker.lock(&key("Patient/1"), |_token| async { Ok(()) }).await;
    assert!(result.is_ok());
}
