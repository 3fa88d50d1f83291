use std::sync::Arc;
use std::time::Duration;

use crate::backend::AdvisoryBackend;
use crate::config::LockConfig;
use crate::coordinator::LockCoordinator;
use crate::error::LockError;
use crate::heartbeat::HeartbeatStore;

/// Fast timings for conformance runs: beats every 200 ms, stale after 1 s.
pub fn conformance_config() -> LockConfig {
    LockConfig {
        heartbeat_interval: Duration::from_millis(200),
        stale_threshold: Duration::from_millis(1000),
        force_release_pause: Duration::from_millis(50),
        deployment_id: String::from("conformance"),
    }
}

/// Run the coordinator conformance suite against a backend and heartbeat
/// store pair. Call this from a backend crate's test module; coordinators
/// constructed here simulate independent competing instances sharing the
/// backend.
///
/// # Errors
///
/// Returns an error if coordinator construction or a diagnostic read fails;
/// behavioral violations panic via assertions.
pub async fn run_coordinator_conformance_tests(
    backend: Arc<dyn AdvisoryBackend>,
    store: Arc<dyn HeartbeatStore>,
) -> Result<(), LockError> {
    test_acquire_contend_release(Arc::clone(&backend), Arc::clone(&store)).await?;
    test_local_idempotence(Arc::clone(&backend), Arc::clone(&store)).await?;
    test_heartbeat_freshness(Arc::clone(&backend), Arc::clone(&store)).await?;
    test_release_all(Arc::clone(&backend), Arc::clone(&store)).await?;
    test_status_snapshot(backend, store).await?;
    Ok(())
}

async fn coordinator(
    backend: Arc<dyn AdvisoryBackend>,
    store: Arc<dyn HeartbeatStore>,
) -> Result<LockCoordinator, LockError> {
    LockCoordinator::new(backend, store, conformance_config()).await
}

/// Scenario: A acquires, B contends and fails, A releases, B acquires.
async fn test_acquire_contend_release(
    backend: Arc<dyn AdvisoryBackend>,
    store: Arc<dyn HeartbeatStore>,
) -> Result<(), LockError> {
    let a = coordinator(Arc::clone(&backend), Arc::clone(&store)).await?;
    let b = coordinator(backend, store).await?;

    assert!(a.try_acquire("conf-sync-job").await, "first acquire should win");
    assert!(
        !b.try_acquire("conf-sync-job").await,
        "contending instance should fail while held"
    );

    a.release("conf-sync-job").await;
    assert!(
        b.try_acquire("conf-sync-job").await,
        "acquire should succeed after release"
    );
    b.release("conf-sync-job").await;
    Ok(())
}

async fn test_local_idempotence(
    backend: Arc<dyn AdvisoryBackend>,
    store: Arc<dyn HeartbeatStore>,
) -> Result<(), LockError> {
    let a = coordinator(Arc::clone(&backend), Arc::clone(&store)).await?;
    let b = coordinator(backend, store).await?;

    assert!(a.try_acquire("conf-idem").await);
    assert!(
        a.try_acquire("conf-idem").await,
        "re-entry from the same process should be idempotent"
    );

    // Not reference counted: one release fully frees the lock.
    a.release("conf-idem").await;
    assert!(
        b.try_acquire("conf-idem").await,
        "one release should fully free the lock"
    );
    b.release("conf-idem").await;

    // Releasing an unheld lock is a safe no-op.
    a.release("conf-idem").await;
    Ok(())
}

async fn test_heartbeat_freshness(
    backend: Arc<dyn AdvisoryBackend>,
    store: Arc<dyn HeartbeatStore>,
) -> Result<(), LockError> {
    let a = coordinator(backend, Arc::clone(&store)).await?;

    assert!(a.try_acquire("conf-beat").await);
    let record = store
        .inspect("conf-beat")
        .await?
        .expect("heartbeat record should exist immediately after acquire");
    assert_eq!(record.instance_id, a.instance_id().as_str());
    assert!(
        record.age < conformance_config().heartbeat_interval,
        "fresh heartbeat should be younger than one interval"
    );

    a.release("conf-beat").await;
    assert!(
        store.inspect("conf-beat").await?.is_none(),
        "heartbeat record should be gone after release"
    );
    Ok(())
}

async fn test_release_all(
    backend: Arc<dyn AdvisoryBackend>,
    store: Arc<dyn HeartbeatStore>,
) -> Result<(), LockError> {
    let a = coordinator(Arc::clone(&backend), Arc::clone(&store)).await?;
    let b = coordinator(backend, store).await?;

    assert!(a.try_acquire("conf-all-1").await);
    assert!(a.try_acquire("conf-all-2").await);
    a.release_all().await;

    assert!(b.try_acquire("conf-all-1").await, "released by release_all");
    assert!(b.try_acquire("conf-all-2").await, "released by release_all");
    b.release_all().await;
    Ok(())
}

async fn test_status_snapshot(
    backend: Arc<dyn AdvisoryBackend>,
    store: Arc<dyn HeartbeatStore>,
) -> Result<(), LockError> {
    let a = coordinator(backend, store).await?;

    assert!(a.try_acquire("conf-status").await);
    let status = a.status().await?;

    assert!(
        status.held.iter().any(|h| h.name == "conf-status"),
        "status should list the held lock"
    );
    let beat = status
        .heartbeats
        .iter()
        .find(|h| h.lock_name == "conf-status")
        .expect("status should include the heartbeat record");
    assert!(!beat.stale, "fresh lock must not be marked stale");
    assert!(
        !status.holders.is_empty(),
        "backend holder view should show the granted advisory lock"
    );

    a.release("conf-status").await;
    let status = a.status().await?;
    assert!(
        status.held.iter().all(|h| h.name != "conf-status"),
        "released lock should leave the held list"
    );
    Ok(())
}
