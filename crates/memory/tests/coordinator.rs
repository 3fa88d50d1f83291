//! Coordinator behavior over the simulated backend: racing instances,
//! crashed-holder recovery, and the staleness boundary, under the paused
//! tokio clock where timing matters.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use fleetlock::backend::{AdvisoryBackend, AdvisoryHolder, AdvisorySession, SessionInfo};
use fleetlock::error::LockError;
use fleetlock::key::LockKeyPair;
use fleetlock::stale::is_stale;
use fleetlock::testing::run_coordinator_conformance_tests;
use fleetlock::{HeartbeatStore, InstanceId, LockConfig, LockCoordinator};
use fleetlock_memory::{MemoryAdvisoryBackend, MemoryHeartbeatStore};

/// Delegating backend that counts (and optionally fails) terminations, so
/// tests can assert how many force-release cycles a call performed.
struct CountingBackend {
    inner: MemoryAdvisoryBackend,
    terminations: AtomicU32,
    fail_terminate: bool,
}

impl CountingBackend {
    fn new(inner: MemoryAdvisoryBackend) -> Self {
        Self {
            inner,
            terminations: AtomicU32::new(0),
            fail_terminate: false,
        }
    }

    fn failing(inner: MemoryAdvisoryBackend) -> Self {
        Self {
            fail_terminate: true,
            ..Self::new(inner)
        }
    }

    fn terminations(&self) -> u32 {
        self.terminations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AdvisoryBackend for CountingBackend {
    async fn session(&self) -> Result<Box<dyn AdvisorySession>, LockError> {
        self.inner.session().await
    }

    async fn holder_of(&self, key: LockKeyPair) -> Result<Option<SessionInfo>, LockError> {
        self.inner.holder_of(key).await
    }

    async fn list_holders(&self) -> Result<Vec<AdvisoryHolder>, LockError> {
        self.inner.list_holders().await
    }

    async fn terminate_session(&self, session_id: i64) -> Result<bool, LockError> {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        if self.fail_terminate {
            return Err(LockError::Terminate(String::from("injected failure")));
        }
        self.inner.terminate_session(session_id).await
    }
}

fn fast_config() -> LockConfig {
    LockConfig {
        heartbeat_interval: Duration::from_secs(1),
        stale_threshold: Duration::from_secs(3),
        force_release_pause: Duration::from_millis(50),
        deployment_id: String::from("test"),
    }
}

async fn coordinator(
    backend: &Arc<dyn AdvisoryBackend>,
    store: &Arc<MemoryHeartbeatStore>,
) -> LockCoordinator {
    let store: Arc<dyn fleetlock::HeartbeatStore> = store.clone();
    LockCoordinator::new(Arc::clone(backend), store, fast_config())
        .await
        .expect("coordinator construction should succeed")
}

/// Park an orphaned session holding `name`, with a heartbeat record aged
/// `age`, the footprint of a holder that crashed without releasing.
async fn plant_abandoned_holder(
    backend: &dyn AdvisoryBackend,
    store: &MemoryHeartbeatStore,
    name: &str,
    age: Duration,
) -> i64 {
    let key = LockKeyPair::derive(name);
    let mut session = backend.session().await.expect("session");
    assert!(session.try_lock(key).await.expect("try_lock"));
    let id = session.session_id();
    // The handle is dropped without close: the simulated session lives on.
    drop(session);

    let dead = InstanceId::new("dead");
    store.upsert(name, &dead).await.expect("upsert");
    store.backdate(name, age);
    id
}

#[tokio::test]
async fn conformance() {
    let backend: Arc<dyn AdvisoryBackend> = Arc::new(MemoryAdvisoryBackend::new());
    let store: Arc<dyn fleetlock::HeartbeatStore> = Arc::new(MemoryHeartbeatStore::new());
    run_coordinator_conformance_tests(backend, store)
        .await
        .expect("conformance suite should pass");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mutual_exclusion_across_racing_instances() {
    let backend: Arc<dyn AdvisoryBackend> = Arc::new(MemoryAdvisoryBackend::new());
    let store = Arc::new(MemoryHeartbeatStore::new());

    let barrier = Arc::new(tokio::sync::Barrier::new(8));
    let mut handles = Vec::new();

    for _ in 0..8 {
        let coordinator = Arc::new(coordinator(&backend, &store).await);
        let barrier = Arc::clone(&barrier);
        handles.push(tokio::spawn(async move {
            barrier.wait().await;
            let won = coordinator.try_acquire("contested-job").await;
            (coordinator, won)
        }));
    }

    let mut winners = 0;
    for handle in handles {
        let (coordinator, won) = handle.await.expect("task should not panic");
        if won {
            winners += 1;
            coordinator.release_all().await;
        }
    }

    assert_eq!(winners, 1, "exactly one racing instance should acquire");
}

#[tokio::test(start_paused = true)]
async fn staleness_boundary() {
    let backend = MemoryAdvisoryBackend::new();
    let store = MemoryHeartbeatStore::new();
    let threshold = Duration::from_secs(120);
    let key = LockKeyPair::derive("boundary");
    let instance = InstanceId::new("test");

    store.upsert("boundary", &instance).await.unwrap();

    store.backdate("boundary", threshold - Duration::from_millis(1));
    assert!(
        !is_stale(&store, &backend, "boundary", key, threshold).await,
        "one millisecond inside the threshold is not stale"
    );

    store.backdate("boundary", threshold + Duration::from_millis(1));
    assert!(
        is_stale(&store, &backend, "boundary", key, threshold).await,
        "one millisecond past the threshold is stale"
    );
}

#[tokio::test(start_paused = true)]
async fn staleness_falls_back_to_session_idle_time() {
    let backend = MemoryAdvisoryBackend::new();
    let store = MemoryHeartbeatStore::new();
    let threshold = Duration::from_secs(120);
    let key = LockKeyPair::derive("no-record");

    // No heartbeat record and no holder: nothing provable, not stale.
    assert!(!is_stale(&store, &backend, "no-record", key, threshold).await);

    // A holder with no record at all (every beat write failed, or a
    // pre-heartbeat holder): classified by the backend's idle view.
    let mut session = backend.session().await.unwrap();
    assert!(session.try_lock(key).await.unwrap());
    drop(session);

    assert!(
        !is_stale(&store, &backend, "no-record", key, threshold).await,
        "freshly idle holder is not stale"
    );

    tokio::time::advance(threshold + Duration::from_secs(1)).await;
    assert!(
        is_stale(&store, &backend, "no-record", key, threshold).await,
        "holder idle past the threshold is stale"
    );
}

#[tokio::test(start_paused = true)]
async fn recovery_round_trip() {
    let counting = Arc::new(CountingBackend::new(MemoryAdvisoryBackend::new()));
    let backend: Arc<dyn AdvisoryBackend> = counting.clone();
    let store = Arc::new(MemoryHeartbeatStore::new());

    let orphan_id = plant_abandoned_holder(
        backend.as_ref(),
        &store,
        "batch-import",
        Duration::from_secs(10),
    )
    .await;

    let b = coordinator(&backend, &store).await;

    assert!(
        !b.try_acquire("batch-import").await,
        "plain acquire must respect the orphaned holder"
    );

    assert!(
        b.try_acquire_with_stale_check("batch-import").await,
        "stale-check acquire should reclaim the abandoned lock"
    );
    assert_eq!(counting.terminations(), 1, "exactly one force-release");

    let key = LockKeyPair::derive("batch-import");
    let holder = backend
        .holder_of(key)
        .await
        .unwrap()
        .expect("new holder should be visible");
    assert_ne!(holder.session_id, orphan_id, "orphan's lock must be gone");

    // Re-entry does not trigger further recovery.
    assert!(b.try_acquire_with_stale_check("batch-import").await);
    assert_eq!(counting.terminations(), 1);

    b.release("batch-import").await;
}

#[tokio::test(start_paused = true)]
async fn failed_force_release_does_not_loop() {
    let counting = Arc::new(CountingBackend::failing(MemoryAdvisoryBackend::new()));
    let backend: Arc<dyn AdvisoryBackend> = counting.clone();
    let store = Arc::new(MemoryHeartbeatStore::new());

    plant_abandoned_holder(backend.as_ref(), &store, "wedged", Duration::from_secs(10)).await;

    let b = coordinator(&backend, &store).await;
    assert!(
        !b.try_acquire_with_stale_check("wedged").await,
        "failed recovery must report not-acquired, not assume the lock is free"
    );
    assert_eq!(
        counting.terminations(),
        1,
        "one bounded recovery attempt per call, no retry loop"
    );
}

// Scenario: holder's connection dies without a release; once the heartbeat
// goes stale a competitor's stale-check acquire takes over.
#[tokio::test(start_paused = true)]
async fn takeover_after_holder_crash() {
    let counting = Arc::new(CountingBackend::new(MemoryAdvisoryBackend::new()));
    let backend: Arc<dyn AdvisoryBackend> = counting.clone();
    let store = Arc::new(MemoryHeartbeatStore::new());

    let a = coordinator(&backend, &store).await;
    assert!(a.try_acquire("batch").await);

    // The process dies: no release, heartbeats stop, the session lingers.
    drop(a);

    let b = coordinator(&backend, &store).await;
    assert!(
        !b.try_acquire_with_stale_check("batch").await,
        "heartbeat still fresh, the crash is not yet provable"
    );

    tokio::time::advance(Duration::from_millis(3500)).await;

    assert!(
        b.try_acquire_with_stale_check("batch").await,
        "stale heartbeat should let the survivor take over"
    );
    assert_eq!(counting.terminations(), 1);

    let record = store
        .inspect("batch")
        .await
        .unwrap()
        .expect("new holder should heartbeat");
    assert_eq!(record.instance_id, b.instance_id().as_str());

    b.release("batch").await;
}

#[tokio::test(start_paused = true)]
async fn with_lock_releases_on_completion() {
    let backend: Arc<dyn AdvisoryBackend> = Arc::new(MemoryAdvisoryBackend::new());
    let store = Arc::new(MemoryHeartbeatStore::new());

    let a = coordinator(&backend, &store).await;
    let b = coordinator(&backend, &store).await;

    let ran = a.with_lock("scoped", || async { 42 }).await;
    assert_eq!(ran, Some(42));
    assert!(
        b.try_acquire("scoped").await,
        "lock should be free after the scoped section"
    );
    b.release("scoped").await;

    // While b holds it, the scoped call reports None without running.
    assert!(b.try_acquire("scoped").await);
    let skipped = a.with_lock("scoped", || async { 42 }).await;
    assert_eq!(skipped, None);
    b.release("scoped").await;
}
