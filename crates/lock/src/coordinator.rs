use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::backend::{AdvisoryBackend, AdvisorySession};
use crate::config::LockConfig;
use crate::error::LockError;
use crate::heartbeat::{HeartbeatPublisher, HeartbeatStore};
use crate::instance::InstanceId;
use crate::key::LockKeyPair;
use crate::stale;
use crate::status::{HeartbeatStatus, HeldLock, LockServiceStatus};

/// A lock held by this process: one exclusively-owned backend session, the
/// acquisition instant, and the running heartbeat publisher.
struct LockHandle {
    key: LockKeyPair,
    session: Box<dyn AdvisorySession>,
    acquired: Instant,
    publisher: HeartbeatPublisher,
}

/// Registry slot for one lock name.
///
/// `Pending` marks an acquire in flight; it is only ever cleared or replaced
/// by the task that inserted it, so the entry API gives atomic check-and-set
/// semantics for local callers.
enum Slot {
    Pending,
    Held(LockHandle),
}

/// Top-level mutual-exclusion API for one process.
///
/// Composes key derivation, the advisory backend, the heartbeat store, and
/// staleness recovery behind try-style acquire/release operations. Across
/// processes the backend's advisory lock is the sole ground truth; heartbeats
/// are an observability and recovery heuristic only, and a force-release is
/// always followed by a real `try_lock` whose result is authoritative.
///
/// Construct one coordinator at process start, share it wherever locking is
/// needed, and call [`release_all`](Self::release_all) at graceful shutdown.
pub struct LockCoordinator {
    backend: Arc<dyn AdvisoryBackend>,
    store: Arc<dyn HeartbeatStore>,
    config: LockConfig,
    instance: InstanceId,
    registry: DashMap<String, Slot>,
}

impl LockCoordinator {
    /// Create a coordinator, ensuring the heartbeat schema exists.
    ///
    /// # Errors
    ///
    /// Returns an error if heartbeat schema setup fails.
    pub async fn new(
        backend: Arc<dyn AdvisoryBackend>,
        store: Arc<dyn HeartbeatStore>,
        config: LockConfig,
    ) -> Result<Self, LockError> {
        store.ensure_schema().await?;

        let instance = InstanceId::new(&config.deployment_id);
        Ok(Self {
            backend,
            store,
            config,
            instance,
            registry: DashMap::new(),
        })
    }

    /// This process's identity among competitors.
    pub fn instance_id(&self) -> &InstanceId {
        &self.instance
    }

    /// Try to take the lock `name`. Never blocks on contention and never
    /// errors: every failure degrades to "not acquired" and is retryable at
    /// the caller's cadence.
    ///
    /// Re-entry is idempotent, not reference counted: a second `true` for a
    /// name this process already holds does not require a second release.
    pub async fn try_acquire(&self, name: &str) -> bool {
        match self.registry.entry(name.to_owned()) {
            Entry::Occupied(slot) => {
                return match slot.get() {
                    Slot::Held(_) => {
                        debug!(lock = name, "already held by this process");
                        true
                    }
                    Slot::Pending => {
                        debug!(lock = name, "acquire already in flight locally");
                        false
                    }
                };
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::Pending);
            }
        }

        // We own the Pending marker from here; every path below must replace
        // it with a handle or clear it.
        match self.acquire_inner(name).await {
            Ok(Some(handle)) => {
                self.registry.insert(name.to_owned(), Slot::Held(handle));
                debug!(lock = name, "acquired");
                true
            }
            Ok(None) => {
                self.clear_pending(name);
                debug!(lock = name, "held elsewhere");
                false
            }
            Err(e) => {
                self.clear_pending(name);
                warn!(lock = name, error = %e, "acquire failed");
                false
            }
        }
    }

    /// [`try_acquire`](Self::try_acquire), and if the lock is held by a
    /// provably abandoned session, force-release it and retry exactly once.
    ///
    /// The single retry bounds recovery: two instances can never live-lock
    /// force-releasing each other. A failed force-release reports "not
    /// acquired" rather than assuming the lock is free.
    pub async fn try_acquire_with_stale_check(&self, name: &str) -> bool {
        if self.try_acquire(name).await {
            return true;
        }

        let key = LockKeyPair::derive(name);
        if !stale::is_stale(
            self.store.as_ref(),
            self.backend.as_ref(),
            name,
            key,
            self.config.stale_threshold,
        )
        .await
        {
            return false;
        }

        warn!(lock = name, "holder appears abandoned, forcing release");
        if let Err(e) = self.force_release(name, key).await {
            warn!(lock = name, error = %e, "force release failed, cannot acquire");
            return false;
        }

        self.try_acquire(name).await
    }

    /// Release `name` if this process holds it; a no-op otherwise.
    ///
    /// The heartbeat publisher is stopped before anything else so no beat can
    /// be written for a lock this process no longer holds. Cleanup failures
    /// are logged, never surfaced; the session is closed on every path.
    pub async fn release(&self, name: &str) {
        // Only a Held slot may be removed here: a Pending marker belongs to
        // an in-flight acquire and stays under its owner's control.
        let removed = self
            .registry
            .remove_if(name, |_, slot| matches!(slot, Slot::Held(_)));
        let Some((_, Slot::Held(handle))) = removed else {
            debug!(lock = name, "release of lock not held locally, ignoring");
            return;
        };

        handle.publisher.stop().await;

        if let Err(e) = self.store.remove(name).await {
            warn!(lock = name, error = %e, "failed to remove heartbeat record");
        }

        let mut session = handle.session;
        if let Err(e) = session.unlock(handle.key).await {
            warn!(lock = name, error = %e, "advisory unlock failed");
        }
        if let Err(e) = session.close().await {
            warn!(lock = name, error = %e, "failed to close lock session");
        }

        debug!(lock = name, "released");
    }

    /// Release every lock this process holds.
    ///
    /// Called at graceful shutdown so no heartbeat record survives a clean
    /// exit; skipping it is safe (the backend frees advisory locks when the
    /// session drops) but leaves the staleness window for the next acquirer.
    pub async fn release_all(&self) {
        let names: Vec<String> = self
            .registry
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for name in names {
            self.release(&name).await;
        }
    }

    /// Run `critical` under the lock `name`, releasing on completion.
    ///
    /// Returns `None` without running `critical` when the lock could not be
    /// acquired. This is the scoped form application code should prefer over
    /// pairing acquire and release by hand.
    pub async fn with_lock<F, Fut, T>(&self, name: &str, critical: F) -> Option<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        if !self.try_acquire_with_stale_check(name).await {
            return None;
        }
        let result = critical().await;
        self.release(name).await;
        Some(result)
    }

    /// Diagnostic snapshot: locally held locks, all heartbeat records with
    /// computed staleness, and the backend's raw advisory-holder view.
    ///
    /// # Errors
    ///
    /// Returns the underlying error if the heartbeat or holder queries fail;
    /// unlike acquire and release, a diagnostic read should surface outages.
    pub async fn status(&self) -> Result<LockServiceStatus, LockError> {
        let held = self
            .registry
            .iter()
            .filter_map(|entry| match entry.value() {
                Slot::Held(handle) => Some(HeldLock {
                    name: entry.key().clone(),
                    held_for: handle.acquired.elapsed(),
                }),
                Slot::Pending => None,
            })
            .collect();

        let heartbeats = self
            .store
            .list()
            .await?
            .into_iter()
            .map(|record| HeartbeatStatus {
                stale: record.age > self.config.stale_threshold,
                lock_name: record.lock_name,
                instance_id: record.instance_id,
                heartbeat_at: record.heartbeat_at,
                acquired_at: record.acquired_at,
                age: record.age,
            })
            .collect();

        let holders = self.backend.list_holders().await?;

        Ok(LockServiceStatus {
            instance_id: self.instance.to_string(),
            held,
            heartbeats,
            holders,
        })
    }

    /// Reserve a session and attempt the advisory lock; on success, write the
    /// initial heartbeat and start the publisher.
    async fn acquire_inner(&self, name: &str) -> Result<Option<LockHandle>, LockError> {
        let key = LockKeyPair::derive(name);
        let mut session = self.backend.session().await?;

        match session.try_lock(key).await {
            Ok(true) => {}
            Ok(false) => {
                Self::discard_session(name, session).await;
                return Ok(None);
            }
            Err(e) => {
                Self::discard_session(name, session).await;
                return Err(e);
            }
        }

        // A failed first beat is recovered by the publisher's next tick.
        if let Err(e) = self.store.upsert(name, &self.instance).await {
            warn!(lock = name, error = %e, "initial heartbeat write failed");
        }

        let publisher = HeartbeatPublisher::start(
            Arc::clone(&self.store),
            name.to_owned(),
            self.instance.clone(),
            self.config.heartbeat_interval,
        );

        Ok(Some(LockHandle {
            key,
            session,
            acquired: Instant::now(),
            publisher,
        }))
    }

    /// Reclaim an abandoned lock. Only called after a positive staleness
    /// verdict; the subsequent retry's `try_lock` stays authoritative.
    async fn force_release(&self, name: &str, key: LockKeyPair) -> Result<(), LockError> {
        // The heartbeat row goes first so a concurrent acquirer cannot read a
        // just-about-to-be-invalidated "held" signal.
        self.store.remove(name).await?;

        let Some(holder) = self.backend.holder_of(key).await? else {
            debug!(lock = name, "no holder found, lock already free");
            return Ok(());
        };

        let terminated = self.backend.terminate_session(holder.session_id).await?;
        debug!(
            lock = name,
            session_id = holder.session_id,
            terminated,
            "terminated abandoned holder session"
        );

        // Let the termination take effect before the retry.
        tokio::time::sleep(self.config.force_release_pause).await;
        Ok(())
    }

    fn clear_pending(&self, name: &str) {
        self.registry
            .remove_if(name, |_, slot| matches!(slot, Slot::Pending));
    }

    async fn discard_session(name: &str, session: Box<dyn AdvisorySession>) {
        if let Err(e) = session.close().await {
            warn!(lock = name, error = %e, "failed to close unused lock session");
        }
    }
}
