use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::LockError;
use crate::instance::InstanceId;

/// Persisted liveness record for one held lock.
///
/// At most one record exists per lock name; it is deleted on clean release
/// and on force-release. `age` is measured by the store against its own
/// clock, so callers never compare timestamps across machines.
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatRecord {
    pub lock_name: String,
    pub instance_id: String,
    pub heartbeat_at: DateTime<Utc>,
    pub acquired_at: DateTime<Utc>,
    #[serde(with = "crate::status::duration_ms")]
    pub age: Duration,
}

/// Storage for heartbeat records.
#[async_trait]
pub trait HeartbeatStore: Send + Sync {
    /// Create the backing schema if absent. Idempotent; implementations
    /// tolerate concurrent already-exists races.
    async fn ensure_schema(&self) -> Result<(), LockError>;

    /// Refresh the record for `name`: `heartbeat_at` advances to now and the
    /// instance id is recorded; `acquired_at` is set only on first insert.
    async fn upsert(&self, name: &str, instance: &InstanceId) -> Result<(), LockError>;

    /// Delete the record for `name`. Idempotent.
    async fn remove(&self, name: &str) -> Result<(), LockError>;

    /// The record for `name`, if one exists.
    async fn inspect(&self, name: &str) -> Result<Option<HeartbeatRecord>, LockError>;

    /// All known records, for diagnostics.
    async fn list(&self) -> Result<Vec<HeartbeatRecord>, LockError>;
}

/// Periodic heartbeat task for one held lock.
///
/// Each held name gets its own publisher; there is no shared mutable state
/// across names. Write failures are logged and swallowed; a missed beat is
/// repaired by the next tick, and a persistently failing holder eventually
/// looks stale to competitors, which is the intended conservative fallback.
pub struct HeartbeatPublisher {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl HeartbeatPublisher {
    /// Start beating for `name` every `interval`.
    ///
    /// The first tick fires one full interval after start; the acquire path
    /// writes the initial record itself before starting the publisher.
    pub fn start(
        store: Arc<dyn HeartbeatStore>,
        name: String,
        instance: InstanceId,
        interval: Duration,
    ) -> Self {
        let token = CancellationToken::new();
        let task_token = token.clone();

        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);

            loop {
                tokio::select! {
                    () = task_token.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = store.upsert(&name, &instance).await {
                            warn!(lock = %name, error = %e, "heartbeat write failed");
                        } else {
                            debug!(lock = %name, "heartbeat refreshed");
                        }
                    }
                }
            }
        });

        Self {
            token,
            task: Some(task),
        }
    }

    /// Stop the publisher and wait for the task to finish.
    ///
    /// Completes before the caller proceeds to the advisory unlock, so no
    /// beat is ever written for a lock this process no longer holds.
    pub async fn stop(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            // The task only ever exits via cancellation; a join error means
            // it panicked, which must not block release.
            let _ = task.await;
        }
    }
}

impl Drop for HeartbeatPublisher {
    /// The task is tied to its handle's lifetime: dropping the handle without
    /// an explicit stop still cancels the beat instead of leaving a detached
    /// task claiming a lock nobody holds.
    fn drop(&mut self) {
        self.token.cancel();
    }
}
