use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;

use fleetlock::error::LockError;
use fleetlock::heartbeat::{HeartbeatRecord, HeartbeatStore};
use fleetlock::instance::InstanceId;

#[derive(Debug, Clone)]
struct StoredBeat {
    instance_id: String,
    heartbeat_at: DateTime<Utc>,
    acquired_at: DateTime<Utc>,
    // Monotonic twins of the wall-clock fields, so ages respect the paused
    // tokio clock in tests.
    beat_instant: Instant,
}

/// In-memory [`HeartbeatStore`].
#[derive(Debug, Clone, Default)]
pub struct MemoryHeartbeatStore {
    records: DashMap<String, StoredBeat>,
}

impl MemoryHeartbeatStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewrite the record for `name` as if its last beat happened `age` ago.
    /// Test hook for staleness-boundary scenarios.
    pub fn backdate(&self, name: &str, age: Duration) {
        if let Some(mut record) = self.records.get_mut(name) {
            record.beat_instant = Instant::now() - age;
            record.heartbeat_at = Utc::now() - age;
        }
    }
}

#[async_trait]
impl HeartbeatStore for MemoryHeartbeatStore {
    async fn ensure_schema(&self) -> Result<(), LockError> {
        Ok(())
    }

    async fn upsert(&self, name: &str, instance: &InstanceId) -> Result<(), LockError> {
        match self.records.entry(name.to_owned()) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                record.instance_id = instance.as_str().to_owned();
                record.heartbeat_at = Utc::now();
                record.beat_instant = Instant::now();
            }
            Entry::Vacant(vacant) => {
                vacant.insert(StoredBeat {
                    instance_id: instance.as_str().to_owned(),
                    heartbeat_at: Utc::now(),
                    acquired_at: Utc::now(),
                    beat_instant: Instant::now(),
                });
            }
        }
        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), LockError> {
        self.records.remove(name);
        Ok(())
    }

    async fn inspect(&self, name: &str) -> Result<Option<HeartbeatRecord>, LockError> {
        Ok(self
            .records
            .get(name)
            .map(|record| to_record(name, &record)))
    }

    async fn list(&self) -> Result<Vec<HeartbeatRecord>, LockError> {
        Ok(self
            .records
            .iter()
            .map(|entry| to_record(entry.key(), entry.value()))
            .collect())
    }
}

fn to_record(name: &str, stored: &StoredBeat) -> HeartbeatRecord {
    HeartbeatRecord {
        lock_name: name.to_owned(),
        instance_id: stored.instance_id.clone(),
        heartbeat_at: stored.heartbeat_at,
        acquired_at: stored.acquired_at,
        age: stored.beat_instant.elapsed(),
    }
}
