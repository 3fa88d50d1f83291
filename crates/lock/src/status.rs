use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::backend::AdvisoryHolder;

/// Serialize a `Duration` as whole milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::Serializer;

    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().try_into().unwrap_or(u64::MAX))
    }
}

/// One lock currently held by this process.
#[derive(Debug, Clone, Serialize)]
pub struct HeldLock {
    pub name: String,
    #[serde(with = "duration_ms", rename = "held_for_ms")]
    pub held_for: Duration,
}

/// One heartbeat record with its computed staleness.
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatStatus {
    pub lock_name: String,
    pub instance_id: String,
    pub heartbeat_at: DateTime<Utc>,
    pub acquired_at: DateTime<Utc>,
    #[serde(with = "duration_ms", rename = "age_ms")]
    pub age: Duration,
    pub stale: bool,
}

/// Diagnostic snapshot of the lock service.
///
/// Three views of the same world for cross-checking: what this process
/// believes it holds, what the heartbeat table claims is held fleet-wide,
/// and what the backend itself reports as granted advisory locks.
#[derive(Debug, Clone, Serialize)]
pub struct LockServiceStatus {
    pub instance_id: String,
    pub held: Vec<HeldLock>,
    pub heartbeats: Vec<HeartbeatStatus>,
    pub holders: Vec<AdvisoryHolder>,
}
