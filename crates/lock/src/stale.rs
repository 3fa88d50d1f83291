use std::time::Duration;

use tracing::{debug, warn};

use crate::backend::AdvisoryBackend;
use crate::heartbeat::HeartbeatStore;
use crate::key::LockKeyPair;

/// Decide whether the lock `name`, already observed as held by someone else,
/// has been abandoned by a crashed holder.
///
/// Classification order:
/// 1. A heartbeat record exists: stale iff its age exceeds `threshold`.
/// 2. No record (pre-heartbeat holder, or every beat write failed): fall back
///    to the backend's live session view: stale iff the holding session is
///    idle and has been idle longer than `threshold`. Known false-positive
///    source: a live holder running long work on the same connection without
///    issuing statements looks idle here.
/// 3. Neither a record nor a matching session: not stale. Without a provable
///    holder, recovery is unnecessary and unsafe to attempt.
///
/// Never errors: query failures are logged and resolve to "not stale", so an
/// observability outage cannot trigger a force-release of a live holder.
pub async fn is_stale(
    store: &dyn HeartbeatStore,
    backend: &dyn AdvisoryBackend,
    name: &str,
    key: LockKeyPair,
    threshold: Duration,
) -> bool {
    match store.inspect(name).await {
        Ok(Some(record)) => {
            let stale = record.age > threshold;
            debug!(
                lock = name,
                instance = %record.instance_id,
                age_ms = record.age.as_millis() as u64,
                threshold_ms = threshold.as_millis() as u64,
                stale,
                "staleness check via heartbeat record"
            );
            stale
        }
        Ok(None) => match backend.holder_of(key).await {
            Ok(Some(session)) => {
                let stale = session.is_idle() && session.idle > threshold;
                debug!(
                    lock = name,
                    session_id = session.session_id,
                    state = %session.state,
                    idle_ms = session.idle.as_millis() as u64,
                    stale,
                    "staleness check via live session view"
                );
                stale
            }
            Ok(None) => {
                debug!(lock = name, "no heartbeat record and no visible holder");
                false
            }
            Err(e) => {
                warn!(lock = name, error = %e, "holder lookup failed, treating as not stale");
                false
            }
        },
        Err(e) => {
            warn!(lock = name, error = %e, "heartbeat inspect failed, treating as not stale");
            false
        }
    }
}
