use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::time::Instant;

use fleetlock::backend::{AdvisoryBackend, AdvisoryHolder, AdvisorySession, SessionInfo};
use fleetlock::error::LockError;
use fleetlock::key::LockKeyPair;

/// Live state of one simulated session.
#[derive(Debug)]
struct SessionState {
    held: Vec<LockKeyPair>,
    last_activity: Instant,
}

#[derive(Debug, Default)]
struct BackendState {
    next_id: AtomicI64,
    sessions: DashMap<i64, SessionState>,
    // key -> holding session id; the entry API makes acquisition atomic.
    locks: DashMap<LockKeyPair, i64>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            held: Vec::new(),
            last_activity: Instant::now(),
        }
    }
}

/// In-memory simulation of a session-scoped advisory-lock backend.
///
/// Sessions are numbered, track their held keys and last activity, and stay
/// registered until closed or terminated; a session handle dropped without
/// `close` leaves an orphaned holder behind, which is exactly how an
/// abandoned database connection looks to the recovery path. Time is
/// measured with [`tokio::time::Instant`] so `start_paused` tests control
/// the clock.
#[derive(Debug, Clone, Default)]
pub struct MemoryAdvisoryBackend {
    state: Arc<BackendState>,
}

impl MemoryAdvisoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AdvisoryBackend for MemoryAdvisoryBackend {
    async fn session(&self) -> Result<Box<dyn AdvisorySession>, LockError> {
        let id = self.state.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.state.sessions.insert(id, SessionState::default());
        Ok(Box::new(MemorySession {
            id,
            state: Arc::clone(&self.state),
        }))
    }

    async fn holder_of(&self, key: LockKeyPair) -> Result<Option<SessionInfo>, LockError> {
        let Some(holder) = self.state.locks.get(&key).map(|entry| *entry.value()) else {
            return Ok(None);
        };
        Ok(self
            .state
            .sessions
            .get(&holder)
            .map(|session| session_info(holder, &session)))
    }

    async fn list_holders(&self) -> Result<Vec<AdvisoryHolder>, LockError> {
        let mut holders = Vec::new();
        for entry in &self.state.locks {
            if let Some(session) = self.state.sessions.get(entry.value()) {
                holders.push(AdvisoryHolder {
                    key: *entry.key(),
                    session: session_info(*entry.value(), &session),
                });
            }
        }
        Ok(holders)
    }

    async fn terminate_session(&self, session_id: i64) -> Result<bool, LockError> {
        let Some((_, state)) = self.state.sessions.remove(&session_id) else {
            return Ok(false);
        };
        for key in state.held {
            self.state
                .locks
                .remove_if(&key, |_, holder| *holder == session_id);
        }
        Ok(true)
    }
}

fn session_info(id: i64, session: &SessionState) -> SessionInfo {
    SessionInfo {
        session_id: id,
        // A simulated session is never mid-statement when observed.
        state: String::from("idle"),
        idle: session.last_activity.elapsed(),
    }
}

/// Handle to one simulated session.
pub struct MemorySession {
    id: i64,
    state: Arc<BackendState>,
}

impl MemorySession {
    /// Mark activity on this session, failing if it has been terminated.
    fn touch(&self) -> Result<(), LockError> {
        let mut session = self
            .state
            .sessions
            .get_mut(&self.id)
            .ok_or_else(|| LockError::Backend(format!("session {} terminated", self.id)))?;
        session.last_activity = Instant::now();
        Ok(())
    }
}

#[async_trait]
impl AdvisorySession for MemorySession {
    fn session_id(&self) -> i64 {
        self.id
    }

    async fn try_lock(&mut self, key: LockKeyPair) -> Result<bool, LockError> {
        self.touch()?;

        match self.state.locks.entry(key) {
            Entry::Occupied(entry) => Ok(*entry.get() == self.id),
            Entry::Vacant(vacant) => {
                vacant.insert(self.id);
                if let Some(mut session) = self.state.sessions.get_mut(&self.id) {
                    session.held.push(key);
                }
                Ok(true)
            }
        }
    }

    async fn unlock(&mut self, key: LockKeyPair) -> Result<(), LockError> {
        self.touch()?;

        self.state
            .locks
            .remove_if(&key, |_, holder| *holder == self.id);
        if let Some(mut session) = self.state.sessions.get_mut(&self.id) {
            session.held.retain(|held| *held != key);
        }
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), LockError> {
        let Some((_, state)) = self.state.sessions.remove(&self.id) else {
            // Already terminated; closing is still a clean outcome.
            return Ok(());
        };
        for key in state.held {
            self.state.locks.remove_if(&key, |_, holder| *holder == self.id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lock_is_exclusive_across_sessions() {
        let backend = MemoryAdvisoryBackend::new();
        let key = LockKeyPair::derive("exclusive");

        let mut a = backend.session().await.unwrap();
        let mut b = backend.session().await.unwrap();

        assert!(a.try_lock(key).await.unwrap());
        assert!(!b.try_lock(key).await.unwrap());

        a.unlock(key).await.unwrap();
        assert!(b.try_lock(key).await.unwrap());
    }

    #[tokio::test]
    async fn close_frees_held_locks() {
        let backend = MemoryAdvisoryBackend::new();
        let key = LockKeyPair::derive("close-frees");

        let mut a = backend.session().await.unwrap();
        assert!(a.try_lock(key).await.unwrap());
        a.close().await.unwrap();

        assert!(backend.holder_of(key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn terminate_frees_locks_and_invalidates_handle() {
        let backend = MemoryAdvisoryBackend::new();
        let key = LockKeyPair::derive("terminate");

        let mut a = backend.session().await.unwrap();
        assert!(a.try_lock(key).await.unwrap());
        let id = a.session_id();

        assert!(backend.terminate_session(id).await.unwrap());
        assert!(backend.holder_of(key).await.unwrap().is_none());

        // The orphaned handle can no longer operate.
        assert!(a.try_lock(key).await.is_err());

        // Terminating a gone session reports false.
        assert!(!backend.terminate_session(id).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn idle_time_tracks_last_activity() {
        let backend = MemoryAdvisoryBackend::new();
        let key = LockKeyPair::derive("idle");

        let mut a = backend.session().await.unwrap();
        assert!(a.try_lock(key).await.unwrap());

        tokio::time::advance(std::time::Duration::from_secs(90)).await;

        let holder = backend.holder_of(key).await.unwrap().unwrap();
        assert_eq!(holder.session_id, a.session_id());
        assert!(holder.is_idle());
        assert!(holder.idle >= std::time::Duration::from_secs(90));
    }

    #[tokio::test]
    async fn dropped_handle_leaves_an_orphaned_holder() {
        let backend = MemoryAdvisoryBackend::new();
        let key = LockKeyPair::derive("orphan");

        let mut a = backend.session().await.unwrap();
        assert!(a.try_lock(key).await.unwrap());
        drop(a);

        // Without close or terminate the simulated session still holds.
        assert!(backend.holder_of(key).await.unwrap().is_some());
    }
}
