use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::LockError;
use crate::key::LockKeyPair;

/// A session observed holding (or inspected for) an advisory lock.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    /// Backend-assigned session id (a backend pid for `PostgreSQL`).
    pub session_id: i64,

    /// Backend-reported session state (e.g. `idle`, `active`).
    pub state: String,

    /// Time since the session last changed state.
    #[serde(with = "crate::status::duration_ms")]
    pub idle: Duration,
}

impl SessionInfo {
    /// Whether the backend considers this session idle.
    pub fn is_idle(&self) -> bool {
        self.state.starts_with("idle")
    }
}

/// One granted advisory lock in the backend's raw holder view.
#[derive(Debug, Clone, Serialize)]
pub struct AdvisoryHolder {
    pub key: LockKeyPair,
    #[serde(flatten)]
    pub session: SessionInfo,
}

/// One dedicated backend session reserved for a single lock hold.
///
/// The advisory lock is scoped to this session: handing the underlying
/// connection back to a shared pool before `unlock` would silently drop the
/// lock, so a session is exclusively owned by one lock handle for the hold's
/// entire lifetime and never multiplexed for other work.
#[async_trait]
pub trait AdvisorySession: Send + Sync {
    /// Backend-assigned id for this session, as seen in [`SessionInfo`].
    fn session_id(&self) -> i64;

    /// Attempt to take the advisory lock for `key`. Never blocks on
    /// contention.
    async fn try_lock(&mut self, key: LockKeyPair) -> Result<bool, LockError>;

    /// Release the advisory lock for `key` held on this session.
    async fn unlock(&mut self, key: LockKeyPair) -> Result<(), LockError>;

    /// Close the session, releasing any lock still tied to it.
    async fn close(self: Box<Self>) -> Result<(), LockError>;
}

/// The advisory-lock primitives required from a backing store.
///
/// Exactly four capabilities beyond session reservation: try-lock and unlock
/// (on [`AdvisorySession`]), holder introspection, and forced session
/// termination. Any backend providing these is substitutable under the
/// coordinator: the production backend is `PostgreSQL`, the test backend an
/// in-memory simulation.
#[async_trait]
pub trait AdvisoryBackend: Send + Sync {
    /// Reserve a dedicated session for one lock hold.
    async fn session(&self) -> Result<Box<dyn AdvisorySession>, LockError>;

    /// The session currently holding the advisory lock for `key`, if any.
    async fn holder_of(&self, key: LockKeyPair) -> Result<Option<SessionInfo>, LockError>;

    /// Raw view of every granted advisory lock, for diagnostics.
    async fn list_holders(&self) -> Result<Vec<AdvisoryHolder>, LockError>;

    /// Forcibly terminate a session; the backend drops any advisory locks it
    /// held. Returns `true` if a session was found and terminated.
    async fn terminate_session(&self, session_id: i64) -> Result<bool, LockError>;
}
