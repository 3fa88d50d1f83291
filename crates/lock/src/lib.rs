//! Distributed mutual exclusion for horizontally scaled backend instances.
//!
//! Built on a database's session-scoped advisory-lock primitive, with a
//! heartbeat table for observability and idle-session recovery for locks
//! abandoned by crashed holders. Best-effort, try-style exclusion for short
//! critical sections ("only one instance runs this job at a time"), not a
//! consensus system and not transactional locking.

pub mod backend;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod heartbeat;
pub mod instance;
pub mod key;
pub mod stale;
pub mod status;
pub mod testing;

pub use backend::{AdvisoryBackend, AdvisoryHolder, AdvisorySession, SessionInfo};
pub use config::LockConfig;
pub use coordinator::LockCoordinator;
pub use error::LockError;
pub use heartbeat::{HeartbeatPublisher, HeartbeatRecord, HeartbeatStore};
pub use instance::InstanceId;
pub use key::LockKeyPair;
pub use status::LockServiceStatus;
