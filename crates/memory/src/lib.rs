//! In-memory simulation of the advisory-lock backend and heartbeat store.
//!
//! Substitutable for the `PostgreSQL` backend under the coordinator; used for
//! fast deterministic tests, including crashed-holder recovery scenarios
//! driven by the paused tokio clock.

mod backend;
mod heartbeat;

pub use backend::{MemoryAdvisoryBackend, MemorySession};
pub use heartbeat::MemoryHeartbeatStore;
