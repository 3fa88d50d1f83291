//! `PostgreSQL` backend for the fleetlock coordinator.
//!
//! Advisory locks (`pg_try_advisory_lock` two-key form) held on dedicated
//! connections, heartbeat rows in a regular table, holder introspection via
//! `pg_locks` joined with `pg_stat_activity`, and crashed-holder recovery via
//! `pg_terminate_backend`.

mod backend;
mod config;
mod heartbeat;
mod migrations;

pub use backend::{PostgresAdvisoryBackend, PostgresSession};
pub use config::PostgresConfig;
pub use heartbeat::PostgresHeartbeatStore;
pub use migrations::ensure_schema;
