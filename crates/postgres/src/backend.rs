use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection, PgPool};
use sqlx::Connection;
use tracing::{debug, warn};

use fleetlock::backend::{AdvisoryBackend, AdvisoryHolder, AdvisorySession, SessionInfo};
use fleetlock::error::LockError;
use fleetlock::key::LockKeyPair;

use crate::config::PostgresConfig;

/// Build `PgConnectOptions` from a [`PostgresConfig`], applying SSL settings
/// when configured.
pub(crate) fn build_connect_options(
    config: &PostgresConfig,
) -> Result<PgConnectOptions, LockError> {
    let mut options: PgConnectOptions = config
        .url
        .parse()
        .map_err(|e: sqlx::Error| LockError::Connection(e.to_string()))?;

    if let Some(ref mode) = config.ssl_mode {
        let ssl_mode = match mode.as_str() {
            "disable" => sqlx::postgres::PgSslMode::Disable,
            "prefer" => sqlx::postgres::PgSslMode::Prefer,
            "require" => sqlx::postgres::PgSslMode::Require,
            "verify-ca" => sqlx::postgres::PgSslMode::VerifyCa,
            "verify-full" => sqlx::postgres::PgSslMode::VerifyFull,
            other => {
                return Err(LockError::Connection(format!("unknown ssl_mode: {other}")));
            }
        };
        options = options.ssl_mode(ssl_mode);
    }

    if let Some(ref path) = config.ssl_root_cert {
        options = options.ssl_root_cert(path);
    }

    if let Some(ref path) = config.ssl_cert {
        options = options.ssl_client_cert(path);
    }

    if let Some(ref path) = config.ssl_key {
        options = options.ssl_client_key(path);
    }

    Ok(options)
}

/// The two int4 advisory keys as they appear in `pg_locks`: `classid` and
/// `objid` are `oid` columns, so each signed key is reinterpreted as its
/// unsigned bit pattern.
fn key_as_oids(key: LockKeyPair) -> (i64, i64) {
    (
        i64::from(key.key1.cast_unsigned()),
        i64::from(key.key2.cast_unsigned()),
    )
}

/// `PostgreSQL` implementation of [`AdvisoryBackend`].
///
/// A shared pool serves heartbeat-independent introspection (`pg_locks`
/// joined with `pg_stat_activity`) and forced termination
/// (`pg_terminate_backend`). Each reserved session is a dedicated
/// `PgConnection` outside the pool: the advisory lock lives and dies with
/// that connection, so it is never returned to a pool or reused while held.
pub struct PostgresAdvisoryBackend {
    pool: PgPool,
    config: Arc<PostgresConfig>,
}

impl PostgresAdvisoryBackend {
    /// Create a backend from the provided configuration, connecting a new
    /// pool for introspection queries.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Connection`] if pool creation fails.
    pub async fn new(config: PostgresConfig) -> Result<Self, LockError> {
        let connect_options = build_connect_options(&config)?;
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(config.pool_size)
            .connect_with(connect_options)
            .await
            .map_err(|e| LockError::Connection(e.to_string()))?;

        Ok(Self {
            pool,
            config: Arc::new(config),
        })
    }

    /// Create a backend from an existing pool and config.
    ///
    /// This is useful for sharing a pool with the heartbeat store.
    pub fn from_pool(pool: PgPool, config: PostgresConfig) -> Self {
        Self {
            pool,
            config: Arc::new(config),
        }
    }

    /// The shared introspection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl AdvisoryBackend for PostgresAdvisoryBackend {
    async fn session(&self) -> Result<Box<dyn AdvisorySession>, LockError> {
        let options = build_connect_options(&self.config)?;
        let mut conn = PgConnection::connect_with(&options)
            .await
            .map_err(|e| LockError::Connection(e.to_string()))?;

        let pid: i32 = sqlx::query_scalar("SELECT pg_backend_pid()")
            .fetch_one(&mut conn)
            .await
            .map_err(|e| LockError::Connection(e.to_string()))?;

        debug!(pid, "reserved dedicated lock session");
        Ok(Box::new(PostgresSession { conn, pid }))
    }

    async fn holder_of(&self, key: LockKeyPair) -> Result<Option<SessionInfo>, LockError> {
        let (classid, objid) = key_as_oids(key);

        let row: Option<(i32, String, i64)> = sqlx::query_as(
            "SELECT a.pid, COALESCE(a.state, ''),
                    COALESCE(GREATEST(EXTRACT(EPOCH FROM (now() - a.state_change)), 0), 0)::BIGINT
             FROM pg_locks l
             JOIN pg_stat_activity a ON a.pid = l.pid
             WHERE l.locktype = 'advisory' AND l.granted
               AND l.classid = $1::oid AND l.objid = $2::oid AND l.objsubid = 2",
        )
        .bind(classid)
        .bind(objid)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| LockError::Backend(e.to_string()))?;

        Ok(row.map(|(pid, state, idle_secs)| SessionInfo {
            session_id: i64::from(pid),
            state,
            idle: Duration::from_secs(idle_secs.max(0).cast_unsigned()),
        }))
    }

    async fn list_holders(&self) -> Result<Vec<AdvisoryHolder>, LockError> {
        let rows: Vec<(i64, i64, i32, String, i64)> = sqlx::query_as(
            "SELECT l.classid::BIGINT, l.objid::BIGINT, a.pid, COALESCE(a.state, ''),
                    COALESCE(GREATEST(EXTRACT(EPOCH FROM (now() - a.state_change)), 0), 0)::BIGINT
             FROM pg_locks l
             JOIN pg_stat_activity a ON a.pid = l.pid
             WHERE l.locktype = 'advisory' AND l.granted AND l.objsubid = 2
             ORDER BY a.pid",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| LockError::Backend(e.to_string()))?;

        Ok(rows
            .into_iter()
            .map(|(classid, objid, pid, state, idle_secs)| AdvisoryHolder {
                key: LockKeyPair {
                    key1: (classid as u32).cast_signed(),
                    key2: (objid as u32).cast_signed(),
                },
                session: SessionInfo {
                    session_id: i64::from(pid),
                    state,
                    idle: Duration::from_secs(idle_secs.max(0).cast_unsigned()),
                },
            })
            .collect())
    }

    async fn terminate_session(&self, session_id: i64) -> Result<bool, LockError> {
        let pid = i32::try_from(session_id)
            .map_err(|_| LockError::Terminate(format!("session id {session_id} out of range")))?;

        let terminated: bool = sqlx::query_scalar("SELECT pg_terminate_backend($1)")
            .bind(pid)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| LockError::Terminate(e.to_string()))?;

        Ok(terminated)
    }
}

/// One dedicated `PostgreSQL` connection holding at most one advisory lock.
pub struct PostgresSession {
    conn: PgConnection,
    pid: i32,
}

#[async_trait]
impl AdvisorySession for PostgresSession {
    fn session_id(&self) -> i64 {
        i64::from(self.pid)
    }

    async fn try_lock(&mut self, key: LockKeyPair) -> Result<bool, LockError> {
        sqlx::query_scalar("SELECT pg_try_advisory_lock($1, $2)")
            .bind(key.key1)
            .bind(key.key2)
            .fetch_one(&mut self.conn)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))
    }

    async fn unlock(&mut self, key: LockKeyPair) -> Result<(), LockError> {
        let released: bool = sqlx::query_scalar("SELECT pg_advisory_unlock($1, $2)")
            .bind(key.key1)
            .bind(key.key2)
            .fetch_one(&mut self.conn)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;

        if !released {
            warn!(pid = self.pid, key = %key, "advisory unlock found no lock on this session");
        }
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<(), LockError> {
        self.conn
            .close()
            .await
            .map_err(|e| LockError::Connection(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_oid_reinterpretation() {
        let key = LockKeyPair {
            key1: -1,
            key2: 42,
        };
        let (classid, objid) = key_as_oids(key);
        assert_eq!(classid, i64::from(u32::MAX));
        assert_eq!(objid, 42);
    }

    #[test]
    fn connect_options_reject_unknown_ssl_mode() {
        let config = PostgresConfig {
            ssl_mode: Some(String::from("sideways")),
            ..PostgresConfig::default()
        };
        assert!(matches!(
            build_connect_options(&config),
            Err(LockError::Connection(_))
        ));
    }

    #[test]
    fn connect_options_accept_known_ssl_modes() {
        for mode in ["disable", "prefer", "require", "verify-ca", "verify-full"] {
            let config = PostgresConfig {
                ssl_mode: Some(String::from(mode)),
                ..PostgresConfig::default()
            };
            assert!(build_connect_options(&config).is_ok(), "mode {mode}");
        }
    }
}
