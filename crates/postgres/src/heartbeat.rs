use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use fleetlock::error::LockError;
use fleetlock::heartbeat::{HeartbeatRecord, HeartbeatStore};
use fleetlock::instance::InstanceId;

use crate::config::PostgresConfig;
use crate::migrations;

/// `PostgreSQL` implementation of [`HeartbeatStore`].
///
/// Rows live in the `{prefix}lock_heartbeats` table; ages are computed by the
/// database against its own clock so competing instances never compare
/// timestamps across machines.
pub struct PostgresHeartbeatStore {
    pool: PgPool,
    config: Arc<PostgresConfig>,
}

impl PostgresHeartbeatStore {
    /// Create a heartbeat store sharing an existing pool, typically the
    /// advisory backend's introspection pool.
    pub fn from_pool(pool: PgPool, config: PostgresConfig) -> Self {
        Self {
            pool,
            config: Arc::new(config),
        }
    }
}

#[async_trait]
impl HeartbeatStore for PostgresHeartbeatStore {
    async fn ensure_schema(&self) -> Result<(), LockError> {
        migrations::ensure_schema(&self.pool, &self.config)
            .await
            .map_err(|e| LockError::Schema(e.to_string()))
    }

    async fn upsert(&self, name: &str, instance: &InstanceId) -> Result<(), LockError> {
        let table = self.config.heartbeat_table();
        let query = format!(
            "INSERT INTO {table} (lock_name, instance_id, heartbeat_at, acquired_at)
             VALUES ($1, $2, now(), now())
             ON CONFLICT (lock_name)
             DO UPDATE SET heartbeat_at = now(), instance_id = EXCLUDED.instance_id"
        );

        sqlx::query(&query)
            .bind(name)
            .bind(instance.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;

        Ok(())
    }

    async fn remove(&self, name: &str) -> Result<(), LockError> {
        let table = self.config.heartbeat_table();
        let query = format!("DELETE FROM {table} WHERE lock_name = $1");

        sqlx::query(&query)
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;

        Ok(())
    }

    async fn inspect(&self, name: &str) -> Result<Option<HeartbeatRecord>, LockError> {
        let table = self.config.heartbeat_table();
        let query = format!(
            "SELECT lock_name, instance_id, heartbeat_at, acquired_at,
                    GREATEST((EXTRACT(EPOCH FROM (now() - heartbeat_at)) * 1000)::BIGINT, 0)
             FROM {table} WHERE lock_name = $1"
        );

        let row: Option<HeartbeatRow> = sqlx::query_as(&query)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;

        Ok(row.map(to_record))
    }

    async fn list(&self) -> Result<Vec<HeartbeatRecord>, LockError> {
        let table = self.config.heartbeat_table();
        let query = format!(
            "SELECT lock_name, instance_id, heartbeat_at, acquired_at,
                    GREATEST((EXTRACT(EPOCH FROM (now() - heartbeat_at)) * 1000)::BIGINT, 0)
             FROM {table} ORDER BY lock_name"
        );

        let rows: Vec<HeartbeatRow> = sqlx::query_as(&query)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;

        Ok(rows.into_iter().map(to_record).collect())
    }
}

type HeartbeatRow = (String, String, DateTime<Utc>, DateTime<Utc>, i64);

fn to_record((lock_name, instance_id, heartbeat_at, acquired_at, age_ms): HeartbeatRow) -> HeartbeatRecord {
    HeartbeatRecord {
        lock_name,
        instance_id,
        heartbeat_at,
        acquired_at,
        age: Duration::from_millis(age_ms.max(0).cast_unsigned()),
    }
}
