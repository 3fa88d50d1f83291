use sqlx::PgPool;

use crate::config::PostgresConfig;

/// Create the heartbeat table if it does not exist.
///
/// Idempotent, and tolerant of two instances racing the creation: even with
/// `IF NOT EXISTS`, concurrent DDL can surface an "already exists" or
/// duplicate-key error from the catalog, which is treated as success.
///
/// # Errors
///
/// Returns a [`sqlx::Error`] if the DDL fails for any other reason.
pub async fn ensure_schema(pool: &PgPool, config: &PostgresConfig) -> Result<(), sqlx::Error> {
    let table = config.heartbeat_table();

    let create = format!(
        "CREATE TABLE IF NOT EXISTS {table} (
            lock_name TEXT PRIMARY KEY,
            instance_id TEXT NOT NULL,
            heartbeat_at TIMESTAMPTZ NOT NULL,
            acquired_at TIMESTAMPTZ NOT NULL
        )"
    );

    match sqlx::query(&create).execute(pool).await {
        Ok(_) => Ok(()),
        Err(e) if is_concurrent_creation(&e) => Ok(()),
        Err(e) => Err(e),
    }
}

fn is_concurrent_creation(error: &sqlx::Error) -> bool {
    let message = error.to_string();
    message.contains("already exists") || message.contains("duplicate key")
}
