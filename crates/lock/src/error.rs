use thiserror::Error;

/// Errors from advisory-lock backends and the heartbeat store.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("schema setup error: {0}")]
    Schema(String),

    #[error("session termination error: {0}")]
    Terminate(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("backend error: {0}")]
    Backend(String),
}
