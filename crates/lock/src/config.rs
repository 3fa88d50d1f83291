use std::time::Duration;

use tracing::warn;

/// Configuration for the lock coordinator.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// How often a holder refreshes its heartbeat record.
    pub heartbeat_interval: Duration,

    /// Age beyond which an unrefreshed heartbeat marks a lock as abandoned.
    /// Must be materially larger than `heartbeat_interval` to absorb jitter.
    pub stale_threshold: Duration,

    /// Pause after terminating a presumed-dead holder's session, letting the
    /// termination take effect before the acquire retry.
    pub force_release_pause: Duration,

    /// Deployment identifier folded into this process's [`InstanceId`].
    ///
    /// [`InstanceId`]: crate::instance::InstanceId
    pub deployment_id: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(30_000),
            stale_threshold: Duration::from_millis(120_000),
            force_release_pause: Duration::from_millis(250),
            deployment_id: String::from("local"),
        }
    }
}

impl LockConfig {
    /// Load configuration from the process environment.
    ///
    /// Reads `HEARTBEAT_INTERVAL_MS`, `STALE_THRESHOLD_MS`, and
    /// `DEPLOYMENT_ID`. Missing variables use the defaults; unparsable values
    /// are logged and fall back rather than failing, since lock configuration
    /// must never prevent a process from starting.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            heartbeat_interval: duration_from_env("HEARTBEAT_INTERVAL_MS")
                .unwrap_or(defaults.heartbeat_interval),
            stale_threshold: duration_from_env("STALE_THRESHOLD_MS")
                .unwrap_or(defaults.stale_threshold),
            force_release_pause: defaults.force_release_pause,
            deployment_id: std::env::var("DEPLOYMENT_ID").unwrap_or(defaults.deployment_id),
        }
    }
}

fn duration_from_env(var: &str) -> Option<Duration> {
    let raw = std::env::var(var).ok()?;
    match raw.parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(_) => {
            warn!(var, value = %raw, "ignoring unparsable duration, using default");
            None
        }
    }
}
