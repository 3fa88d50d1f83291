use std::fmt;
use std::sync::OnceLock;

use serde::Serialize;

/// Identifies one running process among all competitors for the same locks.
///
/// Built from the deployment identifier, the OS process id, and a timestamp
/// captured once per process, so a restarted process (same host, same pid
/// reuse) still produces a distinguishable id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct InstanceId(String);

/// Millisecond timestamp captured the first time any `InstanceId` is built.
fn process_start_ms() -> i64 {
    static START: OnceLock<i64> = OnceLock::new();
    *START.get_or_init(|| chrono::Utc::now().timestamp_millis())
}

impl InstanceId {
    /// Build the id for this process under the given deployment identifier.
    pub fn new(deployment_id: &str) -> Self {
        Self(format!(
            "{deployment_id}-{}-{}",
            std::process::id(),
            process_start_ms()
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
