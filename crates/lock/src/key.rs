use std::fmt;

use serde::Serialize;
use sha2::{Digest, Sha256};

/// The two 32-bit keys identifying one advisory lock.
///
/// Derived deterministically from the lock name, so every competing instance
/// maps the same name to the same key pair across processes and restarts.
/// Distinct names colliding on a pair is accepted as a low-probability risk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct LockKeyPair {
    pub key1: i32,
    pub key2: i32,
}

impl LockKeyPair {
    /// Derive the key pair for a lock name.
    ///
    /// The first and second 4-byte halves of the SHA-256 digest of the name,
    /// each read as a big-endian signed 32-bit integer. Pure and total: any
    /// string, including the empty string, yields a pair.
    pub fn derive(name: &str) -> Self {
        let digest = Sha256::digest(name.as_bytes());
        Self {
            key1: i32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]),
            key2: i32::from_be_bytes([digest[4], digest[5], digest[6], digest[7]]),
        }
    }
}

impl fmt::Display for LockKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.key1, self.key2)
    }
}
