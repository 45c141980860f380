//! Time-ordered, lexicographically sortable identifiers.
//!
//! `LedgerTransaction` and event ids need monotonic causality per owner
//! (spec.md invariant 3): consecutive committed ids for the same owner must
//! be strictly increasing in their embedded timestamp. A random UUID doesn't
//! sort chronologically, so transactions/events get a small ULID-flavored id
//! instead: a millisecond timestamp followed by a random suffix, both
//! hex-encoded so string/byte comparison is also chronological order.

use rand::RngCore;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// A 26-hex-character id: 12 hex chars of millisecond timestamp + 14 hex
/// chars of random suffix. String ordering == chronological ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct TimeOrderedId(String);

impl TimeOrderedId {
    pub fn new(now_millis: u64) -> Self {
        let mut suffix = [0u8; 7];
        rand::thread_rng().fill_bytes(&mut suffix);
        Self(format!("{:012x}{}", now_millis, hex::encode(suffix)))
    }

    pub fn generate() -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_millis() as u64;
        Self::new(now)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Recover the embedded millisecond timestamp, for monotonic-causality checks.
    pub fn timestamp_millis(&self) -> u64 {
        u64::from_str_radix(&self.0[..12], 16).unwrap_or(0)
    }

    pub fn parse(raw: &str) -> Option<Self> {
        if raw.len() == 26 && raw.chars().all(|c| c.is_ascii_hexdigit()) {
            Some(Self(raw.to_string()))
        } else {
            None
        }
    }
}

impl fmt::Display for TimeOrderedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<TimeOrderedId> for String {
    fn from(id: TimeOrderedId) -> Self {
        id.0
    }
}

pub type TxId = TimeOrderedId;
pub type EventId = TimeOrderedId;
