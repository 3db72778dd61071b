//! Cache Entry Module
//!
//! Defines versioned cache entries with optional expiry.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::cluster::NodeId;

// == Version ==
/// Per-key version used for optimistic validation and cross-node arbitration.
///
/// Ordering compares `counter` first and falls back to the node that produced
/// the write, so two nodes racing on the same counter still agree on a winner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version {
    /// Monotonic per-key counter
    pub counter: u64,
    /// Node that produced this version
    pub node: NodeId,
}

impl Version {
    /// Creates a version with the given counter on the given node.
    pub fn new(counter: u64, node: NodeId) -> Self {
        Self { counter, node }
    }

    /// Returns the version a write on `node` should carry after `current`.
    pub fn next(current: Option<Version>, node: NodeId) -> Self {
        let counter = current.map_or(1, |v| v.counter + 1);
        Self { counter, node }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.counter, self.node)
    }
}

// == Entry ==
/// A live cache entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// The stored value
    pub value: String,
    /// Version of the write that produced this value
    pub version: Version,
    /// Expiration timestamp (Unix milliseconds), None = no expiration
    pub expire_at: Option<u64>,
}

impl Entry {
    // == Constructor ==
    pub fn new(value: String, version: Version, expire_at: Option<u64>) -> Self {
        Self {
            value,
            version,
            expire_at,
        }
    }

    // == Is Expired ==
    /// Checks if the entry has expired on this node's clock.
    ///
    /// An entry is expired once the current time is greater than or equal to
    /// its expiration time.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(current_timestamp_ms())
    }

    /// Same as [`Entry::is_expired`] against an explicit clock reading.
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        matches!(self.expire_at, Some(expires) if now_ms >= expires)
    }

    // == Time To Live ==
    /// Returns remaining TTL in milliseconds, or None if no expiration is set.
    pub fn ttl_remaining_ms(&self) -> Option<u64> {
        self.expire_at
            .map(|expires| expires.saturating_sub(current_timestamp_ms()))
    }
}

// == Utility Functions ==
/// Returns current Unix timestamp in milliseconds.
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Absolute deadline for a write made now under `ttl`.
pub fn deadline_after(ttl: Duration) -> u64 {
    current_timestamp_ms().saturating_add(ttl.as_millis() as u64)
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    fn v(counter: u64, node: u32) -> Version {
        Version::new(counter, NodeId(node))
    }

    #[test]
    fn test_version_orders_by_counter_then_node() {
        assert!(v(2, 0) > v(1, 9));
        assert!(v(3, 2) > v(3, 1));
        assert_eq!(v(3, 1), v(3, 1));
    }

    #[test]
    fn test_version_next() {
        assert_eq!(Version::next(None, NodeId(4)), v(1, 4));
        assert_eq!(Version::next(Some(v(7, 1)), NodeId(2)), v(8, 2));
    }

    #[test]
    fn test_entry_without_ttl_never_expires() {
        let entry = Entry::new("value".to_string(), v(1, 0), None);
        assert!(!entry.is_expired());
        assert!(entry.ttl_remaining_ms().is_none());
    }

    #[test]
    fn test_entry_expiration() {
        let entry = Entry::new(
            "value".to_string(),
            v(1, 0),
            Some(deadline_after(Duration::from_millis(50))),
        );
        assert!(!entry.is_expired());

        sleep(Duration::from_millis(80));

        assert!(entry.is_expired());
        assert_eq!(entry.ttl_remaining_ms(), Some(0));
    }

    #[test]
    fn test_expiration_boundary_condition() {
        let now = current_timestamp_ms();
        let entry = Entry::new("test".to_string(), v(1, 0), Some(now));

        assert!(entry.is_expired_at(now), "Entry should be expired at boundary");
        assert!(!entry.is_expired_at(now - 1));
    }

    #[test]
    fn test_ttl_remaining_ms() {
        let entry = Entry::new(
            "value".to_string(),
            v(1, 0),
            Some(deadline_after(Duration::from_secs(10))),
        );
        let remaining = entry.ttl_remaining_ms().unwrap();
        assert!(remaining <= 10_000);
        assert!(remaining >= 9_000);
    }
}
