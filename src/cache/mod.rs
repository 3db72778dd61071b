//! Cache Module
//!
//! Per-node replicated entry store, the public cache handle, metrics,
//! expiry and capacity eviction.

mod entry;
mod expiry;
mod handle;
mod locks;
mod lru;
mod processor;
mod stats;
mod store;

#[cfg(test)]
mod property_tests;

// Re-export public types
pub use entry::{current_timestamp_ms, deadline_after, Entry, Version};
pub use expiry::ExpiryView;
pub use handle::Cache;
pub use locks::KeyLocks;
pub use lru::LruTracker;
pub use processor::MutableEntry;
pub use stats::{CacheMetrics, MetricsSnapshot};
pub use store::{ApplyMode, EntryStore, SHARD_COUNT};

pub(crate) use handle::{validate_key, validate_value};

// == Public Constants ==
/// Maximum allowed key length in bytes
pub const MAX_KEY_LENGTH: usize = 256;

/// Maximum allowed value size in bytes
pub const MAX_VALUE_SIZE: usize = 1024 * 1024; // 1 MB
