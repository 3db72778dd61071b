//! Striped per-key lock arena.
//!
//! Serializes mutations a node originates for the same key across the whole
//! replication round, without a cache-wide lock. Multi-key holders acquire
//! stripes in ascending order so two transactions on overlapping keys cannot
//! deadlock each other.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Maps a key to one of `stripes` buckets.
pub fn stripe_of(key: &str, stripes: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % stripes as u64) as usize
}

#[derive(Debug)]
pub struct KeyLocks {
    stripes: Vec<Mutex<()>>,
}

impl KeyLocks {
    pub fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes.max(1)).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Locks the stripe owning `key`.
    pub fn lock(&self, key: &str) -> MutexGuard<'_, ()> {
        self.stripe(stripe_of(key, self.stripes.len()))
    }

    /// Locks every stripe touched by `keys`, lowest index first.
    pub fn lock_all<'a, I>(&self, keys: I) -> Vec<MutexGuard<'_, ()>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut indices: Vec<usize> = keys
            .into_iter()
            .map(|key| stripe_of(key, self.stripes.len()))
            .collect();
        indices.sort_unstable();
        indices.dedup();
        indices.into_iter().map(|i| self.stripe(i)).collect()
    }

    fn stripe(&self, index: usize) -> MutexGuard<'_, ()> {
        // The guarded unit carries no state, so a poisoned stripe is still usable.
        self.stripes[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
