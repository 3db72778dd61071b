//! Expiry-policy view.
//!
//! Writes made through an [`ExpiryView`] stamp the entry with an absolute
//! deadline of `now + ttl`. The deadline travels with the replicated write,
//! so every node expires the entry at the same wall-clock instant (within
//! clock skew).

use std::time::Duration;

use super::handle::Cache;
use super::processor::MutableEntry;
use crate::error::Result;
use crate::executor::CacheFuture;

#[derive(Debug, Clone)]
pub struct ExpiryView {
    cache: Cache,
    ttl: Duration,
}

impl ExpiryView {
    pub(crate) fn new(cache: Cache, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn put(&self, key: &str, value: impl Into<String>) -> Result<Option<String>> {
        self.cache.put_with(key, value.into(), Some(self.ttl))
    }

    pub fn put_if_absent(&self, key: &str, value: impl Into<String>) -> Result<bool> {
        self.cache.put_if_absent_with(key, value.into(), Some(self.ttl))
    }

    pub fn replace_if_matches(
        &self,
        key: &str,
        expected: &str,
        value: impl Into<String>,
    ) -> Result<bool> {
        self.cache
            .replace_if_matches_with(key, expected, value.into(), Some(self.ttl))
    }

    pub fn invoke<R, F>(&self, key: &str, processor: F) -> Result<R>
    where
        F: FnMut(&mut MutableEntry) -> R,
    {
        self.cache.invoke_with(key, processor, Some(self.ttl))
    }

    pub fn get(&self, key: &str) -> Result<Option<String>> {
        self.cache.get(key)
    }

    pub fn contains_key(&self, key: &str) -> Result<bool> {
        self.cache.contains_key(key)
    }

    pub fn remove(&self, key: &str) -> Result<Option<String>> {
        self.cache.remove(key)
    }

    // == Async ==
    pub fn put_async(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> CacheFuture<Option<String>> {
        let view = self.clone();
        let (key, value) = (key.into(), value.into());
        self.cache.executor().spawn(move || view.put(&key, value))
    }

    pub fn put_if_absent_async(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> CacheFuture<bool> {
        let view = self.clone();
        let (key, value) = (key.into(), value.into());
        self.cache.executor().spawn(move || view.put_if_absent(&key, value))
    }
}
