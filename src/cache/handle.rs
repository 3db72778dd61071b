//! Cache Handle Module
//!
//! The per-node public API. Every mutating call locks its key on the calling
//! node, resolves its outcome against the local entry store, and replicates
//! the resulting write to every member before returning. Each call has an
//! `_async` twin that runs the same path on the async executor.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use super::expiry::ExpiryView;
use super::locks::KeyLocks;
use super::processor::{EntryChange, MutableEntry};
use super::stats::MetricsSnapshot;
use super::store::EntryStore;
use super::{deadline_after, CacheMetrics, Entry, Version, MAX_KEY_LENGTH, MAX_VALUE_SIZE};
use crate::cluster::message::{Mutation, MutationBatch, ReplicationRequest};
use crate::cluster::{NodeId, ReplicationCoordinator};
use crate::error::{CacheError, Result};
use crate::events::EventBus;
use crate::executor::{AsyncExecutor, CacheFuture};
use crate::tx::{Transaction, TxConcurrency, TxIsolation};

/// Stripes in each node's key lock arena.
const KEY_LOCK_STRIPES: usize = 64;

struct CacheInner {
    store: Arc<EntryStore>,
    coordinator: ReplicationCoordinator,
    locks: KeyLocks,
    executor: AsyncExecutor,
}

/// Net write a single-key call resolved to.
enum Planned {
    Put(String),
    Remove,
}

/// Handle to one node's copy of the cache. Cheap to clone.
#[derive(Clone)]
pub struct Cache {
    inner: Arc<CacheInner>,
}

impl Cache {
    // == Constructor ==
    pub fn new(
        store: Arc<EntryStore>,
        coordinator: ReplicationCoordinator,
        executor: AsyncExecutor,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                store,
                coordinator,
                locks: KeyLocks::new(KEY_LOCK_STRIPES),
                executor,
            }),
        }
    }

    pub fn id(&self) -> NodeId {
        self.inner.store.node()
    }

    // == Get ==
    /// Returns the value for `key`. Counts a hit or a miss.
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        validate_key(key)?;
        let started = Instant::now();
        let value = self.inner.store.get(key);
        self.metrics_collector().record_get_time(started.elapsed());
        Ok(value)
    }

    // == Put ==
    /// Stores `value` and returns the previous value.
    pub fn put(&self, key: &str, value: impl Into<String>) -> Result<Option<String>> {
        self.put_with(key, value.into(), None)
    }

    pub(crate) fn put_with(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<Option<String>> {
        validate_key(key)?;
        validate_value(&value)?;
        let started = Instant::now();

        let previous = self.write_key(key, ttl, |current| {
            Ok((
                current.map(|entry| entry.value.clone()),
                Some(Planned::Put(value.clone())),
            ))
        })?;

        self.metrics_collector().record_put_time(started.elapsed());
        Ok(previous)
    }

    // == Remove ==
    /// Removes `key` and returns the previous value. Absent keys are not replicated.
    pub fn remove(&self, key: &str) -> Result<Option<String>> {
        validate_key(key)?;
        let started = Instant::now();

        let previous = self.write_key(key, None, |current| {
            Ok(match current {
                Some(entry) => (Some(entry.value.clone()), Some(Planned::Remove)),
                None => (None, None),
            })
        })?;

        self.metrics_collector().record_remove_time(started.elapsed());
        Ok(previous)
    }

    /// Removes `key` only while it maps to `expected`.
    pub fn remove_if_matches(&self, key: &str, expected: &str) -> Result<bool> {
        validate_key(key)?;
        let started = Instant::now();
        let mut found = false;

        let removed = self.write_key(key, None, |current| {
            found = current.is_some();
            let matches = current.is_some_and(|entry| entry.value == expected);
            Ok((matches, matches.then_some(Planned::Remove)))
        })?;

        self.record_read(found);
        self.metrics_collector().record_remove_time(started.elapsed());
        Ok(removed)
    }

    // == Replace ==
    /// Replaces the value of `key` only while it maps to `expected`.
    pub fn replace_if_matches(
        &self,
        key: &str,
        expected: &str,
        value: impl Into<String>,
    ) -> Result<bool> {
        self.replace_if_matches_with(key, expected, value.into(), None)
    }

    pub(crate) fn replace_if_matches_with(
        &self,
        key: &str,
        expected: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        validate_key(key)?;
        validate_value(&value)?;
        let started = Instant::now();
        let mut found = false;

        let replaced = self.write_key(key, ttl, |current| {
            found = current.is_some();
            let matches = current.is_some_and(|entry| entry.value == expected);
            Ok((matches, matches.then(|| Planned::Put(value.clone()))))
        })?;

        self.record_read(found);
        self.metrics_collector().record_put_time(started.elapsed());
        Ok(replaced)
    }

    // == Put If Absent ==
    /// Stores `value` only when `key` has no live entry.
    pub fn put_if_absent(&self, key: &str, value: impl Into<String>) -> Result<bool> {
        self.put_if_absent_with(key, value.into(), None)
    }

    pub(crate) fn put_if_absent_with(
        &self,
        key: &str,
        value: String,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        validate_key(key)?;
        validate_value(&value)?;
        let started = Instant::now();

        let stored = self.write_key(key, ttl, |current| {
            let absent = current.is_none();
            Ok((absent, absent.then(|| Planned::Put(value.clone()))))
        })?;

        self.metrics_collector().record_put_time(started.elapsed());
        Ok(stored)
    }

    // == Invoke ==
    /// Runs `processor` against the entry for `key` and replicates its net change.
    ///
    /// The processor runs while the key is locked on this node. It runs again
    /// if a concurrent write to the key from another node lands first, so it
    /// should only depend on the entry it is given. It must not call back
    /// into this cache.
    pub fn invoke<R, F>(&self, key: &str, processor: F) -> Result<R>
    where
        F: FnMut(&mut MutableEntry) -> R,
    {
        self.invoke_with(key, processor, None)
    }

    pub(crate) fn invoke_with<R, F>(
        &self,
        key: &str,
        mut processor: F,
        ttl: Option<Duration>,
    ) -> Result<R>
    where
        F: FnMut(&mut MutableEntry) -> R,
    {
        validate_key(key)?;
        let started = Instant::now();
        let mut first_read = None;
        let mut record_time: fn(&CacheMetrics, Duration) = CacheMetrics::record_get_time;

        let result = self.write_key(key, ttl, |current| {
            let mut entry = MutableEntry::new(key, current.map(|e| e.value.clone()));
            let result = processor(&mut entry);
            let existed = entry.existed();
            let (read, change) = entry.into_outcome();
            first_read = read;
            record_time = CacheMetrics::record_get_time;

            let planned = match change {
                EntryChange::Untouched => None,
                EntryChange::Set(value) => {
                    validate_value(&value)?;
                    record_time = CacheMetrics::record_put_time;
                    Some(Planned::Put(value))
                }
                EntryChange::Removed if existed => {
                    record_time = CacheMetrics::record_remove_time;
                    Some(Planned::Remove)
                }
                EntryChange::Removed => None,
            };
            Ok((result, planned))
        })?;

        if let Some(found) = first_read {
            self.record_read(found);
        }
        record_time(self.metrics_collector(), started.elapsed());
        Ok(result)
    }

    // == Queries ==
    /// Whether `key` has a live entry on this node. No metric effect.
    pub fn contains_key(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        Ok(self.inner.store.contains_key(key))
    }

    pub fn len(&self) -> usize {
        self.inner.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.store.is_empty()
    }

    /// Live keys on this node, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.inner.store.keys()
    }

    // == Clear ==
    /// Wipes every entry on every member. Metrics and events are untouched.
    pub fn clear(&self) -> Result<()> {
        self.inner
            .coordinator
            .broadcast(ReplicationRequest::Clear)
    }

    // == Metrics ==
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics_collector().snapshot(self.inner.store.len())
    }

    /// Zeroes metrics on every member.
    pub fn reset_metrics(&self) -> Result<()> {
        self.inner
            .coordinator
            .broadcast(ReplicationRequest::ResetMetrics)
    }

    pub fn events(&self) -> &EventBus {
        self.inner.store.events()
    }

    // == Expiry ==
    /// View whose writes expire `ttl` after they are made.
    pub fn with_expiry_policy(&self, ttl: Duration) -> ExpiryView {
        ExpiryView::new(self.clone(), ttl)
    }

    /// Reaps this node's expired entries; returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        self.inner.store.sweep_expired()
    }

    // == Transactions ==
    /// Starts a transaction owned by the caller.
    ///
    /// A zero `timeout` never expires; `size` is the expected number of keys.
    pub fn tx_start(
        &self,
        concurrency: TxConcurrency,
        isolation: TxIsolation,
        timeout: Duration,
        size: usize,
    ) -> Result<Transaction> {
        if concurrency != TxConcurrency::Optimistic {
            return Err(CacheError::InvalidRequest(format!(
                "{:?} transactions are not supported",
                concurrency
            )));
        }
        if isolation != TxIsolation::ReadCommitted {
            return Err(CacheError::InvalidRequest(format!(
                "{:?} isolation is not supported",
                isolation
            )));
        }
        Ok(Transaction::new(self.clone(), timeout, size))
    }

    // == Async API ==
    pub fn get_async(&self, key: impl Into<String>) -> CacheFuture<Option<String>> {
        let (cache, key) = (self.clone(), key.into());
        self.executor().spawn(move || cache.get(&key))
    }

    pub fn put_async(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> CacheFuture<Option<String>> {
        let (cache, key, value) = (self.clone(), key.into(), value.into());
        self.executor().spawn(move || cache.put(&key, value))
    }

    pub fn remove_async(&self, key: impl Into<String>) -> CacheFuture<Option<String>> {
        let (cache, key) = (self.clone(), key.into());
        self.executor().spawn(move || cache.remove(&key))
    }

    pub fn remove_if_matches_async(
        &self,
        key: impl Into<String>,
        expected: impl Into<String>,
    ) -> CacheFuture<bool> {
        let (cache, key, expected) = (self.clone(), key.into(), expected.into());
        self.executor()
            .spawn(move || cache.remove_if_matches(&key, &expected))
    }

    pub fn replace_if_matches_async(
        &self,
        key: impl Into<String>,
        expected: impl Into<String>,
        value: impl Into<String>,
    ) -> CacheFuture<bool> {
        let cache = self.clone();
        let (key, expected, value) = (key.into(), expected.into(), value.into());
        self.executor()
            .spawn(move || cache.replace_if_matches(&key, &expected, value))
    }

    pub fn put_if_absent_async(
        &self,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> CacheFuture<bool> {
        let (cache, key, value) = (self.clone(), key.into(), value.into());
        self.executor().spawn(move || cache.put_if_absent(&key, value))
    }

    pub fn invoke_async<R, F>(&self, key: impl Into<String>, processor: F) -> CacheFuture<R>
    where
        R: Send + 'static,
        F: FnMut(&mut MutableEntry) -> R + Send + 'static,
    {
        let (cache, key) = (self.clone(), key.into());
        self.executor().spawn(move || cache.invoke(&key, processor))
    }

    pub fn contains_key_async(&self, key: impl Into<String>) -> CacheFuture<bool> {
        let (cache, key) = (self.clone(), key.into());
        self.executor().spawn(move || cache.contains_key(&key))
    }

    pub fn clear_async(&self) -> CacheFuture<()> {
        let cache = self.clone();
        self.executor().spawn(move || cache.clear())
    }

    // == Internals shared with transactions ==
    pub(crate) fn store(&self) -> &EntryStore {
        &self.inner.store
    }

    pub(crate) fn locks(&self) -> &KeyLocks {
        &self.inner.locks
    }

    pub(crate) fn coordinator(&self) -> &ReplicationCoordinator {
        &self.inner.coordinator
    }

    pub(crate) fn executor(&self) -> &AsyncExecutor {
        &self.inner.executor
    }

    /// Write for `key` that follows `base`. A write without a ttl keeps
    /// the deadline of the entry it overwrites.
    pub(crate) fn put_mutation(
        &self,
        key: &str,
        value: String,
        base: Option<Version>,
        previous: Option<&Entry>,
        ttl: Option<Duration>,
    ) -> Mutation {
        let expire_at = match ttl {
            Some(ttl) => Some(deadline_after(ttl)),
            None => previous.and_then(|entry| entry.expire_at),
        };
        Mutation::Put {
            key: key.to_string(),
            value,
            version: Version::next(base, self.id()),
            expire_at,
        }
    }

    pub(crate) fn remove_mutation(&self, key: &str, base: Option<Version>) -> Mutation {
        Mutation::Remove {
            key: key.to_string(),
            version: Version::next(base, self.id()),
        }
    }

    // == Single-Key Writes ==
    /// Resolves a single-key call against the local entry and replicates the
    /// write it produced.
    ///
    /// The write carries the version it was resolved against. When another
    /// write to the key prepares first, members reject this one and the call
    /// is resolved again against the newer entry until the replication
    /// timeout runs out.
    fn write_key<T, F>(&self, key: &str, ttl: Option<Duration>, mut resolve: F) -> Result<T>
    where
        F: FnMut(Option<&Entry>) -> Result<(T, Option<Planned>)>,
    {
        let _guard = self.inner.locks.lock(key);
        let deadline = Instant::now() + self.inner.coordinator.timeout();
        let mut attempt = 0;

        loop {
            let (current, base) = self.inner.store.peek_versioned(key);
            let (result, planned) = resolve(current.as_ref())?;
            let mutation = match planned {
                None => return Ok(result),
                Some(Planned::Put(value)) => {
                    self.put_mutation(key, value, base, current.as_ref(), ttl)
                }
                Some(Planned::Remove) => self.remove_mutation(key, base),
            };

            match self.replicate(mutation, base) {
                Ok(()) => return Ok(result),
                Err(CacheError::Conflict(reason)) if Instant::now() < deadline => {
                    attempt += 1;
                    debug!(node = %self.id(), key, attempt, "write lost its round: {}", reason);
                    thread::sleep(self.backoff(attempt));
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn replicate(&self, mutation: Mutation, base: Option<Version>) -> Result<()> {
        let batch = MutationBatch {
            id: self.inner.coordinator.next_batch_id(),
            expected: vec![(mutation.key().to_string(), base)],
            mutations: vec![mutation],
        };
        debug!(node = %self.id(), batch = %batch.id, "replicating write");
        self.inner.coordinator.apply_everywhere(batch)
    }

    /// Retry delay, staggered by node so two origins racing on a key stop
    /// colliding.
    fn backoff(&self, attempt: u32) -> Duration {
        let step = u64::from(self.id().0 % 8 + 1) * 100;
        Duration::from_micros(step * u64::from(attempt.min(50)))
    }

    fn record_read(&self, found: bool) {
        if found {
            self.metrics_collector().record_hit();
        } else {
            self.metrics_collector().record_miss();
        }
    }

    fn metrics_collector(&self) -> &CacheMetrics {
        self.inner.store.metrics()
    }
}

impl fmt::Debug for Cache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("node", &self.id())
            .field("len", &self.len())
            .finish()
    }
}

// == Validation ==
pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(CacheError::InvalidRequest("Key cannot be empty".to_string()));
    }
    if key.len() > MAX_KEY_LENGTH {
        return Err(CacheError::InvalidRequest(format!(
            "Key exceeds maximum length of {} bytes",
            MAX_KEY_LENGTH
        )));
    }
    Ok(())
}

pub(crate) fn validate_value(value: &str) -> Result<()> {
    if value.len() > MAX_VALUE_SIZE {
        return Err(CacheError::InvalidRequest(format!(
            "Value exceeds maximum size of {} bytes",
            MAX_VALUE_SIZE
        )));
    }
    Ok(())
}
