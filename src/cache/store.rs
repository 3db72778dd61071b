//! Entry Store Module
//!
//! Per-node ground truth for reads. Entries live in write-locked shards so a
//! replicated batch can take every shard it touches at once and become
//! visible atomically. Removed keys keep a tombstone carrying their last
//! version, which keeps versions monotonic and stops stale replicated writes
//! from resurrecting them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use crate::cache::locks::stripe_of;
use crate::cache::{current_timestamp_ms, CacheMetrics, Entry, LruTracker, Version};
use crate::cluster::message::{
    BatchId, Mutation, MutationBatch, ReplicationRequest, ReplicationResponse,
};
use crate::cluster::NodeId;
use crate::events::{CacheEvent, EventBus, EventType};

/// Number of independently locked shards per node.
pub const SHARD_COUNT: usize = 16;

#[derive(Debug, Default)]
struct Shard {
    entries: HashMap<String, Entry>,
    tombstones: HashMap<String, Version>,
}

impl Shard {
    fn version_of(&self, key: &str) -> Option<Version> {
        self.entries
            .get(key)
            .map(|entry| entry.version)
            .or_else(|| self.tombstones.get(key).copied())
    }
}

/// How an applied mutation is accounted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// Normal replication: counts metrics and fires events
    Replicated,
    /// State transfer to a joining node: silent
    CatchUp,
}

// == Entry Store ==
#[derive(Debug)]
pub struct EntryStore {
    node: NodeId,
    shards: Vec<RwLock<Shard>>,
    /// Prepared batches waiting for commit or abort
    staged: Mutex<HashMap<BatchId, MutationBatch>>,
    /// Keys held by prepared batches
    reserved: Mutex<HashMap<String, BatchId>>,
    lru: Mutex<LruTracker>,
    len: AtomicUsize,
    /// 0 disables capacity eviction
    max_entries: usize,
    catching_up: AtomicBool,
    metrics: Arc<CacheMetrics>,
    events: Arc<EventBus>,
}

impl EntryStore {
    // == Constructor ==
    pub fn new(
        node: NodeId,
        max_entries: usize,
        metrics: Arc<CacheMetrics>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            node,
            shards: (0..SHARD_COUNT).map(|_| RwLock::default()).collect(),
            staged: Mutex::default(),
            reserved: Mutex::default(),
            lru: Mutex::default(),
            len: AtomicUsize::new(0),
            max_entries,
            catching_up: AtomicBool::new(false),
            metrics,
            events,
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    /// Live entries, including ones past their deadline that were not reaped yet.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // == Reads ==
    /// Returns the live entry for `key` without touching metrics.
    ///
    /// An entry past its deadline is treated as absent and reaped.
    pub fn peek(&self, key: &str) -> Option<Entry> {
        let found = self.read_shard(self.shard_index(key)).entries.get(key).cloned();
        match found {
            Some(entry) if entry.is_expired() => {
                self.expire(key, entry.version);
                None
            }
            other => other,
        }
    }

    /// Live entry for `key` together with the version the next write to it
    /// must follow, read under one shard lock.
    pub fn peek_versioned(&self, key: &str) -> (Option<Entry>, Option<Version>) {
        let (found, version) = {
            let shard = self.read_shard(self.shard_index(key));
            (shard.entries.get(key).cloned(), shard.version_of(key))
        };
        match found {
            Some(entry) if entry.is_expired() => {
                self.expire(key, entry.version);
                (None, version)
            }
            other => (other, version),
        }
    }

    /// Reads a value, counting a hit or a miss.
    pub fn get(&self, key: &str) -> Option<String> {
        match self.peek(key) {
            Some(entry) => {
                self.metrics.record_hit();
                self.touch(key);
                Some(entry.value)
            }
            None => {
                self.metrics.record_miss();
                None
            }
        }
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.peek(key).is_some()
    }

    /// Version of the live entry or tombstone for `key`.
    pub fn version_of(&self, key: &str) -> Option<Version> {
        self.read_shard(self.shard_index(key)).version_of(key)
    }

    /// Live, unexpired keys in sorted order.
    pub fn keys(&self) -> Vec<String> {
        let now = current_timestamp_ms();
        let mut keys: Vec<String> = (0..self.shards.len())
            .flat_map(|i| {
                self.read_shard(i)
                    .entries
                    .iter()
                    .filter(|(_, entry)| !entry.is_expired_at(now))
                    .map(|(key, _)| key.clone())
                    .collect::<Vec<_>>()
            })
            .collect();
        keys.sort();
        keys
    }

    // == Replication Entry Point ==
    /// Handles one request delivered to this node's apply worker.
    pub fn handle(&self, request: ReplicationRequest) -> ReplicationResponse {
        match request {
            ReplicationRequest::Prepare(batch) => self.prepare(batch),
            ReplicationRequest::Commit(id) => self.commit(id),
            ReplicationRequest::Abort(id) => {
                self.abort(id);
                ReplicationResponse::Aborted
            }
            ReplicationRequest::Clear => {
                self.clear();
                ReplicationResponse::Done
            }
            ReplicationRequest::ResetMetrics => {
                self.metrics.reset();
                ReplicationResponse::Done
            }
        }
    }

    fn prepare(&self, batch: MutationBatch) -> ReplicationResponse {
        // A reserved key belongs to a batch that already prepared here. Any
        // other batch on that key loses the round and is resolved again.
        if !self.catching_up.load(Ordering::Acquire) {
            let mut reserved = lock(&self.reserved);
            for (key, expected) in &batch.expected {
                if let Some(holder) = reserved.get(key).filter(|holder| **holder != batch.id) {
                    return ReplicationResponse::Rejected(format!(
                        "key '{}' is reserved by batch {}",
                        key, holder
                    ));
                }
                let current = self.version_of(key);
                if current != *expected {
                    return ReplicationResponse::Rejected(format!(
                        "key '{}' changed on {}: expected {}, found {}",
                        key,
                        self.node,
                        describe(*expected),
                        describe(current)
                    ));
                }
            }
            for (key, _) in &batch.expected {
                reserved.insert(key.clone(), batch.id);
            }
        }

        debug!(node = %self.node, batch = %batch.id, "batch prepared");
        lock(&self.staged).insert(batch.id, batch);
        ReplicationResponse::Prepared
    }

    fn commit(&self, id: BatchId) -> ReplicationResponse {
        let Some(batch) = lock(&self.staged).remove(&id) else {
            return ReplicationResponse::Failed(format!("batch {} was never prepared", id));
        };
        let applied = self.apply(&batch.mutations, ApplyMode::Replicated);
        self.release(&batch);
        debug!(node = %self.node, batch = %id, applied, "batch committed");
        ReplicationResponse::Committed
    }

    fn abort(&self, id: BatchId) {
        if let Some(batch) = lock(&self.staged).remove(&id) {
            self.release(&batch);
            debug!(node = %self.node, batch = %id, "batch aborted");
        }
    }

    fn release(&self, batch: &MutationBatch) {
        let mut reserved = lock(&self.reserved);
        for (key, _) in &batch.expected {
            if reserved.get(key) == Some(&batch.id) {
                reserved.remove(key);
            }
        }
    }

    // == Apply ==
    /// Applies mutations atomically with respect to readers of this node.
    ///
    /// Every shard the batch touches is write-locked (lowest index first)
    /// before the first write and released after the last, so readers see
    /// either none or all of the batch. A mutation whose version is not newer
    /// than the stored one lost arbitration and is skipped.
    pub fn apply(&self, mutations: &[Mutation], mode: ApplyMode) -> usize {
        let mut indices: Vec<usize> = mutations
            .iter()
            .map(|m| self.shard_index(m.key()))
            .collect();
        indices.sort_unstable();
        indices.dedup();
        let mut guards: HashMap<usize, RwLockWriteGuard<'_, Shard>> = indices
            .into_iter()
            .map(|i| (i, self.write_shard(i)))
            .collect();

        let now = current_timestamp_ms();
        let replicated = mode == ApplyMode::Replicated;
        let mut events = Vec::new();
        let mut touched = Vec::new();
        let mut applied = 0;

        for mutation in mutations {
            let key = mutation.key();
            let Some(shard) = guards.get_mut(&self.shard_index(key)) else {
                continue;
            };
            let incoming = mutation.version();
            if let Some(current) = shard.version_of(key) {
                if incoming <= current {
                    debug!(node = %self.node, key, %incoming, %current, "stale mutation skipped");
                    continue;
                }
            }

            let existing = shard.entries.remove(key);
            let in_map = existing.is_some();
            let previous = match existing {
                Some(entry) if entry.is_expired_at(now) => {
                    if replicated {
                        events.push(self.local_event(EventType::Expired, key, Some(entry.value), entry.version));
                    }
                    None
                }
                other => other,
            };

            match mutation {
                Mutation::Put {
                    value,
                    version,
                    expire_at,
                    ..
                } => {
                    shard.tombstones.remove(key);
                    shard
                        .entries
                        .insert(key.to_string(), Entry::new(value.clone(), *version, *expire_at));
                    if !in_map {
                        self.len.fetch_add(1, Ordering::AcqRel);
                    }
                    if replicated {
                        self.metrics.record_put();
                        events.push(CacheEvent::new(EventType::Put, key, Some(value.clone()), *version, self.node));
                    }
                    touched.push((key.to_string(), true));
                }
                Mutation::Remove { version, .. } => {
                    shard.tombstones.insert(key.to_string(), *version);
                    if in_map {
                        self.len.fetch_sub(1, Ordering::AcqRel);
                    }
                    if let (Some(entry), true) = (previous, replicated) {
                        self.metrics.record_removal();
                        events.push(CacheEvent::new(EventType::Removed, key, Some(entry.value), *version, self.node));
                    }
                    touched.push((key.to_string(), false));
                }
            }
            applied += 1;
        }
        drop(guards);

        if self.max_entries > 0 {
            let mut lru = lock(&self.lru);
            for (key, live) in &touched {
                if *live {
                    lru.touch(key);
                } else {
                    lru.remove(key);
                }
            }
        }
        self.events.publish(events);
        self.enforce_capacity();
        applied
    }

    // == Expiry ==
    /// Reaps `key` if it still holds `version` and is past its deadline.
    ///
    /// The version check under the shard lock makes concurrent reapers agree
    /// on a single winner, so an expiry is observed once.
    pub fn expire(&self, key: &str, version: Version) -> bool {
        let mut shard = self.write_shard(self.shard_index(key));
        let due = matches!(shard.entries.get(key), Some(e) if e.version == version && e.is_expired());
        if !due {
            return false;
        }
        let Some(entry) = shard.entries.remove(key) else {
            return false;
        };
        shard.tombstones.insert(key.to_string(), version);
        drop(shard);

        self.len.fetch_sub(1, Ordering::AcqRel);
        self.forget(key);
        self.events.publish(vec![self.local_event(
            EventType::Expired,
            key,
            Some(entry.value),
            version,
        )]);
        true
    }

    /// Reaps every expired entry, holding each shard lock for one entry at a time.
    pub fn sweep_expired(&self) -> usize {
        let now = current_timestamp_ms();
        let mut removed = 0;
        for index in 0..self.shards.len() {
            let due: Vec<(String, Version)> = self
                .read_shard(index)
                .entries
                .iter()
                .filter(|(_, entry)| entry.is_expired_at(now))
                .map(|(key, entry)| (key.clone(), entry.version))
                .collect();
            for (key, version) in due {
                if self.expire(&key, version) {
                    removed += 1;
                }
            }
        }
        removed
    }

    // == Clear ==
    /// Wipes every entry on this node. Counters are untouched and no events fire.
    pub fn clear(&self) {
        let mut guards: Vec<_> = (0..self.shards.len()).map(|i| self.write_shard(i)).collect();
        for guard in guards.iter_mut() {
            let Shard {
                entries,
                tombstones,
            } = &mut **guard;
            for (key, entry) in entries.drain() {
                tombstones.insert(key, entry.version);
            }
        }
        self.len.store(0, Ordering::Release);
        drop(guards);
        lock(&self.lru).clear();
        debug!(node = %self.node, "store cleared");
    }

    // == Catch-up ==
    /// Marks the store as receiving a state transfer; prepares skip validation
    /// until [`EntryStore::install`] completes.
    pub fn begin_catch_up(&self) {
        self.catching_up.store(true, Ordering::Release);
    }

    /// Every entry and tombstone as mutations that rebuild this store elsewhere.
    pub fn snapshot(&self) -> Vec<Mutation> {
        let mut records = Vec::new();
        for index in 0..self.shards.len() {
            let shard = self.read_shard(index);
            records.extend(shard.entries.iter().map(|(key, entry)| Mutation::Put {
                key: key.clone(),
                value: entry.value.clone(),
                version: entry.version,
                expire_at: entry.expire_at,
            }));
            records.extend(shard.tombstones.iter().map(|(key, version)| Mutation::Remove {
                key: key.clone(),
                version: *version,
            }));
        }
        records
    }

    /// Applies a snapshot taken from a peer and ends catch-up.
    pub fn install(&self, records: &[Mutation]) -> usize {
        let applied = self.apply(records, ApplyMode::CatchUp);
        self.catching_up.store(false, Ordering::Release);
        applied
    }

    // == Capacity ==
    fn enforce_capacity(&self) {
        if self.max_entries == 0 {
            return;
        }
        while self.len() > self.max_entries {
            let Some(victim) = lock(&self.lru).evict_oldest() else {
                break;
            };
            let mut shard = self.write_shard(self.shard_index(&victim));
            let Some(entry) = shard.entries.remove(&victim) else {
                continue;
            };
            shard.tombstones.insert(victim.clone(), entry.version);
            drop(shard);

            self.len.fetch_sub(1, Ordering::AcqRel);
            self.metrics.record_eviction();
            debug!(node = %self.node, key = %victim, "entry evicted");
            self.events.publish(vec![self.local_event(
                EventType::Evicted,
                &victim,
                Some(entry.value),
                entry.version,
            )]);
        }
    }

    fn touch(&self, key: &str) {
        if self.max_entries > 0 {
            lock(&self.lru).touch(key);
        }
    }

    fn forget(&self, key: &str) {
        if self.max_entries > 0 {
            lock(&self.lru).remove(key);
        }
    }

    /// Expired and evicted entries are removed by this node alone, so the
    /// event names this node as its origin.
    fn local_event(
        &self,
        event_type: EventType,
        key: &str,
        value: Option<String>,
        version: Version,
    ) -> CacheEvent {
        CacheEvent {
            origin: self.node,
            ..CacheEvent::new(event_type, key, value, version, self.node)
        }
    }

    fn shard_index(&self, key: &str) -> usize {
        stripe_of(key, self.shards.len())
    }

    fn read_shard(&self, index: usize) -> RwLockReadGuard<'_, Shard> {
        self.shards[index]
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_shard(&self, index: usize) -> RwLockWriteGuard<'_, Shard> {
        self.shards[index]
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn describe(version: Option<Version>) -> String {
    version.map_or_else(|| "absent".to_string(), |v| v.to_string())
}
