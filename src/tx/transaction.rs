//! Transaction handle.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::debug;

use super::TxState;
use crate::cache::{validate_key, validate_value, Cache, Version};
use crate::cluster::message::MutationBatch;
use crate::cluster::NodeId;
use crate::error::{CacheError, Result};
use crate::executor::CacheFuture;

static NEXT_TX: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct TxId {
    pub node: NodeId,
    pub seq: u64,
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}@{}", self.seq, self.node)
    }
}

#[derive(Debug, Clone)]
enum PendingWrite {
    Put { value: String, ttl: Option<Duration> },
    Remove,
}

/// A transaction owned by the context that started it.
///
/// Dropping an active transaction rolls it back.
pub struct Transaction {
    id: TxId,
    cache: Cache,
    state: TxState,
    /// Set when commit failed; allows the one rollback that acknowledges it
    commit_failed: bool,
    started: Instant,
    timeout: Duration,
    /// Version of each touched key at first access
    snapshot: HashMap<String, Option<Version>>,
    /// Keys in first-write order
    order: Vec<String>,
    writes: HashMap<String, PendingWrite>,
}

impl Transaction {
    pub(crate) fn new(cache: Cache, timeout: Duration, size: usize) -> Self {
        let id = TxId {
            node: cache.id(),
            seq: NEXT_TX.fetch_add(1, Ordering::Relaxed),
        };
        debug!(tx = %id, ?timeout, size, "transaction started");
        Self {
            id,
            cache,
            state: TxState::Active,
            commit_failed: false,
            started: Instant::now(),
            timeout,
            snapshot: HashMap::with_capacity(size),
            order: Vec::with_capacity(size),
            writes: HashMap::with_capacity(size),
        }
    }

    pub fn id(&self) -> TxId {
        self.id
    }

    pub fn state(&self) -> TxState {
        self.state
    }

    // == Reads ==
    /// Reads `key`, seeing this transaction's own writes first and the
    /// latest committed value otherwise. Counts a hit or a miss.
    pub fn get(&mut self, key: &str) -> Result<Option<String>> {
        validate_key(key)?;
        self.ensure_active("read")?;
        if let Some(write) = self.writes.get(key) {
            let value = match write {
                PendingWrite::Put { value, .. } => Some(value.clone()),
                PendingWrite::Remove => None,
            };
            let metrics = self.cache.store().metrics();
            if value.is_some() {
                metrics.record_hit();
            } else {
                metrics.record_miss();
            }
            return Ok(value);
        }
        self.observe(key);
        Ok(self.cache.store().get(key))
    }

    pub fn contains_key(&mut self, key: &str) -> Result<bool> {
        validate_key(key)?;
        self.ensure_active("read")?;
        if let Some(write) = self.writes.get(key) {
            return Ok(matches!(write, PendingWrite::Put { .. }));
        }
        self.observe(key);
        Ok(self.cache.store().contains_key(key))
    }

    // == Writes ==
    /// Buffers a put. Nothing is replicated before commit.
    pub fn put(&mut self, key: &str, value: impl Into<String>) -> Result<()> {
        self.put_with(key, value.into(), None)
    }

    /// Buffers a removal.
    pub fn remove(&mut self, key: &str) -> Result<()> {
        validate_key(key)?;
        self.ensure_active("write")?;
        self.observe(key);
        self.record(key, PendingWrite::Remove);
        Ok(())
    }

    /// Scope whose buffered puts expire `ttl` after commit.
    pub fn with_expiry_policy(&mut self, ttl: Duration) -> TxExpiryScope<'_> {
        TxExpiryScope { tx: self, ttl }
    }

    fn put_with(&mut self, key: &str, value: String, ttl: Option<Duration>) -> Result<()> {
        validate_key(key)?;
        validate_value(&value)?;
        self.ensure_active("write")?;
        self.observe(key);
        self.record(key, PendingWrite::Put { value, ttl });
        Ok(())
    }

    // == Commit ==
    /// Validates and replicates the write set as one atomic batch.
    ///
    /// On any failure the transaction ends rolled back with nothing applied
    /// on any node.
    pub fn commit(&mut self) -> Result<()> {
        if self.state != TxState::Active {
            return Err(CacheError::TransactionState(format!(
                "cannot commit {}: transaction is {}",
                self.id, self.state
            )));
        }
        self.state = TxState::Committing;

        match self.apply() {
            Ok(()) => {
                self.state = TxState::Committed;
                debug!(tx = %self.id, keys = self.order.len(), "transaction committed");
                Ok(())
            }
            Err(err) => {
                self.discard();
                self.state = TxState::RolledBack;
                self.commit_failed = true;
                debug!(tx = %self.id, "commit failed: {}", err);
                Err(err)
            }
        }
    }

    fn apply(&self) -> Result<()> {
        if !self.timeout.is_zero() && self.started.elapsed() > self.timeout {
            return Err(CacheError::TransactionTimeout(self.timeout.as_millis() as u64));
        }
        if self.order.is_empty() {
            return Ok(());
        }

        let store = self.cache.store();
        let _guards = self
            .cache
            .locks()
            .lock_all(self.order.iter().map(String::as_str));

        let mut expected = Vec::with_capacity(self.order.len());
        let mut mutations = Vec::with_capacity(self.order.len());
        for key in &self.order {
            let seen = self.snapshot.get(key).copied().flatten();
            let (current, version) = store.peek_versioned(key);
            if version != seen {
                return Err(CacheError::Conflict(format!(
                    "key '{}' was modified after {} first read it",
                    key, self.id
                )));
            }
            expected.push((key.clone(), seen));

            match self.writes.get(key) {
                Some(PendingWrite::Put { value, ttl }) => mutations.push(
                    self.cache
                        .put_mutation(key, value.clone(), seen, current.as_ref(), *ttl),
                ),
                Some(PendingWrite::Remove) if current.is_some() => {
                    mutations.push(self.cache.remove_mutation(key, seen))
                }
                _ => {}
            }
        }

        let coordinator = self.cache.coordinator();
        coordinator.apply_everywhere(MutationBatch {
            id: coordinator.next_batch_id(),
            mutations,
            expected,
        })
    }

    // == Rollback ==
    /// Discards the write set.
    ///
    /// Allowed while active, and once after a failed commit.
    pub fn rollback(&mut self) -> Result<()> {
        match self.state {
            TxState::Active => {
                self.discard();
                self.state = TxState::RolledBack;
                debug!(tx = %self.id, "transaction rolled back");
                Ok(())
            }
            TxState::RolledBack if self.commit_failed => {
                self.commit_failed = false;
                Ok(())
            }
            state => Err(CacheError::TransactionState(format!(
                "cannot roll back {}: transaction is {}",
                self.id, state
            ))),
        }
    }

    // == Async ==
    pub fn commit_async(self) -> CacheFuture<()> {
        let executor = self.cache.executor().clone();
        executor.spawn(move || {
            let mut tx = self;
            tx.commit()
        })
    }

    pub fn rollback_async(self) -> CacheFuture<()> {
        let executor = self.cache.executor().clone();
        executor.spawn(move || {
            let mut tx = self;
            tx.rollback()
        })
    }

    fn ensure_active(&self, action: &str) -> Result<()> {
        if self.state == TxState::Active {
            Ok(())
        } else {
            Err(CacheError::TransactionState(format!(
                "cannot {} in {}: transaction is {}",
                action, self.id, self.state
            )))
        }
    }

    fn observe(&mut self, key: &str) {
        if !self.snapshot.contains_key(key) {
            let version = self.cache.store().version_of(key);
            self.snapshot.insert(key.to_string(), version);
        }
    }

    fn record(&mut self, key: &str, write: PendingWrite) {
        if self.writes.insert(key.to_string(), write).is_none() {
            self.order.push(key.to_string());
        }
    }

    fn discard(&mut self) {
        self.snapshot.clear();
        self.order.clear();
        self.writes.clear();
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == TxState::Active {
            self.discard();
            self.state = TxState::RolledBack;
            debug!(tx = %self.id, "active transaction dropped, rolled back");
        }
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("writes", &self.order.len())
            .finish()
    }
}

/// Buffered writes that expire after a fixed time once committed.
#[derive(Debug)]
pub struct TxExpiryScope<'a> {
    tx: &'a mut Transaction,
    ttl: Duration,
}

impl TxExpiryScope<'_> {
    pub fn put(&mut self, key: &str, value: impl Into<String>) -> Result<()> {
        let ttl = self.ttl;
        self.tx.put_with(key, value.into(), Some(ttl))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::Cluster;
    use crate::config::Config;
    use crate::tx::{TxConcurrency, TxIsolation};

    fn single_node() -> Cluster {
        Cluster::start(&Config {
            cluster_size: 1,
            ..Config::default()
        })
        .unwrap()
    }

    fn begin(cache: &Cache) -> Transaction {
        cache
            .tx_start(
                TxConcurrency::Optimistic,
                TxIsolation::ReadCommitted,
                Duration::ZERO,
                4,
            )
            .unwrap()
    }

    #[test]
    fn test_writes_are_buffered_until_commit() {
        let cluster = single_node();
        let cache = cluster.node(0).unwrap();
        let mut tx = begin(&cache);

        tx.put("k", "v").unwrap();
        assert_eq!(tx.get("k").unwrap(), Some("v".to_string()));
        assert_eq!(cache.get("k").unwrap(), None);

        tx.commit().unwrap();
        assert_eq!(tx.state(), TxState::Committed);
        assert_eq!(cache.get("k").unwrap(), Some("v".to_string()));
    }

    #[test]
    fn test_state_errors() {
        let cluster = single_node();
        let cache = cluster.node(0).unwrap();

        let mut tx = begin(&cache);
        tx.commit().unwrap();
        assert!(matches!(tx.commit(), Err(CacheError::TransactionState(_))));
        assert!(matches!(tx.rollback(), Err(CacheError::TransactionState(_))));
        assert!(matches!(tx.put("k", "v"), Err(CacheError::TransactionState(_))));

        let mut tx = begin(&cache);
        tx.rollback().unwrap();
        assert!(matches!(tx.rollback(), Err(CacheError::TransactionState(_))));
        assert!(matches!(tx.commit(), Err(CacheError::TransactionState(_))));
    }

    #[test]
    fn test_conflict_rolls_back_and_allows_one_rollback() {
        let cluster = single_node();
        let cache = cluster.node(0).unwrap();
        cache.put("k", "before").unwrap();

        let mut tx = begin(&cache);
        assert_eq!(tx.get("k").unwrap(), Some("before".to_string()));
        tx.put("k", "tx").unwrap();
        cache.put("k", "concurrent").unwrap();

        assert!(matches!(tx.commit(), Err(CacheError::Conflict(_))));
        assert_eq!(tx.state(), TxState::RolledBack);
        assert_eq!(cache.get("k").unwrap(), Some("concurrent".to_string()));

        tx.rollback().unwrap();
        assert!(matches!(tx.rollback(), Err(CacheError::TransactionState(_))));
    }

    #[test]
    fn test_timeout_enforced_at_commit() {
        let cluster = single_node();
        let cache = cluster.node(0).unwrap();
        let mut tx = cache
            .tx_start(
                TxConcurrency::Optimistic,
                TxIsolation::ReadCommitted,
                Duration::from_millis(10),
                1,
            )
            .unwrap();
        tx.put("k", "v").unwrap();
        std::thread::sleep(Duration::from_millis(30));

        assert_eq!(tx.commit(), Err(CacheError::TransactionTimeout(10)));
        assert_eq!(cache.get("k").unwrap(), None);
    }

    #[test]
    fn test_drop_rolls_back() {
        let cluster = single_node();
        let cache = cluster.node(0).unwrap();
        {
            let mut tx = begin(&cache);
            tx.put("k", "v").unwrap();
        }
        assert!(!cache.contains_key("k").unwrap());
    }

    #[test]
    fn test_remove_of_absent_key_is_not_replicated() {
        let cluster = single_node();
        let cache = cluster.node(0).unwrap();
        let mut tx = begin(&cache);
        tx.remove("missing").unwrap();
        assert!(!tx.contains_key("missing").unwrap());
        tx.commit().unwrap();

        assert_eq!(cache.metrics().removals, 0);
    }

    #[test]
    fn test_unsupported_modes_are_rejected() {
        let cluster = single_node();
        let cache = cluster.node(0).unwrap();
        let result = cache.tx_start(
            TxConcurrency::Pessimistic,
            TxIsolation::ReadCommitted,
            Duration::ZERO,
            0,
        );
        assert!(matches!(result, Err(CacheError::InvalidRequest(_))));
    }
}
