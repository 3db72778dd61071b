//! Property-Based Tests for Cache Module
//!
//! Uses proptest to check metrics accounting and cross-node convergence
//! against simple models.

use proptest::prelude::*;
use std::collections::HashMap;
use std::sync::Arc;

use crate::cache::{ApplyMode, CacheMetrics, EntryStore, Version};
use crate::cluster::message::Mutation;
use crate::cluster::{Cluster, NodeId};
use crate::config::Config;
use crate::events::EventBus;

// == Strategies ==
/// Small key space so operations collide often
fn key_strategy() -> impl Strategy<Value = String> {
    "[a-d]".prop_map(|s| s)
}

fn value_strategy() -> impl Strategy<Value = String> {
    "[xyz]{1,2}".prop_map(|s| s)
}

#[derive(Debug, Clone)]
enum CacheOp {
    Put { key: String, value: String },
    Get { key: String },
    Remove { key: String },
    RemoveIfMatches { key: String, expected: String },
    ReplaceIfMatches { key: String, expected: String, value: String },
    PutIfAbsent { key: String, value: String },
    ContainsKey { key: String },
}

fn cache_op_strategy() -> impl Strategy<Value = CacheOp> {
    prop_oneof![
        (key_strategy(), value_strategy()).prop_map(|(key, value)| CacheOp::Put { key, value }),
        key_strategy().prop_map(|key| CacheOp::Get { key }),
        key_strategy().prop_map(|key| CacheOp::Remove { key }),
        (key_strategy(), value_strategy())
            .prop_map(|(key, expected)| CacheOp::RemoveIfMatches { key, expected }),
        (key_strategy(), value_strategy(), value_strategy()).prop_map(|(key, expected, value)| {
            CacheOp::ReplaceIfMatches {
                key,
                expected,
                value,
            }
        }),
        (key_strategy(), value_strategy())
            .prop_map(|(key, value)| CacheOp::PutIfAbsent { key, value }),
        key_strategy().prop_map(|key| CacheOp::ContainsKey { key }),
    ]
}

/// Expected counters for the node the operations run on.
#[derive(Debug, Default)]
struct Model {
    entries: HashMap<String, String>,
    puts: u64,
    removals: u64,
    hits: u64,
    misses: u64,
}

impl Model {
    fn read(&mut self, key: &str) -> Option<String> {
        let value = self.entries.get(key).cloned();
        if value.is_some() {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        value
    }

    fn apply(&mut self, op: &CacheOp) {
        match op {
            CacheOp::Put { key, value } => {
                self.entries.insert(key.clone(), value.clone());
                self.puts += 1;
            }
            CacheOp::Get { key } => {
                self.read(key);
            }
            CacheOp::Remove { key } => {
                if self.entries.remove(key).is_some() {
                    self.removals += 1;
                }
            }
            CacheOp::RemoveIfMatches { key, expected } => {
                if self.read(key).as_deref() == Some(expected.as_str()) {
                    self.entries.remove(key);
                    self.removals += 1;
                }
            }
            CacheOp::ReplaceIfMatches {
                key,
                expected,
                value,
            } => {
                if self.read(key).as_deref() == Some(expected.as_str()) {
                    self.entries.insert(key.clone(), value.clone());
                    self.puts += 1;
                }
            }
            CacheOp::PutIfAbsent { key, value } => {
                if !self.entries.contains_key(key) {
                    self.entries.insert(key.clone(), value.clone());
                    self.puts += 1;
                }
            }
            CacheOp::ContainsKey { .. } => {}
        }
    }
}

fn put(key: &str, value: &str, counter: u64, node: u32) -> Mutation {
    Mutation::Put {
        key: key.to_string(),
        value: value.to_string(),
        version: Version::new(counter, NodeId(node)),
        expire_at: None,
    }
}

fn store() -> EntryStore {
    EntryStore::new(
        NodeId(0),
        0,
        Arc::new(CacheMetrics::new()),
        Arc::new(EventBus::new(NodeId(0))),
    )
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    // For any sequence of operations on one node, the metrics of that node
    // follow the operation table, the other node counts the same writes but
    // no reads, and both nodes end with identical contents.
    #[test]
    fn prop_metrics_follow_operation_table(ops in prop::collection::vec(cache_op_strategy(), 1..40)) {
        let cluster = Cluster::start(&Config { cluster_size: 2, ..Config::default() }).unwrap();
        let origin = cluster.node(0).unwrap();
        let replica = cluster.node(1).unwrap();
        let mut model = Model::default();

        for op in &ops {
            match op {
                CacheOp::Put { key, value } => { origin.put(key, value.as_str()).unwrap(); }
                CacheOp::Get { key } => { origin.get(key).unwrap(); }
                CacheOp::Remove { key } => { origin.remove(key).unwrap(); }
                CacheOp::RemoveIfMatches { key, expected } => {
                    origin.remove_if_matches(key, expected).unwrap();
                }
                CacheOp::ReplaceIfMatches { key, expected, value } => {
                    origin.replace_if_matches(key, expected, value.as_str()).unwrap();
                }
                CacheOp::PutIfAbsent { key, value } => { origin.put_if_absent(key, value.as_str()).unwrap(); }
                CacheOp::ContainsKey { key } => { origin.contains_key(key).unwrap(); }
            }
            model.apply(op);
        }

        let local = origin.metrics();
        prop_assert_eq!(local.puts, model.puts);
        prop_assert_eq!(local.removals, model.removals);
        prop_assert_eq!(local.hits, model.hits);
        prop_assert_eq!(local.misses, model.misses);
        prop_assert_eq!(local.size, model.entries.len());

        let remote = replica.metrics();
        prop_assert_eq!(remote.puts, model.puts);
        prop_assert_eq!(remote.removals, model.removals);
        prop_assert_eq!(remote.gets(), 0);

        for key in ["a", "b", "c", "d"] {
            prop_assert_eq!(origin.store().peek(key).map(|e| e.value), model.entries.get(key).cloned());
            prop_assert_eq!(origin.store().peek(key), replica.store().peek(key));
        }
    }

    // Version arbitration picks the same winner whatever order concurrent
    // writes arrive in.
    #[test]
    fn prop_arbitration_is_order_independent(
        writes in prop::collection::vec((1u64..4, 0u32..3), 1..8)
    ) {
        let forward = store();
        let backward = store();
        let mutations: Vec<Mutation> = writes
            .iter()
            .map(|(counter, node)| put("k", &format!("{}@{}", counter, node), *counter, *node))
            .collect();

        for mutation in &mutations {
            forward.apply(std::slice::from_ref(mutation), ApplyMode::Replicated);
        }
        for mutation in mutations.iter().rev() {
            backward.apply(std::slice::from_ref(mutation), ApplyMode::Replicated);
        }

        let winner = mutations.iter().map(Mutation::version).max();
        prop_assert_eq!(forward.version_of("k"), winner);
        prop_assert_eq!(backward.version_of("k"), winner);
        prop_assert_eq!(forward.peek("k").map(|e| e.value), backward.peek("k").map(|e| e.value));
    }

    // The next version is always newer than the one it follows.
    #[test]
    fn prop_next_version_is_newer(counter in 0u64..1_000, from in 0u32..8, to in 0u32..8) {
        let current = Version::new(counter, NodeId(from));
        prop_assert!(Version::next(Some(current), NodeId(to)) > current);
    }
}
