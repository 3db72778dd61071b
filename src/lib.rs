//! Mesh Cache - a clustered, fully replicated in-memory cache
//!
//! Every node holds a complete copy of the cache. A write made through any
//! node is visible, with matching change events, on every node before the
//! call returns. Provides optimistic multi-key transactions, entry
//! processors, per-write expiry, and an async mirror of every operation.

pub mod api;
pub mod cache;
pub mod cluster;
pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod models;
pub mod tasks;
pub mod tx;

pub use api::AppState;
pub use cache::{Cache, ExpiryView, MetricsSnapshot, MutableEntry};
pub use cluster::{Cluster, NodeId};
pub use config::Config;
pub use error::{CacheError, Result};
pub use events::{CacheEvent, EventType, ListenerId};
pub use executor::CacheFuture;
pub use tasks::spawn_reaper_task;
pub use tx::{Transaction, TxConcurrency, TxIsolation, TxState};
