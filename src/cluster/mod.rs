//! Cluster Module
//!
//! Membership, the replication protocol between nodes, and an in-process
//! [`Cluster`] that wires a set of nodes together over [`LocalTransport`].

mod coordinator;
mod membership;
pub mod message;
mod node;
pub mod transport;

pub use coordinator::ReplicationCoordinator;
pub use membership::{MemberStatus, MemberView, Membership, NodeId};
pub use transport::{LocalTransport, Transport};

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::JoinHandle;

use tracing::{info, warn};

use crate::cache::{Cache, CacheMetrics, EntryStore};
use crate::config::Config;
use crate::error::Result;
use crate::events::EventBus;
use crate::executor::AsyncExecutor;

struct ClusterNode {
    cache: Cache,
    worker: Option<JoinHandle<()>>,
}

/// A set of fully replicated nodes living in this process.
pub struct Cluster {
    config: Config,
    membership: Arc<Membership>,
    transport: Arc<LocalTransport>,
    executor: AsyncExecutor,
    nodes: RwLock<BTreeMap<NodeId, ClusterNode>>,
}

impl Cluster {
    // == Start ==
    /// Starts `config.cluster_size` ready nodes (at least one).
    pub fn start(config: &Config) -> Result<Self> {
        let cluster = Self {
            config: config.clone(),
            membership: Arc::new(Membership::new()),
            transport: Arc::new(LocalTransport::new()),
            executor: AsyncExecutor::new()?,
            nodes: RwLock::default(),
        };

        for _ in 0..config.cluster_size.max(1) {
            let id = cluster.membership.allocate_id();
            let node = cluster.spawn_node(id)?;
            cluster.write_nodes().insert(id, node);
            cluster.membership.join(id);
            cluster.membership.mark_ready(id);
        }

        info!(nodes = cluster.len(), "cluster started");
        Ok(cluster)
    }

    fn spawn_node(&self, id: NodeId) -> Result<ClusterNode> {
        let store = Arc::new(EntryStore::new(
            id,
            self.config.max_entries,
            Arc::new(CacheMetrics::new()),
            Arc::new(EventBus::new(id)),
        ));
        let (inbox, worker) = node::spawn_worker(id, Arc::clone(&store))?;
        self.transport.register(id, inbox);

        let coordinator = ReplicationCoordinator::new(
            id,
            Arc::clone(&self.membership),
            self.transport.clone(),
            self.config.replication_timeout(),
        );
        Ok(ClusterNode {
            cache: Cache::new(store, coordinator, self.executor.clone()),
            worker: Some(worker),
        })
    }

    // == Lookup ==
    /// The `index`-th node in id order.
    pub fn node(&self, index: usize) -> Option<Cache> {
        self.read_nodes()
            .values()
            .nth(index)
            .map(|node| node.cache.clone())
    }

    pub fn get(&self, id: NodeId) -> Option<Cache> {
        self.read_nodes().get(&id).map(|node| node.cache.clone())
    }

    /// Every node, in id order.
    pub fn nodes(&self) -> Vec<Cache> {
        self.read_nodes()
            .values()
            .map(|node| node.cache.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read_nodes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_nodes().is_empty()
    }

    pub fn membership(&self) -> &Arc<Membership> {
        &self.membership
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // == Join ==
    /// Adds a node, copies current state into it from a ready peer and
    /// marks it ready.
    ///
    /// The node receives replicated writes from the moment it joins, so
    /// writes racing with the copy are not lost; version arbitration drops
    /// whichever copy of an entry is older.
    pub fn join_node(&self) -> Result<Cache> {
        let id = self.membership.allocate_id();
        let node = self.spawn_node(id)?;
        let cache = node.cache.clone();
        cache.store().begin_catch_up();
        self.write_nodes().insert(id, node);
        self.membership.join(id);

        let peer = self
            .membership
            .current_members()
            .into_iter()
            .find_map(|peer| self.get(peer));
        let records = peer
            .as_ref()
            .map(|peer| peer.store().snapshot())
            .unwrap_or_default();
        let installed = cache.store().install(&records);

        self.membership.mark_ready(id);
        info!(
            node = %id,
            from = ?peer.map(|peer| peer.id()),
            records = installed,
            "node caught up"
        );
        Ok(cache)
    }

    // == Leave ==
    /// Stops a node. Returns false if it was not a member.
    pub fn leave_node(&self, id: NodeId) -> bool {
        let Some(node) = self.write_nodes().remove(&id) else {
            return false;
        };
        self.stop_node(id, node);
        true
    }

    fn stop_node(&self, id: NodeId, mut node: ClusterNode) {
        self.membership.leave(id);
        self.transport.deregister(id);
        if let Some(worker) = node.worker.take() {
            if worker.join().is_err() {
                warn!(node = %id, "apply worker exited abnormally");
            }
        }
        info!(node = %id, "node stopped");
    }

    // == Shutdown ==
    /// Stops every node. Safe to call more than once.
    pub fn shutdown(&self) {
        let nodes = std::mem::take(&mut *self.write_nodes());
        if nodes.is_empty() {
            return;
        }
        for (id, node) in nodes {
            self.stop_node(id, node);
        }
        info!("cluster shut down");
    }

    fn read_nodes(&self) -> RwLockReadGuard<'_, BTreeMap<NodeId, ClusterNode>> {
        self.nodes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_nodes(&self) -> RwLockWriteGuard<'_, BTreeMap<NodeId, ClusterNode>> {
        self.nodes.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("members", &self.membership.view())
            .finish()
    }
}
