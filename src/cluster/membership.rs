//! Membership view.
//!
//! The ordered set of nodes and their readiness, published on a `watch`
//! channel so interested parties see joins and leaves as they happen.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{PoisonError, RwLock, RwLockReadGuard};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

/// Identifier of a cluster node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    /// Receives replicated writes but is not waited on
    Joining,
    /// Full member; every replication round waits for it
    Ready,
}

pub type MemberView = BTreeMap<NodeId, MemberStatus>;

#[derive(Debug)]
pub struct Membership {
    view: watch::Sender<MemberView>,
    next_id: AtomicU32,
    /// Held shared by every replication round, exclusively by a join
    rounds: RwLock<()>,
}

impl Default for Membership {
    fn default() -> Self {
        Self::new()
    }
}

impl Membership {
    pub fn new() -> Self {
        let (view, _) = watch::channel(MemberView::new());
        Self {
            view,
            next_id: AtomicU32::new(0),
            rounds: RwLock::new(()),
        }
    }

    /// Hands out the next unused node id.
    pub fn allocate_id(&self) -> NodeId {
        NodeId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Ready members, in id order.
    pub fn current_members(&self) -> BTreeSet<NodeId> {
        self.view
            .borrow()
            .iter()
            .filter(|(_, status)| **status == MemberStatus::Ready)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Every member with its status.
    pub fn view(&self) -> MemberView {
        self.view.borrow().clone()
    }

    pub fn status(&self, id: NodeId) -> Option<MemberStatus> {
        self.view.borrow().get(&id).copied()
    }

    /// Notification stream of view changes.
    pub fn subscribe(&self) -> watch::Receiver<MemberView> {
        self.view.subscribe()
    }

    /// Marks the start of a replication round. The view read while the
    /// guard is held is the one the round fans out to.
    pub fn begin_round(&self) -> RwLockReadGuard<'_, ()> {
        self.rounds.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds `id` as a joining member and waits until every round that
    /// started without it has finished, so none of them can be missing from
    /// a snapshot taken afterwards.
    pub fn join(&self, id: NodeId) {
        self.view.send_modify(|view| {
            view.insert(id, MemberStatus::Joining);
        });
        drop(self.rounds.write().unwrap_or_else(PoisonError::into_inner));
        info!(node = %id, "node joining");
    }

    pub fn mark_ready(&self, id: NodeId) {
        self.view.send_modify(|view| {
            if let Some(status) = view.get_mut(&id) {
                *status = MemberStatus::Ready;
            }
        });
        info!(node = %id, "node ready");
    }

    /// Removes a member; returns false if it was not in the view.
    pub fn leave(&self, id: NodeId) -> bool {
        let mut removed = false;
        self.view.send_modify(|view| {
            removed = view.remove(&id).is_some();
        });
        if removed {
            info!(node = %id, "node left");
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_joining_members_are_not_current() {
        let membership = Membership::new();
        let a = membership.allocate_id();
        let b = membership.allocate_id();
        membership.join(a);
        membership.join(b);
        membership.mark_ready(a);

        assert_eq!(membership.current_members(), BTreeSet::from([a]));
        assert_eq!(membership.status(b), Some(MemberStatus::Joining));
    }

    #[test]
    fn test_leave() {
        let membership = Membership::new();
        let a = membership.allocate_id();
        membership.join(a);
        membership.mark_ready(a);

        assert!(membership.leave(a));
        assert!(!membership.leave(a));
        assert!(membership.current_members().is_empty());
    }

    #[tokio::test]
    async fn test_subscribers_observe_changes() {
        let membership = Membership::new();
        let mut rx = membership.subscribe();
        let a = membership.allocate_id();

        membership.join(a);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().get(&a), Some(&MemberStatus::Joining));

        membership.mark_ready(a);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().get(&a), Some(&MemberStatus::Ready));
    }
}
