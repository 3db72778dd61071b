//! Replication Coordinator
//!
//! Runs the two-phase round that makes a resolved batch visible on every
//! member before the originating call returns:
//!
//! 1. **Prepare**: every member stages the batch, validates it against the
//!    versions the origin resolved it from and reserves its keys.
//! 2. **Commit**: every member applies the staged batch atomically and fires
//!    its events. If any ready member votes against the batch or fails to
//!    answer the prepare, the batch is aborted everywhere instead.
//!
//! Joining members receive every request but are never waited on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use super::membership::{MemberStatus, MemberView, Membership};
use super::message::{BatchId, MutationBatch, ReplicationRequest, ReplicationResponse};
use super::transport::{PendingReply, Transport};
use super::NodeId;
use crate::error::{CacheError, Result};

pub struct ReplicationCoordinator {
    local: NodeId,
    membership: Arc<Membership>,
    transport: Arc<dyn Transport>,
    timeout: Duration,
    seq: AtomicU64,
}

impl ReplicationCoordinator {
    pub fn new(
        local: NodeId,
        membership: Arc<Membership>,
        transport: Arc<dyn Transport>,
        timeout: Duration,
    ) -> Self {
        Self {
            local,
            membership,
            transport,
            timeout,
            seq: AtomicU64::new(1),
        }
    }

    pub fn local(&self) -> NodeId {
        self.local
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn next_batch_id(&self) -> BatchId {
        BatchId {
            origin: self.local,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
        }
    }

    // == Apply Everywhere ==
    /// Applies `batch` on every member, returning once every ready member
    /// has committed it.
    ///
    /// Fails with `Conflict` when a member rejects the batch, with
    /// `ReplicationTimeout` when a ready member does not prepare in time and
    /// with `NodeUnavailable` when this node has left the cluster. Every
    /// failure leaves no member changed: once all ready members have
    /// prepared, the batch is committed and the call waits for each of them
    /// to confirm it.
    pub fn apply_everywhere(&self, batch: MutationBatch) -> Result<()> {
        if batch.mutations.is_empty() {
            return Ok(());
        }
        let _round = self.membership.begin_round();
        let view = self.membership.view();
        self.ensure_member(&view)?;
        let id = batch.id;
        let size = batch.mutations.len();

        let staged = match self.prepare(&view, ReplicationRequest::Prepare(batch)) {
            Ok(staged) => staged,
            Err((staged, err)) => {
                self.abort(id, &staged);
                warn!(batch = %id, "batch aborted: {}", err);
                return Err(err);
            }
        };

        let mut waits = Vec::new();
        for node in &staged {
            match self.transport.send(*node, &ReplicationRequest::Commit(id)) {
                Ok(pending) if is_ready(&view, *node) => waits.push(pending),
                Ok(_) => {}
                Err(err) => {
                    if let Err(err) = self.tolerate(*node, err) {
                        error!(batch = %id, %node, "commit not delivered: {}", err);
                    }
                }
            }
        }
        for pending in &waits {
            self.confirm_commit(id, pending);
        }

        debug!(batch = %id, mutations = size, members = staged.len(), "batch applied everywhere");
        Ok(())
    }

    /// Waits for a member to confirm a commit, for as long as it stays in
    /// the view.
    fn confirm_commit(&self, id: BatchId, pending: &PendingReply) {
        let node = pending.node();
        loop {
            match pending.wait(self.timeout) {
                Ok(ReplicationResponse::Committed) => return,
                Ok(other) => {
                    error!(batch = %id, %node, "{}", unexpected(node, "commit", other));
                    return;
                }
                Err(err) if self.membership.status(node).is_none() => {
                    debug!(batch = %id, %node, "member left before confirming commit: {}", err);
                    return;
                }
                Err(CacheError::ReplicationTimeout { .. }) => {
                    warn!(batch = %id, %node, "commit not confirmed after {:?}, still waiting", self.timeout);
                }
                Err(err) => {
                    error!(batch = %id, %node, "commit not confirmed: {}", err);
                    return;
                }
            }
        }
    }

    /// Rounds started through a node that left the cluster are refused.
    fn ensure_member(&self, view: &MemberView) -> Result<()> {
        if view.contains_key(&self.local) {
            Ok(())
        } else {
            Err(CacheError::NodeUnavailable(format!(
                "{} is no longer a cluster member",
                self.local
            )))
        }
    }

    /// Sends `Prepare` to every member. On failure, returns the members that
    /// may have staged the batch alongside the error.
    fn prepare(
        &self,
        view: &MemberView,
        request: ReplicationRequest,
    ) -> std::result::Result<Vec<NodeId>, (Vec<NodeId>, CacheError)> {
        let deadline = Instant::now() + self.timeout;
        let mut staged = Vec::with_capacity(view.len());
        let mut waits = Vec::new();

        for (node, status) in view {
            match self.transport.send(*node, &request) {
                Ok(pending) => {
                    staged.push(*node);
                    if *status == MemberStatus::Ready {
                        waits.push(pending);
                    }
                }
                Err(err) => {
                    if let Err(err) = self.tolerate(*node, err) {
                        return Err((staged, err));
                    }
                }
            }
        }

        for pending in waits {
            let node = pending.node();
            let result = match self.wait(&pending, deadline) {
                Ok(ReplicationResponse::Prepared) => Ok(()),
                Ok(ReplicationResponse::Rejected(reason)) => Err(CacheError::Conflict(reason)),
                Ok(other) => Err(unexpected(node, "prepare", other)),
                Err(err) => self.tolerate(node, err),
            };
            if let Err(err) = result {
                return Err((staged, err));
            }
        }
        Ok(staged)
    }

    fn abort(&self, id: BatchId, staged: &[NodeId]) {
        for node in staged {
            if let Err(err) = self.transport.send(*node, &ReplicationRequest::Abort(id)) {
                debug!(batch = %id, %node, "abort not delivered: {}", err);
            }
        }
    }

    // == Broadcast ==
    /// Single-phase request to every member, waiting on the ready ones.
    pub fn broadcast(&self, request: ReplicationRequest) -> Result<()> {
        let _round = self.membership.begin_round();
        let view = self.membership.view();
        self.ensure_member(&view)?;
        let deadline = Instant::now() + self.timeout;

        let mut waits = Vec::new();
        for node in view.keys() {
            match self.transport.send(*node, &request) {
                Ok(pending) if is_ready(&view, *node) => waits.push(pending),
                Ok(_) => {}
                Err(err) => self.tolerate(*node, err)?,
            }
        }
        for pending in waits {
            let node = pending.node();
            match self.wait(&pending, deadline) {
                Ok(ReplicationResponse::Done) => {}
                Ok(other) => return Err(unexpected(node, "broadcast", other)),
                Err(err) => self.tolerate(node, err)?,
            }
        }
        Ok(())
    }

    fn wait(&self, pending: &PendingReply, deadline: Instant) -> Result<ReplicationResponse> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match pending.wait(remaining) {
            Err(CacheError::ReplicationTimeout { node, .. }) => Err(CacheError::ReplicationTimeout {
                node,
                timeout_ms: self.timeout.as_millis() as u64,
            }),
            other => other,
        }
    }

    /// A member that left the view mid-round no longer needs to answer.
    fn tolerate(&self, node: NodeId, err: CacheError) -> Result<()> {
        match err {
            CacheError::NodeUnavailable(_) if self.membership.status(node).is_none() => {
                debug!(%node, "skipping departed member");
                Ok(())
            }
            err => Err(err),
        }
    }
}

impl std::fmt::Debug for ReplicationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationCoordinator")
            .field("local", &self.local)
            .field("timeout", &self.timeout)
            .finish()
    }
}

fn is_ready(view: &MemberView, node: NodeId) -> bool {
    view.get(&node) == Some(&MemberStatus::Ready)
}

fn unexpected(node: NodeId, phase: &str, response: ReplicationResponse) -> CacheError {
    match response {
        ReplicationResponse::Failed(reason) => {
            CacheError::Internal(format!("{} failed during {}: {}", node, phase, reason))
        }
        other => CacheError::Internal(format!(
            "{} answered {:?} during {}",
            node, other, phase
        )),
    }
}
