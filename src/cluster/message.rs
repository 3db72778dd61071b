//! Replication messages exchanged between nodes.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::NodeId;
use crate::cache::Version;

/// Identifies one replication round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BatchId {
    pub origin: NodeId,
    pub seq: u64,
}

impl fmt::Display for BatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.origin, self.seq)
    }
}

/// A single resolved write. Conditional logic has already run on the origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    Put {
        key: String,
        value: String,
        version: Version,
        expire_at: Option<u64>,
    },
    Remove {
        key: String,
        version: Version,
    },
}

impl Mutation {
    pub fn key(&self) -> &str {
        match self {
            Mutation::Put { key, .. } | Mutation::Remove { key, .. } => key,
        }
    }

    pub fn version(&self) -> Version {
        match self {
            Mutation::Put { version, .. } | Mutation::Remove { version, .. } => *version,
        }
    }
}

/// Writes that become visible together on every node, or not at all.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationBatch {
    pub id: BatchId,
    pub mutations: Vec<Mutation>,
    /// Versions keys must still carry when the batch is prepared: the
    /// versions the origin resolved its writes against.
    pub expected: Vec<(String, Option<Version>)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplicationRequest {
    /// Stage a batch, validating and reserving its keys
    Prepare(MutationBatch),
    /// Apply a staged batch
    Commit(BatchId),
    /// Discard a staged batch
    Abort(BatchId),
    /// Wipe every entry on the node
    Clear,
    /// Zero the node's metrics
    ResetMetrics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReplicationResponse {
    Prepared,
    /// Prepare vote against the batch
    Rejected(String),
    Committed,
    Aborted,
    Done,
    /// The node could not process the request
    Failed(String),
}
