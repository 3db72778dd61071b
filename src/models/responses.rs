//! Response DTOs for the cluster admin API
//!
//! Defines the structure of outgoing HTTP response bodies.

use serde::Serialize;

use crate::cache::MetricsSnapshot;
use crate::cluster::{MemberStatus, NodeId};

/// Response body for the GET operation (GET /nodes/:node/get/:key)
#[derive(Debug, Clone, Serialize)]
pub struct GetResponse {
    /// Node that served the read
    pub node: NodeId,
    /// The requested key
    pub key: String,
    /// The stored value
    pub value: String,
}

impl GetResponse {
    pub fn new(node: NodeId, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            node,
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Response body for the SET operation (PUT /nodes/:node/set)
#[derive(Debug, Clone, Serialize)]
pub struct SetResponse {
    /// Success message
    pub message: String,
    /// The key that was set
    pub key: String,
    /// Value replaced by this write, if any
    pub previous: Option<String>,
}

impl SetResponse {
    pub fn new(key: impl Into<String>, previous: Option<String>) -> Self {
        let key = key.into();
        Self {
            message: format!("Key '{}' set on every node", key),
            key,
            previous,
        }
    }
}

/// Response body for the DELETE operation (DELETE /nodes/:node/del/:key)
#[derive(Debug, Clone, Serialize)]
pub struct DeleteResponse {
    /// Success message
    pub message: String,
    /// The key that was deleted
    pub key: String,
}

impl DeleteResponse {
    pub fn new(key: impl Into<String>) -> Self {
        let key = key.into();
        Self {
            message: format!("Key '{}' deleted on every node", key),
            key,
        }
    }
}

/// Response body for the stats endpoint (GET /nodes/:node/stats)
#[derive(Debug, Clone, Serialize)]
pub struct StatsResponse {
    pub node: NodeId,
    #[serde(flatten)]
    pub metrics: MetricsSnapshot,
}

/// One entry of the member listing.
#[derive(Debug, Clone, Serialize)]
pub struct MemberInfo {
    pub node: NodeId,
    pub status: MemberStatus,
    /// Live entries held by the node
    pub entries: usize,
}

/// Response body for GET /nodes
#[derive(Debug, Clone, Serialize)]
pub struct MembersResponse {
    pub members: Vec<MemberInfo>,
}

/// Response body for the health endpoint (GET /health)
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Health status (e.g., "healthy")
    pub status: String,
    /// Ready members
    pub members: usize,
    /// Current timestamp in ISO 8601 format
    pub timestamp: String,
}

impl HealthResponse {
    /// Creates a new HealthResponse with current timestamp
    pub fn healthy(members: usize) -> Self {
        Self {
            status: "healthy".to_string(),
            members,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}
