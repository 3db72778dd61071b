//! Error types for the replicated cache
//!
//! Provides unified error handling using thiserror.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::cluster::NodeId;

// == Cache Error Enum ==
/// Unified error type for cache, replication and transaction failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CacheError {
    /// Optimistic validation failed at commit time
    #[error("Transaction conflict: {0}")]
    Conflict(String),

    /// A member did not acknowledge a replication request in time
    #[error("Replication to {node} timed out after {timeout_ms}ms")]
    ReplicationTimeout { node: NodeId, timeout_ms: u64 },

    /// commit/rollback/write invoked out of sequence
    #[error("Invalid transaction state: {0}")]
    TransactionState(String),

    /// Transaction outlived its own timeout before commit
    #[error("Transaction timed out after {0}ms")]
    TransactionTimeout(u64),

    /// Wire encode/decode failure inside the transport
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Transport cannot reach a node still listed in the member view
    #[error("Node unavailable: {0}")]
    NodeUnavailable(String),

    /// Invalid request data
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Key (or node) not found, only raised by the HTTP surface
    #[error("Not found: {0}")]
    NotFound(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Serialization(err.to_string())
    }
}

// == IntoResponse Implementation ==
impl IntoResponse for CacheError {
    fn into_response(self) -> Response {
        let status = match &self {
            CacheError::Conflict(_) | CacheError::TransactionState(_) => StatusCode::CONFLICT,
            CacheError::ReplicationTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            CacheError::TransactionTimeout(_) => StatusCode::REQUEST_TIMEOUT,
            CacheError::NodeUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            CacheError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            CacheError::NotFound(_) => StatusCode::NOT_FOUND,
            CacheError::Serialization(_) | CacheError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        let body = Json(json!({
            "error": self.to_string()
        }));

        (status, body).into_response()
    }
}

// == Result Type Alias ==
/// Convenience Result type for the cache.
pub type Result<T> = std::result::Result<T, CacheError>;
