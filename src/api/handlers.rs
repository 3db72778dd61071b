//! API Handlers
//!
//! HTTP request handlers for the cluster admin endpoints. Each data
//! endpoint addresses one node; writes made through it are replicated to
//! every member before the response is sent.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    Json,
};

use crate::cache::Cache;
use crate::cluster::{Cluster, NodeId};
use crate::error::{CacheError, Result};
use crate::models::{
    DeleteResponse, GetResponse, HealthResponse, MemberInfo, MembersResponse, SetRequest,
    SetResponse, StatsResponse,
};

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub cluster: Arc<Cluster>,
}

impl AppState {
    pub fn new(cluster: Arc<Cluster>) -> Self {
        Self { cluster }
    }

    /// Starts a cluster from configuration.
    pub fn from_config(config: &crate::config::Config) -> Result<Self> {
        Ok(Self::new(Arc::new(Cluster::start(config)?)))
    }

    fn node(&self, node: u32) -> Result<Cache> {
        self.cluster
            .get(NodeId(node))
            .ok_or_else(|| CacheError::NotFound(NodeId(node).to_string()))
    }
}

/// Handler for PUT /nodes/:node/set
///
/// Stores a key-value pair, optionally expiring after `ttl_ms`.
pub async fn set_handler(
    State(state): State<AppState>,
    Path(node): Path<u32>,
    Json(req): Json<SetRequest>,
) -> Result<Json<SetResponse>> {
    if let Some(error_msg) = req.validate() {
        return Err(CacheError::InvalidRequest(error_msg));
    }
    let cache = state.node(node)?;

    let previous = match req.ttl_ms {
        Some(ttl) => {
            cache
                .with_expiry_policy(Duration::from_millis(ttl))
                .put_async(req.key.clone(), req.value)
                .await?
        }
        None => cache.put_async(req.key.clone(), req.value).await?,
    };

    Ok(Json(SetResponse::new(req.key, previous)))
}

/// Handler for GET /nodes/:node/get/:key
pub async fn get_handler(
    State(state): State<AppState>,
    Path((node, key)): Path<(u32, String)>,
) -> Result<Json<GetResponse>> {
    let cache = state.node(node)?;
    let value = cache
        .get_async(key.clone())
        .await?
        .ok_or_else(|| CacheError::NotFound(key.clone()))?;

    Ok(Json(GetResponse::new(cache.id(), key, value)))
}

/// Handler for DELETE /nodes/:node/del/:key
pub async fn delete_handler(
    State(state): State<AppState>,
    Path((node, key)): Path<(u32, String)>,
) -> Result<Json<DeleteResponse>> {
    let cache = state.node(node)?;
    cache
        .remove_async(key.clone())
        .await?
        .ok_or_else(|| CacheError::NotFound(key.clone()))?;

    Ok(Json(DeleteResponse::new(key)))
}

/// Handler for GET /nodes/:node/stats
pub async fn stats_handler(
    State(state): State<AppState>,
    Path(node): Path<u32>,
) -> Result<Json<StatsResponse>> {
    let cache = state.node(node)?;
    Ok(Json(StatsResponse {
        node: cache.id(),
        metrics: cache.metrics(),
    }))
}

/// Handler for GET /nodes
pub async fn members_handler(State(state): State<AppState>) -> Json<MembersResponse> {
    let members = state
        .cluster
        .membership()
        .view()
        .into_iter()
        .map(|(node, status)| MemberInfo {
            node,
            status,
            entries: state.cluster.get(node).map_or(0, |cache| cache.len()),
        })
        .collect();

    Json(MembersResponse { members })
}

/// Handler for GET /health
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let ready = state.cluster.membership().current_members().len();
    Json(HealthResponse::healthy(ready))
}
