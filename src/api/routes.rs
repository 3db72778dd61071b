//! API Routes
//!
//! Configures the Axum router with all cluster admin endpoints.

use axum::{
    routing::{delete, get, put},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers::{
    delete_handler, get_handler, health_handler, members_handler, set_handler, stats_handler,
    AppState,
};

/// Creates the main router with all endpoints configured.
///
/// # Endpoints
/// - `PUT /nodes/:node/set` - Store a key-value pair through a node
/// - `GET /nodes/:node/get/:key` - Read a value from a node's copy
/// - `DELETE /nodes/:node/del/:key` - Delete a key through a node
/// - `GET /nodes/:node/stats` - Metrics of one node
/// - `GET /nodes` - Member view
/// - `GET /health` - Health check endpoint
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/nodes", get(members_handler))
        .route("/nodes/:node/set", put(set_handler))
        .route("/nodes/:node/get/:key", get(get_handler))
        .route("/nodes/:node/del/:key", delete(delete_handler))
        .route("/nodes/:node/stats", get(stats_handler))
        .route("/health", get(health_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
