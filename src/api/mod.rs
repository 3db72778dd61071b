//! API Module
//!
//! HTTP handlers and routing for the cluster admin REST API.
//!
//! # Endpoints
//! - `PUT /nodes/:node/set` - Store a key-value pair through a node
//! - `GET /nodes/:node/get/:key` - Read a value from a node's copy
//! - `DELETE /nodes/:node/del/:key` - Delete a key through a node
//! - `GET /nodes/:node/stats` - Metrics of one node
//! - `GET /nodes` - Member view
//! - `GET /health` - Health check endpoint

pub mod handlers;
pub mod routes;

pub use handlers::*;
pub use routes::create_router;
