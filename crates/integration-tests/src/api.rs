//! The API placed behind admission control in tests.

use axum::{Router, routing::get};
use http::StatusCode;

/// Routes with a fixed outcome each.
pub fn router() -> Router {
    Router::new()
        .route("/v1/blocks", get(|| async { "blocks" }))
        .route("/v1/blocks/{height}", get(|| async { "block" }))
        .route("/v1/export", get(|| async { "export" }))
        .route("/v1/upstream", get(|| async { StatusCode::BAD_GATEWAY }))
        .route("/v1/missing", get(|| async { StatusCode::NOT_FOUND }))
}
