use std::{net::SocketAddr, sync::Arc};

use anyhow::anyhow;
use axum::{
    Json, Router,
    routing::{MethodRouter, get},
};
use config::HealthConfig;
use http::StatusCode;
use rate_limit::StoreHealth;
use tokio::net::TcpListener;

#[derive(Debug, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub(crate) enum HealthState {
    /// The server is operational and the counter store answers.
    Healthy,

    /// The server is operational, but requests are limited by the local fallback.
    Degraded,
}

impl HealthState {
    fn current(store: Option<&StoreHealth>) -> Self {
        match store {
            Some(store) if !store.is_healthy() => HealthState::Degraded,
            _ => HealthState::Healthy,
        }
    }
}

/// Handles health check requests and returns the current health status of the server.
///
/// A degraded server still answers with `200 OK`: it keeps serving requests.
pub(crate) fn health(store: Option<Arc<StoreHealth>>) -> MethodRouter {
    get(move || {
        let state = HealthState::current(store.as_deref());
        async move { (StatusCode::OK, Json(state)) }
    })
}

pub(crate) fn router(config: &HealthConfig, store: Option<Arc<StoreHealth>>) -> Router {
    Router::new().route(&config.path, health(store))
}

/// Binds the health check endpoint to its own address.
pub(super) async fn bind_health_endpoint(
    addr: SocketAddr,
    config: HealthConfig,
    store: Option<Arc<StoreHealth>>,
) -> anyhow::Result<()> {
    let path = &config.path;
    let app = router(&config, store);

    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow!("Failed to bind the health endpoint to {addr}: {e}"))?;

    log::info!("Health check endpoint exposed at http://{addr}{path}");

    axum::serve(listener, app)
        .await
        .map_err(|e| anyhow!("Failed to start HTTP server in the health endpoint: {e}"))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use http::Request;
    use tower::ServiceExt;

    use super::*;

    async fn body(store: Option<Arc<StoreHealth>>) -> String {
        let app = router(&HealthConfig::default(), store);
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let response = app.oneshot(req).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();

        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn healthy_without_rate_limiting() {
        insta::assert_snapshot!(body(None).await, @r#"{"status":"healthy"}"#);
    }

    #[tokio::test]
    async fn degraded_while_store_is_down() {
        let store = Arc::new(StoreHealth::default());

        insta::assert_snapshot!(body(Some(store.clone())).await, @r#"{"status":"degraded"}"#);

        store.set(true);

        insta::assert_snapshot!(body(Some(store)).await, @r#"{"status":"healthy"}"#);
    }
}
