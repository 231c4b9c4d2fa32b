//! Admission control middleware for HTTP requests.

mod headers;

use std::{
    fmt::Display,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use axum::{
    body::Body,
    extract::MatchedPath,
    response::{IntoResponse, Response},
};
use http::{Request, StatusCode, header::CONTENT_TYPE};
use rate_limit::{Admission, Charge, RateLimitManager, needs_refund};
use tokio::runtime::Handle;
use tower::Layer;

use crate::identity;

/// Route label of requests that matched no route template.
const UNMATCHED_ROUTE: &str = "unmatched";

#[derive(Clone)]
pub struct RateLimitLayer(Arc<RateLimitManager>);

impl RateLimitLayer {
    pub fn new(manager: Arc<RateLimitManager>) -> Self {
        Self(manager)
    }
}

impl<Service> Layer<Service> for RateLimitLayer
where
    Service: Send + Clone,
{
    type Service = RateLimitService<Service>;

    fn layer(&self, next: Service) -> Self::Service {
        RateLimitService {
            next,
            manager: self.0.clone(),
        }
    }
}

#[derive(Clone)]
pub struct RateLimitService<Service> {
    next: Service,
    manager: Arc<RateLimitManager>,
}

impl<Service, ReqBody> tower::Service<Request<ReqBody>> for RateLimitService<Service>
where
    Service: tower::Service<Request<ReqBody>, Response = Response<Body>> + Send + Clone + 'static,
    Service::Future: Send,
    Service::Error: Display + 'static,
    ReqBody: http_body::Body + Send + 'static,
{
    type Response = Response<Body>;
    type Error = Service::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Response<Body>, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.next.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let mut next = self.next.clone();
        let manager = self.manager.clone();

        Box::pin(async move {
            let route = req
                .extensions()
                .get::<MatchedPath>()
                .map(|path| path.as_str().to_string())
                .unwrap_or_else(|| UNMATCHED_ROUTE.to_string());

            let api_key = identity::api_key(&req, manager.identity_config());
            let ip = identity::client_ip(&req, manager.identity_config());
            let identity = manager.identify(api_key.as_deref(), ip);

            match manager.admit(&identity, &route).await {
                Admission::Limited(decision, _) if !decision.is_admitted() => {
                    let mut response = too_many_requests();
                    headers::apply_decision(response.headers_mut(), &decision);

                    Ok(response)
                }
                Admission::Limited(decision, charge) => {
                    let mut settlement = Settlement::new(manager, charge);
                    let mut response = next.call(req).await?;

                    settlement.complete(response.status());
                    headers::apply_decision(response.headers_mut(), &decision);

                    Ok(response)
                }
                Admission::Fallback(decision) if !decision.allowed => {
                    let mut response = too_many_requests();
                    headers::apply_fallback(response.headers_mut(), &decision);

                    Ok(response)
                }
                Admission::Fallback(decision) => {
                    let mut response = next.call(req).await?;
                    headers::apply_fallback(response.headers_mut(), &decision);

                    Ok(response)
                }
                Admission::FailOpen => next.call(req).await,
            }
        })
    }
}

fn too_many_requests() -> Response<Body> {
    (
        StatusCode::TOO_MANY_REQUESTS,
        [(CONTENT_TYPE, "text/plain")],
        "Too Many Requests",
    )
        .into_response()
}

/// Settles the charge of an admitted request when it goes out of scope.
///
/// A request whose future is dropped before the inner service answered never records a
/// status and is refunded like a server error.
struct Settlement {
    manager: Arc<RateLimitManager>,
    charge: Option<Charge>,
    status: Option<u16>,
}

impl Settlement {
    fn new(manager: Arc<RateLimitManager>, charge: Charge) -> Self {
        Self {
            manager,
            charge: Some(charge),
            status: None,
        }
    }

    fn complete(&mut self, status: StatusCode) {
        self.status = Some(status.as_u16());
    }
}

impl Drop for Settlement {
    fn drop(&mut self) {
        let Some(charge) = self.charge.take() else {
            return;
        };

        if !needs_refund(self.status) {
            return;
        }

        let manager = self.manager.clone();
        let status = self.status;

        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { manager.settle(&charge, status).await });
            }
            Err(_) => log::warn!("No runtime available to refund a rate limit charge"),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, sync::Arc, time::Duration};

    use axum::{Router, extract::ConnectInfo, routing::get};
    use config::RateLimitConfig;
    use rate_limit::{CounterStore, MemoryDatabase, MemoryStore, RateLimitManager};
    use tower::ServiceExt;

    use super::*;

    fn manager(store: Arc<MemoryStore>) -> Arc<RateLimitManager> {
        let config = RateLimitConfig {
            enabled: true,
            ..Default::default()
        };

        let manager = RateLimitManager::with_stores(&config, store, Arc::new(MemoryDatabase::default())).unwrap();
        manager.health().set(true);

        Arc::new(manager)
    }

    fn app(manager: Arc<RateLimitManager>) -> Router {
        Router::new()
            .route("/ok", get(|| async { "ok" }))
            .route("/fail", get(|| async { StatusCode::BAD_GATEWAY }))
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    "slow"
                }),
            )
            .layer(RateLimitLayer::new(manager))
    }

    fn request(path: &str) -> Request<Body> {
        let mut req = Request::builder().uri(path).body(Body::empty()).unwrap();
        let peer: SocketAddr = "203.0.113.9:4000".parse().unwrap();
        req.extensions_mut().insert(ConnectInfo(peer));

        req
    }

    async fn hour_counter(store: &MemoryStore) -> Option<i64> {
        let keys = store.scan("gatekeeper:rl|hour|*", 100).await.unwrap();

        keys.first().and_then(|key| store.value(key))
    }

    // Refunds run on a spawned task.
    async fn settled_hour_counter(store: &MemoryStore) -> Option<i64> {
        let mut counter = hour_counter(store).await;

        for _ in 0..50 {
            if counter == Some(0) {
                break;
            }

            tokio::time::sleep(Duration::from_millis(10)).await;
            counter = hour_counter(store).await;
        }

        counter
    }

    #[tokio::test]
    async fn admitted_request_carries_headers() {
        let store = Arc::new(MemoryStore::new());
        let response = app(manager(store.clone())).oneshot(request("/ok")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let headers = response.headers();

        assert_eq!(headers["x-ratelimit-limit"], "2");
        assert_eq!(headers["x-ratelimit-remaining"], "1");
        assert_eq!(headers["x-ratelimit-window"], "second");
        assert_eq!(headers["x-ratelimit-limit-hour"], "100");
        assert!(headers.get("x-ratelimit-limit-month").is_none());
        assert!(headers.get("retry-after").is_none());

        assert_eq!(hour_counter(&store).await, Some(1));
    }

    #[tokio::test]
    async fn unmatched_request_is_counted() {
        let store = Arc::new(MemoryStore::new());
        let response = app(manager(store.clone())).oneshot(request("/nope")).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()["x-ratelimit-limit"], "2");

        let keys = store.scan("gatekeeper:usage|*", 100).await.unwrap();

        assert_eq!(keys.len(), 1);
        assert!(keys[0].ends_with("|unmatched"));
    }

    #[tokio::test]
    async fn blocked_request_skips_the_handler() {
        let store = Arc::new(MemoryStore::new());
        let app = app(manager(store));

        let mut last = None;

        for _ in 0..3 {
            last = Some(app.clone().oneshot(request("/ok")).await.unwrap());
        }

        let response = last.unwrap();

        if response.status() == StatusCode::OK {
            // the three requests straddled a second boundary
            return;
        }

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["content-type"], "text/plain");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
        assert!(response.headers().get("retry-after").is_some());

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"Too Many Requests");
    }

    #[tokio::test]
    async fn server_error_is_refunded() {
        let store = Arc::new(MemoryStore::new());
        let response = app(manager(store.clone())).oneshot(request("/fail")).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

        assert_eq!(settled_hour_counter(&store).await, Some(0));
    }

    #[tokio::test]
    async fn abandoned_request_is_refunded() {
        let store = Arc::new(MemoryStore::new());
        let pending = app(manager(store.clone())).oneshot(request("/slow"));

        let result = tokio::time::timeout(Duration::from_millis(50), pending).await;
        assert!(result.is_err());

        assert_eq!(settled_hour_counter(&store).await, Some(0));
    }

    #[tokio::test]
    async fn fallback_applies_while_unhealthy() {
        let store = Arc::new(MemoryStore::new());
        let manager = manager(store.clone());
        manager.health().set(false);

        let response = app(manager).oneshot(request("/ok")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["x-ratelimit-limit"], "20");
        assert!(response.headers().get("x-ratelimit-window").is_none());
        assert!(store.is_empty());
    }
}
