//! Gatekeeper server library.
//!
//! Wraps an API router with admission control, either for the binary or for the
//! integration tests.

#![deny(missing_docs)]

mod health;
mod identity;
mod rate_limit;

use std::{net::SocketAddr, sync::Arc};

use ::rate_limit::{BackgroundJobs, RateLimitManager, StoreHealth};
use anyhow::anyhow;
use axum::Router;
use config::{Config, HealthConfig};
use self::rate_limit::RateLimitLayer;
use tokio::net::TcpListener;

/// Configuration for serving Gatekeeper.
pub struct ServeConfig {
    /// The socket address (IP and port) the server will bind to
    pub listen_address: SocketAddr,
    /// The deserialized Gatekeeper TOML configuration.
    pub config: Config,
    /// The routes placed behind admission control. Without them only the health
    /// endpoint is served, next to the background jobs.
    pub api: Option<Router>,
    /// A prebuilt manager. Built from `config` when absent and rate limiting is enabled.
    pub rate_limit_manager: Option<Arc<RateLimitManager>>,
}

/// Places `api` behind admission control and adds the health endpoint when it shares
/// the main listener.
///
/// Limits are keyed by route template. Requests reaching the fallback of `api` are
/// counted under the `unmatched` route. The health endpoint is never limited.
pub fn router(api: Router, manager: Option<Arc<RateLimitManager>>, health: &HealthConfig) -> Router {
    let store_health = manager.as_ref().map(|manager| manager.health().clone());

    let app = match manager {
        Some(manager) => api.layer(RateLimitLayer::new(manager)),
        None => api,
    };

    with_health(app, health, store_health)
}

// Routes added after `layer` are not wrapped by it.
fn with_health(app: Router, health: &HealthConfig, store_health: Option<Arc<StoreHealth>>) -> Router {
    if health.enabled && health.listen.is_none() {
        return app.route(&health.path, health::health(store_health));
    }

    app
}

/// Starts and runs the Gatekeeper server with the provided configuration.
///
/// With rate limiting enabled, nothing is served before the configuration is loaded
/// and the counter store answered once.
pub async fn serve(
    ServeConfig {
        listen_address,
        config,
        api,
        rate_limit_manager,
    }: ServeConfig,
) -> anyhow::Result<()> {
    let manager = match rate_limit_manager {
        Some(manager) => Some(manager),
        None if config.rate_limits.enabled => {
            log::debug!("Initializing rate limit manager");
            Some(Arc::new(RateLimitManager::new(&config)?))
        }
        None => {
            log::debug!("Rate limiting disabled - no manager created");
            None
        }
    };

    let jobs = match &manager {
        Some(manager) => {
            log::info!("Waiting for the initial rate limit synchronization");
            Some(BackgroundJobs::start(manager, &config.sync).await)
        }
        None => None,
    };

    if config.server.health.enabled
        && let Some(listen) = config.server.health.listen
    {
        let store_health = manager.as_ref().map(|manager| manager.health().clone());
        let health_config = config.server.health.clone();

        tokio::spawn(async move {
            if let Err(e) = health::bind_health_endpoint(listen, health_config, store_health).await {
                log::error!("{e}");
            }
        });
    }

    let app = match api {
        Some(api) => router(api, manager, &config.server.health),
        None => {
            let store_health = manager.as_ref().map(|manager| manager.health().clone());
            with_health(Router::new(), &config.server.health, store_health)
        }
    };

    let listener = TcpListener::bind(listen_address)
        .await
        .map_err(|e| anyhow!("Failed to bind to {listen_address}: {e}"))?;

    log::info!("Gatekeeper listening on http://{listen_address}");

    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| anyhow!("Failed to start HTTP server: {e}"))?;

    if let Some(jobs) = jobs {
        log::info!("Stopping background jobs");
        jobs.shutdown().await;
    }

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for the shutdown signal: {e}");
        std::future::pending::<()>().await;
    }

    log::info!("Shutdown signal received");
}
