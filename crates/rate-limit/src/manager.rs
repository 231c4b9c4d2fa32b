//! Admission decisions for one request, combining every component.

use std::{net::IpAddr, sync::Arc};

use config::{Config, DatabaseConfig, IdentityConfig, RateLimitConfig, StorageConfig};
use telemetry::{Counter, KeyValue, metrics};

use crate::{
    cache::ConfigurationCache,
    database::{DurableStore, PgDatabase},
    error::RateLimitError,
    fallback::{FallbackDecision, FallbackLimiter},
    health::{HealthMonitor, StoreHealth},
    identity::Identity,
    keys::KeySpace,
    limiter::{Charge, Decision, DistributedLimiter, Verdict},
    storage::{CounterStore, MemoryStore, RedisStore},
    tier::EndpointCost,
};

/// How a request was admitted or rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// Counted in the shared store. The charge settles after the response.
    Limited(Decision, Charge),
    /// The shared store is unhealthy and the local token bucket decided.
    Fallback(FallbackDecision),
    /// The shared store failed this round trip; the request passes uncounted.
    FailOpen,
}

/// Whether a finished request gets its quota back. `None` means the request never
/// produced a response.
pub fn needs_refund(status: Option<u16>) -> bool {
    match status {
        None => true,
        Some(status) => (500..=599).contains(&status),
    }
}

/// Owns the rate limiting state shared by the request path and the background jobs.
pub struct RateLimitManager {
    config: Arc<RateLimitConfig>,
    cache: Arc<ConfigurationCache>,
    limiter: DistributedLimiter,
    fallback: Arc<FallbackLimiter>,
    health: Arc<StoreHealth>,
    counters: Arc<dyn CounterStore>,
    database: Arc<dyn DurableStore>,
    decisions: Counter<u64>,
    refunds: Counter<u64>,
}

impl RateLimitManager {
    /// Builds the manager with the stores named in the configuration.
    pub fn new(config: &Config) -> Result<Self, RateLimitError> {
        let counters: Arc<dyn CounterStore> = match &config.rate_limits.storage {
            StorageConfig::Memory => Arc::new(MemoryStore::new()),
            StorageConfig::Redis(redis) => Arc::new(RedisStore::new(redis)?),
        };

        let database = config.database.as_ref().ok_or_else(|| {
            RateLimitError::InvalidConfig("rate limiting needs a [database] section".to_string())
        })?;

        let database: Arc<dyn DurableStore> = Arc::new(connect(database)?);

        Self::with_stores(&config.rate_limits, counters, database)
    }

    /// Builds the manager over the given stores.
    pub fn with_stores(
        config: &RateLimitConfig,
        counters: Arc<dyn CounterStore>,
        database: Arc<dyn DurableStore>,
    ) -> Result<Self, RateLimitError> {
        let meter = metrics::meter();

        Ok(Self {
            config: Arc::new(config.clone()),
            cache: Arc::new(ConfigurationCache::new(&config.tiers)),
            limiter: DistributedLimiter::new(counters.clone(), config),
            fallback: Arc::new(FallbackLimiter::new(&config.fallback)?),
            health: Arc::new(StoreHealth::default()),
            counters,
            database,
            decisions: meter.u64_counter(metrics::RATE_LIMIT_DECISIONS).build(),
            refunds: meter.u64_counter(metrics::RATE_LIMIT_REFUNDS).build(),
        })
    }

    /// Where the caller identity is read from.
    pub fn identity_config(&self) -> &IdentityConfig {
        &self.config.identity
    }

    /// The configuration snapshot used on the request path.
    pub fn cache(&self) -> &Arc<ConfigurationCache> {
        &self.cache
    }

    /// Latest counter store probe result.
    pub fn health(&self) -> &Arc<StoreHealth> {
        &self.health
    }

    /// Resolves the caller from the presented key and the client address.
    pub fn identify(&self, api_key: Option<&str>, ip: IpAddr) -> Identity {
        self.cache.identify(api_key, ip)
    }

    /// Weight and bucket of a route.
    pub fn endpoint_cost(&self, route: &str) -> EndpointCost {
        self.cache.endpoint_cost(route)
    }

    /// Decides whether a request may proceed.
    ///
    /// Uses the fallback limiter while the counter store is unhealthy. A failed round
    /// trip to a healthy store admits the request.
    pub async fn admit(&self, identity: &Identity, route: &str) -> Admission {
        if !self.health.is_healthy() {
            let decision = self.fallback.check(&identity.api_key);
            let outcome = if decision.allowed { "fallback_admitted" } else { "fallback_blocked" };

            self.decisions.add(1, &[KeyValue::new("outcome", outcome)]);

            return Admission::Fallback(decision);
        }

        let tier = self.cache.tier_for(identity);
        let cost = self.cache.endpoint_cost(route);

        match self.limiter.check(identity, &tier, &cost, route).await {
            Ok((decision, charge)) => {
                let attributes = match decision.verdict {
                    Verdict::Admitted => [KeyValue::new("outcome", "admitted"), KeyValue::new("window", "none")],
                    Verdict::Blocked(window) => [
                        KeyValue::new("outcome", "blocked"),
                        KeyValue::new("window", window.as_str()),
                    ],
                };

                self.decisions.add(1, &attributes);

                if let Verdict::Blocked(window) = decision.verdict {
                    log::debug!(
                        "Blocked {} on {route}: {window} limit reached",
                        identity.subject()
                    );
                }

                Admission::Limited(decision, charge)
            }
            Err(e) => {
                log::warn!("Rate limit check failed, admitting request to {route}: {e}");
                self.decisions.add(1, &[KeyValue::new("outcome", "fail_open")]);

                Admission::FailOpen
            }
        }
    }

    /// Bills or refunds an admitted request once its outcome is known.
    pub async fn settle(&self, charge: &Charge, status: Option<u16>) {
        if !needs_refund(status) {
            return;
        }

        match self.limiter.refund(charge).await {
            Ok(()) => {
                let reason = if status.is_some() { "server_error" } else { "cancelled" };
                self.refunds.add(1, &[KeyValue::new("reason", reason)]);
            }
            Err(e) => log::warn!("Failed to refund rate limit charge: {e}"),
        }
    }

    pub(crate) fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub(crate) fn keys(&self) -> &KeySpace {
        self.limiter.keys()
    }

    pub(crate) fn fallback(&self) -> &Arc<FallbackLimiter> {
        &self.fallback
    }

    pub(crate) fn counters(&self) -> Arc<dyn CounterStore> {
        self.counters.clone()
    }

    pub(crate) fn database(&self) -> Arc<dyn DurableStore> {
        self.database.clone()
    }

    pub(crate) fn health_monitor(&self) -> HealthMonitor {
        HealthMonitor::new(self.counters.clone(), self.health.clone(), &self.config.health)
    }
}

fn connect(config: &DatabaseConfig) -> Result<PgDatabase, RateLimitError> {
    Ok(PgDatabase::connect_lazy(config)?)
}
