//! In-memory snapshot of the rate limiting configuration.
//!
//! Each map is swapped whole by its synchronizer. Request handlers clone the inner
//! `Arc` under a read lock and never wait on I/O.

use std::{collections::HashMap, net::IpAddr, sync::Arc};

use config::TierDefaults;
use parking_lot::RwLock;

use crate::{
    identity::Identity,
    tier::{EndpointCost, RateLimitTier},
};

/// Name of the tier given to authenticated callers without a tier of their own.
pub const FREE_TIER: &str = "free";

/// Name of the tier given to callers without a valid API key.
pub const NO_KEY_TIER: &str = "no-key";

/// Tiers looked up by name rather than by user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedTiers {
    /// See [`FREE_TIER`].
    pub free: Arc<RateLimitTier>,
    /// See [`NO_KEY_TIER`].
    pub no_key: Arc<RateLimitTier>,
}

impl From<&TierDefaults> for NamedTiers {
    fn from(defaults: &TierDefaults) -> Self {
        Self {
            free: Arc::new(defaults.free.into()),
            no_key: Arc::new(defaults.no_key.into()),
        }
    }
}

/// Last known good configuration, shared between the request path and the synchronizers.
#[derive(Debug)]
pub struct ConfigurationCache {
    api_keys: RwLock<Arc<HashMap<String, i64>>>,
    user_tiers: RwLock<Arc<HashMap<i64, Arc<RateLimitTier>>>>,
    endpoints: RwLock<Arc<HashMap<String, EndpointCost>>>,
    named_tiers: RwLock<NamedTiers>,
}

impl ConfigurationCache {
    /// An empty cache using the configured named tiers.
    pub fn new(defaults: &TierDefaults) -> Self {
        Self {
            api_keys: RwLock::default(),
            user_tiers: RwLock::default(),
            endpoints: RwLock::default(),
            named_tiers: RwLock::new(NamedTiers::from(defaults)),
        }
    }

    /// Resolves the caller. A key unknown to the cache makes the caller anonymous.
    pub fn identify(&self, api_key: Option<&str>, ip: IpAddr) -> Identity {
        let user_id = api_key.and_then(|key| self.api_keys.read().get(key).copied());

        match (api_key, user_id) {
            (Some(key), Some(user_id)) => Identity::authenticated(user_id, key, ip),
            _ => Identity::anonymous(ip),
        }
    }

    /// Tier applying to the caller.
    pub fn tier_for(&self, identity: &Identity) -> Arc<RateLimitTier> {
        if !identity.is_valid_key {
            return self.named_tiers.read().no_key.clone();
        }

        if let Some(tier) = self.user_tiers.read().get(&identity.user_id) {
            return tier.clone();
        }

        self.named_tiers.read().free.clone()
    }

    /// Weight and bucket of a route. Unknown routes cost one unit of the default bucket.
    pub fn endpoint_cost(&self, route: &str) -> EndpointCost {
        self.endpoints.read().get(route).cloned().unwrap_or_default()
    }

    /// Current endpoint costs.
    pub fn endpoints(&self) -> Arc<HashMap<String, EndpointCost>> {
        self.endpoints.read().clone()
    }

    /// Current named tiers.
    pub fn named_tiers(&self) -> NamedTiers {
        self.named_tiers.read().clone()
    }

    /// Number of valid API keys.
    pub fn api_key_count(&self) -> usize {
        self.api_keys.read().len()
    }

    /// Swaps in a new API key map.
    pub fn replace_api_keys(&self, api_keys: HashMap<String, i64>) {
        *self.api_keys.write() = Arc::new(api_keys);
    }

    /// Swaps in a new per-user tier map.
    pub fn replace_user_tiers(&self, user_tiers: HashMap<i64, Arc<RateLimitTier>>) {
        *self.user_tiers.write() = Arc::new(user_tiers);
    }

    /// Swaps in a new endpoint cost map.
    pub fn replace_endpoints(&self, endpoints: HashMap<String, EndpointCost>) {
        *self.endpoints.write() = Arc::new(endpoints);
    }

    /// Swaps in new named tiers.
    pub fn replace_named_tiers(&self, tiers: NamedTiers) {
        *self.named_tiers.write() = tiers;
    }
}
