//! Rate limiting configuration structures.

use std::time::Duration;

use duration_str::{deserialize_duration, deserialize_option_duration};
use serde::Deserialize;

/// Admission control configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitConfig {
    /// Whether admission control is enabled.
    pub enabled: bool,
    /// Shared counter store backend.
    pub storage: StorageConfig,
    /// Prefix prepended to every key written to the counter store.
    pub key_prefix: String,
    /// Upper bound for the per-request counter store round trip.
    #[serde(deserialize_with = "deserialize_duration")]
    pub request_timeout: Duration,
    /// Largest weight a single failed request gets refunded.
    pub max_refundable_weight: u64,
    /// Expiry of per-hour usage counters that were never drained.
    #[serde(deserialize_with = "deserialize_duration")]
    pub usage_retention: Duration,
    /// Where the caller identity is read from.
    pub identity: IdentityConfig,
    /// Process-local limiter used while the counter store is unhealthy.
    pub fallback: FallbackConfig,
    /// Counter store liveness probing.
    pub health: StoreHealthConfig,
    /// Built-in tiers, used until the products table provides its own.
    pub tiers: TierDefaults,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            storage: StorageConfig::default(),
            key_prefix: "gatekeeper:".to_string(),
            request_timeout: Duration::from_millis(500),
            max_refundable_weight: 100,
            usage_retention: Duration::from_secs(7 * 24 * 3600),
            identity: IdentityConfig::default(),
            fallback: FallbackConfig::default(),
            health: StoreHealthConfig::default(),
            tiers: TierDefaults::default(),
        }
    }
}

/// Request locations the caller identity is extracted from, in precedence order.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IdentityConfig {
    /// Query parameter carrying the API key.
    pub query_param: String,
    /// Headers carrying the API key, first match wins.
    pub key_headers: Vec<String>,
    /// Headers set by trusted proxies with the client address, first match wins.
    pub ip_headers: Vec<String>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            query_param: "apikey".to_string(),
            key_headers: vec!["apikey".to_string(), "x-api-key".to_string()],
            ip_headers: vec!["x-real-ip".to_string(), "x-forwarded-for".to_string()],
        }
    }
}

/// Token bucket settings for the fallback limiter.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FallbackConfig {
    /// Sustained requests per second for one identity.
    pub rate: u32,
    /// Bucket capacity for one identity.
    pub burst: u32,
    /// How often idle buckets are swept.
    #[serde(deserialize_with = "deserialize_duration")]
    pub eviction_interval: Duration,
    /// Buckets unused for this long are dropped by the sweep.
    #[serde(deserialize_with = "deserialize_duration")]
    pub idle_timeout: Duration,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            rate: 20,
            burst: 20,
            eviction_interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(180),
        }
    }
}

/// Liveness probing of the shared counter store.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StoreHealthConfig {
    /// Delay between two probes.
    #[serde(deserialize_with = "deserialize_duration")]
    pub interval: Duration,
    /// A probe taking longer than this counts as a failure.
    #[serde(deserialize_with = "deserialize_duration")]
    pub timeout: Duration,
}

impl Default for StoreHealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            timeout: Duration::from_millis(300),
        }
    }
}

/// Ceilings for the second, hour and month windows. Zero disables a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TierConfig {
    /// Requests per second.
    #[serde(default)]
    pub second: u64,
    /// Requests per hour.
    #[serde(default)]
    pub hour: u64,
    /// Requests per calendar month.
    #[serde(default)]
    pub month: u64,
}

/// The two tiers every deployment needs before the first sync.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TierDefaults {
    /// Tier of authenticated callers without a tier of their own.
    pub free: TierConfig,
    /// Tier of callers without a valid API key.
    pub no_key: TierConfig,
}

impl Default for TierDefaults {
    fn default() -> Self {
        Self {
            free: TierConfig {
                second: 5,
                hour: 1_000,
                month: 100_000,
            },
            no_key: TierConfig {
                second: 2,
                hour: 100,
                month: 0,
            },
        }
    }
}

/// Storage backend configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory counters, for single-process deployments and tests.
    #[default]
    Memory,
    /// Redis storage with configuration.
    Redis(Box<RedisConfig>),
}

/// Redis storage configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisConfig {
    /// Redis connection URL (redis:// or rediss:// for TLS).
    pub url: String,
    /// Connection pool configuration.
    #[serde(default)]
    pub pool: RedisPoolConfig,
    /// TLS configuration.
    pub tls: Option<RedisTlsConfig>,
}

/// Redis connection pool configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RedisPoolConfig {
    /// Maximum number of connections.
    pub max_size: Option<usize>,
    /// Timeout for creating connections.
    #[serde(deserialize_with = "deserialize_option_duration")]
    pub timeout_create: Option<Duration>,
    /// Timeout for waiting for a connection.
    #[serde(deserialize_with = "deserialize_option_duration")]
    pub timeout_wait: Option<Duration>,
    /// Timeout before recycling idle connections.
    #[serde(deserialize_with = "deserialize_option_duration")]
    pub timeout_recycle: Option<Duration>,
}

impl Default for RedisPoolConfig {
    fn default() -> Self {
        Self {
            max_size: Some(16),
            timeout_create: Some(Duration::from_secs(5)),
            timeout_wait: Some(Duration::from_secs(1)),
            timeout_recycle: Some(Duration::from_secs(300)),
        }
    }
}

/// Redis TLS configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisTlsConfig {
    /// Path to CA certificate file.
    pub ca_cert_path: Option<String>,
    /// Path to client certificate file (for mutual TLS).
    pub client_cert_path: Option<String>,
    /// Path to client key file (for mutual TLS).
    pub client_key_path: Option<String>,
}
