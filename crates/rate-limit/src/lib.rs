//! Admission control for the public API.
//!
//! Every request is charged against per-second, per-hour and per-month windows in a
//! counter store shared by all server processes. While that store is unhealthy a
//! process-local token bucket takes over. Background jobs keep the in-memory
//! configuration fresh and move usage statistics into the durable store.

#![deny(missing_docs)]

mod cache;
mod database;
mod error;
mod fallback;
mod health;
mod identity;
mod keys;
mod limiter;
mod manager;
mod storage;
mod sync;
mod tier;
mod window;

pub use cache::{ConfigurationCache, FREE_TIER, NO_KEY_TIER, NamedTiers};
pub use database::{
    ApiKeyRow, DurableStore, MaintenanceInputs, MemoryDatabase, OverrideRow, PgDatabase, ProductRow,
    SubscriptionRow, UsageRow, UserLimitRow, UserRow, WeightRow,
};
pub use error::{DatabaseError, RateLimitError, StoreError, SyncError};
pub use fallback::{FallbackDecision, FallbackLimiter};
pub use health::{HealthMonitor, StoreHealth};
pub use identity::{Identity, Subject, UNAUTHENTICATED, normalize_ip, parse_forwarded, pseudo_key};
pub use keys::{KeySpace, UsageKey};
pub use limiter::{Alias, Charge, Decision, DistributedLimiter, Verdict, WindowStatus, evaluate};
pub use manager::{Admission, RateLimitManager, needs_refund};
pub use storage::{CounterStore, CounterUpdate, MemoryStore, RedisStore};
pub use sync::{BackgroundJobs, Job, LimitsSync, MaintenanceJob, StatsDrain, WeightsSync, effective_tier};
pub use tier::{DEFAULT_BUCKET, EndpointCost, RateLimitTier, TierInterner};
pub use window::{Window, truncate_to_hour};
