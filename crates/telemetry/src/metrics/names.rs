//! Metric names emitted by the admission control layer.

/// Admission decisions, with `outcome` and `window` attributes.
pub const RATE_LIMIT_DECISIONS: &str = "gatekeeper.rate_limit.decisions";

/// Quota refunds issued after server errors or cancelled requests.
pub const RATE_LIMIT_REFUNDS: &str = "gatekeeper.rate_limit.refunds";

/// Duration of counter store round trips in milliseconds.
pub const COUNTER_STORE_DURATION: &str = "gatekeeper.counter_store.duration";

/// 1 while the counter store answers probes, 0 otherwise.
pub const COUNTER_STORE_HEALTHY: &str = "gatekeeper.counter_store.healthy";

/// Usage rows written to the durable store by the stats drain.
pub const STATS_DRAIN_ROWS: &str = "gatekeeper.stats_drain.rows";

/// Failed synchronizer cycles, with a `job` attribute.
pub const SYNC_FAILURES: &str = "gatekeeper.sync.failures";
