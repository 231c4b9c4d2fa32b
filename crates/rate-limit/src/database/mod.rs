//! The durable relational store: configuration source, usage sink and maintenance target.

mod memory;
mod postgres;

use async_trait::async_trait;
use jiff::Timestamp;

pub use memory::MemoryDatabase;
pub use postgres::PgDatabase;

use crate::{error::DatabaseError, tier::RateLimitTier};

/// A row of `api_keys`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiKeyRow {
    /// The key.
    pub api_key: String,
    /// Its owner.
    pub user_id: i64,
    /// Start of validity.
    pub valid_from: Timestamp,
    /// End of validity, exclusive.
    pub valid_until: Option<Timestamp>,
}

/// A row of `user_rate_limits`. Values are signed as stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserLimitRow {
    /// The user.
    pub user_id: i64,
    /// Per-second ceiling.
    pub second: i64,
    /// Per-hour ceiling.
    pub hour: i64,
    /// Per-month ceiling.
    pub month: i64,
    /// Start of validity.
    pub valid_from: Timestamp,
    /// End of validity, exclusive.
    pub valid_until: Option<Timestamp>,
}

/// A row of `api_products`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProductRow {
    /// Product name, `free` and `no-key` are the named tiers.
    pub name: String,
    /// Per-second ceiling.
    pub second: i64,
    /// Per-hour ceiling.
    pub hour: i64,
    /// Per-month ceiling.
    pub month: i64,
    /// When this version of the product takes effect.
    pub valid_from: Timestamp,
}

/// A row of `api_weights`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightRow {
    /// Route template.
    pub route: String,
    /// Cost of one request.
    pub weight: i64,
    /// Quota bucket charged.
    pub bucket: String,
    /// When this version takes effect.
    pub valid_from: Timestamp,
}

/// A row of `api_usage_stats`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageRow {
    /// Start of the hour.
    pub hour: i64,
    /// Owner of the key, `-1` for pseudo-keys.
    pub user_id: i64,
    /// API key or `ip:<ip>` pseudo-key.
    pub api_key: String,
    /// Route template.
    pub route: String,
    /// Requests counted in that hour.
    pub count: i64,
}

/// A row of `users`, as far as limits are concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserRow {
    /// The user.
    pub id: i64,
    /// Administrators are never limited.
    pub is_admin: bool,
}

/// An active row of `api_subscriptions`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRow {
    /// The subscriber.
    pub user_id: i64,
    /// The subscribed product.
    pub product_name: String,
}

/// A row of `api_rate_limit_overrides`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverrideRow {
    /// The user.
    pub user_id: i64,
    /// Per-second ceiling.
    pub second: i64,
    /// Per-hour ceiling.
    pub hour: i64,
    /// Per-month ceiling.
    pub month: i64,
}

/// Everything the maintenance job reads before computing effective limits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaintenanceInputs {
    /// Every user.
    pub users: Vec<UserRow>,
    /// Subscriptions active now.
    pub subscriptions: Vec<SubscriptionRow>,
    /// Explicit overrides.
    pub overrides: Vec<OverrideRow>,
    /// Currently valid rows of `user_rate_limits`.
    pub current_limits: Vec<UserLimitRow>,
}

/// Access to the durable store.
///
/// `since = None` means a full load of the rows valid at `now`. With `since` set, the
/// change queries return every row updated after it or that became valid in
/// `(since, now]`, valid or not, and the expiry queries return rows whose validity
/// ended in `(since, now]`.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// API keys loaded or changed.
    async fn api_keys(&self, since: Option<Timestamp>, now: Timestamp) -> Result<Vec<ApiKeyRow>, DatabaseError>;

    /// API keys whose validity ended.
    async fn expired_api_keys(&self, since: Timestamp, now: Timestamp) -> Result<Vec<String>, DatabaseError>;

    /// Per-user limits loaded or changed.
    async fn user_limits(&self, since: Option<Timestamp>, now: Timestamp)
    -> Result<Vec<UserLimitRow>, DatabaseError>;

    /// Users whose limits row validity ended.
    async fn expired_user_limits(&self, since: Timestamp, now: Timestamp) -> Result<Vec<i64>, DatabaseError>;

    /// Product rows already in effect at `now`, every version.
    async fn products(&self, now: Timestamp) -> Result<Vec<ProductRow>, DatabaseError>;

    /// Weight rows already in effect at `now`, every version.
    async fn weights(&self, now: Timestamp) -> Result<Vec<WeightRow>, DatabaseError>;

    /// Writes usage counts, overwriting existing rows with the same hour, key and route.
    async fn upsert_usage(&self, rows: &[UsageRow]) -> Result<u64, DatabaseError>;

    /// Creates `api_keys` rows for keys only present in `users.api_key`.
    async fn materialize_api_keys(&self) -> Result<u64, DatabaseError>;

    /// Reads the maintenance inputs.
    async fn maintenance_inputs(&self, now: Timestamp) -> Result<MaintenanceInputs, DatabaseError>;

    /// Inserts or updates the limits of the given users.
    async fn write_user_limits(&self, limits: &[(i64, RateLimitTier)]) -> Result<u64, DatabaseError>;

    /// Ends the validity of the limits rows of the given users.
    async fn expire_user_limits(&self, user_ids: &[i64]) -> Result<u64, DatabaseError>;

    /// Ends the validity of API keys whose user no longer exists.
    async fn invalidate_orphaned_api_keys(&self) -> Result<u64, DatabaseError>;
}

/// Whether a row is valid at `now`.
pub(crate) fn is_valid_at(valid_from: Timestamp, valid_until: Option<Timestamp>, now: Timestamp) -> bool {
    valid_from <= now && valid_until.is_none_or(|until| until > now)
}

/// Ceilings are stored as signed integers.
pub(crate) fn to_column(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validity_is_half_open() {
        let from = Timestamp::from_second(100).unwrap();
        let until = Timestamp::from_second(200).unwrap();

        assert!(!is_valid_at(from, Some(until), Timestamp::from_second(99).unwrap()));
        assert!(is_valid_at(from, Some(until), from));
        assert!(is_valid_at(from, Some(until), Timestamp::from_second(199).unwrap()));
        assert!(!is_valid_at(from, Some(until), until));
        assert!(is_valid_at(from, None, until));
    }
}
