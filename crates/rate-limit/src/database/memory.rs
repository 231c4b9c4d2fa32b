//! Durable store kept in process memory, for tests and local development.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicBool, Ordering},
};

use async_trait::async_trait;
use jiff::Timestamp;
use parking_lot::Mutex;

use super::{
    ApiKeyRow, DurableStore, MaintenanceInputs, OverrideRow, ProductRow, SubscriptionRow, UsageRow, UserLimitRow,
    UserRow, WeightRow, is_valid_at, to_column,
};
use crate::{error::DatabaseError, tier::RateLimitTier};

#[derive(Debug, Clone)]
struct Versioned<T> {
    row: T,
    updated_at: Timestamp,
}

#[derive(Debug, Clone)]
struct User {
    row: UserRow,
    api_key: Option<String>,
}

#[derive(Debug, Default)]
struct Tables {
    api_keys: HashMap<String, Versioned<ApiKeyRow>>,
    user_limits: HashMap<i64, Versioned<UserLimitRow>>,
    products: Vec<ProductRow>,
    weights: Vec<WeightRow>,
    usage: HashMap<(i64, String, String), UsageRow>,
    users: HashMap<i64, User>,
    subscriptions: Vec<SubscriptionRow>,
    overrides: Vec<OverrideRow>,
}

/// Tables in a mutex-guarded struct, following the same query semantics as Postgres.
#[derive(Debug)]
pub struct MemoryDatabase {
    tables: Mutex<Tables>,
    available: AtomicBool,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self {
            tables: Mutex::default(),
            available: AtomicBool::new(true),
        }
    }
}

impl MemoryDatabase {
    /// An empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// While unavailable every call fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Relaxed);
    }

    /// Inserts or replaces an API key.
    pub fn put_api_key(&self, row: ApiKeyRow, updated_at: Timestamp) {
        self.tables
            .lock()
            .api_keys
            .insert(row.api_key.clone(), Versioned { row, updated_at });
    }

    /// Inserts or replaces the limits of a user.
    pub fn put_user_limit(&self, row: UserLimitRow, updated_at: Timestamp) {
        self.tables
            .lock()
            .user_limits
            .insert(row.user_id, Versioned { row, updated_at });
    }

    /// Adds a product version.
    pub fn put_product(&self, row: ProductRow) {
        self.tables.lock().products.push(row);
    }

    /// Adds a weight version.
    pub fn put_weight(&self, row: WeightRow) {
        self.tables.lock().weights.push(row);
    }

    /// Inserts or replaces a user.
    pub fn put_user(&self, id: i64, api_key: Option<&str>, is_admin: bool) {
        self.tables.lock().users.insert(
            id,
            User {
                row: UserRow { id, is_admin },
                api_key: api_key.map(str::to_string),
            },
        );
    }

    /// Deletes a user.
    pub fn remove_user(&self, id: i64) {
        self.tables.lock().users.remove(&id);
    }

    /// Adds an active subscription.
    pub fn put_subscription(&self, user_id: i64, product_name: &str) {
        self.tables.lock().subscriptions.push(SubscriptionRow {
            user_id,
            product_name: product_name.to_string(),
        });
    }

    /// Adds a limits override.
    pub fn put_override(&self, row: OverrideRow) {
        self.tables.lock().overrides.push(row);
    }

    /// An API key row.
    pub fn api_key(&self, api_key: &str) -> Option<ApiKeyRow> {
        self.tables.lock().api_keys.get(api_key).map(|versioned| versioned.row.clone())
    }

    /// The limits row of a user.
    pub fn user_limit(&self, user_id: i64) -> Option<UserLimitRow> {
        self.tables
            .lock()
            .user_limits
            .get(&user_id)
            .map(|versioned| versioned.row.clone())
    }

    /// Every usage row, sorted by hour, key and route.
    pub fn usage(&self) -> Vec<UsageRow> {
        let mut rows: Vec<UsageRow> = self.tables.lock().usage.values().cloned().collect();
        rows.sort_by(|a, b| (a.hour, &a.api_key, &a.route).cmp(&(b.hour, &b.api_key, &b.route)));
        rows
    }

    fn check_available(&self) -> Result<(), DatabaseError> {
        if self.available.load(Ordering::Relaxed) {
            Ok(())
        } else {
            Err(DatabaseError::Query(sqlx::Error::PoolTimedOut))
        }
    }
}

fn changed<T>(versioned: &Versioned<T>, valid_from: Timestamp, since: Timestamp, now: Timestamp) -> bool {
    versioned.updated_at > since || (valid_from > since && valid_from <= now)
}

fn expired(valid_until: Option<Timestamp>, since: Timestamp, now: Timestamp) -> bool {
    valid_until.is_some_and(|until| until > since && until <= now)
}

#[async_trait]
impl DurableStore for MemoryDatabase {
    async fn api_keys(&self, since: Option<Timestamp>, now: Timestamp) -> Result<Vec<ApiKeyRow>, DatabaseError> {
        self.check_available()?;

        let tables = self.tables.lock();

        let rows = tables
            .api_keys
            .values()
            .filter(|versioned| match since {
                None => is_valid_at(versioned.row.valid_from, versioned.row.valid_until, now),
                Some(since) => changed(versioned, versioned.row.valid_from, since, now),
            })
            .map(|versioned| versioned.row.clone())
            .collect();

        Ok(rows)
    }

    async fn expired_api_keys(&self, since: Timestamp, now: Timestamp) -> Result<Vec<String>, DatabaseError> {
        self.check_available()?;

        let tables = self.tables.lock();

        let keys = tables
            .api_keys
            .values()
            .filter(|versioned| expired(versioned.row.valid_until, since, now))
            .map(|versioned| versioned.row.api_key.clone())
            .collect();

        Ok(keys)
    }

    async fn user_limits(
        &self,
        since: Option<Timestamp>,
        now: Timestamp,
    ) -> Result<Vec<UserLimitRow>, DatabaseError> {
        self.check_available()?;

        let tables = self.tables.lock();

        let rows = tables
            .user_limits
            .values()
            .filter(|versioned| match since {
                None => is_valid_at(versioned.row.valid_from, versioned.row.valid_until, now),
                Some(since) => changed(versioned, versioned.row.valid_from, since, now),
            })
            .map(|versioned| versioned.row.clone())
            .collect();

        Ok(rows)
    }

    async fn expired_user_limits(&self, since: Timestamp, now: Timestamp) -> Result<Vec<i64>, DatabaseError> {
        self.check_available()?;

        let tables = self.tables.lock();

        let ids = tables
            .user_limits
            .values()
            .filter(|versioned| expired(versioned.row.valid_until, since, now))
            .map(|versioned| versioned.row.user_id)
            .collect();

        Ok(ids)
    }

    async fn products(&self, now: Timestamp) -> Result<Vec<ProductRow>, DatabaseError> {
        self.check_available()?;

        let tables = self.tables.lock();

        Ok(tables
            .products
            .iter()
            .filter(|row| row.valid_from <= now)
            .cloned()
            .collect())
    }

    async fn weights(&self, now: Timestamp) -> Result<Vec<WeightRow>, DatabaseError> {
        self.check_available()?;

        let tables = self.tables.lock();

        Ok(tables
            .weights
            .iter()
            .filter(|row| row.valid_from <= now)
            .cloned()
            .collect())
    }

    async fn upsert_usage(&self, rows: &[UsageRow]) -> Result<u64, DatabaseError> {
        self.check_available()?;

        let mut tables = self.tables.lock();

        for row in rows {
            let key = (row.hour, row.api_key.clone(), row.route.clone());
            tables.usage.insert(key, row.clone());
        }

        Ok(rows.len() as u64)
    }

    async fn materialize_api_keys(&self) -> Result<u64, DatabaseError> {
        self.check_available()?;

        let now = Timestamp::now();
        let mut tables = self.tables.lock();
        let Tables { users, api_keys, .. } = &mut *tables;
        let mut created = 0;

        for user in users.values() {
            let Some(api_key) = user.api_key.as_ref().filter(|key| !key.is_empty()) else {
                continue;
            };

            if api_keys.contains_key(api_key) {
                continue;
            }

            let row = ApiKeyRow {
                api_key: api_key.clone(),
                user_id: user.row.id,
                valid_from: now,
                valid_until: None,
            };

            api_keys.insert(api_key.clone(), Versioned { row, updated_at: now });
            created += 1;
        }

        Ok(created)
    }

    async fn maintenance_inputs(&self, now: Timestamp) -> Result<MaintenanceInputs, DatabaseError> {
        self.check_available()?;

        let current_limits = self.user_limits(None, now).await?;
        let tables = self.tables.lock();

        let mut users: Vec<UserRow> = tables.users.values().map(|user| user.row).collect();
        users.sort_by_key(|user| user.id);

        Ok(MaintenanceInputs {
            users,
            subscriptions: tables.subscriptions.clone(),
            overrides: tables.overrides.clone(),
            current_limits,
        })
    }

    async fn write_user_limits(&self, limits: &[(i64, RateLimitTier)]) -> Result<u64, DatabaseError> {
        self.check_available()?;

        let now = Timestamp::now();
        let mut tables = self.tables.lock();

        for (user_id, tier) in limits {
            let valid_from = tables
                .user_limits
                .get(user_id)
                .map_or(now, |versioned| versioned.row.valid_from.min(now));

            let row = UserLimitRow {
                user_id: *user_id,
                second: to_column(tier.second),
                hour: to_column(tier.hour),
                month: to_column(tier.month),
                valid_from,
                valid_until: None,
            };

            tables.user_limits.insert(*user_id, Versioned { row, updated_at: now });
        }

        Ok(limits.len() as u64)
    }

    async fn expire_user_limits(&self, user_ids: &[i64]) -> Result<u64, DatabaseError> {
        self.check_available()?;

        let now = Timestamp::now();
        let mut tables = self.tables.lock();
        let mut expired = 0;

        for user_id in user_ids {
            if let Some(versioned) = tables.user_limits.get_mut(user_id)
                && versioned.row.valid_until.is_none_or(|until| until > now)
            {
                versioned.row.valid_until = Some(now);
                versioned.updated_at = now;
                expired += 1;
            }
        }

        Ok(expired)
    }

    async fn invalidate_orphaned_api_keys(&self) -> Result<u64, DatabaseError> {
        self.check_available()?;

        let now = Timestamp::now();
        let mut tables = self.tables.lock();
        let Tables { users, api_keys, .. } = &mut *tables;
        let mut invalidated = 0;

        for versioned in api_keys.values_mut() {
            let live = versioned.row.valid_until.is_none_or(|until| until > now);

            if live && !users.contains_key(&versioned.row.user_id) {
                versioned.row.valid_until = Some(now);
                versioned.updated_at = now;
                invalidated += 1;
            }
        }

        Ok(invalidated)
    }
}
