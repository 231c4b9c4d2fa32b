use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use config::TierDefaults;
use jiff::{SignedDuration, Timestamp};

use super::Job;
use crate::{
    cache::{ConfigurationCache, FREE_TIER, NO_KEY_TIER, NamedTiers},
    database::{ApiKeyRow, DurableStore, ProductRow, UserLimitRow, is_valid_at},
    error::SyncError,
    tier::{RateLimitTier, TierInterner},
};

/// Overlap between two incremental queries, covering clock skew and rows
/// committed late with an earlier `updated_at`.
const SINCE_OVERLAP: SignedDuration = SignedDuration::from_secs(30);

/// Keeps API keys, per-user tiers and the named tiers up to date.
///
/// The first cycle loads everything. Later cycles only fetch rows changed since the
/// previous cycle and apply them to a private working copy, which is then cloned
/// into the cache.
pub struct LimitsSync {
    database: Arc<dyn DurableStore>,
    cache: Arc<ConfigurationCache>,
    defaults: NamedTiers,
    interner: TierInterner,
    api_keys: HashMap<String, i64>,
    user_tiers: HashMap<i64, Arc<RateLimitTier>>,
    since: Option<Timestamp>,
}

impl LimitsSync {
    /// Creates the job. The named tiers fall back to `defaults` until products exist.
    pub fn new(database: Arc<dyn DurableStore>, cache: Arc<ConfigurationCache>, defaults: &TierDefaults) -> Self {
        Self {
            database,
            cache,
            defaults: NamedTiers::from(defaults),
            interner: TierInterner::default(),
            api_keys: HashMap::new(),
            user_tiers: HashMap::new(),
            since: None,
        }
    }

    /// Runs one synchronization as of `now`.
    pub async fn sync_at(&mut self, now: Timestamp) -> Result<(), SyncError> {
        let since = self.since;

        let api_keys = self.database.api_keys(since, now).await?;
        let user_limits = self.database.user_limits(since, now).await?;

        let (expired_keys, expired_users) = match since {
            Some(since) => (
                self.database.expired_api_keys(since, now).await?,
                self.database.expired_user_limits(since, now).await?,
            ),
            None => (Vec::new(), Vec::new()),
        };

        let products = self.database.products(now).await?;

        if since.is_none() {
            self.api_keys.clear();
            self.user_tiers.clear();
        }

        self.apply_api_keys(api_keys, expired_keys, now);
        self.apply_user_limits(user_limits, expired_users, now);
        let named = self.named_tiers(&products);

        self.cache.replace_api_keys(self.api_keys.clone());
        self.cache.replace_user_tiers(self.user_tiers.clone());
        self.cache.replace_named_tiers(named);
        self.interner.shrink();

        log::debug!(
            "Rate limits synchronized: {} API keys, {} user tiers, {} distinct tiers",
            self.api_keys.len(),
            self.user_tiers.len(),
            self.interner.len()
        );

        self.since = Some(now.checked_sub(SINCE_OVERLAP).unwrap_or(now));

        Ok(())
    }

    fn apply_api_keys(&mut self, rows: Vec<ApiKeyRow>, expired: Vec<String>, now: Timestamp) {
        for row in rows {
            if is_valid_at(row.valid_from, row.valid_until, now) {
                self.api_keys.insert(row.api_key, row.user_id);
            } else {
                self.api_keys.remove(&row.api_key);
            }
        }

        for api_key in expired {
            self.api_keys.remove(&api_key);
        }
    }

    fn apply_user_limits(&mut self, rows: Vec<UserLimitRow>, expired: Vec<i64>, now: Timestamp) {
        for row in rows {
            if !is_valid_at(row.valid_from, row.valid_until, now) {
                self.user_tiers.remove(&row.user_id);
                continue;
            }

            match RateLimitTier::from_signed(row.second, row.hour, row.month) {
                Some(tier) => {
                    self.user_tiers.insert(row.user_id, self.interner.intern(tier));
                }
                None => log::warn!(
                    "Ignoring malformed rate limits of user {}: {}/{}/{}",
                    row.user_id,
                    row.second,
                    row.hour,
                    row.month
                ),
            }
        }

        for user_id in expired {
            self.user_tiers.remove(&user_id);
        }
    }

    fn named_tiers(&mut self, products: &[ProductRow]) -> NamedTiers {
        let free = latest_product(products, FREE_TIER).unwrap_or(*self.defaults.free);
        let no_key = latest_product(products, NO_KEY_TIER).unwrap_or(*self.defaults.no_key);

        NamedTiers {
            free: self.interner.intern(free),
            no_key: self.interner.intern(no_key),
        }
    }
}

#[async_trait]
impl Job for LimitsSync {
    fn name(&self) -> &'static str {
        "limits"
    }

    async fn cycle(&mut self) -> Result<(), SyncError> {
        self.sync_at(Timestamp::now()).await
    }
}

/// The latest version of a product as a tier. Malformed rows are skipped.
pub(crate) fn latest_product(products: &[ProductRow], name: &str) -> Option<RateLimitTier> {
    products
        .iter()
        .filter(|product| product.name == name)
        .filter_map(|product| {
            let tier = RateLimitTier::from_signed(product.second, product.hour, product.month);

            if tier.is_none() {
                log::warn!("Ignoring malformed product {} from {}", product.name, product.valid_from);
            }

            tier.map(|tier| (product.valid_from, tier))
        })
        .max_by_key(|(valid_from, _)| *valid_from)
        .map(|(_, tier)| tier)
}
