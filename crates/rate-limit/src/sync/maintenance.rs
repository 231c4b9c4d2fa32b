use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use config::TierDefaults;
use jiff::Timestamp;

use super::{Job, limits::latest_product};
use crate::{
    cache::FREE_TIER,
    database::{DurableStore, MaintenanceInputs, ProductRow},
    error::SyncError,
    tier::RateLimitTier,
};

/// The tier a user is entitled to.
///
/// An explicit override replaces everything. Administrators are unlimited. Otherwise the
/// free tier and every subscribed product are merged window by window, where the larger
/// ceiling wins and an unlimited window dominates.
pub fn effective_tier(
    free: RateLimitTier,
    is_admin: bool,
    subscriptions: &[RateLimitTier],
    override_tier: Option<RateLimitTier>,
) -> RateLimitTier {
    if let Some(tier) = override_tier {
        return tier;
    }

    if is_admin {
        return RateLimitTier::UNLIMITED;
    }

    subscriptions.iter().fold(free, |merged, tier| merged.union(*tier))
}

/// Changes the maintenance job writes.
#[derive(Debug, Default, PartialEq, Eq)]
pub(crate) struct LimitsPlan {
    pub(crate) writes: Vec<(i64, RateLimitTier)>,
    pub(crate) expirations: Vec<i64>,
}

/// Compares the computed tiers with the stored ones. Users entitled to exactly the free
/// tier need no row.
pub(crate) fn plan(inputs: &MaintenanceInputs, products: &[ProductRow], free: RateLimitTier) -> LimitsPlan {
    let mut subscriptions: HashMap<i64, Vec<RateLimitTier>> = HashMap::new();

    for subscription in &inputs.subscriptions {
        match latest_product(products, &subscription.product_name) {
            Some(tier) => subscriptions.entry(subscription.user_id).or_default().push(tier),
            None => log::warn!(
                "User {} is subscribed to unknown product {}",
                subscription.user_id,
                subscription.product_name
            ),
        }
    }

    let overrides: HashMap<i64, RateLimitTier> = inputs
        .overrides
        .iter()
        .filter_map(|row| {
            let tier = RateLimitTier::from_signed(row.second, row.hour, row.month);

            if tier.is_none() {
                log::warn!("Ignoring malformed rate limit override of user {}", row.user_id);
            }

            tier.map(|tier| (row.user_id, tier))
        })
        .collect();

    let current: HashMap<i64, Option<RateLimitTier>> = inputs
        .current_limits
        .iter()
        .map(|row| (row.user_id, RateLimitTier::from_signed(row.second, row.hour, row.month)))
        .collect();

    let mut result = LimitsPlan::default();
    let mut entitled = HashSet::new();

    for user in &inputs.users {
        let tier = effective_tier(
            free,
            user.is_admin,
            subscriptions.get(&user.id).map(Vec::as_slice).unwrap_or_default(),
            overrides.get(&user.id).copied(),
        );

        let needs_row = tier != free || overrides.contains_key(&user.id);

        if !needs_row {
            continue;
        }

        entitled.insert(user.id);

        if current.get(&user.id) != Some(&Some(tier)) {
            result.writes.push((user.id, tier));
        }
    }

    result.expirations = current
        .keys()
        .filter(|user_id| !entitled.contains(*user_id))
        .copied()
        .collect();

    result.expirations.sort_unstable();

    result
}

/// Reconciles the durable store: materializes legacy API keys, recomputes per-user
/// limits and invalidates keys of deleted users.
pub struct MaintenanceJob {
    database: Arc<dyn DurableStore>,
    default_free: RateLimitTier,
}

impl MaintenanceJob {
    /// Creates the job.
    pub fn new(database: Arc<dyn DurableStore>, defaults: &TierDefaults) -> Self {
        Self {
            database,
            default_free: defaults.free.into(),
        }
    }

    /// Runs one reconciliation as of `now`.
    pub async fn run_at(&self, now: Timestamp) -> Result<(), SyncError> {
        let materialized = self.database.materialize_api_keys().await?;

        let products = self.database.products(now).await?;
        let free = latest_product(&products, FREE_TIER).unwrap_or(self.default_free);
        let inputs = self.database.maintenance_inputs(now).await?;

        let plan = plan(&inputs, &products, free);
        let written = self.database.write_user_limits(&plan.writes).await?;
        let expired = self.database.expire_user_limits(&plan.expirations).await?;

        let invalidated = self.database.invalidate_orphaned_api_keys().await?;

        log::info!(
            "Maintenance done: {materialized} API keys materialized, {written} limits written, \
             {expired} limits expired, {invalidated} orphaned API keys invalidated"
        );

        Ok(())
    }
}

#[async_trait]
impl Job for MaintenanceJob {
    fn name(&self) -> &'static str {
        "maintenance"
    }

    async fn cycle(&mut self) -> Result<(), SyncError> {
        self.run_at(Timestamp::now()).await
    }
}
