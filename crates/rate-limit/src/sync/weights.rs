use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use jiff::Timestamp;

use super::Job;
use crate::{
    cache::ConfigurationCache,
    database::{DurableStore, WeightRow},
    error::SyncError,
    tier::{DEFAULT_BUCKET, EndpointCost},
};

/// Reloads endpoint weights and buckets.
pub struct WeightsSync {
    database: Arc<dyn DurableStore>,
    cache: Arc<ConfigurationCache>,
}

impl WeightsSync {
    /// Creates the job.
    pub fn new(database: Arc<dyn DurableStore>, cache: Arc<ConfigurationCache>) -> Self {
        Self { database, cache }
    }

    /// Loads the weights in effect at `now` and swaps them into the cache.
    pub async fn sync_at(&self, now: Timestamp) -> Result<(), SyncError> {
        let rows = self.database.weights(now).await?;
        let endpoints = latest_per_route(rows);
        let previous = self.cache.endpoints();

        for (route, cost) in &endpoints {
            if previous.get(route) != Some(cost) {
                log::info!(
                    "Endpoint {route} now costs {} from bucket {}",
                    cost.weight,
                    cost.bucket
                );
            }
        }

        for route in previous.keys().filter(|route| !endpoints.contains_key(*route)) {
            log::info!("Endpoint {route} is back to the default cost");
        }

        self.cache.replace_endpoints(endpoints);

        Ok(())
    }
}

#[async_trait]
impl Job for WeightsSync {
    fn name(&self) -> &'static str {
        "weights"
    }

    async fn cycle(&mut self) -> Result<(), SyncError> {
        self.sync_at(Timestamp::now()).await
    }
}

fn latest_per_route(rows: Vec<WeightRow>) -> HashMap<String, EndpointCost> {
    let mut latest: HashMap<String, WeightRow> = HashMap::new();

    for row in rows {
        match latest.get(&row.route) {
            Some(current) if current.valid_from >= row.valid_from => (),
            _ => {
                latest.insert(row.route.clone(), row);
            }
        }
    }

    latest
        .into_iter()
        .filter_map(|(route, row)| {
            let Ok(weight) = u64::try_from(row.weight) else {
                log::warn!("Ignoring negative weight {} for endpoint {route}", row.weight);
                return None;
            };

            let bucket = if row.bucket.is_empty() {
                DEFAULT_BUCKET
            } else {
                row.bucket.as_str()
            };

            let cost = EndpointCost {
                weight,
                bucket: Arc::from(bucket),
            };

            Some((route, cost))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use config::TierDefaults;

    use super::*;
    use crate::database::MemoryDatabase;

    fn at(seconds: i64) -> Timestamp {
        Timestamp::from_second(seconds).unwrap()
    }

    fn weight(route: &str, weight: i64, bucket: &str, valid_from: i64) -> WeightRow {
        WeightRow {
            route: route.to_string(),
            weight,
            bucket: bucket.to_string(),
            valid_from: at(valid_from),
        }
    }

    #[tokio::test]
    async fn latest_effective_weight_wins() {
        let database = Arc::new(MemoryDatabase::new());
        let cache = Arc::new(ConfigurationCache::new(&TierDefaults::default()));

        database.put_weight(weight("/v1/search", 2, "search", 100));
        database.put_weight(weight("/v1/search", 5, "search", 200));
        database.put_weight(weight("/v1/search", 9, "search", 400));
        database.put_weight(weight("/v1/blocks", -1, "", 100));
        database.put_weight(weight("/v1/tx", 3, "", 100));

        let job = WeightsSync::new(database, cache.clone());
        job.sync_at(at(300)).await.unwrap();

        assert_eq!(cache.endpoint_cost("/v1/search").weight, 5);
        assert_eq!(&*cache.endpoint_cost("/v1/search").bucket, "search");
        assert_eq!(cache.endpoint_cost("/v1/blocks"), EndpointCost::default());
        assert_eq!(&*cache.endpoint_cost("/v1/tx").bucket, DEFAULT_BUCKET);

        job.sync_at(at(400)).await.unwrap();
        assert_eq!(cache.endpoint_cost("/v1/search").weight, 9);
    }

    #[tokio::test]
    async fn failure_keeps_the_previous_snapshot() {
        let database = Arc::new(MemoryDatabase::new());
        let cache = Arc::new(ConfigurationCache::new(&TierDefaults::default()));

        database.put_weight(weight("/v1/search", 4, "search", 0));

        let job = WeightsSync::new(database.clone(), cache.clone());
        job.sync_at(at(10)).await.unwrap();

        database.set_available(false);
        assert!(job.sync_at(at(20)).await.is_err());

        assert_eq!(cache.endpoint_cost("/v1/search").weight, 4);
    }
}
