use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use telemetry::{Counter, metrics::STATS_DRAIN_ROWS};

use super::Job;
use crate::{
    database::{DurableStore, UsageRow},
    error::SyncError,
    keys::KeySpace,
    storage::CounterStore,
    window::truncate_to_hour,
};

/// Copies the per-hour usage counters from the counter store into `api_usage_stats`.
///
/// Rows are overwritten with the current counter value, so draining the same hour
/// twice is harmless. Counters of past hours are deleted once they were written.
pub struct StatsDrain {
    counters: Arc<dyn CounterStore>,
    database: Arc<dyn DurableStore>,
    keys: KeySpace,
    batch_size: usize,
    rows_written: Counter<u64>,
}

impl StatsDrain {
    /// Creates the job.
    pub fn new(
        counters: Arc<dyn CounterStore>,
        database: Arc<dyn DurableStore>,
        keys: KeySpace,
        batch_size: usize,
    ) -> Self {
        Self {
            counters,
            database,
            keys,
            batch_size: batch_size.max(1),
            rows_written: telemetry::metrics::meter().u64_counter(STATS_DRAIN_ROWS).build(),
        }
    }

    /// Drains every usage counter, treating `now` (UNIX seconds) as the current time.
    pub async fn drain_at(&self, now: i64) -> Result<u64, SyncError> {
        let current_hour = truncate_to_hour(now);
        let keys = self.counters.scan(&self.keys.usage_pattern(), self.batch_size).await?;

        let mut rows: HashMap<(i64, String, String), UsageRow> = HashMap::new();
        let mut finished = Vec::new();

        for batch in keys.chunks(self.batch_size) {
            let values = self.counters.get_many(batch).await?;

            for (key, value) in batch.iter().zip(values) {
                let Some(value) = value else {
                    continue;
                };

                let Some(usage) = self.keys.parse_usage(key) else {
                    log::warn!("Skipping malformed usage key {key}");
                    continue;
                };

                if usage.hour < current_hour {
                    finished.push(key.clone());
                }

                // Only a refund landing after the counter was deleted leaves it at or below zero.
                if value <= 0 {
                    continue;
                }

                let row = rows
                    .entry((usage.hour, usage.api_key.clone(), usage.route.clone()))
                    .or_insert_with(|| UsageRow {
                        hour: usage.hour,
                        user_id: usage.user_id,
                        api_key: usage.api_key,
                        route: usage.route,
                        count: 0,
                    });

                row.count += value;
            }
        }

        let rows: Vec<UsageRow> = rows.into_values().collect();
        let written = self.database.upsert_usage(&rows).await?;

        self.rows_written.add(written, &[]);

        // Keys are only removed after their counts are stored.
        for batch in finished.chunks(self.batch_size) {
            self.counters.delete(batch).await?;
        }

        log::debug!(
            "Drained {} usage rows, removed {} finished counters",
            rows.len(),
            finished.len()
        );

        Ok(written)
    }
}

#[async_trait]
impl Job for StatsDrain {
    fn name(&self) -> &'static str {
        "stats_drain"
    }

    async fn cycle(&mut self) -> Result<(), SyncError> {
        self.drain_at(jiff::Timestamp::now().as_second()).await?;
        Ok(())
    }
}
