//! Background synchronization settings.

use std::time::Duration;

use duration_str::deserialize_duration;
use serde::Deserialize;

const MIN_SYNC_INTERVAL: Duration = Duration::from_secs(1);

/// Settings shared by the configuration synchronizers and the stats drain.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// How often weights, API keys and rate limits are reloaded.
    #[serde(deserialize_with = "deserialize_duration")]
    pub interval: Duration,
    /// Delay before retrying a failed cycle.
    #[serde(deserialize_with = "deserialize_duration")]
    pub retry_backoff: Duration,
    /// How often usage counters are drained into the durable store.
    #[serde(deserialize_with = "deserialize_duration")]
    pub stats_interval: Duration,
    /// Number of keys read per batch while draining usage counters.
    pub stats_batch_size: usize,
    /// Durable store reconciliation job.
    pub maintenance: MaintenanceConfig,
}

impl SyncConfig {
    /// The reload interval, replaced by the default when it is below one second.
    pub fn effective_interval(&self) -> Duration {
        if self.interval < MIN_SYNC_INTERVAL {
            log::warn!(
                "Sync interval {:?} is below the {MIN_SYNC_INTERVAL:?} minimum, using {:?}",
                self.interval,
                Self::default().interval
            );

            return Self::default().interval;
        }

        self.interval
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            retry_backoff: Duration::from_secs(2),
            stats_interval: Duration::from_secs(30),
            stats_batch_size: 500,
            maintenance: MaintenanceConfig::default(),
        }
    }
}

/// Settings for the durable store reconciliation job.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MaintenanceConfig {
    /// Whether this process runs the reconciliation job at all.
    pub enabled: bool,
    /// How often the reconciliation runs.
    #[serde(deserialize_with = "deserialize_duration")]
    pub interval: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(600),
        }
    }
}
