//! Liveness of the shared counter store.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use config::StoreHealthConfig;
use telemetry::{Gauge, metrics::COUNTER_STORE_HEALTHY};

use crate::{error::StoreError, storage::CounterStore};

/// Latest probe result, read on every request.
///
/// Starts unhealthy until the first successful probe.
#[derive(Debug, Default)]
pub struct StoreHealth {
    healthy: AtomicBool,
}

impl StoreHealth {
    /// Whether the last probe succeeded.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// Stores a probe result and returns the previous one.
    pub fn set(&self, healthy: bool) -> bool {
        self.healthy.swap(healthy, Ordering::Relaxed)
    }
}

/// Probes the counter store and publishes the result.
pub struct HealthMonitor {
    store: Arc<dyn CounterStore>,
    health: Arc<StoreHealth>,
    timeout: Duration,
    gauge: Gauge<u64>,
}

impl HealthMonitor {
    /// Creates the monitor.
    pub fn new(store: Arc<dyn CounterStore>, health: Arc<StoreHealth>, config: &StoreHealthConfig) -> Self {
        let gauge = telemetry::metrics::meter().u64_gauge(COUNTER_STORE_HEALTHY).build();

        Self {
            store,
            health,
            timeout: config.timeout,
            gauge,
        }
    }

    /// Runs one probe, records the outcome and logs transitions.
    pub async fn probe(&self) -> Result<(), StoreError> {
        let result = match tokio::time::timeout(self.timeout, self.store.ping()).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        };

        let healthy = result.is_ok();
        let was_healthy = self.health.set(healthy);

        match (&result, was_healthy) {
            (Err(e), true) => log::warn!("Counter store became unhealthy, using the fallback limiter: {e}"),
            (Ok(()), false) => log::info!("Counter store is healthy"),
            (Err(e), false) => log::debug!("Counter store is still unhealthy: {e}"),
            (Ok(()), true) => (),
        }

        self.gauge.record(u64::from(healthy), &[]);

        result
    }
}
