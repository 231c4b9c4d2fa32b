//! Background jobs: configuration synchronizers, the stats drain, maintenance,
//! health probing and the fallback sweep.
//!
//! Every job runs in its own task on a fixed interval until the shared cancellation
//! token fires. A failed cycle is logged and retried after the configured backoff,
//! while the cache keeps serving the last known good snapshot.

mod drain;
mod limits;
mod maintenance;
mod weights;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use config::SyncConfig;
use telemetry::{KeyValue, metrics::SYNC_FAILURES};
use tokio::{
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tokio_util::sync::CancellationToken;

pub use drain::StatsDrain;
pub use limits::LimitsSync;
pub use maintenance::{MaintenanceJob, effective_tier};
pub use weights::WeightsSync;

use crate::{error::SyncError, fallback::FallbackLimiter, health::HealthMonitor, manager::RateLimitManager};

/// One unit of periodic work.
#[async_trait]
pub trait Job: Send + 'static {
    /// Name used in logs and metrics.
    fn name(&self) -> &'static str;

    /// Runs one cycle.
    async fn cycle(&mut self) -> Result<(), SyncError>;
}

struct HealthProbe(HealthMonitor);

#[async_trait]
impl Job for HealthProbe {
    fn name(&self) -> &'static str {
        "health"
    }

    async fn cycle(&mut self) -> Result<(), SyncError> {
        // Failures are reported by the monitor and must not trigger the retry backoff.
        let _ = self.0.probe().await;
        Ok(())
    }
}

struct FallbackSweep(Arc<FallbackLimiter>);

#[async_trait]
impl Job for FallbackSweep {
    fn name(&self) -> &'static str {
        "fallback_sweep"
    }

    async fn cycle(&mut self) -> Result<(), SyncError> {
        let evicted = self.0.evict_idle();

        if evicted > 0 {
            log::debug!("Evicted {evicted} idle fallback buckets");
        }

        Ok(())
    }
}

/// Handles of the running background jobs. Dropping it stops them.
pub struct BackgroundJobs {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl BackgroundJobs {
    /// Loads the configuration, retrying until it succeeds, probes the counter store once,
    /// then spawns every job. Requests should only be served after this returns.
    ///
    /// An unreachable counter store does not hold up startup: requests go to the fallback
    /// limiter until a later probe succeeds.
    pub async fn start(manager: &RateLimitManager, sync: &SyncConfig) -> Self {
        let token = CancellationToken::new();
        let interval = sync.effective_interval();
        let backoff = sync.retry_backoff;

        let mut weights = WeightsSync::new(manager.database(), manager.cache().clone());
        let mut limits = LimitsSync::new(manager.database(), manager.cache().clone(), &manager.config().tiers);
        let health = HealthProbe(manager.health_monitor());

        barrier(&mut weights, backoff, &token).await;
        barrier(&mut limits, backoff, &token).await;

        if let Err(e) = health.0.probe().await {
            log::warn!("Counter store is not reachable at startup, using the fallback limiter: {e}");
        }

        log::info!(
            "Rate limit configuration loaded: {} API keys, {} endpoint weights",
            manager.cache().api_key_count(),
            manager.cache().endpoints().len()
        );

        let health_interval = manager.config().health.interval;
        let sweep_interval = manager.config().fallback.eviction_interval;

        let mut tasks = vec![
            spawn(weights, interval, interval, backoff, &token),
            spawn(limits, interval, interval, backoff, &token),
            spawn(health, health_interval, health_interval, backoff, &token),
            spawn(
                FallbackSweep(manager.fallback().clone()),
                sweep_interval,
                sweep_interval,
                backoff,
                &token,
            ),
            spawn(
                StatsDrain::new(
                    manager.counters(),
                    manager.database(),
                    manager.keys().clone(),
                    sync.stats_batch_size,
                ),
                sync.stats_interval,
                sync.stats_interval,
                backoff,
                &token,
            ),
        ];

        if sync.maintenance.enabled {
            let job = MaintenanceJob::new(manager.database(), &manager.config().tiers);
            tasks.push(spawn(job, Duration::ZERO, sync.maintenance.interval, backoff, &token));
        }

        Self { token, tasks }
    }

    /// Stops every job and waits for them to finish.
    pub async fn shutdown(mut self) {
        self.token.cancel();

        for task in std::mem::take(&mut self.tasks) {
            if let Err(e) = task.await {
                log::error!("Background job panicked: {e}");
            }
        }
    }
}

impl Drop for BackgroundJobs {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn barrier(job: &mut impl Job, backoff: Duration, token: &CancellationToken) {
    loop {
        let result = tokio::select! {
            _ = token.cancelled() => return,
            result = job.cycle() => result,
        };

        match result {
            Ok(()) => return,
            Err(e) => {
                log::warn!("Initial {} sync failed, retrying in {backoff:?}: {e}", job.name());
                tokio::time::sleep(backoff).await;
            }
        }
    }
}

/// Spawns `job`, first run after `delay`, then every `period`.
pub(crate) fn spawn<J: Job>(
    job: J,
    delay: Duration,
    period: Duration,
    backoff: Duration,
    token: &CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(run(job, delay, period, backoff, token.clone()))
}

async fn run<J: Job>(mut job: J, delay: Duration, period: Duration, backoff: Duration, token: CancellationToken) {
    let failures = telemetry::metrics::meter().u64_counter(SYNC_FAILURES).build();

    let mut ticker = tokio::time::interval_at(Instant::now() + delay, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let result = tokio::select! {
            _ = token.cancelled() => break,
            result = job.cycle() => result,
        };

        if let Err(e) = result {
            log::warn!("{} cycle failed, retrying in {backoff:?}: {e}", job.name());
            failures.add(1, &[KeyValue::new("job", job.name())]);
            ticker.reset_after(backoff);
        }
    }

    log::debug!("{} job stopped", job.name());
}
