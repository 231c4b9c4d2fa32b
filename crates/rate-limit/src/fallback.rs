//! Process-local limiter used while the shared counter store is unhealthy.
//!
//! One GCRA bucket per caller, no weights and no tiers.

use std::{num::NonZeroU32, sync::Arc, time::Duration};

use config::FallbackConfig;
use dashmap::DashMap;
use governor::{
    DefaultDirectRateLimiter, Quota, RateLimiter,
    clock::{Clock, DefaultClock},
};
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::RateLimitError;

struct Bucket {
    limiter: DefaultDirectRateLimiter,
    last_used: Mutex<Instant>,
}

/// Result of a fallback check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FallbackDecision {
    /// Whether the request may proceed.
    pub allowed: bool,
    /// Sustained requests per second, reported as the limit.
    pub limit: u32,
    /// Seconds until the next request would be allowed, when blocked.
    pub retry_after: u64,
}

/// Token buckets keyed by caller.
pub struct FallbackLimiter {
    buckets: DashMap<String, Arc<Bucket>>,
    quota: Quota,
    rate: u32,
    idle_timeout: Duration,
}

impl FallbackLimiter {
    /// Builds the limiter. Rate and burst must be positive.
    pub fn new(config: &FallbackConfig) -> Result<Self, RateLimitError> {
        let rate = NonZeroU32::new(config.rate)
            .ok_or_else(|| RateLimitError::InvalidConfig("fallback rate must be greater than zero".to_string()))?;

        let burst = NonZeroU32::new(config.burst)
            .ok_or_else(|| RateLimitError::InvalidConfig("fallback burst must be greater than zero".to_string()))?;

        Ok(Self {
            buckets: DashMap::new(),
            quota: Quota::per_second(rate).allow_burst(burst),
            rate: config.rate,
            idle_timeout: config.idle_timeout,
        })
    }

    /// Takes one token from the caller's bucket, creating the bucket on first use.
    pub fn check(&self, key: &str) -> FallbackDecision {
        let bucket = match self.buckets.get(key) {
            Some(bucket) => bucket.clone(),
            None => self
                .buckets
                .entry(key.to_string())
                .or_insert_with(|| {
                    Arc::new(Bucket {
                        limiter: RateLimiter::direct(self.quota),
                        last_used: Mutex::new(Instant::now()),
                    })
                })
                .clone(),
        };

        *bucket.last_used.lock() = Instant::now();

        match bucket.limiter.check() {
            Ok(()) => FallbackDecision {
                allowed: true,
                limit: self.rate,
                retry_after: 0,
            },
            Err(not_until) => {
                let wait = not_until.wait_time_from(DefaultClock::default().now());

                FallbackDecision {
                    allowed: false,
                    limit: self.rate,
                    retry_after: ceil_seconds(wait),
                }
            }
        }
    }

    /// Drops buckets idle for longer than the idle timeout and returns how many were removed.
    pub fn evict_idle(&self) -> usize {
        let now = Instant::now();
        let before = self.buckets.len();

        self.buckets
            .retain(|_, bucket| now.duration_since(*bucket.last_used.lock()) < self.idle_timeout);

        before.saturating_sub(self.buckets.len())
    }

    /// Number of live buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    /// Whether no bucket exists.
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

fn ceil_seconds(wait: Duration) -> u64 {
    let seconds = wait.as_secs() + u64::from(wait.subsec_nanos() > 0);
    seconds.max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(rate: u32, burst: u32) -> FallbackLimiter {
        FallbackLimiter::new(&FallbackConfig {
            rate,
            burst,
            ..FallbackConfig::default()
        })
        .unwrap()
    }

    #[test]
    fn burst_then_block() {
        let limiter = limiter(1, 3);

        for _ in 0..3 {
            assert!(limiter.check("ip:10.0.0.1").allowed);
        }

        let blocked = limiter.check("ip:10.0.0.1");

        assert!(!blocked.allowed);
        assert_eq!(blocked.limit, 1);
        assert_eq!(blocked.retry_after, 1);
    }

    #[tokio::test]
    async fn tokens_refill_over_time() {
        let limiter = limiter(1, 2);

        assert!(limiter.check("ip:10.0.0.1").allowed);
        assert!(limiter.check("ip:10.0.0.1").allowed);
        assert!(!limiter.check("ip:10.0.0.1").allowed);

        tokio::time::sleep(Duration::from_millis(1100)).await;

        assert!(limiter.check("ip:10.0.0.1").allowed);
    }

    #[test]
    fn callers_have_separate_buckets() {
        let limiter = limiter(1, 1);

        assert!(limiter.check("a").allowed);
        assert!(!limiter.check("a").allowed);
        assert!(limiter.check("b").allowed);
        assert_eq!(limiter.len(), 2);
    }

    #[test]
    fn zero_rate_is_rejected() {
        let result = FallbackLimiter::new(&FallbackConfig {
            rate: 0,
            ..FallbackConfig::default()
        });

        assert!(matches!(result, Err(RateLimitError::InvalidConfig(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_buckets_are_evicted() {
        let limiter = limiter(20, 20);

        limiter.check("old");
        tokio::time::advance(Duration::from_secs(120)).await;
        limiter.check("recent");
        tokio::time::advance(Duration::from_secs(61)).await;

        assert_eq!(limiter.evict_idle(), 1);
        assert_eq!(limiter.len(), 1);
        assert!(limiter.buckets.contains_key("recent"));
    }

    #[test]
    fn retry_after_rounds_up() {
        assert_eq!(ceil_seconds(Duration::from_millis(10)), 1);
        assert_eq!(ceil_seconds(Duration::from_millis(1500)), 2);
        assert_eq!(ceil_seconds(Duration::ZERO), 1);
    }
}
