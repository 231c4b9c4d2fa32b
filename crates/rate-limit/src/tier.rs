//! Rate limit tiers and per-endpoint costs.

use std::{collections::HashMap, sync::Arc};

use config::TierConfig;

use crate::window::Window;

/// Ceilings for the three windows. A ceiling of zero leaves that window unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct RateLimitTier {
    /// Weighted requests per second.
    pub second: u64,
    /// Weighted requests per hour.
    pub hour: u64,
    /// Weighted requests per calendar month.
    pub month: u64,
}

impl RateLimitTier {
    /// A tier without any ceiling.
    pub const UNLIMITED: RateLimitTier = RateLimitTier {
        second: 0,
        hour: 0,
        month: 0,
    };

    /// Builds a tier from signed database columns. Negative values are malformed.
    pub fn from_signed(second: i64, hour: i64, month: i64) -> Option<Self> {
        Some(Self {
            second: u64::try_from(second).ok()?,
            hour: u64::try_from(hour).ok()?,
            month: u64::try_from(month).ok()?,
        })
    }

    /// The ceiling of `window`, zero when unlimited.
    pub fn ceiling(&self, window: Window) -> u64 {
        match window {
            Window::Second => self.second,
            Window::Hour => self.hour,
            Window::Month => self.month,
        }
    }

    /// Windows with a ceiling, finest first.
    pub fn limited_windows(&self) -> impl Iterator<Item = Window> + '_ {
        Window::ALL.into_iter().filter(|window| self.ceiling(*window) > 0)
    }

    /// Per-window union of two tiers: the larger ceiling wins and unlimited beats everything.
    pub fn union(self, other: RateLimitTier) -> RateLimitTier {
        fn widest(a: u64, b: u64) -> u64 {
            if a == 0 || b == 0 { 0 } else { a.max(b) }
        }

        RateLimitTier {
            second: widest(self.second, other.second),
            hour: widest(self.hour, other.hour),
            month: widest(self.month, other.month),
        }
    }
}

impl From<TierConfig> for RateLimitTier {
    fn from(config: TierConfig) -> Self {
        Self {
            second: config.second,
            hour: config.hour,
            month: config.month,
        }
    }
}

/// Shares one allocation between all users with an identical tier.
#[derive(Debug, Default)]
pub struct TierInterner {
    tiers: HashMap<RateLimitTier, Arc<RateLimitTier>>,
}

impl TierInterner {
    /// Returns the shared instance for `tier`, creating it on first use.
    pub fn intern(&mut self, tier: RateLimitTier) -> Arc<RateLimitTier> {
        self.tiers.entry(tier).or_insert_with(|| Arc::new(tier)).clone()
    }

    /// Forgets tiers no longer referenced outside of the interner.
    pub fn shrink(&mut self) {
        self.tiers.retain(|_, tier| Arc::strong_count(tier) > 1);
    }

    /// Number of distinct tiers held.
    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    /// Whether no tier is held.
    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }
}

/// Bucket charged when a route has no explicit assignment.
pub const DEFAULT_BUCKET: &str = "default";

/// What a request to one route costs, and which quota bucket pays for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointCost {
    /// Units charged against every window.
    pub weight: u64,
    /// Name of the quota bucket.
    pub bucket: Arc<str>,
}

impl Default for EndpointCost {
    fn default() -> Self {
        Self {
            weight: 1,
            bucket: Arc::from(DEFAULT_BUCKET),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_columns_are_rejected() {
        assert_eq!(RateLimitTier::from_signed(1, -1, 0), None);
        assert_eq!(
            RateLimitTier::from_signed(1, 2, 0),
            Some(RateLimitTier {
                second: 1,
                hour: 2,
                month: 0
            })
        );
    }

    #[test]
    fn limited_windows_skip_zero_ceilings() {
        let tier = RateLimitTier {
            second: 2,
            hour: 500,
            month: 0,
        };

        let windows: Vec<_> = tier.limited_windows().collect();

        assert_eq!(windows, vec![Window::Second, Window::Hour]);
    }

    #[test]
    fn union_prefers_unlimited() {
        let free = RateLimitTier {
            second: 5,
            hour: 1000,
            month: 100_000,
        };

        let paid = RateLimitTier {
            second: 50,
            hour: 500,
            month: 0,
        };

        assert_eq!(
            free.union(paid),
            RateLimitTier {
                second: 50,
                hour: 1000,
                month: 0
            }
        );
    }

    #[test]
    fn interner_shares_identical_tiers() {
        let mut interner = TierInterner::default();

        let a = interner.intern(RateLimitTier {
            second: 1,
            hour: 2,
            month: 3,
        });

        let b = interner.intern(RateLimitTier {
            second: 1,
            hour: 2,
            month: 3,
        });

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(interner.len(), 1);

        drop(a);
        drop(b);
        interner.shrink();

        assert_eq!(interner.len(), 0);
    }
}
