//! Multi-window counting against the shared counter store.

use std::{sync::Arc, time::Duration};

use telemetry::metrics::{COUNTER_STORE_DURATION, Recorder};

use crate::{
    error::StoreError,
    identity::Identity,
    keys::{KeySpace, UsageKey},
    storage::{CounterStore, CounterUpdate},
    tier::{EndpointCost, RateLimitTier},
    window::{Window, truncate_to_hour},
};

/// Counter state of one window after this request was counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowStatus {
    /// The window.
    pub window: Window,
    /// Its ceiling, never zero.
    pub limit: u64,
    /// Units left in the current window instance.
    pub remaining: u64,
    /// Seconds until the window rolls over.
    pub reset: u64,
}

/// Outcome of the counting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Every window is within its ceiling.
    Admitted,
    /// The coarsest window over its ceiling.
    Blocked(Window),
}

/// Alias headers mirroring a native window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alias {
    /// Mirrors the hour window, else the second window.
    Minute,
    /// Mirrors the month window, else the hour window, else the second window.
    Day,
}

impl Alias {
    /// Header suffix of the alias.
    pub fn as_str(self) -> &'static str {
        match self {
            Alias::Minute => "Minute",
            Alias::Day => "Day",
        }
    }

    fn sources(self) -> &'static [Window] {
        match self {
            Alias::Minute => &[Window::Hour, Window::Second],
            Alias::Day => &[Window::Month, Window::Hour, Window::Second],
        }
    }
}

/// A request decision with everything the response headers need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Admitted or blocked.
    pub verdict: Verdict,
    /// Limited windows, finest first.
    pub windows: Vec<WindowStatus>,
}

impl Decision {
    /// Whether the request may proceed.
    pub fn is_admitted(&self) -> bool {
        self.verdict == Verdict::Admitted
    }

    /// Status of a limited window.
    pub fn window(&self, window: Window) -> Option<&WindowStatus> {
        self.windows.iter().find(|status| status.window == window)
    }

    /// The window reported in the default headers: the violated window when blocked,
    /// otherwise the finest limited window. `None` when every window is unlimited.
    pub fn headline(&self) -> Option<WindowStatus> {
        match self.verdict {
            Verdict::Blocked(window) => self.window(window).map(|status| WindowStatus {
                remaining: 0,
                ..*status
            }),
            Verdict::Admitted => self.windows.first().copied(),
        }
    }

    /// The native window an alias mirrors.
    pub fn alias(&self, alias: Alias) -> Option<&WindowStatus> {
        alias.sources().iter().find_map(|window| self.window(*window))
    }

    /// Seconds a blocked caller should wait.
    pub fn retry_after(&self) -> Option<u64> {
        match self.verdict {
            Verdict::Blocked(window) => self.window(window).map(|status| status.reset),
            Verdict::Admitted => None,
        }
    }
}

/// Compares counter values against the tier.
///
/// `values` holds the post-increment value of every limited window. Windows are checked
/// from the coarsest to the finest and a value above the ceiling blocks.
pub fn evaluate(tier: &RateLimitTier, values: &[(Window, i64)], now: i64) -> Decision {
    let mut windows = Vec::with_capacity(values.len());
    let mut violated = None;

    for window in Window::ALL {
        let limit = tier.ceiling(window);

        if limit == 0 {
            continue;
        }

        let Some((_, value)) = values.iter().find(|(w, _)| *w == window) else {
            continue;
        };

        let used = u64::try_from(*value).unwrap_or(0);

        windows.push(WindowStatus {
            window,
            limit,
            remaining: limit.saturating_sub(used),
            reset: window.reset(now),
        });
    }

    for window in Window::EVALUATION_ORDER {
        let over = windows
            .iter()
            .any(|status| status.window == window && used_of(values, window) > status.limit);

        if over {
            violated = Some(window);
            break;
        }
    }

    Decision {
        verdict: violated.map_or(Verdict::Admitted, Verdict::Blocked),
        windows,
    }
}

fn used_of(values: &[(Window, i64)], window: Window) -> u64 {
    values
        .iter()
        .find(|(w, _)| *w == window)
        .and_then(|(_, value)| u64::try_from(*value).ok())
        .unwrap_or(0)
}

/// Counters a request was charged, kept until its response status is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Charge {
    counters: Vec<CounterUpdate>,
    usage: CounterUpdate,
    hour: i64,
}

impl Charge {
    /// The window counters, with the amount a refund gives back.
    pub fn counters(&self) -> &[CounterUpdate] {
        &self.counters
    }

    /// The usage statistics counter.
    pub fn usage(&self) -> &CounterUpdate {
        &self.usage
    }
}

/// Counts requests in the shared store.
pub struct DistributedLimiter {
    store: Arc<dyn CounterStore>,
    keys: KeySpace,
    request_timeout: Duration,
    max_refundable_weight: u64,
    usage_ttl: u64,
}

impl DistributedLimiter {
    /// Creates a limiter over `store`.
    pub fn new(store: Arc<dyn CounterStore>, config: &config::RateLimitConfig) -> Self {
        Self {
            store,
            keys: KeySpace::new(config.key_prefix.clone()),
            request_timeout: config.request_timeout,
            max_refundable_weight: config.max_refundable_weight,
            usage_ttl: config.usage_retention.as_secs().max(1),
        }
    }

    /// Key layout used by this limiter.
    pub fn keys(&self) -> &KeySpace {
        &self.keys
    }

    /// Charges the request at the current time.
    pub async fn check(
        &self,
        identity: &Identity,
        tier: &RateLimitTier,
        cost: &EndpointCost,
        route: &str,
    ) -> Result<(Decision, Charge), StoreError> {
        self.check_at(identity, tier, cost, route, jiff::Timestamp::now().as_second())
            .await
    }

    /// Charges every limited window and the usage counter in one round trip, then
    /// decides. `now` is in UNIX seconds.
    pub async fn check_at(
        &self,
        identity: &Identity,
        tier: &RateLimitTier,
        cost: &EndpointCost,
        route: &str,
        now: i64,
    ) -> Result<(Decision, Charge), StoreError> {
        let subject = identity.subject();
        let windows: Vec<Window> = tier.limited_windows().collect();

        let mut updates: Vec<CounterUpdate> = windows
            .iter()
            .map(|window| CounterUpdate {
                key: self.keys.counter(*window, &cost.bucket, subject, window.start(now)),
                amount: cost.weight,
                ttl: window.ttl(now),
            })
            .collect();

        let hour = truncate_to_hour(now);

        let usage = CounterUpdate {
            key: self.keys.usage(&UsageKey {
                hour,
                user_id: identity.user_id,
                api_key: identity.api_key.clone(),
                route: route.to_string(),
            }),
            amount: 1,
            ttl: self.usage_ttl,
        };

        updates.push(usage.clone());

        let values = self.timed("increment", self.store.increment(&updates)).await?;

        if values.len() != updates.len() {
            return Err(StoreError::Query(format!(
                "expected {} counter values, got {}",
                updates.len(),
                values.len()
            )));
        }

        let window_values: Vec<(Window, i64)> = windows.iter().copied().zip(values.iter().copied()).collect();
        let decision = evaluate(tier, &window_values, now);

        let refundable = cost.weight.min(self.max_refundable_weight);
        updates.pop();

        let counters = updates
            .into_iter()
            .map(|update| CounterUpdate {
                amount: refundable,
                ..update
            })
            .collect();

        Ok((decision, Charge { counters, usage, hour }))
    }

    /// Gives back a charge after a failed or abandoned request.
    pub async fn refund(&self, charge: &Charge) -> Result<(), StoreError> {
        self.refund_at(charge, jiff::Timestamp::now().as_second()).await
    }

    /// Like [`Self::refund`], treating `now` (UNIX seconds) as the current time.
    ///
    /// The usage counter is left alone once its hour is over: the stats drain may
    /// already have stored and deleted it.
    pub async fn refund_at(&self, charge: &Charge, now: i64) -> Result<(), StoreError> {
        let mut updates = Vec::with_capacity(charge.counters.len() + 1);
        updates.extend(charge.counters.iter().filter(|update| update.amount > 0).cloned());

        if charge.hour == truncate_to_hour(now) {
            updates.push(charge.usage.clone());
        }

        if updates.is_empty() {
            return Ok(());
        }

        self.timed("decrement", self.store.decrement(&updates)).await
    }

    async fn timed<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T, StoreError>>,
    ) -> Result<T, StoreError> {
        let mut recorder = Recorder::new(COUNTER_STORE_DURATION);
        recorder.push_attribute("operation", operation);

        let result = match tokio::time::timeout(self.request_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(self.request_timeout)),
        };

        recorder.push_attribute("status", if result.is_ok() { "ok" } else { "error" });
        recorder.record();

        result
    }
}
