//! The `X-RateLimit-*` response header contract.

use http::{HeaderMap, HeaderName, HeaderValue, header::RETRY_AFTER};
use rate_limit::{Alias, Decision, FallbackDecision, WindowStatus};

const LIMIT: &str = "x-ratelimit-limit";
const REMAINING: &str = "x-ratelimit-remaining";
const RESET: &str = "x-ratelimit-reset";
const WINDOW: &str = "x-ratelimit-window";

fn insert_number(headers: &mut HeaderMap, name: impl http::header::IntoHeaderName, value: u64) {
    headers.insert(name, HeaderValue::from(value));
}

// Per-window headers, e.g. `X-RateLimit-Remaining-Hour`.
fn insert_pair(headers: &mut HeaderMap, suffix: &str, status: &WindowStatus) {
    let suffix = suffix.to_ascii_lowercase();
    let limit = format!("{LIMIT}-{suffix}");
    let remaining = format!("{REMAINING}-{suffix}");

    if let (Ok(limit), Ok(remaining)) = (HeaderName::try_from(limit), HeaderName::try_from(remaining)) {
        insert_number(headers, limit, status.limit);
        insert_number(headers, remaining, status.remaining);
    }
}

/// Writes the headers of a decision by the distributed limiter.
pub(crate) fn apply_decision(headers: &mut HeaderMap, decision: &Decision) {
    if let Some(headline) = decision.headline() {
        insert_number(headers, LIMIT, headline.limit);
        insert_number(headers, REMAINING, headline.remaining);
        insert_number(headers, RESET, headline.reset);
        headers.insert(WINDOW, HeaderValue::from_static(headline.window.as_str()));
    }

    for status in &decision.windows {
        insert_pair(headers, status.window.as_str(), status);
    }

    for alias in [Alias::Minute, Alias::Day] {
        if let Some(status) = decision.alias(alias) {
            insert_pair(headers, alias.as_str(), status);
        }
    }

    if let Some(retry_after) = decision.retry_after() {
        insert_number(headers, RETRY_AFTER, retry_after);
    }
}

/// Writes the headers of a decision by the fallback limiter.
pub(crate) fn apply_fallback(headers: &mut HeaderMap, decision: &FallbackDecision) {
    insert_number(headers, LIMIT, u64::from(decision.limit));

    if !decision.allowed {
        insert_number(headers, RETRY_AFTER, decision.retry_after);
    }
}

#[cfg(test)]
mod tests {
    use std::fmt::Write;

    use rate_limit::{RateLimitTier, Window, evaluate};

    use super::*;

    // 2024-02-15T12:30:15Z
    const NOW: i64 = 1_708_000_215;

    fn render(headers: &HeaderMap) -> String {
        let mut lines: Vec<(String, String)> = headers
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_str().unwrap().to_string()))
            .collect();

        lines.sort();

        let mut out = String::new();

        for (name, value) in lines {
            writeln!(out, "{name}: {value}").unwrap();
        }

        out
    }

    #[test]
    fn admitted_with_all_windows() {
        let tier = RateLimitTier {
            second: 5,
            hour: 1000,
            month: 100_000,
        };

        let decision = evaluate(
            &tier,
            &[(Window::Second, 2), (Window::Hour, 40), (Window::Month, 900)],
            NOW,
        );

        let mut headers = HeaderMap::new();
        apply_decision(&mut headers, &decision);

        insta::assert_snapshot!(render(&headers), @r"
        x-ratelimit-limit: 5
        x-ratelimit-limit-day: 100000
        x-ratelimit-limit-hour: 1000
        x-ratelimit-limit-minute: 1000
        x-ratelimit-limit-month: 100000
        x-ratelimit-limit-second: 5
        x-ratelimit-remaining: 3
        x-ratelimit-remaining-day: 99100
        x-ratelimit-remaining-hour: 960
        x-ratelimit-remaining-minute: 960
        x-ratelimit-remaining-month: 99100
        x-ratelimit-remaining-second: 3
        x-ratelimit-reset: 1
        x-ratelimit-window: second
        ");
    }

    #[test]
    fn blocked_by_hour() {
        let tier = RateLimitTier {
            second: 5,
            hour: 100,
            month: 0,
        };

        let decision = evaluate(&tier, &[(Window::Second, 1), (Window::Hour, 101)], NOW);

        let mut headers = HeaderMap::new();
        apply_decision(&mut headers, &decision);

        insta::assert_snapshot!(render(&headers), @r"
        retry-after: 1785
        x-ratelimit-limit: 100
        x-ratelimit-limit-day: 100
        x-ratelimit-limit-hour: 100
        x-ratelimit-limit-minute: 100
        x-ratelimit-limit-second: 5
        x-ratelimit-remaining: 0
        x-ratelimit-remaining-day: 0
        x-ratelimit-remaining-hour: 0
        x-ratelimit-remaining-minute: 0
        x-ratelimit-remaining-second: 4
        x-ratelimit-reset: 1785
        x-ratelimit-window: hour
        ");
    }

    #[test]
    fn unlimited_tier_has_no_headers() {
        let decision = evaluate(&RateLimitTier::UNLIMITED, &[], NOW);

        let mut headers = HeaderMap::new();
        apply_decision(&mut headers, &decision);

        assert!(headers.is_empty());
    }

    #[test]
    fn fallback_block() {
        let decision = FallbackDecision {
            allowed: false,
            limit: 20,
            retry_after: 1,
        };

        let mut headers = HeaderMap::new();
        apply_fallback(&mut headers, &decision);

        insta::assert_snapshot!(render(&headers), @r"
        retry-after: 1
        x-ratelimit-limit: 20
        ");
    }
}
