//! Fixed time windows the distributed limiter counts in.
//!
//! Timestamps are UNIX seconds. Months are UTC calendar months.

use std::fmt;

use jiff::{Timestamp, ToSpan, tz::TimeZone};

const HOUR: i64 = 3600;

/// Average month length, only used if the calendar computation fails.
const APPROXIMATE_MONTH: i64 = 30 * 24 * HOUR;

/// A counting window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Window {
    /// One second.
    Second,
    /// One hour.
    Hour,
    /// One UTC calendar month.
    Month,
}

impl Window {
    /// All windows from the finest to the coarsest.
    pub const ALL: [Window; 3] = [Window::Second, Window::Hour, Window::Month];

    /// Order in which violations are looked for: the coarsest violated window wins.
    pub const EVALUATION_ORDER: [Window; 3] = [Window::Month, Window::Hour, Window::Second];

    /// Lowercase name used in keys and headers.
    pub fn as_str(self) -> &'static str {
        match self {
            Window::Second => "second",
            Window::Hour => "hour",
            Window::Month => "month",
        }
    }

    /// Start of the window containing `now`.
    pub fn start(self, now: i64) -> i64 {
        match self {
            Window::Second => now,
            Window::Hour => truncate_to_hour(now),
            Window::Month => month_bounds(now).0,
        }
    }

    /// Seconds until the window containing `now` rolls over. Always at least one.
    pub fn reset(self, now: i64) -> u64 {
        let end = match self {
            Window::Second => now + 1,
            Window::Hour => truncate_to_hour(now) + HOUR,
            Window::Month => month_bounds(now).1,
        };

        (end - now).max(1) as u64
    }

    /// Expiry given to a counter created at `now`: the rest of the window plus a margin.
    pub fn ttl(self, now: i64) -> u64 {
        match self {
            Window::Second => 2,
            Window::Hour => self.reset(now) + 60,
            Window::Month => self.reset(now) + HOUR as u64,
        }
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Start of the hour containing `now`.
pub fn truncate_to_hour(now: i64) -> i64 {
    now - now.rem_euclid(HOUR)
}

/// First second of the current UTC month and of the next one.
fn month_bounds(now: i64) -> (i64, i64) {
    calendar_month_bounds(now).unwrap_or_else(|| {
        let start = now - now.rem_euclid(APPROXIMATE_MONTH);
        (start, start + APPROXIMATE_MONTH)
    })
}

fn calendar_month_bounds(now: i64) -> Option<(i64, i64)> {
    let date = Timestamp::from_second(now).ok()?.to_zoned(TimeZone::UTC).date();
    let first = date.first_of_month();
    let next = first.checked_add(1.month()).ok()?;

    let start = first.to_zoned(TimeZone::UTC).ok()?.timestamp().as_second();
    let end = next.to_zoned(TimeZone::UTC).ok()?.timestamp().as_second();

    Some((start, end))
}
