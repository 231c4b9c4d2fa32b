//! Layout of the keys written to the counter store.
//!
//! Counters: `<prefix>rl|<window>|<bucket>|<subject>|<window_start>`.
//! Usage: `<prefix>usage|<hour>|<user_id>|<api_key>|<route>`, route last.

use std::borrow::Cow;

use crate::{identity::Subject, window::Window};

const SEPARATOR: char = '|';

/// Builds and parses keys below one prefix.
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    /// Creates the key space. The prefix must not contain `|`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    /// Counter of one window instance.
    pub fn counter(&self, window: Window, bucket: &str, subject: Subject, window_start: i64) -> String {
        format!(
            "{}rl|{}|{}|{}|{}",
            self.prefix,
            window,
            sanitize(bucket),
            subject,
            window_start
        )
    }

    /// Usage statistics counter of one caller, route and hour.
    pub fn usage(&self, key: &UsageKey) -> String {
        format!(
            "{}usage|{}|{}|{}|{}",
            self.prefix,
            key.hour,
            key.user_id,
            sanitize(&key.api_key),
            sanitize(&key.route)
        )
    }

    /// `SCAN MATCH` pattern selecting every usage key of this prefix.
    pub fn usage_pattern(&self) -> String {
        format!("{}usage|*", escape_glob(&self.prefix))
    }

    /// Parses a usage key. Returns `None` for keys of another shape.
    pub fn parse_usage(&self, key: &str) -> Option<UsageKey> {
        let rest = key.strip_prefix(&self.prefix)?.strip_prefix("usage|")?;
        let mut parts = rest.splitn(4, SEPARATOR);

        let hour = parts.next()?.parse().ok()?;
        let user_id = parts.next()?.parse().ok()?;
        let api_key = parts.next()?;
        let route = parts.next()?;

        if api_key.is_empty() || route.is_empty() {
            return None;
        }

        Some(UsageKey {
            hour,
            user_id,
            api_key: api_key.to_string(),
            route: route.to_string(),
        })
    }
}

/// Identifies one usage statistics counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UsageKey {
    /// Start of the hour, UNIX seconds.
    pub hour: i64,
    /// Owner of the key, `-1` for unauthenticated callers.
    pub user_id: i64,
    /// The API key, or the `ip:<ip>` pseudo-key.
    pub api_key: String,
    /// Route template.
    pub route: String,
}

fn sanitize(segment: &str) -> Cow<'_, str> {
    if segment.contains(SEPARATOR) {
        Cow::Owned(segment.replace(SEPARATOR, "_"))
    } else {
        Cow::Borrowed(segment)
    }
}

fn escape_glob(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());

    for c in value.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }

        escaped.push(c);
    }

    escaped
}
