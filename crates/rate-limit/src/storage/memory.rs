//! In-process counter store for single-instance deployments and tests.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use super::{CounterStore, CounterUpdate};
use crate::error::StoreError;

/// Expired entries are swept every this many write operations.
const PURGE_EVERY: u64 = 1024;

#[derive(Debug)]
struct Entry {
    value: i64,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|expires_at| expires_at <= now)
    }
}

#[derive(Debug, Default)]
struct State {
    entries: HashMap<String, Entry>,
    operations: u64,
}

impl State {
    fn apply(&mut self, update: &CounterUpdate, delta: i64, now: Instant) -> i64 {
        self.operations += 1;

        if self.operations >= PURGE_EVERY {
            self.operations = 0;
            self.entries.retain(|_, entry| !entry.is_expired(now));
        }

        let entry = self.entries.entry(update.key.clone()).or_insert(Entry {
            value: 0,
            expires_at: None,
        });

        if entry.is_expired(now) {
            entry.value = 0;
            entry.expires_at = None;
        }

        entry.value = entry.value.saturating_add(delta);

        if entry.expires_at.is_none() {
            entry.expires_at = Some(now + Duration::from_secs(update.ttl));
        }

        entry.value
    }

    fn get(&self, key: &str, now: Instant) -> Option<i64> {
        self.entries
            .get(key)
            .filter(|entry| !entry.is_expired(now))
            .map(|entry| entry.value)
    }
}

/// Counters held in a mutex-guarded map, with the same expiry semantics as the Redis store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a counter, for inspection.
    pub fn value(&self, key: &str) -> Option<i64> {
        self.state.lock().get(key, Instant::now())
    }

    /// Number of live counters.
    pub fn len(&self) -> usize {
        let now = Instant::now();

        self.state
            .lock()
            .entries
            .values()
            .filter(|entry| !entry.is_expired(now))
            .count()
    }

    /// Whether no live counter exists.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(&self, updates: &[CounterUpdate]) -> Result<Vec<i64>, StoreError> {
        let now = Instant::now();
        let mut state = self.state.lock();

        let values = updates
            .iter()
            .map(|update| state.apply(update, to_delta(update.amount), now))
            .collect();

        Ok(values)
    }

    async fn decrement(&self, updates: &[CounterUpdate]) -> Result<(), StoreError> {
        let now = Instant::now();
        let mut state = self.state.lock();

        for update in updates {
            state.apply(update, -to_delta(update.amount), now);
        }

        Ok(())
    }

    async fn scan(&self, pattern: &str, _count: usize) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        let state = self.state.lock();

        let keys = state
            .entries
            .iter()
            .filter(|(key, entry)| !entry.is_expired(now) && glob_match(pattern, key))
            .map(|(key, _)| key.clone())
            .collect();

        Ok(keys)
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<i64>>, StoreError> {
        let now = Instant::now();
        let state = self.state.lock();

        Ok(keys.iter().map(|key| state.get(key, now)).collect())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        let mut state = self.state.lock();

        for key in keys {
            state.entries.remove(key);
        }

        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

fn to_delta(amount: u64) -> i64 {
    i64::try_from(amount).unwrap_or(i64::MAX)
}

/// Glob matching with `*`, `?` and backslash escapes, as used by `SCAN MATCH`.
fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    glob_match_at(&pattern, &text)
}

fn glob_match_at(pattern: &[char], text: &[char]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some(('*', rest)) => (0..=text.len()).any(|skip| glob_match_at(rest, &text[skip..])),
        Some(('?', rest)) => !text.is_empty() && glob_match_at(rest, &text[1..]),
        Some(('\\', rest)) if !rest.is_empty() => {
            text.first() == rest.first() && glob_match_at(&rest[1..], &text[1..])
        }
        Some((c, rest)) => text.first() == Some(c) && glob_match_at(rest, &text[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(key: &str, amount: u64, ttl: u64) -> CounterUpdate {
        CounterUpdate {
            key: key.to_string(),
            amount,
            ttl,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn increments_accumulate() {
        let store = MemoryStore::new();

        let first = store.increment(&[update("a", 2, 10), update("b", 1, 10)]).await.unwrap();
        let second = store.increment(&[update("a", 3, 10)]).await.unwrap();

        assert_eq!(first, vec![2, 1]);
        assert_eq!(second, vec![5]);
    }

    #[tokio::test(start_paused = true)]
    async fn expiry_is_never_extended() {
        let store = MemoryStore::new();

        store.increment(&[update("a", 1, 2)]).await.unwrap();
        tokio::time::advance(Duration::from_secs(1)).await;

        store.increment(&[update("a", 1, 100)]).await.unwrap();
        assert_eq!(store.value("a"), Some(2));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(store.value("a"), None);

        let values = store.increment(&[update("a", 1, 2)]).await.unwrap();
        assert_eq!(values, vec![1]);
    }

    #[tokio::test(start_paused = true)]
    async fn decrement_restores_value() {
        let store = MemoryStore::new();

        store.increment(&[update("a", 5, 10)]).await.unwrap();
        store.decrement(&[update("a", 5, 10)]).await.unwrap();

        assert_eq!(store.value("a"), Some(0));
    }

    #[tokio::test]
    async fn scan_get_and_delete() {
        let store = MemoryStore::new();

        store
            .increment(&[
                update("p:usage|1|2|k|/a", 1, 60),
                update("p:usage|1|2|k|/b", 4, 60),
                update("p:rl|second|default|u:2|1", 1, 60),
            ])
            .await
            .unwrap();

        let mut keys = store.scan("p:usage|*", 500).await.unwrap();
        keys.sort();

        assert_eq!(keys, vec!["p:usage|1|2|k|/a", "p:usage|1|2|k|/b"]);

        let values = store
            .get_many(&[keys[1].clone(), "missing".to_string()])
            .await
            .unwrap();

        assert_eq!(values, vec![Some(4), None]);

        store.delete(&keys).await.unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn glob_patterns() {
        assert!(glob_match("a*", "abc"));
        assert!(glob_match("a?c", "abc"));
        assert!(!glob_match("a?c", "ac"));
        assert!(glob_match(r"a\*b*", "a*bc"));
        assert!(!glob_match(r"a\*b*", "axbc"));
        assert!(glob_match("*", ""));
    }
}
