//! A counter store that can be broken on demand.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use rate_limit::{CounterStore, CounterUpdate, MemoryStore, StoreError};

/// In-memory counters with switches simulating an unreachable or misbehaving store.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    down: AtomicBool,
    failing_increments: AtomicBool,
}

impl FlakyStore {
    /// Makes every operation fail, probes included.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Makes only the request path round trip fail. Probes keep succeeding.
    pub fn set_failing_increments(&self, failing: bool) {
        self.failing_increments.store(failing, Ordering::SeqCst);
    }

    /// Current value of a counter.
    pub fn value(&self, key: &str) -> Option<i64> {
        self.inner.value(key)
    }

    /// Whether no counter exists.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Every live key matching the glob pattern.
    pub async fn keys(&self, pattern: &str) -> Vec<String> {
        self.inner.scan(pattern, 100).await.unwrap()
    }

    fn check(&self) -> Result<(), StoreError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(StoreError::Connection("connection refused".to_string()));
        }

        Ok(())
    }
}

#[async_trait]
impl CounterStore for FlakyStore {
    async fn increment(&self, updates: &[CounterUpdate]) -> Result<Vec<i64>, StoreError> {
        self.check()?;

        if self.failing_increments.load(Ordering::SeqCst) {
            return Err(StoreError::Query("READONLY replica".to_string()));
        }

        self.inner.increment(updates).await
    }

    async fn decrement(&self, updates: &[CounterUpdate]) -> Result<(), StoreError> {
        self.check()?;
        self.inner.decrement(updates).await
    }

    async fn scan(&self, pattern: &str, count: usize) -> Result<Vec<String>, StoreError> {
        self.check()?;
        self.inner.scan(pattern, count).await
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<i64>>, StoreError> {
        self.check()?;
        self.inner.get_many(keys).await
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        self.check()?;
        self.inner.delete(keys).await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.check()
    }
}
