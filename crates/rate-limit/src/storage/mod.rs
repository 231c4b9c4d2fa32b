//! Shared counter stores.

mod memory;
mod redis;
mod redis_pool;

use async_trait::async_trait;

pub use memory::MemoryStore;
pub use self::redis::RedisStore;

use crate::error::StoreError;

/// One counter change: the key, by how much, and the expiry it gets if it has none.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterUpdate {
    /// Full key, including the prefix.
    pub key: String,
    /// Amount added or removed.
    pub amount: u64,
    /// Expiry in seconds, only applied to keys without one.
    pub ttl: u64,
}

/// Primitives the limiter and the stats drain need from the counter store.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Adds to every counter in one round trip and returns the new values in order.
    async fn increment(&self, updates: &[CounterUpdate]) -> Result<Vec<i64>, StoreError>;

    /// Subtracts from every counter in one round trip.
    async fn decrement(&self, updates: &[CounterUpdate]) -> Result<(), StoreError>;

    /// All keys matching a glob pattern, fetched `count` at a time.
    async fn scan(&self, pattern: &str, count: usize) -> Result<Vec<String>, StoreError>;

    /// Values of the given keys, `None` for missing ones.
    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<i64>>, StoreError>;

    /// Removes the given keys.
    async fn delete(&self, keys: &[String]) -> Result<(), StoreError>;

    /// Liveness check.
    async fn ping(&self) -> Result<(), StoreError>;
}
