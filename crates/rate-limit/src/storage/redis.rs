//! Redis counter store.

use async_trait::async_trait;
use config::RedisConfig;
use deadpool::managed::Object;

use super::{
    CounterStore, CounterUpdate,
    redis_pool::{self, Manager, Pool},
};
use crate::error::StoreError;

/// Counters in Redis, shared by every server process.
///
/// Expiries use `EXPIRE .. NX`, which needs Redis 7 or newer.
pub struct RedisStore {
    pool: Pool,
}

impl RedisStore {
    /// Creates the connection pool. No connection is made until the first command.
    pub fn new(config: &RedisConfig) -> Result<Self, StoreError> {
        let pool = redis_pool::create_pool(config)
            .map_err(|e| StoreError::Connection(format!("Failed to create Redis connection pool: {e}")))?;

        Ok(Self { pool })
    }

    async fn connection(&self) -> Result<Object<Manager>, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Connection(format!("Failed to get Redis connection from pool: {e}")))
    }
}

fn query_error(e: redis::RedisError) -> StoreError {
    StoreError::Query(e.to_string())
}

fn counter_pipeline(command: &str, updates: &[CounterUpdate]) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic();

    for update in updates {
        pipe.cmd(command).arg(&update.key).arg(update.amount);
        pipe.cmd("EXPIRE").arg(&update.key).arg(update.ttl).arg("NX").ignore();
    }

    pipe
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment(&self, updates: &[CounterUpdate]) -> Result<Vec<i64>, StoreError> {
        if updates.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.connection().await?;

        counter_pipeline("INCRBY", updates)
            .query_async::<Vec<i64>>(&mut *conn)
            .await
            .map_err(query_error)
    }

    async fn decrement(&self, updates: &[CounterUpdate]) -> Result<(), StoreError> {
        if updates.is_empty() {
            return Ok(());
        }

        let mut conn = self.connection().await?;

        counter_pipeline("DECRBY", updates)
            .query_async::<Vec<i64>>(&mut *conn)
            .await
            .map_err(query_error)?;

        Ok(())
    }

    async fn scan(&self, pattern: &str, count: usize) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection().await?;
        let mut keys = Vec::new();
        let mut cursor = 0u64;

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(count)
                .query_async(&mut *conn)
                .await
                .map_err(query_error)?;

            keys.extend(batch);

            if next == 0 {
                break;
            }

            cursor = next;
        }

        // SCAN may return a key more than once.
        keys.sort_unstable();
        keys.dedup();

        Ok(keys)
    }

    async fn get_many(&self, keys: &[String]) -> Result<Vec<Option<i64>>, StoreError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.connection().await?;

        redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut *conn)
            .await
            .map_err(query_error)
    }

    async fn delete(&self, keys: &[String]) -> Result<(), StoreError> {
        if keys.is_empty() {
            return Ok(());
        }

        let mut conn = self.connection().await?;

        redis::cmd("DEL")
            .arg(keys)
            .query_async::<i64>(&mut *conn)
            .await
            .map_err(query_error)?;

        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;

        redis::cmd("PING")
            .query_async::<String>(&mut *conn)
            .await
            .map_err(query_error)?;

        Ok(())
    }
}
