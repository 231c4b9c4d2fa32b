//! Postgres implementation of the durable store.

use async_trait::async_trait;
use config::DatabaseConfig;
use jiff::Timestamp;
use secrecy::ExposeSecret;
use sqlx::{
    PgPool, Row,
    postgres::{PgPoolOptions, PgRow},
};

use super::{
    ApiKeyRow, DurableStore, MaintenanceInputs, OverrideRow, ProductRow, SubscriptionRow, UsageRow, UserLimitRow,
    UserRow, WeightRow, to_column,
};
use crate::{error::DatabaseError, tier::RateLimitTier};

const API_KEYS_FULL: &str = r#"
    SELECT api_key, user_id,
           EXTRACT(EPOCH FROM valid_from)::BIGINT AS valid_from,
           EXTRACT(EPOCH FROM valid_until)::BIGINT AS valid_until
    FROM api_keys
    WHERE valid_from <= to_timestamp($1)
      AND (valid_until IS NULL OR valid_until > to_timestamp($1))
"#;

const API_KEYS_CHANGED: &str = r#"
    SELECT api_key, user_id,
           EXTRACT(EPOCH FROM valid_from)::BIGINT AS valid_from,
           EXTRACT(EPOCH FROM valid_until)::BIGINT AS valid_until
    FROM api_keys
    WHERE updated_at > to_timestamp($1)
       OR (valid_from > to_timestamp($1) AND valid_from <= to_timestamp($2))
"#;

const API_KEYS_EXPIRED: &str = r#"
    SELECT api_key
    FROM api_keys
    WHERE valid_until > to_timestamp($1) AND valid_until <= to_timestamp($2)
"#;

const USER_LIMITS_FULL: &str = r#"
    SELECT user_id, "second", "hour", "month",
           EXTRACT(EPOCH FROM valid_from)::BIGINT AS valid_from,
           EXTRACT(EPOCH FROM valid_until)::BIGINT AS valid_until
    FROM user_rate_limits
    WHERE valid_from <= to_timestamp($1)
      AND (valid_until IS NULL OR valid_until > to_timestamp($1))
"#;

const USER_LIMITS_CHANGED: &str = r#"
    SELECT user_id, "second", "hour", "month",
           EXTRACT(EPOCH FROM valid_from)::BIGINT AS valid_from,
           EXTRACT(EPOCH FROM valid_until)::BIGINT AS valid_until
    FROM user_rate_limits
    WHERE updated_at > to_timestamp($1)
       OR (valid_from > to_timestamp($1) AND valid_from <= to_timestamp($2))
"#;

const USER_LIMITS_EXPIRED: &str = r#"
    SELECT user_id
    FROM user_rate_limits
    WHERE valid_until > to_timestamp($1) AND valid_until <= to_timestamp($2)
"#;

const PRODUCTS: &str = r#"
    SELECT name, "second", "hour", "month", EXTRACT(EPOCH FROM valid_from)::BIGINT AS valid_from
    FROM api_products
    WHERE valid_from <= to_timestamp($1)
"#;

const WEIGHTS: &str = r#"
    SELECT route, weight, bucket, EXTRACT(EPOCH FROM valid_from)::BIGINT AS valid_from
    FROM api_weights
    WHERE valid_from <= to_timestamp($1)
"#;

const UPSERT_USAGE: &str = r#"
    INSERT INTO api_usage_stats (hour, user_id, api_key, route, count)
    SELECT to_timestamp(h), u, k, r, c
    FROM UNNEST($1::BIGINT[], $2::BIGINT[], $3::TEXT[], $4::TEXT[], $5::BIGINT[]) AS t(h, u, k, r, c)
    ON CONFLICT (hour, api_key, route) DO UPDATE
    SET count = EXCLUDED.count, user_id = EXCLUDED.user_id
"#;

const MATERIALIZE_API_KEYS: &str = r#"
    INSERT INTO api_keys (api_key, user_id, valid_from, updated_at)
    SELECT api_key, id, now(), now()
    FROM users
    WHERE api_key IS NOT NULL AND api_key <> ''
    ON CONFLICT (api_key) DO NOTHING
"#;

const USERS: &str = "SELECT id, is_admin FROM users";

const ACTIVE_SUBSCRIPTIONS: &str = r#"
    SELECT user_id, product_name
    FROM api_subscriptions
    WHERE active_from <= to_timestamp($1)
      AND (active_until IS NULL OR active_until > to_timestamp($1))
"#;

const OVERRIDES: &str = r#"SELECT user_id, "second", "hour", "month" FROM api_rate_limit_overrides"#;

const WRITE_USER_LIMITS: &str = r#"
    INSERT INTO user_rate_limits (user_id, "second", "hour", "month", valid_from, valid_until, updated_at)
    SELECT u, s, h, m, now(), NULL, now()
    FROM UNNEST($1::BIGINT[], $2::BIGINT[], $3::BIGINT[], $4::BIGINT[]) AS t(u, s, h, m)
    ON CONFLICT (user_id) DO UPDATE
    SET "second" = EXCLUDED."second",
        "hour" = EXCLUDED."hour",
        "month" = EXCLUDED."month",
        valid_from = LEAST(user_rate_limits.valid_from, now()),
        valid_until = NULL,
        updated_at = now()
"#;

const EXPIRE_USER_LIMITS: &str = r#"
    UPDATE user_rate_limits
    SET valid_until = now(), updated_at = now()
    WHERE user_id = ANY($1) AND (valid_until IS NULL OR valid_until > now())
"#;

const INVALIDATE_ORPHANED_API_KEYS: &str = r#"
    UPDATE api_keys
    SET valid_until = now(), updated_at = now()
    WHERE (valid_until IS NULL OR valid_until > now())
      AND NOT EXISTS (SELECT 1 FROM users WHERE users.id = api_keys.user_id)
"#;

/// Durable store backed by a Postgres connection pool.
#[derive(Debug, Clone)]
pub struct PgDatabase {
    pool: PgPool,
}

impl PgDatabase {
    /// Creates the pool. Connections are opened on first use.
    pub fn connect_lazy(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect_lazy(config.url.expose_secret())?;

        Ok(Self { pool })
    }
}

fn timestamp(seconds: i64) -> Result<Timestamp, DatabaseError> {
    Timestamp::from_second(seconds).map_err(|_| DatabaseError::Timestamp(seconds))
}

fn optional_timestamp(seconds: Option<i64>) -> Result<Option<Timestamp>, DatabaseError> {
    seconds.map(timestamp).transpose()
}

/// Decodes every row, skipping the malformed ones with a warning.
fn decode_all<R, T>(rows: &[R], table: &str, decode: impl Fn(&R) -> Result<T, DatabaseError>) -> Vec<T> {
    rows.iter()
        .filter_map(|row| match decode(row) {
            Ok(value) => Some(value),
            Err(e) => {
                log::warn!("Skipping malformed {table} row: {e}");
                None
            }
        })
        .collect()
}

fn api_key_row(row: &PgRow) -> Result<ApiKeyRow, DatabaseError> {
    Ok(ApiKeyRow {
        api_key: row.try_get("api_key")?,
        user_id: row.try_get("user_id")?,
        valid_from: timestamp(row.try_get("valid_from")?)?,
        valid_until: optional_timestamp(row.try_get("valid_until")?)?,
    })
}

fn user_limit_row(row: &PgRow) -> Result<UserLimitRow, DatabaseError> {
    Ok(UserLimitRow {
        user_id: row.try_get("user_id")?,
        second: row.try_get("second")?,
        hour: row.try_get("hour")?,
        month: row.try_get("month")?,
        valid_from: timestamp(row.try_get("valid_from")?)?,
        valid_until: optional_timestamp(row.try_get("valid_until")?)?,
    })
}

fn product_row(row: &PgRow) -> Result<ProductRow, DatabaseError> {
    Ok(ProductRow {
        name: row.try_get("name")?,
        second: row.try_get("second")?,
        hour: row.try_get("hour")?,
        month: row.try_get("month")?,
        valid_from: timestamp(row.try_get("valid_from")?)?,
    })
}

fn weight_row(row: &PgRow) -> Result<WeightRow, DatabaseError> {
    Ok(WeightRow {
        route: row.try_get("route")?,
        weight: row.try_get("weight")?,
        bucket: row.try_get("bucket")?,
        valid_from: timestamp(row.try_get("valid_from")?)?,
    })
}

fn user_row(row: &PgRow) -> Result<UserRow, DatabaseError> {
    Ok(UserRow {
        id: row.try_get("id")?,
        is_admin: row.try_get("is_admin")?,
    })
}

fn subscription_row(row: &PgRow) -> Result<SubscriptionRow, DatabaseError> {
    Ok(SubscriptionRow {
        user_id: row.try_get("user_id")?,
        product_name: row.try_get("product_name")?,
    })
}

fn override_row(row: &PgRow) -> Result<OverrideRow, DatabaseError> {
    Ok(OverrideRow {
        user_id: row.try_get("user_id")?,
        second: row.try_get("second")?,
        hour: row.try_get("hour")?,
        month: row.try_get("month")?,
    })
}

#[async_trait]
impl DurableStore for PgDatabase {
    async fn api_keys(&self, since: Option<Timestamp>, now: Timestamp) -> Result<Vec<ApiKeyRow>, DatabaseError> {
        let query = match since {
            None => sqlx::query(API_KEYS_FULL).bind(now.as_second()),
            Some(since) => sqlx::query(API_KEYS_CHANGED)
                .bind(since.as_second())
                .bind(now.as_second()),
        };

        let rows = query.fetch_all(&self.pool).await?;

        Ok(decode_all(&rows, "api_keys", api_key_row))
    }

    async fn expired_api_keys(&self, since: Timestamp, now: Timestamp) -> Result<Vec<String>, DatabaseError> {
        let rows = sqlx::query(API_KEYS_EXPIRED)
            .bind(since.as_second())
            .bind(now.as_second())
            .fetch_all(&self.pool)
            .await?;

        Ok(decode_all(&rows, "api_keys", |row| Ok(row.try_get("api_key")?)))
    }

    async fn user_limits(
        &self,
        since: Option<Timestamp>,
        now: Timestamp,
    ) -> Result<Vec<UserLimitRow>, DatabaseError> {
        let query = match since {
            None => sqlx::query(USER_LIMITS_FULL).bind(now.as_second()),
            Some(since) => sqlx::query(USER_LIMITS_CHANGED)
                .bind(since.as_second())
                .bind(now.as_second()),
        };

        let rows = query.fetch_all(&self.pool).await?;

        Ok(decode_all(&rows, "user_rate_limits", user_limit_row))
    }

    async fn expired_user_limits(&self, since: Timestamp, now: Timestamp) -> Result<Vec<i64>, DatabaseError> {
        let rows = sqlx::query(USER_LIMITS_EXPIRED)
            .bind(since.as_second())
            .bind(now.as_second())
            .fetch_all(&self.pool)
            .await?;

        Ok(decode_all(&rows, "user_rate_limits", |row| Ok(row.try_get("user_id")?)))
    }

    async fn products(&self, now: Timestamp) -> Result<Vec<ProductRow>, DatabaseError> {
        let rows = sqlx::query(PRODUCTS).bind(now.as_second()).fetch_all(&self.pool).await?;

        Ok(decode_all(&rows, "api_products", product_row))
    }

    async fn weights(&self, now: Timestamp) -> Result<Vec<WeightRow>, DatabaseError> {
        let rows = sqlx::query(WEIGHTS).bind(now.as_second()).fetch_all(&self.pool).await?;

        Ok(decode_all(&rows, "api_weights", weight_row))
    }

    async fn upsert_usage(&self, rows: &[UsageRow]) -> Result<u64, DatabaseError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let hours: Vec<i64> = rows.iter().map(|row| row.hour).collect();
        let user_ids: Vec<i64> = rows.iter().map(|row| row.user_id).collect();
        let api_keys: Vec<String> = rows.iter().map(|row| row.api_key.clone()).collect();
        let routes: Vec<String> = rows.iter().map(|row| row.route.clone()).collect();
        let counts: Vec<i64> = rows.iter().map(|row| row.count).collect();

        let result = sqlx::query(UPSERT_USAGE)
            .bind(hours)
            .bind(user_ids)
            .bind(api_keys)
            .bind(routes)
            .bind(counts)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn materialize_api_keys(&self) -> Result<u64, DatabaseError> {
        let result = sqlx::query(MATERIALIZE_API_KEYS).execute(&self.pool).await?;

        Ok(result.rows_affected())
    }

    async fn maintenance_inputs(&self, now: Timestamp) -> Result<MaintenanceInputs, DatabaseError> {
        let rows = sqlx::query(USERS).fetch_all(&self.pool).await?;
        let users = decode_all(&rows, "users", user_row);

        let rows = sqlx::query(ACTIVE_SUBSCRIPTIONS)
            .bind(now.as_second())
            .fetch_all(&self.pool)
            .await?;
        let subscriptions = decode_all(&rows, "api_subscriptions", subscription_row);

        let rows = sqlx::query(OVERRIDES).fetch_all(&self.pool).await?;
        let overrides = decode_all(&rows, "api_rate_limit_overrides", override_row);

        let current_limits = self.user_limits(None, now).await?;

        Ok(MaintenanceInputs {
            users,
            subscriptions,
            overrides,
            current_limits,
        })
    }

    async fn write_user_limits(&self, limits: &[(i64, RateLimitTier)]) -> Result<u64, DatabaseError> {
        if limits.is_empty() {
            return Ok(0);
        }

        let user_ids: Vec<i64> = limits.iter().map(|(user_id, _)| *user_id).collect();
        let seconds: Vec<i64> = limits.iter().map(|(_, tier)| to_column(tier.second)).collect();
        let hours: Vec<i64> = limits.iter().map(|(_, tier)| to_column(tier.hour)).collect();
        let months: Vec<i64> = limits.iter().map(|(_, tier)| to_column(tier.month)).collect();

        let result = sqlx::query(WRITE_USER_LIMITS)
            .bind(user_ids)
            .bind(seconds)
            .bind(hours)
            .bind(months)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn expire_user_limits(&self, user_ids: &[i64]) -> Result<u64, DatabaseError> {
        if user_ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query(EXPIRE_USER_LIMITS)
            .bind(user_ids)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn invalidate_orphaned_api_keys(&self) -> Result<u64, DatabaseError> {
        let result = sqlx::query(INVALIDATE_ORPHANED_API_KEYS).execute(&self.pool).await?;

        Ok(result.rows_affected())
    }
}
