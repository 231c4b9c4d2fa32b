//! Error types for rate limiting.

use std::time::Duration;

/// Errors returned by the shared counter store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No connection to the store could be obtained.
    #[error("Counter store connection error: {0}")]
    Connection(String),

    /// The store rejected or failed a command.
    #[error("Counter store query error: {0}")]
    Query(String),

    /// The store did not answer in time.
    #[error("Counter store did not answer within {0:?}")]
    Timeout(Duration),
}

/// Errors returned by the durable relational store.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    /// Connection or query failure.
    #[error("Database error: {0}")]
    Query(#[from] sqlx::Error),

    /// A timestamp outside of the representable range.
    #[error("Invalid timestamp {0} in database row")]
    Timestamp(i64),
}

/// Errors that abort one cycle of a background job.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The counter store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The durable store failed.
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Errors raised while building the rate limiting components.
#[derive(Debug, thiserror::Error)]
pub enum RateLimitError {
    /// The counter store could not be set up.
    #[error(transparent)]
    Storage(#[from] StoreError),

    /// The durable store could not be set up.
    #[error(transparent)]
    Database(#[from] DatabaseError),

    /// A configuration value the limiter cannot work with.
    #[error("Invalid rate limit configuration: {0}")]
    InvalidConfig(String),
}
