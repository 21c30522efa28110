//! Shared token buckets in `PostgreSQL`.
//!
//! Refill and consumption happen in one `INSERT ... ON CONFLICT DO UPDATE`.
//! The conflicting row is locked for the duration of the statement and every
//! `SET` expression reads the pre-update row, so two processes racing on one
//! key are serialized by the database and cannot both spend the last token.
//!
//! A key seen for the first time starts with a full bucket.

use crate::database_error;
use bulwark_core::{BucketSpec, BucketStore, ConsumeOutcome, StorageError, StorageFuture};
use sqlx::PgPool;

/// Schema for the bucket table.
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS rate_limit_buckets (
    key TEXT PRIMARY KEY,
    tokens DOUBLE PRECISION NOT NULL,
    allowed BOOLEAN NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
)
";

// $1 key, $2 capacity, $3 refill per second, $4 tokens requested
const CONSUME: &str = r"
INSERT INTO rate_limit_buckets AS b (key, tokens, allowed, updated_at)
VALUES (
    $1,
    CASE WHEN $2::float8 >= $4::float8 THEN $2::float8 - $4::float8 ELSE $2::float8 END,
    $2::float8 >= $4::float8,
    clock_timestamp()
)
ON CONFLICT (key) DO UPDATE SET
    allowed = LEAST(
        $2::float8,
        b.tokens + GREATEST(EXTRACT(EPOCH FROM (clock_timestamp() - b.updated_at))::float8, 0) * $3::float8
    ) >= $4::float8,
    tokens = LEAST(
        $2::float8,
        b.tokens + GREATEST(EXTRACT(EPOCH FROM (clock_timestamp() - b.updated_at))::float8, 0) * $3::float8
    ) - CASE
        WHEN LEAST(
            $2::float8,
            b.tokens + GREATEST(EXTRACT(EPOCH FROM (clock_timestamp() - b.updated_at))::float8, 0) * $3::float8
        ) >= $4::float8 THEN $4::float8
        ELSE 0
    END,
    updated_at = GREATEST(b.updated_at, clock_timestamp())
RETURNING allowed, tokens
";

/// [`BucketStore`] backed by a `PostgreSQL` table.
#[derive(Debug, Clone)]
pub struct PostgresBucketStore {
    pool: PgPool,
}

impl PostgresBucketStore {
    /// Use an existing connection pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to `database_url`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Database`] if the connection fails.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| database_error(&e))?;
        Ok(Self::new(pool))
    }

    /// Create the bucket table if missing.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Database`] if the DDL fails.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::query(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| database_error(&e))?;
        Ok(())
    }

    /// Forget `key`; its next request starts with a full bucket.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Database`] if the delete fails.
    pub async fn reset(&self, key: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM rate_limit_buckets WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| database_error(&e))?;
        Ok(())
    }
}

impl BucketStore for PostgresBucketStore {
    fn try_consume<'a>(
        &'a self,
        key: &'a str,
        spec: BucketSpec,
        tokens: f64,
    ) -> StorageFuture<'a, ConsumeOutcome> {
        Box::pin(async move {
            let (allowed, remaining): (bool, f64) = sqlx::query_as(CONSUME)
                .bind(key)
                .bind(spec.capacity)
                .bind(spec.refill_rate)
                .bind(tokens)
                .fetch_one(&self.pool)
                .await
                .map_err(|e| database_error(&e))?;

            tracing::trace!(key, allowed, remaining, "Shared bucket consumed");
            Ok(ConsumeOutcome {
                allowed,
                remaining: remaining.max(0.0),
            })
        })
    }
}
