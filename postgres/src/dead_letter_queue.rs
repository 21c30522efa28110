//! Dead letter storage in `PostgreSQL`.
//!
//! Messages live in one `dead_letters` table. Ids come from a `BIGSERIAL`
//! sequence, so they are monotonic across every process sharing the table
//! and never reused after a delete.

use crate::database_error;
use bulwark_core::{
    DeadLetterDraft, DeadLetterMessage, DlqStorage, FailureClass, Metadata, MessageId,
    StorageError, StorageFuture,
};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

/// Schema for the dead letter table.
pub const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS dead_letters (
    id BIGSERIAL PRIMARY KEY,
    payload JSONB NOT NULL,
    reason TEXT NOT NULL,
    class TEXT NOT NULL,
    metadata JSONB NOT NULL DEFAULT '{}'::jsonb,
    source TEXT,
    created_at TIMESTAMPTZ NOT NULL,
    attempt_count INTEGER NOT NULL
)
";

const INDEX: &str = "CREATE INDEX IF NOT EXISTS idx_dead_letters_created ON dead_letters(created_at)";

const COLUMNS: &str = "id, payload, reason, class, metadata, source, created_at, attempt_count";

/// [`DlqStorage`] backed by a `PostgreSQL` table.
///
/// # Example
///
/// ```no_run
/// use bulwark_postgres::PostgresDlqStorage;
///
/// # async fn example(pool: sqlx::PgPool) -> Result<(), Box<dyn std::error::Error>> {
/// let storage = PostgresDlqStorage::new(pool);
/// storage.migrate().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct PostgresDlqStorage {
    pool: PgPool,
}

impl PostgresDlqStorage {
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

    /// Underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the table and index if missing.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Database`] if the DDL fails.
    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::query(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| database_error(&e))?;
        sqlx::query(INDEX)
            .execute(&self.pool)
            .await
            .map_err(|e| database_error(&e))?;
        Ok(())
    }

    fn row_to_message(row: &PgRow) -> Result<DeadLetterMessage, StorageError> {
        let id: i64 = row.try_get("id").map_err(|e| database_error(&e))?;
        let class: String = row.try_get("class").map_err(|e| database_error(&e))?;
        let metadata: serde_json::Value = row.try_get("metadata").map_err(|e| database_error(&e))?;
        let attempt_count: i32 = row.try_get("attempt_count").map_err(|e| database_error(&e))?;
        let created_at: DateTime<Utc> = row.try_get("created_at").map_err(|e| database_error(&e))?;

        Ok(DeadLetterMessage {
            id: MessageId::new(
                u64::try_from(id)
                    .map_err(|_| StorageError::Database(format!("Negative dead letter id: {id}")))?,
            ),
            payload: row.try_get("payload").map_err(|e| database_error(&e))?,
            reason: row.try_get("reason").map_err(|e| database_error(&e))?,
            class: FailureClass::parse(&class)
                .ok_or_else(|| StorageError::Database(format!("Invalid failure class: {class}")))?,
            metadata: serde_json::from_value::<Metadata>(metadata)?,
            source: row.try_get("source").map_err(|e| database_error(&e))?,
            created_at,
            attempt_count: u32::try_from(attempt_count).unwrap_or(0),
        })
    }
}

fn to_db_id(id: MessageId) -> Result<i64, StorageError> {
    i64::try_from(id.value())
        .map_err(|_| StorageError::Database(format!("Dead letter id out of range: {id}")))
}

impl DlqStorage for PostgresDlqStorage {
    fn append(&self, draft: DeadLetterDraft) -> StorageFuture<'_, DeadLetterMessage> {
        Box::pin(async move {
            let metadata = serde_json::to_value(&draft.metadata)?;
            let attempt_count = i32::try_from(draft.attempt_count).unwrap_or(i32::MAX);

            let (id,): (i64,) = sqlx::query_as(
                r"
                INSERT INTO dead_letters (
                    payload, reason, class, metadata, source, created_at, attempt_count
                ) VALUES ($1, $2, $3, $4, $5, $6, $7)
                RETURNING id
                ",
            )
            .bind(&draft.payload)
            .bind(&draft.reason)
            .bind(draft.class.as_str())
            .bind(&metadata)
            .bind(draft.source.as_deref())
            .bind(draft.created_at)
            .bind(attempt_count)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| database_error(&e))?;

            let id = u64::try_from(id)
                .map_err(|_| StorageError::Database(format!("Negative dead letter id: {id}")))?;
            tracing::debug!(dlq_id = id, "Dead letter row inserted");
            Ok(DeadLetterMessage::from_draft(MessageId::new(id), draft))
        })
    }

    fn list(&self) -> StorageFuture<'_, Vec<DeadLetterMessage>> {
        Box::pin(async move {
            let rows = sqlx::query(&format!("SELECT {COLUMNS} FROM dead_letters ORDER BY id ASC"))
                .fetch_all(&self.pool)
                .await
                .map_err(|e| database_error(&e))?;
            rows.iter().map(Self::row_to_message).collect()
        })
    }

    fn remove(&self, ids: Vec<MessageId>) -> StorageFuture<'_, usize> {
        Box::pin(async move {
            if ids.is_empty() {
                return Ok(0);
            }
            let ids = ids
                .into_iter()
                .map(to_db_id)
                .collect::<Result<Vec<i64>, _>>()?;

            let result = sqlx::query("DELETE FROM dead_letters WHERE id = ANY($1)")
                .bind(&ids)
                .execute(&self.pool)
                .await
                .map_err(|e| database_error(&e))?;
            Ok(usize::try_from(result.rows_affected()).unwrap_or(usize::MAX))
        })
    }

    fn get(&self, id: MessageId) -> StorageFuture<'_, Option<DeadLetterMessage>> {
        Box::pin(async move {
            let row = sqlx::query(&format!("SELECT {COLUMNS} FROM dead_letters WHERE id = $1"))
                .bind(to_db_id(id)?)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| database_error(&e))?;
            row.as_ref().map(Self::row_to_message).transpose()
        })
    }

    fn count(&self) -> StorageFuture<'_, usize> {
        Box::pin(async move {
            let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM dead_letters")
                .fetch_one(&self.pool)
                .await
                .map_err(|e| database_error(&e))?;
            Ok(usize::try_from(count).unwrap_or(0))
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    #[test]
    fn ids_beyond_bigint_are_rejected() {
        assert!(to_db_id(MessageId::new(u64::MAX)).is_err());
        assert_eq!(to_db_id(MessageId::new(42)).unwrap(), 42);
    }

    #[test]
    fn schema_creates_bigserial_table() {
        assert!(SCHEMA.contains("id BIGSERIAL PRIMARY KEY"));
        assert!(SCHEMA.contains("IF NOT EXISTS"));
    }
}
