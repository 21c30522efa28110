//! `PostgreSQL` backends for Bulwark.
//!
//! This crate provides the storage capabilities from `bulwark-core` on top of
//! a shared `PostgreSQL` database, so several processes can use one dead
//! letter queue and one set of rate limit buckets:
//!
//! - [`PostgresDlqStorage`]: dead letters in a `BIGSERIAL`-keyed table; a
//!   message is durable once the `INSERT` commits
//! - [`PostgresBucketStore`]: token buckets refilled and consumed by a single
//!   upsert, so concurrent processes never double-spend a token
//!
//! Both stores can create their own tables with `migrate()`.
//!
//! # Example
//!
//! ```no_run
//! use bulwark_postgres::PostgresDlqStorage;
//! use bulwark_runtime::DeadLetterQueue;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = PostgresDlqStorage::connect("postgres://localhost/app").await?;
//! storage.migrate().await?;
//!
//! let dlq = DeadLetterQueue::new(Arc::new(storage));
//! println!("queued: {}", dlq.size().await?);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod dead_letter_queue;
pub mod rate_limiter;

pub use dead_letter_queue::PostgresDlqStorage;
pub use rate_limiter::PostgresBucketStore;

use bulwark_core::{DlqStorage, StorageError};
use bulwark_runtime::{DeadLetterQueue, DlqBackend, DlqError};
use std::sync::Arc;

pub(crate) fn database_error(e: &sqlx::Error) -> StorageError {
    StorageError::Database(e.to_string())
}

/// Open any configured dead letter backend, including `postgres`.
///
/// Memory and file backends are delegated to
/// [`DeadLetterQueue::open_storage`]. The postgres table is created if it
/// does not exist yet.
///
/// # Errors
///
/// Returns [`DlqError::Storage`] if the backend cannot be opened.
pub async fn open_storage(backend: &DlqBackend) -> Result<Arc<dyn DlqStorage>, DlqError> {
    match backend {
        DlqBackend::Postgres { url } => {
            let storage = PostgresDlqStorage::connect(url).await?;
            storage.migrate().await?;
            Ok(Arc::new(storage))
        }
        other => DeadLetterQueue::open_storage(other).await,
    }
}
