//! Storage capabilities behind the dead letter queue and the distributed
//! rate limiter.
//!
//! # Dyn Compatibility
//!
//! Both traits return `Pin<Box<dyn Future>>` instead of using `async fn` so
//! that backends can be chosen at runtime from configuration and held as
//! `Arc<dyn DlqStorage>` / `Arc<dyn BucketStore>`.

use crate::dead_letter::{DeadLetterDraft, DeadLetterMessage, MessageId};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Boxed future returned by storage backends.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StorageError>> + Send + 'a>>;

/// Errors raised by storage backends.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Reading or writing the backing file failed
    #[error("I/O error: {0}")]
    Io(String),

    /// A record could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The database rejected or failed the query
    #[error("Database error: {0}")]
    Database(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Durable storage for dead letter messages.
///
/// Implementations must make a record durable before the future returned by
/// [`append`](DlqStorage::append) resolves: a crash right after it returns
/// must not lose the message.
///
/// # Implementations
///
/// - `MemoryStorage` (runtime): process-local, for tests and non-critical paths
/// - `FileStorage` (runtime): JSON-lines append log, fsynced on every write
/// - `PostgresDlqStorage` (postgres): committed rows in a shared database
pub trait DlqStorage: Send + Sync {
    /// Persist a draft and return it with its assigned id.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the record could not be made durable.
    fn append(&self, draft: DeadLetterDraft) -> StorageFuture<'_, DeadLetterMessage>;

    /// All live messages, ordered by id (oldest first).
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the backend could not be read.
    fn list(&self) -> StorageFuture<'_, Vec<DeadLetterMessage>>;

    /// Remove the given ids, returning how many were present.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the removal could not be made durable.
    fn remove(&self, ids: Vec<MessageId>) -> StorageFuture<'_, usize>;

    /// One message by id.
    ///
    /// The default scans [`list`](DlqStorage::list); indexed backends override it.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the backend could not be read.
    fn get(&self, id: MessageId) -> StorageFuture<'_, Option<DeadLetterMessage>> {
        Box::pin(async move {
            let messages = self.list().await?;
            Ok(messages.into_iter().find(|message| message.id == id))
        })
    }

    /// Number of live messages.
    ///
    /// The default scans [`list`](DlqStorage::list); indexed backends override it.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the backend could not be read.
    fn count(&self) -> StorageFuture<'_, usize> {
        Box::pin(async move { Ok(self.list().await?.len()) })
    }
}

/// Shape of a token bucket as seen by a shared store.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketSpec {
    /// Maximum tokens (steady rate plus burst)
    pub capacity: f64,
    /// Tokens added per second
    pub refill_rate: f64,
}

/// Result of one atomic refill-and-consume.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConsumeOutcome {
    /// Whether the requested tokens were taken
    pub allowed: bool,
    /// Tokens left after the operation
    pub remaining: f64,
}

/// Shared token store for rate limiting across processes.
///
/// [`try_consume`](BucketStore::try_consume) must perform refill and
/// consumption as a single atomic read-modify-write on the store side.
/// Reading the bucket, computing locally and writing back would let two
/// processes spend the same token.
pub trait BucketStore: Send + Sync {
    /// Refill the bucket for `key` and take `tokens` if available.
    ///
    /// A bucket seen for the first time starts full.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the store could not be reached.
    fn try_consume<'a>(
        &'a self,
        key: &'a str,
        spec: BucketSpec,
        tokens: f64,
    ) -> StorageFuture<'a, ConsumeOutcome>;
}
