//! Dead letter queue for terminal failures.
//!
//! The queue stores operations that could not be completed so they can be
//! inspected, replayed, archived or purged later. Messages pass through a
//! pluggable [`DlqStorage`] backend chosen at construction time:
//!
//! - [`MemoryStorage`]: process-local
//! - [`FileStorage`]: fsynced JSON-lines log
//! - `bulwark_postgres::PostgresDlqStorage`: shared `PostgreSQL` table
//!
//! The caller classifies every failure as [`FailureClass::Transient`] (safe to
//! replay automatically) or [`FailureClass::Permanent`] (needs a human). The
//! queue never infers the class on its own; [`replay_all`](DeadLetterQueue::replay_all)
//! only touches transient messages.
//!
//! # Example
//!
//! ```
//! use bulwark_runtime::dead_letter_queue::{DeadLetterQueue, MemoryStorage, MessageFilter, PageRequest};
//! use bulwark_core::Metadata;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let dlq = DeadLetterQueue::new(Arc::new(MemoryStorage::new()));
//!
//! let id = dlq
//!     .send(&serde_json::json!({"order_id": "ORD-1"}), "card declined", Metadata::new())
//!     .await?;
//!
//! let page = dlq.get_messages(&MessageFilter::default(), PageRequest::first(10)).await?;
//! assert_eq!(page.messages.len(), 1);
//! assert_eq!(page.messages[0].id, id);
//! # Ok(())
//! # }
//! ```

mod file;
mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

use crate::config::DlqBackend;
use crate::metrics::DeadLetterMetrics;
use bulwark_core::environment::{Clock, SystemClock};
use bulwark_core::{
    DeadLetterDraft, DeadLetterMessage, DlqStorage, FailureClass, Metadata, MessageId,
    ResilienceError, StorageError,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

/// Default retention for `purge_expired`: seven days.
pub const DEFAULT_RETENTION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Errors from queue management operations.
#[derive(Error, Debug)]
pub enum DlqError {
    /// Storage backend failure
    #[error("Dead letter storage error: {0}")]
    Storage(#[from] StorageError),

    /// No message with this id
    #[error("Dead letter message not found: {0}")]
    NotFound(MessageId),

    /// The payload could not be converted to JSON
    #[error("Dead letter payload is not serializable: {0}")]
    Payload(String),

    /// `archive` was called on a queue without archive storage
    #[error("No archive storage configured")]
    NoArchive,

    /// The configured backend must be constructed by its own crate
    #[error("The {0} backend is provided by its own crate")]
    UnsupportedBackend(&'static str),
}

/// Predicate over stored messages. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageFilter {
    /// Case-insensitive substring of `reason`
    pub reason_contains: Option<String>,
    /// Exact source
    pub source: Option<String>,
    /// Exact failure class
    pub class: Option<FailureClass>,
    /// Every entry must be present with an equal value
    pub metadata: Metadata,
    /// Created strictly after
    pub created_after: Option<DateTime<Utc>>,
    /// Created at or before
    pub created_before: Option<DateTime<Utc>>,
}

impl MessageFilter {
    /// Match only `class`.
    #[must_use]
    pub fn class(class: FailureClass) -> Self {
        Self {
            class: Some(class),
            ..Self::default()
        }
    }

    /// Restrict to reasons containing `needle`.
    #[must_use]
    pub fn with_reason(mut self, needle: impl Into<String>) -> Self {
        self.reason_contains = Some(needle.into());
        self
    }

    /// Restrict to one source.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Require a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Does `message` satisfy every set field?
    #[must_use]
    pub fn matches(&self, message: &DeadLetterMessage) -> bool {
        self.reason_contains.as_ref().is_none_or(|needle| {
            message
                .reason
                .to_lowercase()
                .contains(&needle.to_lowercase())
        }) && self
            .source
            .as_ref()
            .is_none_or(|source| message.source.as_ref() == Some(source))
            && self.class.is_none_or(|class| message.class == class)
            && self
                .metadata
                .iter()
                .all(|(key, value)| message.metadata.get(key) == Some(value))
            && self
                .created_after
                .is_none_or(|after| message.created_at > after)
            && self
                .created_before
                .is_none_or(|before| message.created_at <= before)
    }
}

/// Cursor-based page selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    /// Return messages with ids strictly greater than this
    pub after: Option<MessageId>,
    /// Maximum messages per page
    pub limit: usize,
}

impl PageRequest {
    /// First page of `limit` messages.
    #[must_use]
    pub const fn first(limit: usize) -> Self {
        Self { after: None, limit }
    }

    /// Page following `after`.
    #[must_use]
    pub const fn after(after: MessageId, limit: usize) -> Self {
        Self {
            after: Some(after),
            limit,
        }
    }
}

/// One page of messages in id order.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    /// Messages on this page
    pub messages: Vec<DeadLetterMessage>,
    /// Cursor for the next page, `None` when this was the last
    pub next: Option<MessageId>,
}

/// A failed replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayAttempt {
    /// Message that was replayed
    pub message_id: MessageId,
    /// 1-based replay attempt number for this message
    pub attempt: u32,
    /// When the attempt ran
    pub at: DateTime<Utc>,
    /// Handler error
    pub error: String,
}

/// Result of a single replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// The handler succeeded and the message was removed
    Acknowledged,
    /// The handler failed; the message stays queued
    Failed(ReplayAttempt),
}

impl ReplayOutcome {
    /// Was the message acknowledged?
    #[must_use]
    pub const fn is_acknowledged(&self) -> bool {
        matches!(self, Self::Acknowledged)
    }
}

/// Totals from `replay_all`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    /// Transient messages the handler was run for
    pub attempted: usize,
    /// Attempts that succeeded
    pub acknowledged: usize,
    /// Attempts that failed
    pub failed: usize,
    /// Permanent messages left alone
    pub skipped: usize,
}

/// Queue snapshot for dashboards.
#[derive(Debug, Clone, PartialEq)]
pub struct DlqStats {
    /// Messages currently queued
    pub size: usize,
    /// Age of the oldest queued message
    pub oldest_message_age: Option<Duration>,
    /// Count per reason
    pub by_reason: BTreeMap<String, usize>,
    /// Count per source; messages without a source are keyed `"unknown"`
    pub by_source: BTreeMap<String, usize>,
    /// Count per failure class
    pub by_class: BTreeMap<&'static str, usize>,
    /// Messages created within the last hour
    pub last_hour: usize,
    /// Lifetime messages sent through this queue
    pub total_sent: u64,
    /// Lifetime successful replays
    pub total_replayed: u64,
    /// Lifetime archived messages
    pub total_archived: u64,
    /// Lifetime purged messages
    pub total_purged: u64,
}

#[derive(Debug, Default)]
struct Totals {
    sent: AtomicU64,
    replayed: AtomicU64,
    archived: AtomicU64,
    purged: AtomicU64,
}

/// Dead letter queue over a [`DlqStorage`] backend.
pub struct DeadLetterQueue {
    storage: Arc<dyn DlqStorage>,
    archive: Option<Arc<dyn DlqStorage>>,
    clock: Arc<dyn Clock>,
    retention: Duration,
    alert_threshold: Option<usize>,
    history: Mutex<HashMap<MessageId, Vec<ReplayAttempt>>>,
    totals: Totals,
}

impl fmt::Debug for DeadLetterQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadLetterQueue")
            .field("retention", &self.retention)
            .field("alert_threshold", &self.alert_threshold)
            .field("has_archive", &self.archive.is_some())
            .finish_non_exhaustive()
    }
}

impl DeadLetterQueue {
    /// Create a queue over `storage` with the system clock and default retention.
    #[must_use]
    pub fn new(storage: Arc<dyn DlqStorage>) -> Self {
        Self {
            storage,
            archive: None,
            clock: Arc::new(SystemClock),
            retention: DEFAULT_RETENTION,
            alert_threshold: None,
            history: Mutex::new(HashMap::new()),
            totals: Totals::default(),
        }
    }

    /// Open the storage backend described by configuration.
    ///
    /// # Errors
    ///
    /// Returns [`DlqError::Storage`] if the file backend cannot be opened and
    /// [`DlqError::UnsupportedBackend`] for `postgres`, which is constructed
    /// through `bulwark-postgres`.
    pub async fn open_storage(backend: &DlqBackend) -> Result<Arc<dyn DlqStorage>, DlqError> {
        match backend {
            DlqBackend::Memory => Ok(Arc::new(MemoryStorage::new())),
            DlqBackend::File { path } => Ok(Arc::new(FileStorage::open(path).await?)),
            DlqBackend::Postgres { .. } => Err(DlqError::UnsupportedBackend("postgres")),
        }
    }

    /// Use `clock` for timestamps and retention.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set retention used by [`purge_expired`](Self::purge_expired).
    #[must_use]
    pub const fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Warn once the queue reaches `threshold` messages.
    #[must_use]
    pub const fn with_alert_threshold(mut self, threshold: usize) -> Self {
        self.alert_threshold = Some(threshold);
        self
    }

    /// Store archived messages in `archive`.
    #[must_use]
    pub fn with_archive(mut self, archive: Arc<dyn DlqStorage>) -> Self {
        self.archive = Some(archive);
        self
    }

    /// Configured retention.
    #[must_use]
    pub const fn retention(&self) -> Duration {
        self.retention
    }

    // ========== Intake ==========

    /// Dead-letter `payload` as a permanent failure.
    ///
    /// Returns once the backend has made the message durable.
    ///
    /// # Errors
    ///
    /// Returns [`DlqError::Payload`] if `payload` does not serialize and
    /// [`DlqError::Storage`] if the backend rejects the write.
    pub async fn send<P>(
        &self,
        payload: &P,
        reason: impl Into<String>,
        metadata: Metadata,
    ) -> Result<MessageId, DlqError>
    where
        P: Serialize + ?Sized,
    {
        let payload = serde_json::to_value(payload).map_err(|e| DlqError::Payload(e.to_string()))?;
        let draft = DeadLetterDraft::new(payload, reason, self.clock.now()).with_metadata_map(metadata);
        Ok(self.send_draft(draft).await?)
    }

    /// Dead-letter a fully described draft.
    ///
    /// # Errors
    ///
    /// Returns the backend's [`StorageError`].
    pub async fn send_draft(&self, draft: DeadLetterDraft) -> Result<MessageId, StorageError> {
        let message = match self.storage.append(draft).await {
            Ok(message) => message,
            Err(e) => {
                DeadLetterMetrics::record_storage_error();
                tracing::error!(error = %e, "Failed to persist dead letter");
                return Err(e);
            }
        };

        self.totals.sent.fetch_add(1, Ordering::Relaxed);
        DeadLetterMetrics::record_sent();
        tracing::warn!(
            dlq_id = %message.id,
            reason = %message.reason,
            class = message.class.as_str(),
            source = message.source.as_deref().unwrap_or("unknown"),
            attempts = message.attempt_count,
            "Message sent to dead letter queue"
        );

        self.check_alert().await;
        Ok(message.id)
    }

    /// Route a terminal pipeline failure into the queue.
    ///
    /// `Permanent` and `RetriesExhausted` errors are stored with the error's
    /// display text as reason, its failure class and attempt count, and are
    /// handed back unchanged. Every other error is returned untouched
    /// without a write. If the write fails the caller receives
    /// [`ResilienceError::DeadLetterFailed`] carrying both errors.
    pub async fn dead_letter<E, P>(
        &self,
        payload: &P,
        error: ResilienceError<E>,
        source: Option<&str>,
        metadata: Metadata,
    ) -> ResilienceError<E>
    where
        E: fmt::Display,
        P: Serialize + ?Sized,
    {
        match serde_json::to_value(payload) {
            Ok(payload) => self.dead_letter_value(payload, error, source, metadata).await,
            Err(e) => ResilienceError::DeadLetterFailed {
                error: Box::new(error),
                storage: StorageError::Serialization(e.to_string()),
            },
        }
    }

    /// [`dead_letter`](Self::dead_letter) for an already serialized payload.
    pub async fn dead_letter_value<E>(
        &self,
        payload: serde_json::Value,
        error: ResilienceError<E>,
        source: Option<&str>,
        metadata: Metadata,
    ) -> ResilienceError<E>
    where
        E: fmt::Display,
    {
        let attempts = match &error {
            ResilienceError::Permanent(_) => 1,
            ResilienceError::RetriesExhausted { attempts, .. } => *attempts,
            _ => return error,
        };
        let class = error.failure_class().unwrap_or(FailureClass::Permanent);

        let mut draft = DeadLetterDraft::new(payload, error.to_string(), self.clock.now())
            .with_class(class)
            .with_attempt_count(attempts)
            .with_metadata_map(metadata);
        if let Some(source) = source {
            draft = draft.with_source(source);
        }

        match self.send_draft(draft).await {
            Ok(_) => error,
            Err(storage) => ResilienceError::DeadLetterFailed {
                error: Box::new(error),
                storage,
            },
        }
    }

    // ========== Inspection ==========

    /// Look up one message.
    ///
    /// # Errors
    ///
    /// Returns the backend's [`StorageError`].
    pub async fn get_message(&self, id: MessageId) -> Result<Option<DeadLetterMessage>, StorageError> {
        self.storage.get(id).await
    }

    /// One page of messages matching `filter`, in id order.
    ///
    /// Pages are computed from a fresh listing on every call; messages
    /// removed between calls simply disappear from later pages.
    ///
    /// # Errors
    ///
    /// Returns the backend's [`StorageError`].
    pub async fn get_messages(
        &self,
        filter: &MessageFilter,
        page: PageRequest,
    ) -> Result<Page, StorageError> {
        let mut matching = self
            .storage
            .list()
            .await?
            .into_iter()
            .filter(|message| page.after.is_none_or(|after| message.id > after))
            .filter(|message| filter.matches(message));

        let messages: Vec<DeadLetterMessage> = matching.by_ref().take(page.limit).collect();
        let next = if matching.next().is_some() {
            messages.last().map(|message| message.id)
        } else {
            None
        };
        Ok(Page { messages, next })
    }

    /// Number of messages matching `filter`.
    ///
    /// # Errors
    ///
    /// Returns the backend's [`StorageError`].
    pub async fn count(&self, filter: &MessageFilter) -> Result<usize, StorageError> {
        if *filter == MessageFilter::default() {
            return self.storage.count().await;
        }
        Ok(self
            .storage
            .list()
            .await?
            .iter()
            .filter(|message| filter.matches(message))
            .count())
    }

    /// Failed replays recorded for `id`, oldest first.
    #[must_use]
    pub fn replay_history(&self, id: MessageId) -> Vec<ReplayAttempt> {
        self.history
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    // ========== Replay ==========

    /// Re-submit one message to `handler`.
    ///
    /// The message is removed only if the handler succeeds. A failure is
    /// recorded in [`replay_history`](Self::replay_history) and the message
    /// stays queued.
    ///
    /// # Errors
    ///
    /// Returns [`DlqError::NotFound`] for an unknown id and
    /// [`DlqError::Storage`] if the backend fails.
    pub async fn replay<F, Fut, E>(&self, id: MessageId, handler: F) -> Result<ReplayOutcome, DlqError>
    where
        F: FnOnce(DeadLetterMessage) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: fmt::Display,
    {
        let message = self.storage.get(id).await?.ok_or(DlqError::NotFound(id))?;
        self.replay_message(message, handler).await
    }

    /// Replay every transient message matching `filter`, in id order.
    ///
    /// Permanent messages are counted as skipped and left queued.
    ///
    /// # Errors
    ///
    /// Returns [`DlqError::Storage`] if the backend fails; replays already
    /// completed stay acknowledged.
    pub async fn replay_all<F, Fut, E>(
        &self,
        filter: &MessageFilter,
        mut handler: F,
    ) -> Result<ReplaySummary, DlqError>
    where
        F: FnMut(DeadLetterMessage) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: fmt::Display,
    {
        let mut summary = ReplaySummary::default();
        let candidates: Vec<DeadLetterMessage> = self
            .storage
            .list()
            .await?
            .into_iter()
            .filter(|message| filter.matches(message))
            .collect();

        for message in candidates {
            if message.class == FailureClass::Permanent {
                summary.skipped += 1;
                continue;
            }
            summary.attempted += 1;
            if self.replay_message(message, &mut handler).await?.is_acknowledged() {
                summary.acknowledged += 1;
            } else {
                summary.failed += 1;
            }
        }

        tracing::info!(
            attempted = summary.attempted,
            acknowledged = summary.acknowledged,
            failed = summary.failed,
            skipped = summary.skipped,
            "Dead letter replay finished"
        );
        Ok(summary)
    }

    async fn replay_message<F, Fut, E>(
        &self,
        message: DeadLetterMessage,
        handler: F,
    ) -> Result<ReplayOutcome, DlqError>
    where
        F: FnOnce(DeadLetterMessage) -> Fut,
        Fut: Future<Output = Result<(), E>>,
        E: fmt::Display,
    {
        let id = message.id;
        match handler(message).await {
            Ok(()) => {
                self.storage.remove(vec![id]).await?;
                self.history
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(&id);
                self.totals.replayed.fetch_add(1, Ordering::Relaxed);
                DeadLetterMetrics::record_replay(true);
                tracing::info!(dlq_id = %id, "Dead letter replayed");
                Ok(ReplayOutcome::Acknowledged)
            }
            Err(e) => {
                let attempt = {
                    let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
                    let attempts = history.entry(id).or_default();
                    let attempt = ReplayAttempt {
                        message_id: id,
                        attempt: u32::try_from(attempts.len() + 1).unwrap_or(u32::MAX),
                        at: self.clock.now(),
                        error: e.to_string(),
                    };
                    attempts.push(attempt.clone());
                    attempt
                };
                DeadLetterMetrics::record_replay(false);
                tracing::warn!(
                    dlq_id = %id,
                    attempt = attempt.attempt,
                    error = %attempt.error,
                    "Dead letter replay failed"
                );
                Ok(ReplayOutcome::Failed(attempt))
            }
        }
    }

    // ========== Removal ==========

    /// Remove a message that was handled out of band.
    ///
    /// Returns `false` if the id was not queued.
    ///
    /// # Errors
    ///
    /// Returns the backend's [`StorageError`].
    pub async fn acknowledge(&self, id: MessageId) -> Result<bool, StorageError> {
        let removed = self.storage.remove(vec![id]).await? > 0;
        if removed {
            self.forget(&[id]);
            tracing::info!(dlq_id = %id, "Dead letter acknowledged");
        }
        Ok(removed)
    }

    /// Move a message into archive storage.
    ///
    /// The archive copy is written first, so a crash in between leaves the
    /// message in both stores rather than neither.
    ///
    /// # Errors
    ///
    /// Returns [`DlqError::NoArchive`] without archive storage,
    /// [`DlqError::NotFound`] for an unknown id, or [`DlqError::Storage`].
    pub async fn archive(&self, id: MessageId) -> Result<MessageId, DlqError> {
        let archive = self.archive.as_ref().ok_or(DlqError::NoArchive)?;
        let message = self.storage.get(id).await?.ok_or(DlqError::NotFound(id))?;

        let draft = DeadLetterDraft::new(message.payload, message.reason, message.created_at)
            .with_class(message.class)
            .with_attempt_count(message.attempt_count)
            .with_metadata_map(message.metadata)
            .with_metadata("archived_from", id.value());
        let draft = match message.source {
            Some(source) => draft.with_source(source),
            None => draft,
        };
        let archived = archive.append(draft).await?;
        self.storage.remove(vec![id]).await?;
        self.forget(&[id]);

        self.totals.archived.fetch_add(1, Ordering::Relaxed);
        DeadLetterMetrics::record_archived(1);
        tracing::info!(dlq_id = %id, archive_id = %archived.id, "Dead letter archived");
        Ok(archived.id)
    }

    /// Remove messages created at least `older_than` ago.
    ///
    /// `purge(Duration::ZERO)` empties the queue.
    ///
    /// # Errors
    ///
    /// Returns the backend's [`StorageError`].
    pub async fn purge(&self, older_than: Duration) -> Result<usize, StorageError> {
        let cutoff = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| self.clock.now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let expired: Vec<MessageId> = self
            .storage
            .list()
            .await?
            .into_iter()
            .filter(|message| message.created_at <= cutoff)
            .map(|message| message.id)
            .collect();
        if expired.is_empty() {
            return Ok(0);
        }

        let purged = self.storage.remove(expired.clone()).await?;
        self.forget(&expired);
        self.totals.purged.fetch_add(purged as u64, Ordering::Relaxed);
        DeadLetterMetrics::record_purged(purged);
        tracing::info!(purged, ?older_than, "Purged dead letters");
        Ok(purged)
    }

    /// Purge messages older than the configured retention.
    ///
    /// # Errors
    ///
    /// Returns the backend's [`StorageError`].
    pub async fn purge_expired(&self) -> Result<usize, StorageError> {
        self.purge(self.retention).await
    }

    fn forget(&self, ids: &[MessageId]) {
        let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
        for id in ids {
            history.remove(id);
        }
    }

    // ========== Monitoring ==========

    /// Messages currently queued.
    ///
    /// # Errors
    ///
    /// Returns the backend's [`StorageError`].
    pub async fn size(&self) -> Result<usize, StorageError> {
        self.storage.count().await
    }

    /// Age of the oldest queued message, `None` when empty.
    ///
    /// # Errors
    ///
    /// Returns the backend's [`StorageError`].
    pub async fn oldest_message_age(&self) -> Result<Option<Duration>, StorageError> {
        let messages = self.storage.list().await?;
        Ok(self.oldest_age(&messages))
    }

    fn oldest_age(&self, messages: &[DeadLetterMessage]) -> Option<Duration> {
        let now = self.clock.now();
        messages
            .iter()
            .map(|message| message.created_at)
            .min()
            .map(|oldest| (now - oldest).to_std().unwrap_or(Duration::ZERO))
    }

    /// Snapshot of queue contents and lifetime totals.
    ///
    /// # Errors
    ///
    /// Returns the backend's [`StorageError`].
    pub async fn stats(&self) -> Result<DlqStats, StorageError> {
        let messages = self.storage.list().await?;
        let hour_ago = self.clock.now() - chrono::Duration::hours(1);

        let mut by_reason = BTreeMap::new();
        let mut by_source = BTreeMap::new();
        let mut by_class = BTreeMap::new();
        let mut last_hour = 0;
        for message in &messages {
            *by_reason.entry(message.reason.clone()).or_insert(0) += 1;
            *by_source
                .entry(message.source.clone().unwrap_or_else(|| "unknown".to_string()))
                .or_insert(0) += 1;
            *by_class.entry(message.class.as_str()).or_insert(0) += 1;
            if message.created_at > hour_ago {
                last_hour += 1;
            }
        }

        DeadLetterMetrics::record_size(messages.len());
        Ok(DlqStats {
            size: messages.len(),
            oldest_message_age: self.oldest_age(&messages),
            by_reason,
            by_source,
            by_class,
            last_hour,
            total_sent: self.totals.sent.load(Ordering::Relaxed),
            total_replayed: self.totals.replayed.load(Ordering::Relaxed),
            total_archived: self.totals.archived.load(Ordering::Relaxed),
            total_purged: self.totals.purged.load(Ordering::Relaxed),
        })
    }

    async fn check_alert(&self) {
        let size = match self.storage.count().await {
            Ok(size) => size,
            Err(e) => {
                tracing::debug!(error = %e, "Could not read dead letter queue size");
                return;
            }
        };
        DeadLetterMetrics::record_size(size);
        if let Some(threshold) = self.alert_threshold {
            if size >= threshold {
                tracing::warn!(size, threshold, "Dead letter queue size reached alert threshold");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use bulwark_testing::{ManualClock, test_clock, test_time};
    use serde_json::json;

    fn queue() -> DeadLetterQueue {
        DeadLetterQueue::new(Arc::new(MemoryStorage::new()))
    }

    #[tokio::test]
    async fn test_send_then_get_messages_returns_record() {
        let dlq = queue();
        let id = dlq.send(&json!({"n": 1}), "X", Metadata::new()).await.unwrap();

        let page = dlq
            .get_messages(&MessageFilter::default(), PageRequest::first(10))
            .await
            .unwrap();

        assert_eq!(page.messages.len(), 1);
        assert_eq!(page.messages[0].id, id);
        assert_eq!(page.messages[0].reason, "X");
        assert_eq!(page.messages[0].class, FailureClass::Permanent);
        assert_eq!(page.next, None);
    }

    #[tokio::test]
    async fn test_pagination_cursor() {
        let dlq = queue();
        for n in 0..5 {
            dlq.send(&n, "boom", Metadata::new()).await.unwrap();
        }

        let filter = MessageFilter::default();
        let first = dlq.get_messages(&filter, PageRequest::first(2)).await.unwrap();
        assert_eq!(first.messages.len(), 2);
        let cursor = first.next.unwrap();

        let second = dlq
            .get_messages(&filter, PageRequest::after(cursor, 2))
            .await
            .unwrap();
        assert_eq!(second.messages.len(), 2);
        assert!(second.messages[0].id > cursor);

        let last = dlq
            .get_messages(&filter, PageRequest::after(second.next.unwrap(), 2))
            .await
            .unwrap();
        assert_eq!(last.messages.len(), 1);
        assert_eq!(last.next, None);
    }

    #[tokio::test]
    async fn test_filters() {
        let dlq = queue();
        dlq.send_draft(
            DeadLetterDraft::new(json!(1), "Gateway TIMEOUT", Utc::now())
                .with_class(FailureClass::Transient)
                .with_source("payments")
                .with_metadata("user_id", "u-1"),
        )
        .await
        .unwrap();
        dlq.send_draft(DeadLetterDraft::new(json!(2), "card declined", Utc::now()).with_source("payments"))
            .await
            .unwrap();
        dlq.send_draft(DeadLetterDraft::new(json!(3), "timeout", Utc::now()).with_source("email"))
            .await
            .unwrap();

        let by_reason = MessageFilter::default().with_reason("timeout");
        assert_eq!(dlq.count(&by_reason).await.unwrap(), 2);

        let by_source = MessageFilter::default().with_source("payments");
        assert_eq!(dlq.count(&by_source).await.unwrap(), 2);

        let transient = MessageFilter::class(FailureClass::Transient);
        assert_eq!(dlq.count(&transient).await.unwrap(), 1);

        let by_user = MessageFilter::default().with_metadata("user_id", "u-1");
        assert_eq!(dlq.count(&by_user).await.unwrap(), 1);

        assert_eq!(dlq.count(&MessageFilter::default()).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_replay_success_removes_message() {
        let dlq = queue();
        let id = dlq.send(&json!({"n": 1}), "boom", Metadata::new()).await.unwrap();

        let outcome = dlq
            .replay(id, |message| async move {
                assert_eq!(message.payload, json!({"n": 1}));
                Ok::<(), String>(())
            })
            .await
            .unwrap();

        assert!(outcome.is_acknowledged());
        assert_eq!(dlq.size().await.unwrap(), 0);
        assert_eq!(dlq.stats().await.unwrap().total_replayed, 1);
    }

    #[tokio::test]
    async fn test_replay_failure_keeps_message_and_records_history() {
        let dlq = queue();
        let id = dlq.send(&json!({}), "boom", Metadata::new()).await.unwrap();

        for _ in 0..2 {
            let outcome = dlq
                .replay(id, |_| async { Err::<(), _>("still down") })
                .await
                .unwrap();
            assert!(!outcome.is_acknowledged());
        }

        assert_eq!(dlq.size().await.unwrap(), 1);
        let history = dlq.replay_history(id);
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].attempt, 2);
        assert_eq!(history[1].error, "still down");
    }

    #[tokio::test]
    async fn test_replay_unknown_id() {
        let dlq = queue();
        let result = dlq
            .replay(MessageId::new(42), |_| async { Ok::<(), String>(()) })
            .await;
        assert!(matches!(result, Err(DlqError::NotFound(id)) if id == MessageId::new(42)));
    }

    #[tokio::test]
    async fn test_replay_all_skips_permanent() {
        let dlq = queue();
        dlq.send_draft(DeadLetterDraft::new(json!(1), "a", Utc::now()).with_class(FailureClass::Transient))
            .await
            .unwrap();
        dlq.send_draft(DeadLetterDraft::new(json!(2), "b", Utc::now()))
            .await
            .unwrap();
        dlq.send_draft(DeadLetterDraft::new(json!(3), "c", Utc::now()).with_class(FailureClass::Transient))
            .await
            .unwrap();

        let summary = dlq
            .replay_all(&MessageFilter::default(), |message| async move {
                if message.payload == json!(3) {
                    Err("no")
                } else {
                    Ok(())
                }
            })
            .await
            .unwrap();

        assert_eq!(
            summary,
            ReplaySummary {
                attempted: 2,
                acknowledged: 1,
                failed: 1,
                skipped: 1,
            }
        );
        assert_eq!(dlq.size().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_purge_zero_empties_queue() {
        let dlq = queue();
        for n in 0..3 {
            dlq.send(&n, "boom", Metadata::new()).await.unwrap();
        }

        assert_eq!(dlq.purge(Duration::ZERO).await.unwrap(), 3);
        assert_eq!(dlq.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_purge_expired_uses_retention() {
        let clock = ManualClock::new(test_time());
        let dlq = queue()
            .with_clock(Arc::new(clock.clone()))
            .with_retention(Duration::from_secs(3600));

        dlq.send(&1, "old", Metadata::new()).await.unwrap();
        clock.advance(Duration::from_secs(90 * 60));
        let fresh = dlq.send(&2, "fresh", Metadata::new()).await.unwrap();

        assert_eq!(dlq.purge_expired().await.unwrap(), 1);
        let remaining = dlq
            .get_messages(&MessageFilter::default(), PageRequest::first(10))
            .await
            .unwrap();
        assert_eq!(remaining.messages.len(), 1);
        assert_eq!(remaining.messages[0].id, fresh);
    }

    #[tokio::test]
    async fn test_archive_moves_message() {
        let archive = Arc::new(MemoryStorage::new());
        let dlq = queue().with_archive(archive.clone());
        let id = dlq.send(&json!({"n": 1}), "boom", Metadata::new()).await.unwrap();

        dlq.archive(id).await.unwrap();

        assert_eq!(dlq.size().await.unwrap(), 0);
        let archived = archive.list().await.unwrap();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].reason, "boom");
        assert_eq!(archived[0].metadata.get("archived_from"), Some(&json!(id.value())));
    }

    #[tokio::test]
    async fn test_archive_without_storage() {
        let dlq = queue();
        let id = dlq.send(&1, "boom", Metadata::new()).await.unwrap();
        assert!(matches!(dlq.archive(id).await, Err(DlqError::NoArchive)));
    }

    #[tokio::test]
    async fn test_send_stamps_created_at_from_clock() {
        let dlq = queue().with_clock(Arc::new(test_clock()));
        let id = dlq.send(&json!({"n": 1}), "X", Metadata::new()).await.unwrap();

        let message = dlq.get_message(id).await.unwrap().unwrap();
        assert_eq!(message.created_at, test_time());
    }

    #[tokio::test]
    async fn test_stats() {
        let clock = ManualClock::new(test_time());
        let dlq = queue().with_clock(Arc::new(clock.clone()));

        dlq.send_draft(DeadLetterDraft::new(json!(1), "timeout", clock.now()).with_source("payments"))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(2 * 3600));
        dlq.send_draft(DeadLetterDraft::new(json!(2), "timeout", clock.now()))
            .await
            .unwrap();

        let stats = dlq.stats().await.unwrap();
        assert_eq!(stats.size, 2);
        assert_eq!(stats.last_hour, 1);
        assert_eq!(stats.by_reason.get("timeout"), Some(&2));
        assert_eq!(stats.by_source.get("payments"), Some(&1));
        assert_eq!(stats.by_source.get("unknown"), Some(&1));
        assert_eq!(stats.oldest_message_age, Some(Duration::from_secs(7200)));
        assert_eq!(stats.total_sent, 2);
    }

    #[tokio::test]
    async fn test_dead_letter_routes_terminal_errors_only() {
        let dlq = queue();

        let exhausted: ResilienceError<String> = ResilienceError::RetriesExhausted {
            attempts: 3,
            last_error: Box::new(ResilienceError::Transient("reset".to_string())),
        };
        let returned = dlq
            .dead_letter(&json!({"n": 1}), exhausted, Some("payments"), Metadata::new())
            .await;
        assert!(matches!(returned, ResilienceError::RetriesExhausted { attempts: 3, .. }));

        let open: ResilienceError<String> = ResilienceError::CircuitOpen {
            name: "payments".to_string(),
        };
        let returned = dlq.dead_letter(&json!({}), open, None, Metadata::new()).await;
        assert!(matches!(returned, ResilienceError::CircuitOpen { .. }));

        let messages = dlq
            .get_messages(&MessageFilter::default(), PageRequest::first(10))
            .await
            .unwrap()
            .messages;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].class, FailureClass::Transient);
        assert_eq!(messages[0].attempt_count, 3);
        assert_eq!(messages[0].source.as_deref(), Some("payments"));
    }

    struct FailingStorage;

    impl DlqStorage for FailingStorage {
        fn append(&self, _draft: DeadLetterDraft) -> bulwark_core::StorageFuture<'_, DeadLetterMessage> {
            Box::pin(async { Err(StorageError::Io("disk full".to_string())) })
        }

        fn list(&self) -> bulwark_core::StorageFuture<'_, Vec<DeadLetterMessage>> {
            Box::pin(async { Ok(Vec::new()) })
        }

        fn remove(&self, _ids: Vec<MessageId>) -> bulwark_core::StorageFuture<'_, usize> {
            Box::pin(async { Ok(0) })
        }
    }

    #[tokio::test]
    async fn test_storage_failure_surfaces_as_dead_letter_failed() {
        let dlq = DeadLetterQueue::new(Arc::new(FailingStorage));
        let error: ResilienceError<String> = ResilienceError::Permanent("bad request".to_string());

        let returned = dlq.dead_letter(&json!({}), error, None, Metadata::new()).await;

        match returned {
            ResilienceError::DeadLetterFailed { error, storage } => {
                assert!(matches!(*error, ResilienceError::Permanent(_)));
                assert_eq!(storage, StorageError::Io("disk full".to_string()));
            }
            other => unreachable!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_open_storage_by_backend() {
        let dir = tempfile::tempdir().unwrap();
        let file = DeadLetterQueue::open_storage(&DlqBackend::File {
            path: dir.path().join("dlq.jsonl"),
        })
        .await
        .unwrap();
        let dlq = DeadLetterQueue::new(file);
        dlq.send(&1, "boom", Metadata::new()).await.unwrap();
        assert_eq!(dlq.size().await.unwrap(), 1);

        let postgres = DeadLetterQueue::open_storage(&DlqBackend::Postgres {
            url: "postgres://localhost".to_string(),
        })
        .await;
        assert!(matches!(postgres, Err(DlqError::UnsupportedBackend("postgres"))));
    }
}
