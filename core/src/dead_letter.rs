//! Dead letter message model.
//!
//! A [`DeadLetterMessage`] is immutable once a storage backend has accepted
//! it. Backends receive a [`DeadLetterDraft`] (everything except the id) and
//! assign the monotonic [`MessageId`] themselves, so ids stay ordered even when
//! several processes share one external store.

use crate::error::FailureClass;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Free-form context attached to a dead letter (user id, trace id, ...).
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Monotonic identifier assigned by the storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(u64);

impl MessageId {
    /// Wrap a raw id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw id value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dlq-{}", self.0)
    }
}

/// A message accepted by a dead letter queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterMessage {
    /// Storage-assigned id
    pub id: MessageId,
    /// The failed operation's input
    pub payload: serde_json::Value,
    /// Why the operation failed
    pub reason: String,
    /// Whether the failure may be replayed automatically
    pub class: FailureClass,
    /// Additional context
    pub metadata: Metadata,
    /// Dependency or queue the failure came from
    pub source: Option<String>,
    /// When the message was dead-lettered
    pub created_at: DateTime<Utc>,
    /// Attempts made before the operation was given up on
    pub attempt_count: u32,
}

impl DeadLetterMessage {
    /// Build a stored message from a draft and an assigned id.
    #[must_use]
    pub fn from_draft(id: MessageId, draft: DeadLetterDraft) -> Self {
        Self {
            id,
            payload: draft.payload,
            reason: draft.reason,
            class: draft.class,
            metadata: draft.metadata,
            source: draft.source,
            created_at: draft.created_at,
            attempt_count: draft.attempt_count,
        }
    }
}

/// Everything about a dead letter except its id.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterDraft {
    /// The failed operation's input
    pub payload: serde_json::Value,
    /// Why the operation failed
    pub reason: String,
    /// Whether the failure may be replayed automatically
    pub class: FailureClass,
    /// Additional context
    pub metadata: Metadata,
    /// Dependency or queue the failure came from
    pub source: Option<String>,
    /// When the message was dead-lettered
    pub created_at: DateTime<Utc>,
    /// Attempts made before the operation was given up on
    pub attempt_count: u32,
}

impl DeadLetterDraft {
    /// Create a permanent-class draft timestamped `created_at`.
    #[must_use]
    pub fn new(payload: serde_json::Value, reason: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            payload,
            reason: reason.into(),
            class: FailureClass::Permanent,
            metadata: Metadata::new(),
            source: None,
            created_at,
            attempt_count: 1,
        }
    }

    /// Set the failure class.
    #[must_use]
    pub const fn with_class(mut self, class: FailureClass) -> Self {
        self.class = class;
        self
    }

    /// Add one metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Merge a metadata map.
    #[must_use]
    pub fn with_metadata_map(mut self, metadata: Metadata) -> Self {
        self.metadata.extend(metadata);
        self
    }

    /// Set the source dependency.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Set the number of attempts made.
    #[must_use]
    pub const fn with_attempt_count(mut self, attempts: u32) -> Self {
        self.attempt_count = attempts;
        self
    }
}
