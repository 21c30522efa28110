//! Failure taxonomy shared by every resilience pattern.
//!
//! All patterns speak one error type, [`ResilienceError`]. The wrapped
//! operation reports its own failures as either [`ResilienceError::Transient`]
//! or [`ResilienceError::Permanent`]; the patterns add admission denials
//! (`CircuitOpen`, `RateLimitExceeded`, `RateLimitTimeout`) and terminal
//! wrappers (`RetriesExhausted`, `Cancelled`, `DeadLetterFailed`).
//!
//! Because every layer consumes and produces the same type, the composer can
//! nest layers as plain closures and callers see exactly one variant per
//! failed call.
//!
//! # Example
//!
//! ```
//! use bulwark_core::error::{ErrorKind, ResilienceError};
//!
//! fn classify(status: u16) -> ResilienceError<String> {
//!     if status >= 500 {
//!         ResilienceError::Transient(format!("server error {status}"))
//!     } else {
//!         ResilienceError::Permanent(format!("client error {status}"))
//!     }
//! }
//!
//! assert_eq!(classify(503).kind(), ErrorKind::Transient);
//! assert_eq!(classify(404).kind(), ErrorKind::Permanent);
//! ```

use crate::storage::StorageError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Discriminant of a [`ResilienceError`], used by classifiers and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Retryable failure reported by the operation
    Transient,
    /// Non-retryable failure reported by the operation
    Permanent,
    /// Admission denied by an open circuit
    CircuitOpen,
    /// Admission denied by an empty token bucket
    RateLimitExceeded,
    /// Waiting for a token took longer than allowed
    RateLimitTimeout,
    /// The operation did not complete within its call timeout
    Timeout,
    /// Every attempt allowed by the retry policy failed
    RetriesExhausted,
    /// The call chain was cancelled from outside
    Cancelled,
    /// A terminal failure could not be written to the dead letter queue
    DeadLetterFailed,
}

impl ErrorKind {
    /// Stable lowercase name, used as a metrics label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::CircuitOpen => "circuit_open",
            Self::RateLimitExceeded => "rate_limit_exceeded",
            Self::RateLimitTimeout => "rate_limit_timeout",
            Self::Timeout => "timeout",
            Self::RetriesExhausted => "retries_exhausted",
            Self::Cancelled => "cancelled",
            Self::DeadLetterFailed => "dead_letter_failed",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied classification of a dead-lettered failure.
///
/// The dead letter queue never infers this; it is carried from the error
/// that reached it or set explicitly by whoever calls `send`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Safe to replay automatically
    Transient,
    /// Needs a human (or dedicated tooling) before it can be replayed
    Permanent,
}

impl FailureClass {
    /// Database / wire representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
        }
    }

    /// Parse from the wire representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "transient" => Some(Self::Transient),
            "permanent" => Some(Self::Permanent),
            _ => None,
        }
    }
}

/// The single error type produced by every resilience pattern.
#[derive(Debug)]
pub enum ResilienceError<E> {
    /// Retryable failure reported by the operation
    Transient(E),
    /// Non-retryable failure reported by the operation
    Permanent(E),
    /// The named circuit breaker rejected the call without invoking it
    CircuitOpen {
        /// Breaker name
        name: String,
    },
    /// The bucket for `key` had no token available
    RateLimitExceeded {
        /// Rate-limit key
        key: String,
    },
    /// No token for `key` became available within `waited`
    RateLimitTimeout {
        /// Rate-limit key
        key: String,
        /// How long the caller was suspended
        waited: Duration,
    },
    /// The operation ran longer than its call timeout
    Timeout(Duration),
    /// All attempts failed; carries the last underlying error
    RetriesExhausted {
        /// Number of attempts made
        attempts: u32,
        /// Error returned by the final attempt
        last_error: Box<ResilienceError<E>>,
    },
    /// An external cancellation signal stopped the call chain
    Cancelled {
        /// Attempts made before cancellation was observed
        attempts: u32,
    },
    /// A terminal failure could not be persisted to the dead letter queue
    DeadLetterFailed {
        /// The failure that should have been dead-lettered
        error: Box<ResilienceError<E>>,
        /// Why the write failed
        storage: StorageError,
    },
}

impl<E> ResilienceError<E> {
    /// Discriminant of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) => ErrorKind::Transient,
            Self::Permanent(_) => ErrorKind::Permanent,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::RateLimitExceeded { .. } => ErrorKind::RateLimitExceeded,
            Self::RateLimitTimeout { .. } => ErrorKind::RateLimitTimeout,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::RetriesExhausted { .. } => ErrorKind::RetriesExhausted,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::DeadLetterFailed { .. } => ErrorKind::DeadLetterFailed,
        }
    }

    /// `true` when the call was refused before the operation ran.
    #[must_use]
    pub const fn is_admission_denied(&self) -> bool {
        matches!(
            self,
            Self::CircuitOpen { .. } | Self::RateLimitExceeded { .. } | Self::RateLimitTimeout { .. }
        )
    }

    /// Failure class to record when this error is dead-lettered.
    ///
    /// Returns `None` for errors that never reach a dead letter queue
    /// (admission denials and cancellation).
    #[must_use]
    pub fn failure_class(&self) -> Option<FailureClass> {
        match self {
            Self::Transient(_) | Self::Timeout(_) => Some(FailureClass::Transient),
            Self::Permanent(_) => Some(FailureClass::Permanent),
            Self::RetriesExhausted { last_error, .. } => last_error.failure_class(),
            Self::DeadLetterFailed { error, .. } => error.failure_class(),
            Self::CircuitOpen { .. }
            | Self::RateLimitExceeded { .. }
            | Self::RateLimitTimeout { .. }
            | Self::Cancelled { .. } => None,
        }
    }

    /// Borrow the operation's own error, looking through wrappers.
    #[must_use]
    pub fn inner(&self) -> Option<&E> {
        match self {
            Self::Transient(e) | Self::Permanent(e) => Some(e),
            Self::RetriesExhausted { last_error, .. } => last_error.inner(),
            Self::DeadLetterFailed { error, .. } => error.inner(),
            _ => None,
        }
    }

    /// Take the operation's own error, looking through wrappers.
    #[must_use]
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Transient(e) | Self::Permanent(e) => Some(e),
            Self::RetriesExhausted { last_error, .. } => last_error.into_inner(),
            Self::DeadLetterFailed { error, .. } => error.into_inner(),
            _ => None,
        }
    }

    /// Transform the operation error, keeping the taxonomy variant.
    pub fn map<F, U>(self, f: F) -> ResilienceError<U>
    where
        F: FnOnce(E) -> U,
    {
        match self {
            Self::Transient(e) => ResilienceError::Transient(f(e)),
            Self::Permanent(e) => ResilienceError::Permanent(f(e)),
            Self::CircuitOpen { name } => ResilienceError::CircuitOpen { name },
            Self::RateLimitExceeded { key } => ResilienceError::RateLimitExceeded { key },
            Self::RateLimitTimeout { key, waited } => {
                ResilienceError::RateLimitTimeout { key, waited }
            }
            Self::Timeout(after) => ResilienceError::Timeout(after),
            Self::RetriesExhausted {
                attempts,
                last_error,
            } => ResilienceError::RetriesExhausted {
                attempts,
                last_error: Box::new(last_error.map(f)),
            },
            Self::Cancelled { attempts } => ResilienceError::Cancelled { attempts },
            Self::DeadLetterFailed { error, storage } => ResilienceError::DeadLetterFailed {
                error: Box::new(error.map(f)),
                storage,
            },
        }
    }
}

impl<E: fmt::Display> fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient(e) => write!(f, "Transient failure: {e}"),
            Self::Permanent(e) => write!(f, "Permanent failure: {e}"),
            Self::CircuitOpen { name } => write!(f, "Circuit breaker '{name}' is open"),
            Self::RateLimitExceeded { key } => write!(f, "Rate limit exceeded for '{key}'"),
            Self::RateLimitTimeout { key, waited } => {
                write!(f, "Timed out after {waited:?} waiting for a token on '{key}'")
            }
            Self::Timeout(after) => write!(f, "Operation timed out after {after:?}"),
            Self::RetriesExhausted {
                attempts,
                last_error,
            } => write!(f, "Retries exhausted after {attempts} attempts: {last_error}"),
            Self::Cancelled { attempts } => write!(f, "Cancelled after {attempts} attempts"),
            Self::DeadLetterFailed { error, storage } => {
                write!(f, "{error} (dead letter write failed: {storage})")
            }
        }
    }
}

impl<E> std::error::Error for ResilienceError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Transient(e) | Self::Permanent(e) => Some(e),
            Self::RetriesExhausted { last_error, .. } => Some(last_error.as_ref()),
            Self::DeadLetterFailed { error, .. } => Some(error.as_ref()),
            _ => None,
        }
    }
}

/// A set of [`ErrorKind`]s that a pattern reacts to.
///
/// The circuit breaker counts matching errors as failures; the retry policy
/// re-invokes on matching errors. Anything else passes straight through.
///
/// Serializes as a plain list so configuration files can write
/// `failure_kinds = ["transient", "timeout"]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ErrorClassifier {
    kinds: Vec<ErrorKind>,
}

impl ErrorClassifier {
    /// Classifier matching exactly the given kinds.
    #[must_use]
    pub fn new(kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        let mut unique = Vec::new();
        for kind in kinds {
            if !unique.contains(&kind) {
                unique.push(kind);
            }
        }
        Self { kinds: unique }
    }

    /// Matches `Transient` and `Timeout`: the retry policy's default.
    #[must_use]
    pub fn retryable() -> Self {
        Self::new([ErrorKind::Transient, ErrorKind::Timeout])
    }

    /// Matches `Transient`, `Timeout` and `RetriesExhausted`: the breaker's
    /// default, so an exhausted retry loop nested inside a breaker counts as one
    /// downstream failure.
    #[must_use]
    pub fn breaker_failures() -> Self {
        Self::new([
            ErrorKind::Transient,
            ErrorKind::Timeout,
            ErrorKind::RetriesExhausted,
        ])
    }

    /// Whether `kind` is in the set.
    #[must_use]
    pub fn matches(&self, kind: ErrorKind) -> bool {
        self.kinds.contains(&kind)
    }

    /// Whether `error`'s kind is in the set.
    #[must_use]
    pub fn matches_error<E>(&self, error: &ResilienceError<E>) -> bool {
        self.matches(error.kind())
    }

    /// Kinds in the set.
    #[must_use]
    pub fn kinds(&self) -> &[ErrorKind] {
        &self.kinds
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    #[test]
    fn retries_exhausted_exposes_last_underlying_error() {
        let err: ResilienceError<&str> = ResilienceError::RetriesExhausted {
            attempts: 3,
            last_error: Box::new(ResilienceError::Transient("connection reset")),
        };

        assert_eq!(err.kind(), ErrorKind::RetriesExhausted);
        assert_eq!(err.inner(), Some(&"connection reset"));
        assert_eq!(err.failure_class(), Some(FailureClass::Transient));
        assert_eq!(
            err.to_string(),
            "Retries exhausted after 3 attempts: Transient failure: connection reset"
        );
    }

    #[test]
    fn admission_denials_have_no_failure_class() {
        let open: ResilienceError<()> = ResilienceError::CircuitOpen {
            name: "payments".into(),
        };
        let limited: ResilienceError<()> = ResilienceError::RateLimitExceeded { key: "u1".into() };

        assert!(open.is_admission_denied());
        assert!(limited.is_admission_denied());
        assert_eq!(open.failure_class(), None);
        assert_eq!(limited.into_inner(), None);
    }

    #[test]
    fn classifier_matches_only_listed_kinds() {
        let classifier = ErrorClassifier::retryable();

        assert!(classifier.matches(ErrorKind::Transient));
        assert!(classifier.matches(ErrorKind::Timeout));
        assert!(!classifier.matches(ErrorKind::Permanent));
        assert!(!classifier.matches_error(&ResilienceError::<()>::Cancelled { attempts: 1 }));
    }

    #[test]
    fn classifier_deserializes_from_list() {
        let classifier: ErrorClassifier =
            serde_json::from_str(r#"["transient", "retries_exhausted"]"#).unwrap();

        assert_eq!(
            classifier.kinds(),
            &[ErrorKind::Transient, ErrorKind::RetriesExhausted]
        );
    }

    #[test]
    fn map_preserves_variant() {
        let err: ResilienceError<i32> = ResilienceError::Permanent(404);
        let mapped = err.map(|code| format!("HTTP {code}"));

        assert_eq!(mapped.kind(), ErrorKind::Permanent);
        assert_eq!(mapped.into_inner().as_deref(), Some("HTTP 404"));
    }
}
