//! # Bulwark Core
//!
//! Core traits and types shared by the Bulwark resilience patterns.
//!
//! This crate holds no behaviour of its own. It defines the vocabulary that
//! the circuit breaker, retry policy, rate limiter and dead letter queue in
//! `bulwark-runtime` speak, plus the storage capabilities that backends such
//! as `bulwark-postgres` implement.
//!
//! ## Core Concepts
//!
//! - **`ResilienceError`**: one error taxonomy for every pattern
//! - **`ErrorClassifier`**: the set of error kinds a pattern reacts to
//! - **`Clock`**: injected wall-clock time for dead letter timestamps
//! - **`CancellationSignal`**: external abort for retry loops
//! - **`DlqStorage` / `BucketStore`**: pluggable persistence
//!
//! ## Example
//!
//! ```
//! use bulwark_core::{ErrorClassifier, ErrorKind, ResilienceError};
//!
//! let classifier = ErrorClassifier::retryable();
//! let err: ResilienceError<&str> = ResilienceError::Transient("connection reset");
//!
//! assert!(classifier.matches_error(&err));
//! assert_eq!(err.kind(), ErrorKind::Transient);
//! ```

pub mod cancellation;
pub mod dead_letter;
pub mod error;
pub mod storage;

pub use cancellation::{CancellationHandle, CancellationSignal, cancellation};
pub use dead_letter::{DeadLetterDraft, DeadLetterMessage, Metadata, MessageId};
pub use error::{ErrorClassifier, ErrorKind, FailureClass, ResilienceError};
pub use storage::{BucketSpec, BucketStore, ConsumeOutcome, DlqStorage, StorageError, StorageFuture};

/// Environment traits - injected dependencies
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts wall-clock time for testability
    ///
    /// Only dead letter timestamps and retention use wall-clock time.
    /// Breaker timeouts, backoff and token refill use the monotonic
    /// `tokio::time::Instant`, which tests control with a paused runtime.
    ///
    /// # Examples
    ///
    /// ```
    /// use bulwark_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let _now = clock.now();
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
