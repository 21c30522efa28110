//! # Bulwark Testing
//!
//! Testing utilities for the Bulwark resilience patterns.
//!
//! This crate provides:
//! - Deterministic implementations of the `Clock` environment trait
//! - Scripted operations that fail and recover on cue
//! - Tracing initialisation for test output
//!
//! Monotonic time (breaker timeouts, backoff, token refill) is driven by
//! tokio's paused clock: use `#[tokio::test(start_paused = true)]` and
//! `tokio::time::advance`. The clocks here only cover wall-clock time used
//! for dead letter timestamps and retention.
//!
//! ## Example
//!
//! ```
//! use bulwark_testing::{ScriptedOperation, Step};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let op = ScriptedOperation::new([Step::Transient("reset"), Step::Ok(42)]);
//!
//! assert!(op.invoke().await.is_err());
//! assert_eq!(op.invoke().await.ok(), Some(42));
//! assert_eq!(op.calls(), 2);
//! # }
//! ```

use chrono::{DateTime, Utc};

/// Mock implementations of Environment traits
pub mod mocks {
    use bulwark_core::environment::Clock;
    use chrono::{DateTime, Utc};
    use std::sync::{Arc, Mutex, PoisonError};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use bulwark_testing::mocks::FixedClock;
    /// use bulwark_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to.
    ///
    /// Clones share the same time, so a test can keep one handle and give
    /// another to the code under test.
    ///
    /// ```
    /// use bulwark_testing::mocks::ManualClock;
    /// use bulwark_core::environment::Clock;
    /// use std::time::Duration;
    ///
    /// let clock = ManualClock::new(bulwark_testing::test_time());
    /// let before = clock.now();
    /// clock.advance(Duration::from_secs(90));
    /// assert_eq!((clock.now() - before).num_seconds(), 90);
    /// ```
    #[derive(Debug, Clone)]
    pub struct ManualClock {
        time: Arc<Mutex<DateTime<Utc>>>,
    }

    impl ManualClock {
        /// Start at `time`.
        #[must_use]
        pub fn new(time: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(Mutex::new(time)),
            }
        }

        /// Move forward by `by`. Durations beyond chrono's range saturate.
        pub fn advance(&self, by: std::time::Duration) {
            let by = chrono::Duration::from_std(by).unwrap_or(chrono::Duration::MAX);
            let mut time = self.time.lock().unwrap_or_else(PoisonError::into_inner);
            *time = time.checked_add_signed(by).unwrap_or(DateTime::<Utc>::MAX_UTC);
        }

        /// Jump to `time`, forwards or backwards.
        pub fn set(&self, time: DateTime<Utc>) {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner) = time;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }
}

/// Scripted operations for driving the patterns through failures
pub mod scripted {
    use bulwark_core::ResilienceError;
    use std::collections::VecDeque;
    use std::future::Future;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex, PoisonError};
    use std::time::Duration;

    /// One scripted outcome.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum Step<T, E> {
        /// Succeed with a value
        Ok(T),
        /// Fail with a retryable error
        Transient(E),
        /// Fail with a non-retryable error
        Permanent(E),
        /// Sleep on the tokio clock, then succeed
        Slow(Duration, T),
    }

    #[derive(Debug)]
    struct Script<T, E> {
        steps: VecDeque<Step<T, E>>,
        last: Option<Step<T, E>>,
    }

    /// Operation that plays back a fixed sequence of outcomes.
    ///
    /// Once the script runs out the last step repeats forever. Clones share
    /// the script and the call counter.
    #[derive(Debug)]
    pub struct ScriptedOperation<T, E> {
        script: Arc<Mutex<Script<T, E>>>,
        calls: Arc<AtomicU32>,
    }

    impl<T, E> Clone for ScriptedOperation<T, E> {
        fn clone(&self) -> Self {
            Self {
                script: Arc::clone(&self.script),
                calls: Arc::clone(&self.calls),
            }
        }
    }

    impl<T, E> ScriptedOperation<T, E>
    where
        T: Clone,
        E: Clone,
    {
        /// Play `steps` in order.
        ///
        /// An empty script is a valid operation whose every invocation is
        /// reported as `Cancelled`; tests normally supply at least one step.
        #[must_use]
        pub fn new(steps: impl IntoIterator<Item = Step<T, E>>) -> Self {
            Self {
                script: Arc::new(Mutex::new(Script {
                    steps: steps.into_iter().collect(),
                    last: None,
                })),
                calls: Arc::new(AtomicU32::new(0)),
            }
        }

        /// Fail transiently `failures` times, then succeed with `value`.
        #[must_use]
        pub fn failing_then_ok(failures: usize, error: E, value: T) -> Self {
            let steps = std::iter::repeat_n(Step::Transient(error), failures)
                .chain(std::iter::once(Step::Ok(value)));
            Self::new(steps)
        }

        /// Always fail transiently with `error`.
        #[must_use]
        pub fn always_failing(error: E) -> Self {
            Self::new([Step::Transient(error)])
        }

        /// Number of invocations so far.
        #[must_use]
        pub fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        fn next_step(&self) -> Option<Step<T, E>> {
            let mut script = self.script.lock().unwrap_or_else(PoisonError::into_inner);
            match script.steps.pop_front() {
                Some(step) => {
                    script.last = Some(step.clone());
                    Some(step)
                }
                None => script.last.clone(),
            }
        }

        /// Run the next step.
        pub fn invoke(&self) -> impl Future<Output = Result<T, ResilienceError<E>>> + use<T, E> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let step = self.next_step();
            async move {
                match step {
                    Some(Step::Ok(value)) => Ok(value),
                    Some(Step::Transient(error)) => Err(ResilienceError::Transient(error)),
                    Some(Step::Permanent(error)) => Err(ResilienceError::Permanent(error)),
                    Some(Step::Slow(delay, value)) => {
                        tokio::time::sleep(delay).await;
                        Ok(value)
                    }
                    None => Err(ResilienceError::Cancelled { attempts: 0 }),
                }
            }
        }

        /// Run the next step on the current thread; `Slow` blocks the thread.
        ///
        /// # Errors
        ///
        /// Returns the scripted failure.
        pub fn invoke_blocking(&self) -> Result<T, ResilienceError<E>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match self.next_step() {
                Some(Step::Ok(value)) => Ok(value),
                Some(Step::Transient(error)) => Err(ResilienceError::Transient(error)),
                Some(Step::Permanent(error)) => Err(ResilienceError::Permanent(error)),
                Some(Step::Slow(delay, value)) => {
                    std::thread::sleep(delay);
                    Ok(value)
                }
                None => Err(ResilienceError::Cancelled { attempts: 0 }),
            }
        }
    }
}

/// Tracing setup for tests
pub mod tracing_setup {
    use tracing_subscriber::EnvFilter;

    /// Route `tracing` output through the test harness.
    ///
    /// Honours `RUST_LOG` and defaults to `warn`. Safe to call from every
    /// test; only the first call installs the subscriber.
    pub fn init_test_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    }
}

// Re-export commonly used items
pub use mocks::{FixedClock, ManualClock};
pub use scripted::{ScriptedOperation, Step};
pub use tracing_setup::init_test_tracing;

/// Reference time for tests: 2025-01-01 00:00:00 UTC.
#[must_use]
pub fn test_time() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH + chrono::Duration::days(20_089)
}

/// Fixed clock at [`test_time`].
#[must_use]
pub fn test_clock() -> FixedClock {
    FixedClock::new(test_time())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use bulwark_core::ResilienceError;
    use bulwark_core::environment::Clock;
    use std::time::Duration;

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        assert_eq!(clock.now(), clock.now());
        assert_eq!(clock.now().to_rfc3339(), "2025-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_manual_clock_clones_share_time() {
        let clock = ManualClock::new(test_time());
        let shared = clock.clone();

        clock.advance(Duration::from_secs(3600));

        assert_eq!(shared.now(), test_time() + chrono::Duration::hours(1));
    }

    #[tokio::test]
    async fn test_script_repeats_last_step() {
        let op = ScriptedOperation::failing_then_ok(1, "boom", 7);

        assert!(matches!(op.invoke().await, Err(ResilienceError::Transient("boom"))));
        assert_eq!(op.invoke().await.unwrap(), 7);
        assert_eq!(op.invoke().await.unwrap(), 7);
        assert_eq!(op.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_step_uses_tokio_clock() {
        let op: ScriptedOperation<u8, &str> =
            ScriptedOperation::new([Step::Slow(Duration::from_secs(5), 1)]);
        let start = tokio::time::Instant::now();

        assert_eq!(op.invoke().await.unwrap(), 1);
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[test]
    fn test_blocking_permanent() {
        let op: ScriptedOperation<(), &str> = ScriptedOperation::new([Step::Permanent("bad")]);
        assert!(matches!(op.invoke_blocking(), Err(ResilienceError::Permanent("bad"))));
    }
}
