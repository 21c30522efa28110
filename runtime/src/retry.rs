//! Retry logic with exponential backoff for handling transient failures.
//!
//! Attempts are numbered from 1; the first try is not a retry. After a
//! failed attempt `n` whose error matches the policy's classifier, the loop
//! sleeps for
//!
//! ```text
//! delay = min(max_delay, base_delay * exponential_base^(n - 1)) + U[0, delay * jitter_factor]
//! ```
//!
//! and tries again, up to `max_attempts` tries in total. Errors outside the
//! classifier are returned immediately. The policy never assumes the
//! operation is idempotent; it only decides *when* to call it again.
//!
//! # Example
//!
//! ```rust
//! use bulwark_core::ResilienceError;
//! use bulwark_runtime::retry::RetryPolicy;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let policy = RetryPolicy::builder()
//!     .max_attempts(5)
//!     .base_delay(Duration::from_millis(100))
//!     .max_delay(Duration::from_secs(10))
//!     .exponential_base(2.0)
//!     .jitter_factor(0.1)
//!     .build()?;
//!
//! let result = policy.retry(|| async {
//!     // Your fallible operation here
//!     Ok::<_, ResilienceError<std::io::Error>>(42)
//! }).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::ConfigError;
use crate::metrics::RetryMetrics;
use bulwark_core::{CancellationSignal, ErrorClassifier, ResilienceError};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Retry policy configuration for exponential backoff.
///
/// # Default Values
///
/// - `max_attempts`: 3
/// - `base_delay`: 100ms
/// - `max_delay`: 30 seconds
/// - `exponential_base`: 2.0 (delay doubles each retry)
/// - `jitter_factor`: 0.1
/// - `retryable`: `Transient` and `Timeout`
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of tries, including the first
    pub max_attempts: u32,
    /// Delay after the first failed attempt
    pub base_delay: Duration,
    /// Maximum delay between retries (cap for exponential backoff)
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub exponential_base: f64,
    /// Upper bound of the random jitter, as a fraction of the delay
    pub jitter_factor: f64,
    /// Error kinds that trigger another attempt
    pub retryable: ErrorClassifier,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            exponential_base: 2.0,
            jitter_factor: 0.1,
            retryable: ErrorClassifier::retryable(),
        }
    }
}

impl RetryPolicy {
    /// Create a new policy builder.
    #[must_use]
    pub const fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder {
            max_attempts: None,
            base_delay: None,
            max_delay: None,
            exponential_base: None,
            jitter_factor: None,
            retryable: None,
        }
    }

    /// Check the policy's numeric bounds.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts", "must be at least 1"));
        }
        if self.max_delay < self.base_delay {
            return Err(ConfigError::invalid(
                "retry.max_delay",
                "must be greater than or equal to base_delay",
            ));
        }
        if !self.exponential_base.is_finite() || self.exponential_base < 1.0 {
            return Err(ConfigError::invalid(
                "retry.exponential_base",
                "must be a finite number >= 1.0",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::invalid(
                "retry.jitter_factor",
                "must be between 0.0 and 1.0",
            ));
        }
        Ok(())
    }

    /// Backoff after failed attempt `attempt` (1-based), before jitter.
    ///
    /// `min(max_delay, base_delay * exponential_base^(attempt - 1))`
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.exponential_base.powi(exponent);

        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::try_from_secs_f64(secs).map_or(self.max_delay, |delay| delay.min(self.max_delay))
        }
    }

    /// Add jitter drawn uniformly from `[0, delay * jitter_factor]`.
    #[must_use]
    pub fn with_jitter(&self, delay: Duration) -> Duration {
        if self.jitter_factor <= 0.0 || delay.is_zero() {
            return delay;
        }
        let max_jitter = delay.as_secs_f64() * self.jitter_factor;
        let jitter = rand::thread_rng().gen_range(0.0..=max_jitter);
        delay.saturating_add(Duration::try_from_secs_f64(jitter).unwrap_or(Duration::MAX))
    }

    /// Retry an async operation until it succeeds, fails permanently, or
    /// runs out of attempts.
    ///
    /// # Errors
    ///
    /// Returns non-retryable errors unchanged, or
    /// [`ResilienceError::RetriesExhausted`] wrapping the last error.
    pub async fn retry<F, Fut, T, E>(&self, operation: F) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        self.run(operation, |_: &T| false, &CancellationSignal::never())
            .await
    }

    /// Like [`retry`](Self::retry), but stops as soon as `signal` fires.
    ///
    /// The signal is checked before every attempt and raced against the
    /// backoff sleep, so a cancelled loop never invokes the operation again.
    ///
    /// # Errors
    ///
    /// Additionally returns [`ResilienceError::Cancelled`] with the number of
    /// attempts made before cancellation was observed.
    pub async fn retry_with_cancel<F, Fut, T, E>(
        &self,
        operation: F,
        signal: &CancellationSignal,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        self.run(operation, |_: &T| false, signal).await
    }

    /// Re-invoke while a *successful* result still satisfies `should_retry`.
    ///
    /// Useful for polling. After `max_attempts` the last result is returned
    /// as `Ok` even if it still matches. Errors are handled as in
    /// [`retry`](Self::retry).
    ///
    /// # Errors
    ///
    /// Same as [`retry`](Self::retry).
    pub async fn retry_if_result<F, Fut, T, E, P>(
        &self,
        operation: F,
        should_retry: P,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        P: Fn(&T) -> bool,
    {
        self.run(operation, should_retry, &CancellationSignal::never())
            .await
    }

    /// Blocking variant of [`retry`](Self::retry); sleeps the current thread.
    ///
    /// # Errors
    ///
    /// Same as [`retry`](Self::retry).
    pub fn retry_blocking<F, T, E>(&self, mut operation: F) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Result<T, ResilienceError<E>>,
    {
        let mut attempt = 1;
        loop {
            match operation() {
                Ok(value) => {
                    self.log_success(attempt);
                    return Ok(value);
                }
                Err(err) => {
                    let delay = self.next_delay(attempt, err)?;
                    std::thread::sleep(delay);
                    attempt += 1;
                }
            }
        }
    }

    /// Attempt plan for hand-written retry loops.
    ///
    /// Yields `max_attempts` entries; the first has zero delay. Jitter is
    /// drawn as the iterator advances.
    #[must_use]
    pub fn schedule(&self) -> RetrySchedule<'_> {
        RetrySchedule {
            policy: self,
            next: 1,
        }
    }

    async fn run<F, Fut, T, E, P>(
        &self,
        mut operation: F,
        should_retry: P,
        signal: &CancellationSignal,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        P: Fn(&T) -> bool,
    {
        let mut attempt = 1;

        loop {
            if signal.is_cancelled() {
                return Err(self.cancelled(attempt - 1));
            }

            let delay = match operation().await {
                Ok(value) if attempt < self.max_attempts && should_retry(&value) => {
                    let delay = self.with_jitter(self.delay_for_attempt(attempt));
                    tracing::debug!(
                        attempt,
                        delay_ms = delay.as_millis(),
                        "Result not ready, polling again"
                    );
                    delay
                }
                Ok(value) => {
                    self.log_success(attempt);
                    return Ok(value);
                }
                Err(err) => self.next_delay(attempt, err)?,
            };

            RetryMetrics::record_attempt(delay);
            tokio::select! {
                () = sleep(delay) => {}
                () = signal.cancelled() => return Err(self.cancelled(attempt)),
            }
            attempt += 1;
        }
    }

    /// Decide what follows a failed attempt: a delay, or the error to return.
    fn next_delay<E>(&self, attempt: u32, err: ResilienceError<E>) -> Result<Duration, ResilienceError<E>> {
        if !self.retryable.matches_error(&err) {
            tracing::debug!(
                attempt,
                kind = %err.kind(),
                "Error is not retryable, failing immediately"
            );
            return Err(err);
        }

        if attempt >= self.max_attempts {
            tracing::error!(
                attempts = attempt,
                kind = %err.kind(),
                "Operation failed after max retries"
            );
            RetryMetrics::record_exhausted();
            return Err(ResilienceError::RetriesExhausted {
                attempts: attempt,
                last_error: Box::new(err),
            });
        }

        let delay = self.with_jitter(self.delay_for_attempt(attempt));
        tracing::warn!(
            attempt,
            max_attempts = self.max_attempts,
            delay_ms = delay.as_millis(),
            kind = %err.kind(),
            "Operation failed, retrying..."
        );
        Ok(delay)
    }

    fn log_success(&self, attempt: u32) {
        if attempt > 1 {
            tracing::info!(attempt, "Operation succeeded after retry");
            RetryMetrics::record_success();
        }
    }

    #[allow(clippy::unused_self)]
    fn cancelled<E>(&self, attempts: u32) -> ResilienceError<E> {
        tracing::info!(attempts, "Retry loop cancelled");
        RetryMetrics::record_cancelled();
        ResilienceError::Cancelled { attempts }
    }
}

/// Builder for [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct RetryPolicyBuilder {
    max_attempts: Option<u32>,
    base_delay: Option<Duration>,
    max_delay: Option<Duration>,
    exponential_base: Option<f64>,
    jitter_factor: Option<f64>,
    retryable: Option<ErrorClassifier>,
}

impl RetryPolicyBuilder {
    /// Set maximum number of tries, including the first.
    #[must_use]
    pub const fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Set the delay after the first failed attempt.
    #[must_use]
    pub const fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = Some(delay);
        self
    }

    /// Set maximum delay (cap for exponential backoff).
    #[must_use]
    pub const fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = Some(delay);
        self
    }

    /// Set multiplier for exponential backoff.
    #[must_use]
    pub const fn exponential_base(mut self, base: f64) -> Self {
        self.exponential_base = Some(base);
        self
    }

    /// Set the jitter fraction (0.0 disables jitter).
    #[must_use]
    pub const fn jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = Some(factor);
        self
    }

    /// Set which error kinds trigger another attempt.
    #[must_use]
    pub fn retryable(mut self, classifier: ErrorClassifier) -> Self {
        self.retryable = Some(classifier);
        self
    }

    /// Build and validate the [`RetryPolicy`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the values fail [`RetryPolicy::validate`].
    pub fn build(self) -> Result<RetryPolicy, ConfigError> {
        let defaults = RetryPolicy::default();
        let policy = RetryPolicy {
            max_attempts: self.max_attempts.unwrap_or(defaults.max_attempts),
            base_delay: self.base_delay.unwrap_or(defaults.base_delay),
            max_delay: self.max_delay.unwrap_or(defaults.max_delay),
            exponential_base: self.exponential_base.unwrap_or(defaults.exponential_base),
            jitter_factor: self.jitter_factor.unwrap_or(defaults.jitter_factor),
            retryable: self.retryable.unwrap_or(defaults.retryable),
        };
        policy.validate()?;
        Ok(policy)
    }
}

/// One planned attempt from [`RetryPolicy::schedule`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryAttempt {
    /// Attempt number, starting at 1
    pub number: u32,
    /// Total attempts the policy allows
    pub max_attempts: u32,
    /// Delay to wait before making this attempt
    pub delay: Duration,
}

impl RetryAttempt {
    /// Whether no attempt follows this one.
    #[must_use]
    pub const fn is_last(&self) -> bool {
        self.number >= self.max_attempts
    }
}

/// Iterator returned by [`RetryPolicy::schedule`].
#[derive(Debug, Clone)]
pub struct RetrySchedule<'a> {
    policy: &'a RetryPolicy,
    next: u32,
}

impl Iterator for RetrySchedule<'_> {
    type Item = RetryAttempt;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next > self.policy.max_attempts {
            return None;
        }
        let number = self.next;
        self.next += 1;

        let delay = if number == 1 {
            Duration::ZERO
        } else {
            self.policy
                .with_jitter(self.policy.delay_for_attempt(number - 1))
        };

        Some(RetryAttempt {
            number,
            max_attempts: self.policy.max_attempts,
            delay,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = usize::try_from(
            self.policy
                .max_attempts
                .saturating_add(1)
                .saturating_sub(self.next),
        )
        .unwrap_or(usize::MAX);
        (remaining, Some(remaining))
    }
}
