//! Composition of the resilience patterns around one call.
//!
//! The layers always nest in the same order:
//!
//! ```text
//! rate limiter -> circuit breaker -> retry policy -> operation
//!                                                      |
//!                     dead letter queue <- terminal failure
//! ```
//!
//! The limiter sheds load before anything else runs. The breaker wraps the
//! whole retry loop, so an open circuit fails fast instead of feeding
//! retries to a dependency already known to be down, and an exhausted retry
//! loop counts as one breaker failure. Only `RetriesExhausted` and
//! `Permanent` errors are dead-lettered, and only for calls that supplied a
//! payload. Admission denials and cancellation pass straight through.
//!
//! A breaker `call_timeout` bounds the complete retry loop, including its
//! backoff sleeps.
//!
//! Every layer is optional, so a pipeline with only a retry policy is just a
//! retry.
//!
//! # Example
//!
//! ```
//! use bulwark_core::ResilienceError;
//! use bulwark_runtime::circuit_breaker::{BreakerRegistry, CircuitBreakerConfig};
//! use bulwark_runtime::pipeline::ResiliencePipeline;
//! use bulwark_runtime::retry::RetryPolicy;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let pipeline = ResiliencePipeline::builder()
//!     .breakers(Arc::new(BreakerRegistry::new(CircuitBreakerConfig::default())))
//!     .retry(RetryPolicy::default())
//!     .build();
//!
//! let value = pipeline
//!     .execute("inventory", || async { Ok::<_, ResilienceError<String>>(7) })
//!     .await;
//! assert_eq!(value.ok(), Some(7));
//! # }
//! ```

use crate::circuit_breaker::BreakerRegistry;
use crate::config::{ConfigError, ResilienceConfig};
use crate::dead_letter_queue::DeadLetterQueue;
use crate::metrics::PipelineMetrics;
use crate::rate_limiter::RateLimiter;
use crate::retry::RetryPolicy;
use bulwark_core::{CancellationSignal, ErrorKind, Metadata, ResilienceError, StorageError};
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// The composed resilience stack.
///
/// Cheap to share behind an `Arc`; every layer keeps its own per-key state.
#[derive(Debug, Clone, Default)]
pub struct ResiliencePipeline {
    limiter: Option<Arc<RateLimiter>>,
    acquire_timeout: Option<Duration>,
    breakers: Option<Arc<BreakerRegistry>>,
    retry: Option<RetryPolicy>,
    dead_letters: Option<Arc<DeadLetterQueue>>,
}

impl ResiliencePipeline {
    /// Start an empty builder.
    #[must_use]
    pub fn builder() -> ResiliencePipelineBuilder {
        ResiliencePipelineBuilder::default()
    }

    /// Builder preloaded with the limiter, breaker template and retry policy
    /// from `config`.
    ///
    /// The dead letter queue is attached separately because opening its
    /// backend is async and may live in another crate.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if any section is out of range.
    pub fn from_config(config: &ResilienceConfig) -> Result<ResiliencePipelineBuilder, ConfigError> {
        let limiter = RateLimiter::new(config.rate_limiter.to_config()?);
        let template = config.circuit_breaker.to_config("default")?;

        let mut builder = Self::builder()
            .rate_limiter(Arc::new(limiter))
            .breakers(Arc::new(BreakerRegistry::new(template)))
            .retry(config.retry.to_policy()?);
        if let Some(timeout) = config.rate_limiter.acquire_timeout() {
            builder = builder.acquire_timeout(timeout);
        }
        Ok(builder)
    }

    /// Rate limiter layer, if any.
    #[must_use]
    pub fn rate_limiter(&self) -> Option<&Arc<RateLimiter>> {
        self.limiter.as_ref()
    }

    /// Breaker registry layer, if any.
    #[must_use]
    pub fn breakers(&self) -> Option<&Arc<BreakerRegistry>> {
        self.breakers.as_ref()
    }

    /// Retry layer, if any.
    #[must_use]
    pub const fn retry_policy(&self) -> Option<&RetryPolicy> {
        self.retry.as_ref()
    }

    /// Dead letter queue, if any.
    #[must_use]
    pub fn dead_letter_queue(&self) -> Option<&Arc<DeadLetterQueue>> {
        self.dead_letters.as_ref()
    }

    /// Prepare a call to `dependency`.
    ///
    /// `dependency` names the circuit breaker and, unless
    /// [`Call::rate_key`] overrides it, the rate limiter bucket.
    pub fn call(&self, dependency: impl Into<String>) -> Call<'_> {
        Call {
            pipeline: self,
            dependency: dependency.into(),
            rate_key: None,
            payload: None,
            metadata: Metadata::new(),
            signal: CancellationSignal::never(),
        }
    }

    /// Run `operation` against `dependency` with no payload.
    ///
    /// # Errors
    ///
    /// Returns whichever layer's [`ResilienceError`] ended the call.
    pub async fn execute<F, Fut, T, E>(
        &self,
        dependency: impl Into<String>,
        operation: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        E: fmt::Display,
    {
        self.call(dependency).run(operation).await
    }
}

/// Builder for [`ResiliencePipeline`].
#[derive(Debug, Clone, Default)]
pub struct ResiliencePipelineBuilder {
    pipeline: ResiliencePipeline,
}

impl ResiliencePipelineBuilder {
    /// Gate calls with `limiter`.
    #[must_use]
    pub fn rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.pipeline.limiter = Some(limiter);
        self
    }

    /// Wait up to `timeout` for a token instead of rejecting immediately.
    #[must_use]
    pub const fn acquire_timeout(mut self, timeout: Duration) -> Self {
        self.pipeline.acquire_timeout = Some(timeout);
        self
    }

    /// Guard each dependency with a breaker from `registry`.
    #[must_use]
    pub fn breakers(mut self, registry: Arc<BreakerRegistry>) -> Self {
        self.pipeline.breakers = Some(registry);
        self
    }

    /// Retry failed attempts with `policy`.
    #[must_use]
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.pipeline.retry = Some(policy);
        self
    }

    /// Dead-letter terminal failures of calls that carry a payload.
    #[must_use]
    pub fn dead_letter_queue(mut self, queue: Arc<DeadLetterQueue>) -> Self {
        self.pipeline.dead_letters = Some(queue);
        self
    }

    /// Finish the pipeline.
    #[must_use]
    pub fn build(self) -> ResiliencePipeline {
        self.pipeline
    }
}

/// One call through a [`ResiliencePipeline`].
#[must_use = "a call does nothing until `run` is awaited"]
pub struct Call<'p> {
    pipeline: &'p ResiliencePipeline,
    dependency: String,
    rate_key: Option<String>,
    payload: Option<Result<serde_json::Value, StorageError>>,
    metadata: Metadata,
    signal: CancellationSignal,
}

impl fmt::Debug for Call<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("dependency", &self.dependency)
            .field("rate_key", &self.rate_key)
            .field("has_payload", &self.payload.is_some())
            .finish_non_exhaustive()
    }
}

impl Call<'_> {
    /// Take rate limiter tokens from `key` instead of the dependency's bucket.
    pub fn rate_key(mut self, key: impl Into<String>) -> Self {
        self.rate_key = Some(key.into());
        self
    }

    /// Opt in to dead-lettering: store `payload` if the call fails terminally.
    ///
    /// The payload is serialized now. If that fails, a terminal failure is
    /// reported as [`ResilienceError::DeadLetterFailed`].
    pub fn payload<P: Serialize + ?Sized>(mut self, payload: &P) -> Self {
        self.payload = Some(
            serde_json::to_value(payload).map_err(|e| StorageError::Serialization(e.to_string())),
        );
        self
    }

    /// Attach metadata to a dead letter written by this call.
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Abort retries once `signal` fires.
    pub fn cancel_on(mut self, signal: CancellationSignal) -> Self {
        self.signal = signal;
        self
    }

    /// Run `operation` through every configured layer.
    ///
    /// # Errors
    ///
    /// Exactly one taxonomy error per failed call:
    /// [`RateLimitExceeded`](ResilienceError::RateLimitExceeded) or
    /// [`RateLimitTimeout`](ResilienceError::RateLimitTimeout) from the
    /// limiter, [`CircuitOpen`](ResilienceError::CircuitOpen) or
    /// [`Timeout`](ResilienceError::Timeout) from the breaker,
    /// [`RetriesExhausted`](ResilienceError::RetriesExhausted) or
    /// [`Cancelled`](ResilienceError::Cancelled) from the retry loop, the
    /// operation's own error, or
    /// [`DeadLetterFailed`](ResilienceError::DeadLetterFailed) when a
    /// terminal failure could not be stored.
    pub async fn run<F, Fut, T, E>(self, mut operation: F) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
        E: fmt::Display,
    {
        let started = Instant::now();
        let result = match self.guarded(&mut operation).await {
            Ok(value) => Ok(value),
            Err(err) => Err(self.route(err).await),
        };

        let outcome = result.as_ref().err().map(ResilienceError::kind);
        PipelineMetrics::record_call(outcome, started.elapsed());
        tracing::debug!(
            dependency = %self.dependency,
            outcome = outcome.map_or("success", ErrorKind::as_str),
            elapsed_ms = started.elapsed().as_millis(),
            "Pipeline call finished"
        );
        result
    }

    async fn guarded<F, Fut, T, E>(&self, operation: &mut F) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        if self.signal.is_cancelled() {
            return Err(ResilienceError::Cancelled { attempts: 0 });
        }

        if let Some(limiter) = &self.pipeline.limiter {
            let key = self.rate_key.as_deref().unwrap_or(&self.dependency);
            match self.pipeline.acquire_timeout {
                Some(timeout) => limiter.acquire(key, timeout).await?,
                None => limiter.check(key)?,
            }
        }

        match &self.pipeline.breakers {
            Some(registry) => {
                let breaker = registry.get_or_create(&self.dependency);
                // Futures are lazy: nothing runs unless the breaker admits the call.
                let retried = self.retried(operation);
                breaker.call(move || retried).await
            }
            None => self.retried(operation).await,
        }
    }

    async fn retried<F, Fut, T, E>(&self, operation: &mut F) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        match &self.pipeline.retry {
            Some(policy) => policy.retry_with_cancel(&mut *operation, &self.signal).await,
            None => operation().await,
        }
    }

    async fn route<E: fmt::Display>(&self, err: ResilienceError<E>) -> ResilienceError<E> {
        let (Some(queue), Some(payload)) = (&self.pipeline.dead_letters, &self.payload) else {
            return err;
        };
        match payload {
            Ok(payload) => {
                queue
                    .dead_letter_value(
                        payload.clone(),
                        err,
                        Some(&self.dependency),
                        self.metadata.clone(),
                    )
                    .await
            }
            Err(storage) if is_terminal(&err) => ResilienceError::DeadLetterFailed {
                error: Box::new(err),
                storage: storage.clone(),
            },
            Err(_) => err,
        }
    }
}

const fn is_terminal<E>(err: &ResilienceError<E>) -> bool {
    matches!(
        err,
        ResilienceError::Permanent(_) | ResilienceError::RetriesExhausted { .. }
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use crate::circuit_breaker::{CircuitBreakerConfig, State};
    use crate::dead_letter_queue::{MemoryStorage, MessageFilter, PageRequest};
    use crate::rate_limiter::RateLimiterConfig;
    use bulwark_core::{FailureClass, cancellation};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy::builder()
            .max_attempts(max_attempts)
            .base_delay(Duration::from_millis(10))
            .jitter_factor(0.0)
            .build()
            .unwrap()
    }

    fn breakers(failure_threshold: u32) -> Arc<BreakerRegistry> {
        let template = CircuitBreakerConfig::builder()
            .failure_threshold(failure_threshold)
            .open_timeout(Duration::from_secs(30))
            .build()
            .unwrap();
        Arc::new(BreakerRegistry::new(template))
    }

    fn dead_letters() -> Arc<DeadLetterQueue> {
        Arc::new(DeadLetterQueue::new(Arc::new(MemoryStorage::new())))
    }

    async fn queued(queue: &DeadLetterQueue) -> Vec<bulwark_core::DeadLetterMessage> {
        queue
            .get_messages(&MessageFilter::default(), PageRequest::first(100))
            .await
            .unwrap()
            .messages
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_reach_dead_letter_queue() {
        let queue = dead_letters();
        let pipeline = ResiliencePipeline::builder()
            .breakers(breakers(5))
            .retry(fast_retry(3))
            .dead_letter_queue(Arc::clone(&queue))
            .build();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = pipeline
            .call("payments")
            .payload(&serde_json::json!({"order_id": "ORD-1"}))
            .metadata("user_id", "u-7")
            .run(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ResilienceError::Transient("gateway reset".to_string()))
            })
            .await;

        assert!(matches!(result, Err(ResilienceError::RetriesExhausted { attempts: 3, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        let messages = queued(&queue).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].class, FailureClass::Transient);
        assert_eq!(messages[0].attempt_count, 3);
        assert_eq!(messages[0].source.as_deref(), Some("payments"));
        assert_eq!(messages[0].metadata.get("user_id"), Some(&serde_json::json!("u-7")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_exhausted_loop_is_one_breaker_failure() {
        let registry = breakers(2);
        let pipeline = ResiliencePipeline::builder()
            .breakers(Arc::clone(&registry))
            .retry(fast_retry(3))
            .build();
        let calls = AtomicU32::new(0);
        let failing = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err::<(), _>(ResilienceError::Transient("down".to_string()))
        };

        let _ = pipeline.execute("search", failing).await;
        assert_eq!(registry.get("search").unwrap().state(), State::Closed);

        let _ = pipeline.execute("search", failing).await;
        assert_eq!(registry.get("search").unwrap().state(), State::Open);
        assert_eq!(calls.load(Ordering::SeqCst), 6);

        // Open circuit: no retries, no invocation
        let result = pipeline.execute("search", failing).await;
        assert!(matches!(result, Err(ResilienceError::CircuitOpen { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_admission_denials_skip_dead_letter_queue() {
        let queue = dead_letters();
        let limiter = Arc::new(RateLimiter::new(RateLimiterConfig::new(1.0, Duration::from_secs(60))));
        let pipeline = ResiliencePipeline::builder()
            .rate_limiter(limiter)
            .retry(fast_retry(2))
            .dead_letter_queue(Arc::clone(&queue))
            .build();

        let first = pipeline
            .call("email")
            .payload(&1)
            .run(|| async { Ok::<_, ResilienceError<String>>(()) })
            .await;
        assert!(first.is_ok());

        let second = pipeline
            .call("email")
            .payload(&2)
            .run(|| async { Ok::<_, ResilienceError<String>>(()) })
            .await;
        assert!(matches!(second, Err(ResilienceError::RateLimitExceeded { ref key }) if key == "email"));
        assert!(queued(&queue).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_timeout_is_deterministic() {
        let limiter = Arc::new(RateLimiter::new(RateLimiterConfig::new(1.0, Duration::from_secs(10))));
        let pipeline = ResiliencePipeline::builder()
            .rate_limiter(limiter)
            .acquire_timeout(Duration::from_secs(2))
            .build();

        pipeline
            .execute("sms", || async { Ok::<_, ResilienceError<String>>(()) })
            .await
            .unwrap();

        let started = Instant::now();
        let result = pipeline
            .execute("sms", || async { Ok::<_, ResilienceError<String>>(()) })
            .await;

        assert!(matches!(result, Err(ResilienceError::RateLimitTimeout { .. })));
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_key_overrides_dependency_bucket() {
        let limiter = Arc::new(RateLimiter::new(RateLimiterConfig::new(1.0, Duration::from_secs(60))));
        let pipeline = ResiliencePipeline::builder()
            .rate_limiter(Arc::clone(&limiter))
            .build();

        for user in ["alice", "bob"] {
            pipeline
                .call("api")
                .rate_key(user)
                .run(|| async { Ok::<_, ResilienceError<String>>(()) })
                .await
                .unwrap();
        }

        assert!(limiter.tokens_remaining("alice") < 1.0);
        assert!(limiter.tokens_remaining("bob") < 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_errors_are_not_retried_but_are_dead_lettered() {
        let queue = dead_letters();
        let pipeline = ResiliencePipeline::builder()
            .retry(fast_retry(5))
            .dead_letter_queue(Arc::clone(&queue))
            .build();
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = pipeline
            .call("billing")
            .payload(&"invoice-9")
            .run(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ResilienceError::Permanent("invalid card".to_string()))
            })
            .await;

        assert!(matches!(result, Err(ResilienceError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let messages = queued(&queue).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].class, FailureClass::Permanent);
        assert_eq!(messages[0].reason, "Permanent failure: invalid card");
    }

    #[tokio::test(start_paused = true)]
    async fn test_without_payload_nothing_is_dead_lettered() {
        let queue = dead_letters();
        let pipeline = ResiliencePipeline::builder()
            .retry(fast_retry(2))
            .dead_letter_queue(Arc::clone(&queue))
            .build();

        let result = pipeline
            .execute("billing", || async {
                Err::<(), _>(ResilienceError::Permanent("invalid card".to_string()))
            })
            .await;

        assert!(result.is_err());
        assert!(queued(&queue).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_before_start() {
        let queue = dead_letters();
        let pipeline = ResiliencePipeline::builder()
            .retry(fast_retry(3))
            .dead_letter_queue(Arc::clone(&queue))
            .build();
        let (handle, signal) = cancellation();
        handle.cancel();
        let calls = AtomicU32::new(0);

        let result = pipeline
            .call("reports")
            .payload(&1)
            .cancel_on(signal)
            .run(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, ResilienceError<String>>(())
            })
            .await;

        assert!(matches!(result, Err(ResilienceError::Cancelled { attempts: 0 })));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(queued(&queue).await.is_empty());
    }

    #[test]
    fn test_from_config_wires_every_section() {
        let config = ResilienceConfig::from_toml_str(
            r"
            [rate_limiter]
            rate = 5.0
            per_secs = 1
            acquire_timeout_ms = 250

            [retry]
            max_attempts = 4
            ",
        )
        .unwrap();

        let pipeline = ResiliencePipeline::from_config(&config).unwrap().build();

        assert_eq!(pipeline.retry_policy().unwrap().max_attempts, 4);
        assert!(pipeline.breakers().unwrap().is_empty());
        assert!((pipeline.rate_limiter().unwrap().config().capacity() - 5.0).abs() < f64::EPSILON);
        assert!(pipeline.dead_letter_queue().is_none());
    }
}
