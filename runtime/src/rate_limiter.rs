//! Rate limiting using the token bucket algorithm.
//!
//! ## Algorithm: Token Bucket
//!
//! ```text
//! Bucket (capacity = rate + burst)
//! ├─ Tokens refill continuously at rate / per
//! ├─ Each admitted request consumes one token (or n for allow_n)
//! └─ Not enough tokens → request rejected (allow) or suspended (acquire)
//! ```
//!
//! On every call the bucket first refills by `elapsed * refill_rate`, capped
//! at capacity, then tries to consume. Token counts never leave
//! `[0, capacity]`.
//!
//! [`RateLimiter`] keeps one bucket per key in a sharded map. Buckets are
//! created lazily (full) and never shared between keys. For limits shared by
//! several processes use [`DistributedRateLimiter`] over a
//! [`BucketStore`](bulwark_core::BucketStore) whose refill-and-consume is a
//! single atomic operation on the store side.
//!
//! ## Usage
//!
//! ```rust
//! use bulwark_runtime::rate_limiter::{RateLimiter, RateLimiterConfig};
//! use std::time::Duration;
//!
//! let limiter = RateLimiter::new(RateLimiterConfig::new(100.0, Duration::from_secs(60)).with_burst(20.0));
//!
//! if limiter.allow("user-42") {
//!     // Request allowed
//! }
//! ```

use crate::config::ConfigError;
use crate::metrics::RateLimiterMetrics;
use bulwark_core::{BucketSpec, BucketStore, ConsumeOutcome, ResilienceError, StorageError, StorageFuture};
use dashmap::DashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Rate limiter configuration.
///
/// `rate` tokens are granted every `per`; `burst` is extra capacity above the
/// steady rate. A new bucket starts with `rate + burst` tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimiterConfig {
    /// Steady-state tokens per `per`
    pub rate: f64,
    /// Window over which `rate` tokens are granted
    pub per: Duration,
    /// Additional capacity above `rate`
    pub burst: f64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            rate: 10.0,
            per: Duration::from_secs(1),
            burst: 0.0,
        }
    }
}

impl RateLimiterConfig {
    /// `rate` tokens per `per`, no burst.
    #[must_use]
    pub const fn new(rate: f64, per: Duration) -> Self {
        Self {
            rate,
            per,
            burst: 0.0,
        }
    }

    /// Set the burst allowance.
    #[must_use]
    pub const fn with_burst(mut self, burst: f64) -> Self {
        self.burst = burst;
        self
    }

    /// `rate + burst`.
    #[must_use]
    pub fn capacity(&self) -> f64 {
        self.rate + self.burst
    }

    /// Tokens added per second: `rate / per`.
    #[must_use]
    pub fn refill_rate(&self) -> f64 {
        self.rate / self.per.as_secs_f64()
    }

    /// Shape handed to a [`BucketStore`].
    #[must_use]
    pub fn spec(&self) -> BucketSpec {
        BucketSpec {
            capacity: self.capacity(),
            refill_rate: self.refill_rate(),
        }
    }

    /// Check that the bucket can ever refill.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a non-positive rate or window, or
    /// a negative burst.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.rate.is_finite() || self.rate <= 0.0 {
            return Err(ConfigError::invalid("rate_limiter.rate", "must be greater than zero"));
        }
        if self.per.is_zero() {
            return Err(ConfigError::invalid("rate_limiter.per", "must be greater than zero"));
        }
        if !self.burst.is_finite() || self.burst < 0.0 {
            return Err(ConfigError::invalid("rate_limiter.burst", "must not be negative"));
        }
        Ok(())
    }
}

/// A single token bucket.
///
/// Time is passed in explicitly so the refill arithmetic can be driven by
/// tests; the keyed limiter calls it with `Instant::now()`.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
    requests: u64,
    allowed: u64,
    rejected: u64,
}

impl TokenBucket {
    /// A full bucket.
    #[must_use]
    pub fn new(capacity: f64, refill_rate: f64, now: Instant) -> Self {
        let capacity = capacity.max(0.0);
        Self {
            capacity,
            tokens: capacity,
            refill_rate: refill_rate.max(0.0),
            last_refill: now,
            requests: 0,
            allowed: 0,
            rejected: 0,
        }
    }

    /// A full bucket shaped by `config`.
    #[must_use]
    pub fn from_config(config: &RateLimiterConfig, now: Instant) -> Self {
        Self::new(config.capacity(), config.refill_rate(), now)
    }

    /// Add tokens for the time elapsed since the last refill.
    ///
    /// A `now` earlier than the last refill adds nothing.
    pub fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        if now > self.last_refill {
            self.last_refill = now;
        }
    }

    /// Refill, then take `tokens` if available.
    pub fn try_consume_at(&mut self, now: Instant, tokens: f64) -> bool {
        self.refill(now);
        self.requests += 1;
        if self.tokens >= tokens {
            self.tokens = (self.tokens - tokens).max(0.0);
            self.allowed += 1;
            true
        } else {
            self.rejected += 1;
            false
        }
    }

    /// Tokens currently in the bucket (as of the last refill).
    #[must_use]
    pub const fn tokens(&self) -> f64 {
        self.tokens
    }

    /// Maximum tokens.
    #[must_use]
    pub const fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Wait until `tokens` will be available, or `None` if they never can be.
    #[must_use]
    pub fn time_until_available(&self, tokens: f64) -> Option<Duration> {
        if tokens > self.capacity || self.refill_rate <= 0.0 {
            return (self.tokens >= tokens).then_some(Duration::ZERO);
        }
        let deficit = (tokens - self.tokens).max(0.0);
        Some(secs_to_duration(deficit / self.refill_rate))
    }

    /// Wait until the bucket is full again.
    #[must_use]
    pub fn time_until_full(&self) -> Duration {
        if self.refill_rate <= 0.0 {
            return Duration::ZERO;
        }
        secs_to_duration((self.capacity - self.tokens).max(0.0) / self.refill_rate)
    }
}

/// Waits too long for a `Duration` saturate to `Duration::MAX`.
fn secs_to_duration(secs: f64) -> Duration {
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// Per-key snapshot from [`RateLimiter::status`].
#[derive(Debug, Clone, PartialEq)]
pub struct KeyStatus {
    /// Rate-limit key
    pub key: String,
    /// Tokens available right now
    pub tokens_remaining: f64,
    /// Bucket capacity
    pub capacity: f64,
    /// Calls seen for this key
    pub requests: u64,
    /// Calls admitted
    pub allowed: u64,
    /// Calls rejected
    pub rejected: u64,
    /// Time until the bucket is full
    pub time_until_full: Duration,
}

/// Aggregate snapshot from [`RateLimiter::stats`].
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterStats {
    /// Calls seen across all keys
    pub total_requests: u64,
    /// Calls admitted across all keys
    pub total_allowed: u64,
    /// Calls rejected across all keys
    pub total_rejected: u64,
    /// Keys with a live bucket
    pub active_keys: usize,
    /// Keys with the most requests, highest first
    pub top_consumers: Vec<(String, u64)>,
}

impl RateLimiterStats {
    /// Rejected / requests (0.0 when idle).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn rejection_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.total_rejected as f64 / self.total_requests as f64
    }
}

/// Keyed token-bucket rate limiter.
///
/// Each bucket has its own mutex, held only for one refill-and-consume.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    buckets: DashMap<String, Arc<Mutex<TokenBucket>>>,
}

impl RateLimiter {
    /// Number of keys reported in [`RateLimiterStats::top_consumers`].
    pub const TOP_CONSUMERS: usize = 10;

    /// Create a limiter; every key gets a bucket shaped by `config`.
    #[must_use]
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            buckets: DashMap::new(),
        }
    }

    /// Limiter configuration.
    #[must_use]
    pub const fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    fn bucket(&self, key: &str) -> Arc<Mutex<TokenBucket>> {
        if let Some(bucket) = self.buckets.get(key) {
            return Arc::clone(bucket.value());
        }

        let bucket = {
            let entry = self.buckets.entry(key.to_owned()).or_insert_with(|| {
                Arc::new(Mutex::new(TokenBucket::from_config(&self.config, Instant::now())))
            });
            Arc::clone(entry.value())
        };
        // Shard guard must be released before len() walks every shard.
        RateLimiterMetrics::record_active_keys(self.buckets.len());
        bucket
    }

    /// Refill and try to take `tokens`; on failure also report the wait.
    fn consume(&self, key: &str, tokens: f64) -> Result<(), Option<Duration>> {
        let bucket = self.bucket(key);
        let mut bucket = bucket.lock().unwrap_or_else(PoisonError::into_inner);
        if bucket.try_consume_at(Instant::now(), tokens) {
            Ok(())
        } else {
            Err(bucket.time_until_available(tokens))
        }
    }

    /// Take one token for `key` without waiting.
    pub fn allow(&self, key: &str) -> bool {
        self.allow_n(key, 1.0)
    }

    /// Take `tokens` for `key` without waiting.
    pub fn allow_n(&self, key: &str, tokens: f64) -> bool {
        let allowed = self.consume(key, tokens).is_ok();
        RateLimiterMetrics::record_decision(allowed);
        if !allowed {
            tracing::warn!(key, tokens, "Rate limit exceeded");
        }
        allowed
    }

    /// Like [`allow`](Self::allow), as a taxonomy error.
    ///
    /// # Errors
    ///
    /// Returns [`ResilienceError::RateLimitExceeded`] if no token was available.
    pub fn check<E>(&self, key: &str) -> Result<(), ResilienceError<E>> {
        if self.allow(key) {
            Ok(())
        } else {
            Err(ResilienceError::RateLimitExceeded {
                key: key.to_owned(),
            })
        }
    }

    /// Take one token for `key`, suspending the task until one is available.
    ///
    /// # Errors
    ///
    /// Returns [`ResilienceError::RateLimitTimeout`] once `timeout` has elapsed
    /// without a token becoming available.
    pub async fn acquire<E>(&self, key: &str, timeout: Duration) -> Result<(), ResilienceError<E>> {
        let start = Instant::now();
        let deadline = start.checked_add(timeout);

        loop {
            let wait = match self.consume(key, 1.0) {
                Ok(()) => {
                    RateLimiterMetrics::record_decision(true);
                    RateLimiterMetrics::record_wait(start.elapsed());
                    return Ok(());
                }
                Err(wait) => wait,
            };

            let now = Instant::now();
            if deadline.is_some_and(|deadline| now >= deadline) {
                return Err(self.acquire_timed_out(key, start.elapsed()));
            }
            let remaining = deadline.map_or(Duration::MAX, |deadline| deadline - now);
            let pause = wait.map_or(remaining, |wait| wait.min(remaining));
            tracing::debug!(key, wait_ms = pause.as_millis(), "Waiting for rate limit token");
            tokio::time::sleep(pause.max(Duration::from_micros(1))).await;
        }
    }

    /// Blocking variant of [`acquire`](Self::acquire); sleeps the current thread.
    ///
    /// # Errors
    ///
    /// Same as [`acquire`](Self::acquire).
    pub fn acquire_blocking<E>(&self, key: &str, timeout: Duration) -> Result<(), ResilienceError<E>> {
        let start = std::time::Instant::now();

        loop {
            let wait = match self.consume(key, 1.0) {
                Ok(()) => {
                    RateLimiterMetrics::record_decision(true);
                    RateLimiterMetrics::record_wait(start.elapsed());
                    return Ok(());
                }
                Err(wait) => wait,
            };

            let elapsed = start.elapsed();
            if elapsed >= timeout {
                return Err(self.acquire_timed_out(key, elapsed));
            }
            let remaining = timeout - elapsed;
            let pause = wait.map_or(remaining, |wait| wait.min(remaining));
            std::thread::sleep(pause.max(Duration::from_micros(1)));
        }
    }

    fn acquire_timed_out<E>(&self, key: &str, waited: Duration) -> ResilienceError<E> {
        RateLimiterMetrics::record_decision(false);
        RateLimiterMetrics::record_timeout();
        tracing::warn!(
            key,
            waited_ms = waited.as_millis(),
            rate = self.config.rate,
            "Timed out waiting for rate limit token"
        );
        ResilienceError::RateLimitTimeout {
            key: key.to_owned(),
            waited,
        }
    }

    /// Run `operation` behind a non-blocking [`check`](Self::check).
    ///
    /// # Errors
    ///
    /// Returns [`ResilienceError::RateLimitExceeded`] without invoking the
    /// operation, or the operation's own error.
    pub async fn limit<F, Fut, T, E>(&self, key: &str, operation: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        self.check(key)?;
        operation().await
    }

    /// Tokens available for `key`; unseen keys report full capacity.
    #[must_use]
    pub fn tokens_remaining(&self, key: &str) -> f64 {
        self.status(key)
            .map_or_else(|| self.config.capacity(), |status| status.tokens_remaining)
    }

    /// Snapshot of `key`'s bucket, if it exists.
    #[must_use]
    pub fn status(&self, key: &str) -> Option<KeyStatus> {
        let bucket = Arc::clone(self.buckets.get(key)?.value());
        let mut bucket = bucket.lock().unwrap_or_else(PoisonError::into_inner);
        bucket.refill(Instant::now());
        Some(KeyStatus {
            key: key.to_owned(),
            tokens_remaining: bucket.tokens(),
            capacity: bucket.capacity(),
            requests: bucket.requests,
            allowed: bucket.allowed,
            rejected: bucket.rejected,
            time_until_full: bucket.time_until_full(),
        })
    }

    /// Totals across every key.
    #[must_use]
    pub fn stats(&self) -> RateLimiterStats {
        let mut stats = RateLimiterStats {
            total_requests: 0,
            total_allowed: 0,
            total_rejected: 0,
            active_keys: 0,
            top_consumers: Vec::new(),
        };

        let snapshot: Vec<(String, Arc<Mutex<TokenBucket>>)> = self
            .buckets
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        for (key, bucket) in snapshot {
            let bucket = bucket.lock().unwrap_or_else(PoisonError::into_inner);
            stats.total_requests += bucket.requests;
            stats.total_allowed += bucket.allowed;
            stats.total_rejected += bucket.rejected;
            stats.active_keys += 1;
            stats.top_consumers.push((key, bucket.requests));
        }

        stats
            .top_consumers
            .sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        stats.top_consumers.truncate(Self::TOP_CONSUMERS);
        stats
    }

    /// Drop `key`'s bucket; its next call starts with a full bucket.
    pub fn reset(&self, key: &str) {
        self.buckets.remove(key);
        RateLimiterMetrics::record_active_keys(self.buckets.len());
    }

    /// Drop every bucket.
    pub fn reset_all(&self) {
        self.buckets.clear();
        RateLimiterMetrics::record_active_keys(0);
    }
}

/// Rate limiter whose buckets live in a shared [`BucketStore`].
///
/// Every decision is one atomic refill-and-consume on the store, so several
/// processes enforcing the same key never double-spend a token.
#[derive(Clone)]
pub struct DistributedRateLimiter {
    config: RateLimiterConfig,
    store: Arc<dyn BucketStore>,
    prefix: String,
}

impl std::fmt::Debug for DistributedRateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedRateLimiter")
            .field("config", &self.config)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

impl DistributedRateLimiter {
    /// Create a limiter over `store`. Keys are stored as `{prefix}:{key}`.
    #[must_use]
    pub fn new(config: RateLimiterConfig, store: Arc<dyn BucketStore>, prefix: impl Into<String>) -> Self {
        Self {
            config,
            store,
            prefix: prefix.into(),
        }
    }

    fn store_key(&self, key: &str) -> String {
        format!("{}:{key}", self.prefix)
    }

    /// Take one token for `key` without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the store could not be reached.
    pub async fn allow(&self, key: &str) -> Result<bool, StorageError> {
        self.allow_n(key, 1.0).await
    }

    /// Take `tokens` for `key` without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the store could not be reached.
    pub async fn allow_n(&self, key: &str, tokens: f64) -> Result<bool, StorageError> {
        let outcome = self.consume(key, tokens).await?;
        Ok(outcome.allowed)
    }

    async fn consume(&self, key: &str, tokens: f64) -> Result<ConsumeOutcome, StorageError> {
        let store_key = self.store_key(key);
        let outcome = self
            .store
            .try_consume(&store_key, self.config.spec(), tokens)
            .await
            .inspect_err(|e| tracing::error!(key, error = %e, "Rate limit store unavailable"))?;

        RateLimiterMetrics::record_decision(outcome.allowed);
        if !outcome.allowed {
            tracing::warn!(key, remaining = outcome.remaining, "Distributed rate limit exceeded");
        }
        Ok(outcome)
    }

    /// Like [`allow`](Self::allow), as a taxonomy error.
    ///
    /// # Errors
    ///
    /// Returns [`ResilienceError::RateLimitExceeded`] if no token was
    /// available, or [`ResilienceError::Transient`] wrapping the
    /// [`StorageError`] if the store could not be reached.
    pub async fn check<E>(&self, key: &str) -> Result<(), ResilienceError<E>>
    where
        E: From<StorageError>,
    {
        if self.consume(key, 1.0).await.map_err(store_failure)?.allowed {
            Ok(())
        } else {
            Err(ResilienceError::RateLimitExceeded {
                key: key.to_owned(),
            })
        }
    }

    /// Take one token for `key`, waiting up to `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`ResilienceError::RateLimitTimeout`] once `timeout` has elapsed
    /// without a token, or [`ResilienceError::Transient`] wrapping the
    /// [`StorageError`] if the store could not be reached.
    pub async fn acquire<E>(&self, key: &str, timeout: Duration) -> Result<(), ResilienceError<E>>
    where
        E: From<StorageError>,
    {
        let start = Instant::now();
        let deadline = start.checked_add(timeout);
        let refill_rate = self.config.refill_rate();

        loop {
            let outcome = self.consume(key, 1.0).await.map_err(store_failure)?;
            if outcome.allowed {
                RateLimiterMetrics::record_wait(start.elapsed());
                return Ok(());
            }

            let now = Instant::now();
            if deadline.is_some_and(|deadline| now >= deadline) {
                let waited = start.elapsed();
                RateLimiterMetrics::record_timeout();
                tracing::warn!(
                    key,
                    waited_ms = waited.as_millis(),
                    "Timed out waiting for distributed rate limit token"
                );
                return Err(ResilienceError::RateLimitTimeout {
                    key: key.to_owned(),
                    waited,
                });
            }
            let remaining = deadline.map_or(Duration::MAX, |deadline| deadline - now);
            let wait = secs_to_duration((1.0 - outcome.remaining).max(0.0) / refill_rate);
            tokio::time::sleep(wait.min(remaining).max(Duration::from_micros(1))).await;
        }
    }
}

fn store_failure<E: From<StorageError>>(error: StorageError) -> ResilienceError<E> {
    ResilienceError::Transient(E::from(error))
}

/// Process-local [`BucketStore`], for tests and single-node deployments.
#[derive(Debug, Default)]
pub struct MemoryBucketStore {
    buckets: DashMap<String, TokenBucket>,
}

impl MemoryBucketStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl BucketStore for MemoryBucketStore {
    fn try_consume<'a>(
        &'a self,
        key: &'a str,
        spec: BucketSpec,
        tokens: f64,
    ) -> StorageFuture<'a, ConsumeOutcome> {
        Box::pin(async move {
            let now = Instant::now();
            let mut bucket = self
                .buckets
                .entry(key.to_owned())
                .or_insert_with(|| TokenBucket::new(spec.capacity, spec.refill_rate, now));
            let allowed = bucket.try_consume_at(now, tokens);
            Ok(ConsumeOutcome {
                allowed,
                remaining: bucket.tokens(),
            })
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn ten_per_second() -> RateLimiter {
        RateLimiter::new(RateLimiterConfig::new(10.0, Duration::from_secs(1)))
    }

    #[test]
    fn test_capacity_includes_burst() {
        let config = RateLimiterConfig::new(100.0, Duration::from_secs(60)).with_burst(20.0);
        assert!((config.capacity() - 120.0).abs() < f64::EPSILON);
        assert!((config.refill_rate() - 100.0 / 60.0).abs() < 1e-12);
    }

    #[test]
    fn test_validation() {
        assert!(RateLimiterConfig::new(0.0, Duration::from_secs(1)).validate().is_err());
        assert!(RateLimiterConfig::new(1.0, Duration::ZERO).validate().is_err());
        assert!(RateLimiterConfig::new(1.0, Duration::from_secs(1))
            .with_burst(-1.0)
            .validate()
            .is_err());
        assert!(RateLimiterConfig::default().validate().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ten_allowed_then_rejected_then_refilled() {
        let limiter = ten_per_second();

        for _ in 0..10 {
            assert!(limiter.allow("default"));
        }
        assert!(!limiter.allow("default"));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.allow("default"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_is_capped_at_capacity() {
        let limiter = ten_per_second();
        assert!(limiter.allow_n("k", 5.0));

        tokio::time::advance(Duration::from_secs(60)).await;

        let status = limiter.status("k").unwrap();
        assert!((status.tokens_remaining - 10.0).abs() < f64::EPSILON);
        assert_eq!(status.time_until_full, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_keys_have_independent_buckets() {
        let limiter = RateLimiter::new(RateLimiterConfig::new(1.0, Duration::from_secs(60)));

        assert!(limiter.allow("alice"));
        assert!(!limiter.allow("alice"));
        assert!(limiter.allow("bob"));
    }

    #[tokio::test]
    async fn test_check_returns_rate_limit_exceeded() {
        let limiter = RateLimiter::new(RateLimiterConfig::new(1.0, Duration::from_secs(60)));

        assert!(limiter.check::<()>("k").is_ok());
        let err = limiter.check::<()>("k").unwrap_err();
        assert!(matches!(err, ResilienceError::RateLimitExceeded { ref key } if key == "k"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_refill() {
        let limiter = ten_per_second();
        assert!(limiter.allow_n("k", 10.0));

        let start = Instant::now();
        limiter
            .acquire::<()>("k", Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(start.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_times_out_deterministically() {
        let limiter = RateLimiter::new(RateLimiterConfig::new(1.0, Duration::from_secs(60)));
        assert!(limiter.allow("k"));

        let start = Instant::now();
        let err = limiter
            .acquire::<()>("k", Duration::from_secs(2))
            .await
            .unwrap_err();

        assert_eq!(start.elapsed(), Duration::from_secs(2));
        assert!(matches!(
            err,
            ResilienceError::RateLimitTimeout { waited, .. } if waited == Duration::from_secs(2)
        ));
    }

    #[tokio::test]
    async fn test_limit_skips_operation_when_exhausted() {
        let limiter = RateLimiter::new(RateLimiterConfig::new(1.0, Duration::from_secs(60)));
        let calls = AtomicU32::new(0);

        for _ in 0..3 {
            let _ = limiter
                .limit("k", || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, ResilienceError<()>>(())
                })
                .await;
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stats_and_reset() {
        let limiter = RateLimiter::new(RateLimiterConfig::new(2.0, Duration::from_secs(60)));

        for _ in 0..3 {
            limiter.allow("heavy");
        }
        limiter.allow("light");

        let stats = limiter.stats();
        assert_eq!(stats.total_requests, 4);
        assert_eq!(stats.total_allowed, 3);
        assert_eq!(stats.total_rejected, 1);
        assert_eq!(stats.active_keys, 2);
        assert_eq!(stats.top_consumers[0], ("heavy".to_string(), 3));
        assert!((stats.rejection_rate() - 0.25).abs() < f64::EPSILON);

        limiter.reset("heavy");
        assert!(limiter.status("heavy").is_none());
        assert!((limiter.tokens_remaining("heavy") - 2.0).abs() < f64::EPSILON);
        assert!(limiter.allow("heavy"));
    }

    #[test]
    fn test_acquire_blocking() {
        let limiter = RateLimiter::new(RateLimiterConfig::new(1000.0, Duration::from_secs(1)));
        assert!(limiter.allow_n("k", 1000.0));

        assert!(limiter
            .acquire_blocking::<()>("k", Duration::from_secs(1))
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_distributed_limiter_over_memory_store() {
        let store = Arc::new(MemoryBucketStore::new());
        let config = RateLimiterConfig::new(2.0, Duration::from_secs(1));
        let a = DistributedRateLimiter::new(config, store.clone(), "api");
        let b = DistributedRateLimiter::new(config, store, "api");

        assert!(a.allow("user").await.unwrap());
        assert!(b.allow("user").await.unwrap());
        assert!(!a.allow("user").await.unwrap());

        b.acquire::<StorageError>("user", Duration::from_secs(1))
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_distributed_acquire_times_out_with_taxonomy_error() {
        let store = Arc::new(MemoryBucketStore::new());
        let limiter = DistributedRateLimiter::new(
            RateLimiterConfig::new(1.0, Duration::from_secs(60)),
            store,
            "api",
        );
        limiter.check::<StorageError>("user").await.unwrap();

        let exceeded = limiter.check::<StorageError>("user").await.unwrap_err();
        assert!(matches!(exceeded, ResilienceError::RateLimitExceeded { ref key } if key == "user"));

        let start = Instant::now();
        let err = limiter
            .acquire::<StorageError>("user", Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_eq!(start.elapsed(), Duration::from_secs(2));
        assert!(err.is_admission_denied());
        assert!(matches!(
            err,
            ResilienceError::RateLimitTimeout { waited, .. } if waited == Duration::from_secs(2)
        ));
    }

    #[tokio::test]
    async fn test_distributed_store_failure_is_transient() {
        struct Unreachable;

        impl BucketStore for Unreachable {
            fn try_consume<'a>(
                &'a self,
                _key: &'a str,
                _spec: BucketSpec,
                _tokens: f64,
            ) -> StorageFuture<'a, ConsumeOutcome> {
                Box::pin(async { Err(StorageError::Database("connection refused".into())) })
            }
        }

        let limiter = DistributedRateLimiter::new(
            RateLimiterConfig::default(),
            Arc::new(Unreachable),
            "api",
        );
        let err = limiter
            .acquire::<StorageError>("user", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ResilienceError::Transient(StorageError::Database(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tiny_refill_rate_saturates_waits() {
        let config = RateLimiterConfig::new(1e-300, Duration::from_secs(1)).with_burst(1.0);
        assert!(config.validate().is_ok());
        let limiter = RateLimiter::new(config);

        assert!(limiter.allow("k"));
        assert!(!limiter.allow("k"));
        assert_eq!(limiter.status("k").unwrap().time_until_full, Duration::MAX);

        let err = limiter
            .acquire::<()>("k", Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, ResilienceError::RateLimitTimeout { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_accepts_unbounded_timeout() {
        let limiter = ten_per_second();
        assert!(limiter.allow_n("k", 10.0));

        limiter.acquire::<()>("k", Duration::MAX).await.unwrap();
    }
}
