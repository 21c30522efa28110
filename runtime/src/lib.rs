//! # Bulwark Runtime
//!
//! Resilience patterns for calls to unreliable dependencies.
//!
//! This crate implements the patterns whose vocabulary lives in
//! `bulwark-core` and composes them into one pipeline.
//!
//! ## Core Components
//!
//! - **Circuit Breaker**: fails fast while a dependency is known to be down
//! - **Retry Policy**: exponential backoff with jitter for transient failures
//! - **Rate Limiter**: keyed token buckets, local or shared through a store
//! - **Dead Letter Queue**: durable sink for terminal failures, with replay
//! - **Pipeline**: rate limiter, then breaker, then retry, then DLQ
//!
//! ## Example
//!
//! ```
//! use bulwark_core::{Metadata, ResilienceError};
//! use bulwark_runtime::{
//!     BreakerRegistry, CircuitBreakerConfig, DeadLetterQueue, MemoryStorage, RateLimiter,
//!     RateLimiterConfig, ResiliencePipeline, RetryPolicy,
//! };
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let dlq = Arc::new(DeadLetterQueue::new(Arc::new(MemoryStorage::new())));
//! let pipeline = ResiliencePipeline::builder()
//!     .rate_limiter(Arc::new(RateLimiter::new(RateLimiterConfig::new(100.0, Duration::from_secs(1)))))
//!     .breakers(Arc::new(BreakerRegistry::new(CircuitBreakerConfig::default())))
//!     .retry(RetryPolicy::default())
//!     .dead_letter_queue(Arc::clone(&dlq))
//!     .build();
//!
//! let result = pipeline
//!     .call("payments")
//!     .payload(&serde_json::json!({"order_id": "ORD-1"}))
//!     .run(|| async { Ok::<_, ResilienceError<String>>("charged") })
//!     .await;
//!
//! assert_eq!(result.ok(), Some("charged"));
//! # }
//! ```

/// Circuit breaker pattern for preventing cascading failures
pub mod circuit_breaker;

/// TOML configuration for every pattern
pub mod config;

pub mod dead_letter_queue;

/// Prometheus metrics for observability
pub mod metrics;

pub mod pipeline;

/// Token-bucket rate limiting
pub mod rate_limiter;

/// Retry logic with exponential backoff
pub mod retry;

pub use circuit_breaker::{
    AdaptiveThreshold, BreakerRegistry, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus,
    State, StateChange, StateListener,
};
pub use config::{ConfigError, DlqBackend, ResilienceConfig};
pub use dead_letter_queue::{
    DeadLetterQueue, DlqError, DlqStats, FileStorage, MemoryStorage, MessageFilter, Page,
    PageRequest, ReplayAttempt, ReplayOutcome, ReplaySummary,
};
pub use metrics::{MetricsError, MetricsServer};
pub use pipeline::{Call, ResiliencePipeline, ResiliencePipelineBuilder};
pub use rate_limiter::{
    DistributedRateLimiter, KeyStatus, MemoryBucketStore, RateLimiter, RateLimiterConfig,
    RateLimiterStats, TokenBucket,
};
pub use retry::{RetryAttempt, RetryPolicy, RetrySchedule};
