//! Prometheus metrics for observability and monitoring.
//!
//! Every resilience pattern records through the recorder structs in this
//! module:
//! - Circuit breaker state, calls and transitions (labelled by breaker name)
//! - Retry attempts, delays and exhaustion
//! - Rate limiter decisions and wait times
//! - Dead letter queue size and lifecycle
//! - Pipeline outcomes and latency
//!
//! Recording is a no-op until a recorder is installed, so libraries can call
//! these unconditionally. Binaries install one with [`MetricsServer`].
//!
//! # Example
//!
//! ```rust,no_run
//! use bulwark_runtime::metrics::MetricsServer;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//!
//! // Metrics available at http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use crate::circuit_breaker::State;
use bulwark_core::ErrorKind;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus metrics server.
///
/// Exposes metrics on an HTTP endpoint for Prometheus scraping.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server.
    ///
    /// # Arguments
    ///
    /// * `addr` - Socket address to bind to (e.g., `0.0.0.0:9090`)
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Register metric descriptions and install the Prometheus exporter.
    ///
    /// The HTTP listener is spawned on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the exporter cannot be built or installed.
    ///
    /// # Note
    ///
    /// If a metrics recorder is already installed (e.g., in tests), this logs a
    /// warning and leaves [`handle`](Self::handle) empty.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let builder = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .set_buckets_for_metric(
                Matcher::Suffix("wait_seconds".to_string()),
                &[0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 60.0],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let (recorder, exporter) = builder
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;
        let handle = recorder.handle();

        match metrics::set_global_recorder(recorder) {
            Ok(()) => {
                tokio::spawn(exporter);
                self.handle = Some(handle);
                tracing::info!(
                    addr = %self.addr,
                    "Metrics server started - available at http://{}/metrics",
                    self.addr
                );
                Ok(())
            }
            Err(_) => {
                tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                Ok(())
            }
        }
    }

    /// Install the Prometheus recorder without an HTTP listener.
    ///
    /// Useful for tests and for binaries that expose `render()` themselves.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError::Install`] if another recorder is installed.
    pub fn install_recorder_only(&mut self) -> Result<(), MetricsError> {
        register_metrics();
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| MetricsError::Install(e.to_string()))?;
        self.handle = Some(handle);
        Ok(())
    }

    /// Get the metrics handle for rendering.
    #[must_use]
    pub const fn handle(&self) -> Option<&PrometheusHandle> {
        self.handle.as_ref()
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if server hasn't been started.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register all metric descriptions.
fn register_metrics() {
    // Circuit Breaker Metrics
    describe_gauge!(
        "circuit_breaker_state",
        "Current circuit breaker state (0=closed, 1=half-open, 2=open)"
    );
    describe_counter!(
        "circuit_breaker_calls_total",
        "Total number of calls through circuit breaker"
    );
    describe_counter!(
        "circuit_breaker_successes_total",
        "Total number of successful calls"
    );
    describe_counter!(
        "circuit_breaker_failures_total",
        "Total number of classified failures"
    );
    describe_counter!(
        "circuit_breaker_rejections_total",
        "Total number of rejected calls (circuit open or probe in flight)"
    );
    describe_counter!(
        "circuit_breaker_transitions_total",
        "Total number of state transitions"
    );

    // Retry Metrics
    describe_counter!("retry_attempts_total", "Total number of retry attempts");
    describe_counter!(
        "retry_successes_total",
        "Total number of operations that succeeded after at least one retry"
    );
    describe_counter!(
        "retry_exhausted_total",
        "Total number of retry loops that used every attempt"
    );
    describe_counter!(
        "retry_cancelled_total",
        "Total number of retry loops stopped by cancellation"
    );
    describe_histogram!(
        "retry_delay_duration_seconds",
        "Backoff delay applied before a retry"
    );

    // Rate Limiter Metrics
    describe_counter!(
        "rate_limiter_requests_total",
        "Total number of admission decisions"
    );
    describe_histogram!(
        "rate_limiter_acquire_wait_seconds",
        "Time spent suspended waiting for a token"
    );
    describe_counter!(
        "rate_limiter_acquire_timeouts_total",
        "Total number of acquire calls that timed out"
    );
    describe_gauge!(
        "rate_limiter_active_keys",
        "Number of keys with a live token bucket"
    );

    // Dead Letter Queue Metrics
    describe_counter!(
        "dlq_messages_sent_total",
        "Total number of messages written to the dead letter queue"
    );
    describe_gauge!("dlq_size", "Current number of messages in the dead letter queue");
    describe_counter!(
        "dlq_replays_total",
        "Total number of replay attempts by outcome"
    );
    describe_counter!(
        "dlq_messages_archived_total",
        "Total number of messages moved to the archive"
    );
    describe_counter!(
        "dlq_messages_purged_total",
        "Total number of messages removed by retention"
    );
    describe_counter!(
        "dlq_storage_errors_total",
        "Total number of storage backend failures"
    );

    // Pipeline Metrics
    describe_counter!("pipeline_calls_total", "Total number of pipeline executions");
    describe_histogram!(
        "pipeline_call_duration_seconds",
        "End-to-end latency of a pipeline execution"
    );
}

/// Circuit breaker metrics recorder.
pub struct CircuitBreakerMetrics;

impl CircuitBreakerMetrics {
    /// Record circuit breaker state.
    ///
    /// 0 = Closed, 1 = `HalfOpen`, 2 = Open
    pub fn record_state(breaker: &str, state: State) {
        gauge!("circuit_breaker_state", "breaker" => breaker.to_owned()).set(state.metric_value());
    }

    /// Record a call attempt.
    pub fn record_call(breaker: &str) {
        counter!("circuit_breaker_calls_total", "breaker" => breaker.to_owned()).increment(1);
    }

    /// Record a successful call.
    pub fn record_success(breaker: &str) {
        counter!("circuit_breaker_successes_total", "breaker" => breaker.to_owned()).increment(1);
    }

    /// Record a classified failure.
    pub fn record_failure(breaker: &str) {
        counter!("circuit_breaker_failures_total", "breaker" => breaker.to_owned()).increment(1);
    }

    /// Record a rejected call.
    pub fn record_rejection(breaker: &str) {
        counter!("circuit_breaker_rejections_total", "breaker" => breaker.to_owned()).increment(1);
    }

    /// Record a state transition.
    pub fn record_transition(breaker: &str, from: State, to: State) {
        counter!(
            "circuit_breaker_transitions_total",
            "breaker" => breaker.to_owned(),
            "from" => from.as_str(),
            "to" => to.as_str()
        )
        .increment(1);
        Self::record_state(breaker, to);
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry attempt and the delay before it.
    pub fn record_attempt(delay: Duration) {
        counter!("retry_attempts_total").increment(1);
        histogram!("retry_delay_duration_seconds").record(delay.as_secs_f64());
    }

    /// Record a success after at least one retry.
    pub fn record_success() {
        counter!("retry_successes_total").increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted() {
        counter!("retry_exhausted_total").increment(1);
    }

    /// Record a cancelled retry loop.
    pub fn record_cancelled() {
        counter!("retry_cancelled_total").increment(1);
    }
}

/// Rate limiter metrics recorder.
pub struct RateLimiterMetrics;

impl RateLimiterMetrics {
    /// Record an admission decision.
    pub fn record_decision(allowed: bool) {
        let outcome = if allowed { "allowed" } else { "rejected" };
        counter!("rate_limiter_requests_total", "outcome" => outcome).increment(1);
    }

    /// Record time spent waiting in `acquire`.
    pub fn record_wait(waited: Duration) {
        histogram!("rate_limiter_acquire_wait_seconds").record(waited.as_secs_f64());
    }

    /// Record an `acquire` timeout.
    pub fn record_timeout() {
        counter!("rate_limiter_acquire_timeouts_total").increment(1);
    }

    /// Record the number of live buckets.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_active_keys(count: usize) {
        gauge!("rate_limiter_active_keys").set(count as f64);
    }
}

/// Dead letter queue metrics recorder.
pub struct DeadLetterMetrics;

impl DeadLetterMetrics {
    /// Record a message written to the queue.
    pub fn record_sent() {
        counter!("dlq_messages_sent_total").increment(1);
    }

    /// Record the current queue size.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_size(size: usize) {
        gauge!("dlq_size").set(size as f64);
    }

    /// Record a replay attempt.
    pub fn record_replay(succeeded: bool) {
        let outcome = if succeeded { "acknowledged" } else { "failed" };
        counter!("dlq_replays_total", "outcome" => outcome).increment(1);
    }

    /// Record archived messages.
    pub fn record_archived(count: usize) {
        counter!("dlq_messages_archived_total").increment(count as u64);
    }

    /// Record purged messages.
    pub fn record_purged(count: usize) {
        counter!("dlq_messages_purged_total").increment(count as u64);
    }

    /// Record a storage failure.
    pub fn record_storage_error() {
        counter!("dlq_storage_errors_total").increment(1);
    }
}

/// Pipeline metrics recorder.
pub struct PipelineMetrics;

impl PipelineMetrics {
    /// Record a pipeline execution with its outcome.
    pub fn record_call(outcome: Option<ErrorKind>, duration: Duration) {
        let outcome = outcome.map_or("success", ErrorKind::as_str);
        counter!("pipeline_calls_total", "outcome" => outcome).increment(1);
        histogram!("pipeline_call_duration_seconds").record(duration.as_secs_f64());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;

    #[test]
    fn test_metrics_server_creation() {
        let addr = "127.0.0.1:0".parse().unwrap();
        let server = MetricsServer::new(addr);
        assert!(server.handle().is_none());
        assert!(server.render().is_none());
    }

    #[test]
    fn test_recorders_without_installed_recorder_are_noops() {
        CircuitBreakerMetrics::record_call("payments");
        CircuitBreakerMetrics::record_transition("payments", State::Closed, State::Open);
        RetryMetrics::record_attempt(Duration::from_millis(100));
        RateLimiterMetrics::record_decision(false);
        DeadLetterMetrics::record_size(3);
        PipelineMetrics::record_call(Some(ErrorKind::CircuitOpen), Duration::from_millis(1));
    }

    #[test]
    fn test_recorder_renders_breaker_metrics() {
        let mut server = MetricsServer::new("127.0.0.1:0".parse().unwrap());

        // Another test binary may own the global recorder; only assert when we got it.
        if server.install_recorder_only().is_ok() {
            CircuitBreakerMetrics::record_call("inventory");
            CircuitBreakerMetrics::record_transition("inventory", State::Closed, State::Open);

            let rendered = server.render().unwrap();
            assert!(rendered.contains("circuit_breaker_calls_total"));
            assert!(rendered.contains("circuit_breaker_transitions_total"));
            assert!(rendered.contains("breaker=\"inventory\""));
        }
    }
}
