//! Circuit breaker pattern for preventing cascading failures.
//!
//! A circuit breaker monitors operations and "opens" (stops allowing requests) when
//! failures exceed a threshold, preventing cascading failures in distributed systems.
//!
//! # States
//!
//! - **Closed**: Normal operation. Requests pass through. Classified failures are counted.
//! - **Open**: Too many consecutive failures. Requests fail immediately with
//!   [`ResilienceError::CircuitOpen`] and the operation is never invoked.
//! - **HalfOpen**: The first call after `open_timeout` is let through as a single
//!   probe. While it is in flight every other call is rejected.
//!
//! The only legal edges are Closed→Open, Open→HalfOpen, HalfOpen→Closed and
//! HalfOpen→Open (see [`is_legal_transition`]). There is no manual
//! reset: forcing an open breaker closed would need the Open→Closed edge.
//!
//! # Adaptive threshold
//!
//! With [`AdaptiveThreshold`] set, the failure threshold moves one step per
//! adaptation period from the error rate seen in that period: above 30% it
//! drops (the breaker trips sooner), below 5% it rises. It stays within
//! `[min_threshold, max_threshold]` and a period with fewer than
//! `min_samples` completed calls keeps accumulating instead of adapting.
//!
//! # Example
//!
//! ```rust
//! use bulwark_core::ResilienceError;
//! use bulwark_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CircuitBreakerConfig::builder()
//!     .name("payments")
//!     .failure_threshold(5)
//!     .open_timeout(Duration::from_secs(60))
//!     .success_threshold(2)
//!     .build()?;
//!
//! let breaker = CircuitBreaker::new(config);
//!
//! match breaker.call(|| async {
//!     // Your fallible operation
//!     Ok::<_, ResilienceError<String>>(42)
//! }).await {
//!     Ok(result) => println!("Success: {result}"),
//!     Err(e) => println!("Failed: {e}"),
//! }
//! # Ok(())
//! # }
//! ```

use crate::config::ConfigError;
use crate::metrics::CircuitBreakerMetrics;
use bulwark_core::{ErrorClassifier, ResilienceError};
use dashmap::DashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Error rate above which the adaptive threshold is lowered.
pub const HIGH_ERROR_RATE: f64 = 0.3;

/// Error rate below which the adaptive threshold is raised.
pub const LOW_ERROR_RATE: f64 = 0.05;

/// Bounds and cadence for adjusting the failure threshold at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdaptiveThreshold {
    /// Lowest threshold adaptation may reach
    pub min_threshold: u32,
    /// Highest threshold adaptation may reach
    pub max_threshold: u32,
    /// Minimum time between adjustments
    pub adaptation_period: Duration,
    /// Completed calls required in a window before it is evaluated
    pub min_samples: u32,
}

impl Default for AdaptiveThreshold {
    fn default() -> Self {
        Self {
            min_threshold: 3,
            max_threshold: 20,
            adaptation_period: Duration::from_secs(300),
            min_samples: 10,
        }
    }
}

impl AdaptiveThreshold {
    /// Threshold to use after a window with `error_rate`.
    #[must_use]
    pub fn next_threshold(&self, current: u32, error_rate: f64) -> u32 {
        if error_rate > HIGH_ERROR_RATE {
            current.saturating_sub(1).max(self.min_threshold)
        } else if error_rate < LOW_ERROR_RATE {
            current.saturating_add(1).min(self.max_threshold)
        } else {
            current
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Name used in errors, logs and metric labels
    pub name: String,
    /// Consecutive classified failures before opening the circuit
    pub failure_threshold: u32,
    /// Consecutive probe successes in `HalfOpen` before closing the circuit
    pub success_threshold: u32,
    /// Duration to wait before transitioning from Open to `HalfOpen`
    pub open_timeout: Duration,
    /// Error kinds that count as failures
    pub failure_classifier: ErrorClassifier,
    /// Upper bound on each admitted call, surfaced as `Timeout`
    pub call_timeout: Option<Duration>,
    /// Adjust `failure_threshold` from the observed error rate
    pub adaptive: Option<AdaptiveThreshold>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            failure_threshold: 5,
            success_threshold: 2,
            open_timeout: Duration::from_secs(60),
            failure_classifier: ErrorClassifier::breaker_failures(),
            call_timeout: None,
            adaptive: None,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub const fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder {
            name: None,
            failure_threshold: None,
            success_threshold: None,
            open_timeout: None,
            failure_classifier: None,
            call_timeout: None,
            adaptive: None,
        }
    }

    /// Check thresholds and timeouts.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a zero threshold, a zero call
    /// timeout, or adaptive bounds that do not contain `failure_threshold`.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid(
                "circuit_breaker.failure_threshold",
                "must be at least 1",
            ));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::invalid(
                "circuit_breaker.success_threshold",
                "must be at least 1",
            ));
        }
        if self.call_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::invalid(
                "circuit_breaker.call_timeout",
                "must be greater than zero when set",
            ));
        }
        if let Some(adaptive) = &self.adaptive {
            self.validate_adaptive(adaptive)?;
        }
        Ok(())
    }

    fn validate_adaptive(&self, adaptive: &AdaptiveThreshold) -> Result<(), ConfigError> {
        if adaptive.min_threshold == 0 {
            return Err(ConfigError::invalid(
                "circuit_breaker.adaptive.min_threshold",
                "must be at least 1",
            ));
        }
        if adaptive.max_threshold < adaptive.min_threshold {
            return Err(ConfigError::invalid(
                "circuit_breaker.adaptive.max_threshold",
                "must not be below min_threshold",
            ));
        }
        if !(adaptive.min_threshold..=adaptive.max_threshold).contains(&self.failure_threshold) {
            return Err(ConfigError::invalid(
                "circuit_breaker.failure_threshold",
                "must lie within the adaptive bounds",
            ));
        }
        if adaptive.adaptation_period.is_zero() {
            return Err(ConfigError::invalid(
                "circuit_breaker.adaptive.adaptation_period",
                "must be greater than zero",
            ));
        }
        if adaptive.min_samples == 0 {
            return Err(ConfigError::invalid(
                "circuit_breaker.adaptive.min_samples",
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfigBuilder {
    name: Option<String>,
    failure_threshold: Option<u32>,
    success_threshold: Option<u32>,
    open_timeout: Option<Duration>,
    failure_classifier: Option<ErrorClassifier>,
    call_timeout: Option<Duration>,
    adaptive: Option<AdaptiveThreshold>,
}

impl CircuitBreakerConfigBuilder {
    /// Set the breaker name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the failure threshold.
    ///
    /// Circuit opens after this many consecutive failures.
    #[must_use]
    pub const fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = Some(threshold);
        self
    }

    /// Set the success threshold.
    ///
    /// Number of successful probes in `HalfOpen` state before closing the circuit.
    #[must_use]
    pub const fn success_threshold(mut self, threshold: u32) -> Self {
        self.success_threshold = Some(threshold);
        self
    }

    /// Set the open timeout.
    ///
    /// How long to wait in Open state before trying `HalfOpen`.
    #[must_use]
    pub const fn open_timeout(mut self, duration: Duration) -> Self {
        self.open_timeout = Some(duration);
        self
    }

    /// Set which error kinds count as failures.
    #[must_use]
    pub fn failure_classifier(mut self, classifier: ErrorClassifier) -> Self {
        self.failure_classifier = Some(classifier);
        self
    }

    /// Bound every admitted call by `timeout`.
    #[must_use]
    pub const fn call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    /// Let the failure threshold adapt to the observed error rate.
    ///
    /// `failure_threshold` is the starting point and must lie within the bounds.
    #[must_use]
    pub const fn adaptive(mut self, adaptive: AdaptiveThreshold) -> Self {
        self.adaptive = Some(adaptive);
        self
    }

    /// Build and validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] if the values fail [`CircuitBreakerConfig::validate`].
    pub fn build(self) -> Result<CircuitBreakerConfig, ConfigError> {
        let defaults = CircuitBreakerConfig::default();
        let config = CircuitBreakerConfig {
            name: self.name.unwrap_or(defaults.name),
            failure_threshold: self.failure_threshold.unwrap_or(defaults.failure_threshold),
            success_threshold: self.success_threshold.unwrap_or(defaults.success_threshold),
            open_timeout: self.open_timeout.unwrap_or(defaults.open_timeout),
            failure_classifier: self
                .failure_classifier
                .unwrap_or(defaults.failure_classifier),
            call_timeout: self.call_timeout,
            adaptive: self.adaptive,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// Circuit is closed, requests pass through normally
    Closed,
    /// Circuit is open, requests fail immediately
    Open,
    /// Circuit is half-open, testing if service recovered
    HalfOpen,
}

impl State {
    /// Lowercase name used in logs and metric labels.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    /// Gauge value: 0 = Closed, 1 = `HalfOpen`, 2 = Open.
    #[must_use]
    pub const fn metric_value(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether `from → to` is one of the four edges the breaker may take.
#[must_use]
pub const fn is_legal_transition(from: State, to: State) -> bool {
    matches!(
        (from, to),
        (State::Closed, State::Open)
            | (State::Open, State::HalfOpen)
            | (State::HalfOpen, State::Closed | State::Open)
    )
}

/// A transition reported to state-change listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    /// Breaker name
    pub breaker: String,
    /// State before the transition
    pub from: State,
    /// State after the transition
    pub to: State,
}

/// Callback invoked after every transition, outside the breaker lock.
pub type StateListener = Arc<dyn Fn(&StateChange) + Send + Sync>;

/// Internal state of the circuit breaker.
#[derive(Debug)]
struct CircuitBreakerState {
    state: State,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    last_failure_at: Option<Instant>,
    probe_in_flight: bool,
    // Bumped on every transition; results admitted under an older value are ignored.
    generation: u64,
    // Threshold in effect; only moves when adaptation is configured.
    failure_threshold: u32,
    window_started: Instant,
    window_calls: u32,
    window_failures: u32,
}

/// Ticket handed out by admission control.
#[derive(Debug, Clone, Copy)]
struct Permit {
    generation: u64,
    probe: bool,
}

/// Circuit breaker for preventing cascading failures.
///
/// Wraps operations and monitors their success/failure. When classified
/// failures reach a threshold the circuit opens and rejects requests until
/// `open_timeout` has elapsed.
///
/// Cloning is cheap and every clone shares the same state.
#[derive(Clone)]
pub struct CircuitBreaker {
    config: Arc<CircuitBreakerConfig>,
    state: Arc<Mutex<CircuitBreakerState>>,
    listener: Option<StateListener>,
    // Metrics
    total_calls: Arc<AtomicU64>,
    total_successes: Arc<AtomicU64>,
    total_failures: Arc<AtomicU64>,
    total_rejections: Arc<AtomicU64>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration.
    #[must_use]
    pub fn new(config: CircuitBreakerConfig) -> Self {
        CircuitBreakerMetrics::record_state(&config.name, State::Closed);
        let failure_threshold = config.failure_threshold;
        Self {
            config: Arc::new(config),
            state: Arc::new(Mutex::new(CircuitBreakerState {
                state: State::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
                last_failure_at: None,
                probe_in_flight: false,
                generation: 0,
                failure_threshold,
                window_started: Instant::now(),
                window_calls: 0,
                window_failures: 0,
            })),
            listener: None,
            total_calls: Arc::new(AtomicU64::new(0)),
            total_successes: Arc::new(AtomicU64::new(0)),
            total_failures: Arc::new(AtomicU64::new(0)),
            total_rejections: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Register a callback invoked after every state transition.
    #[must_use]
    pub fn on_state_change(mut self, listener: StateListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Breaker name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Breaker configuration.
    #[must_use]
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get the current state of the circuit breaker.
    ///
    /// An open breaker whose timeout has elapsed still reports `Open` until
    /// the next call moves it to `HalfOpen`.
    #[must_use]
    pub fn state(&self) -> State {
        self.lock().state
    }

    /// Call an operation through the circuit breaker.
    ///
    /// The breaker's lock is never held while `operation` runs. If the
    /// returned future is dropped while a probe is in flight the probe gate
    /// is released and the state stays `HalfOpen`.
    ///
    /// # Errors
    ///
    /// Returns [`ResilienceError::CircuitOpen`] if the circuit is open or a
    /// probe is already in flight, [`ResilienceError::Timeout`] if the call
    /// exceeded `call_timeout`, or the operation's own error.
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ResilienceError<E>>>,
    {
        let mut guard = self.admit()?;

        let result = match self.config.call_timeout {
            Some(limit) => tokio::time::timeout(limit, operation())
                .await
                .unwrap_or(Err(ResilienceError::Timeout(limit))),
            None => operation().await,
        };

        guard.complete(&result);
        result
    }

    /// Blocking variant of [`call`](Self::call) for callers on plain threads.
    ///
    /// Shares the same state machine. `call_timeout` is not applied because a
    /// blocking operation cannot be interrupted.
    ///
    /// # Errors
    ///
    /// Same as [`call`](Self::call), minus `Timeout`.
    pub fn call_blocking<F, T, E>(&self, operation: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Result<T, ResilienceError<E>>,
    {
        let mut guard = self.admit()?;
        let result = operation();
        guard.complete(&result);
        result
    }

    /// Snapshot of state, counters and lifetime totals.
    #[must_use]
    pub fn status(&self) -> CircuitBreakerStatus {
        let now = Instant::now();
        let state = self.lock();
        let time_until_half_open = match (state.state, state.opened_at) {
            (State::Open, Some(opened_at)) => Some(
                self.config
                    .open_timeout
                    .saturating_sub(now.saturating_duration_since(opened_at)),
            ),
            _ => None,
        };

        CircuitBreakerStatus {
            name: self.config.name.clone(),
            state: state.state,
            failure_count: state.consecutive_failures,
            success_count: state.consecutive_successes,
            failure_threshold: state.failure_threshold,
            time_until_half_open,
            last_failure_age: state
                .last_failure_at
                .map(|at| now.saturating_duration_since(at)),
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CircuitBreakerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decide whether a call may run, moving Open→HalfOpen once the timeout elapsed.
    fn admit<E>(&self) -> Result<PermitGuard<'_>, ResilienceError<E>> {
        self.total_calls.fetch_add(1, Ordering::Relaxed);
        CircuitBreakerMetrics::record_call(&self.config.name);

        let mut transition = None;
        let permit = {
            let mut state = self.lock();
            match state.state {
                State::Closed => Some(Permit {
                    generation: state.generation,
                    probe: false,
                }),
                State::Open => {
                    let elapsed = state
                        .opened_at
                        .is_none_or(|at| at.elapsed() >= self.config.open_timeout);
                    if elapsed {
                        transition = Some(self.transition(&mut state, State::HalfOpen));
                        state.probe_in_flight = true;
                        Some(Permit {
                            generation: state.generation,
                            probe: true,
                        })
                    } else {
                        None
                    }
                }
                State::HalfOpen => {
                    if state.probe_in_flight {
                        None
                    } else {
                        state.probe_in_flight = true;
                        Some(Permit {
                            generation: state.generation,
                            probe: true,
                        })
                    }
                }
            }
        };

        if let Some(change) = transition {
            self.notify(change);
        }

        match permit {
            Some(permit) => {
                if permit.probe {
                    tracing::debug!(breaker = %self.config.name, "Admitting half-open probe");
                }
                Ok(PermitGuard {
                    breaker: self,
                    permit,
                    completed: false,
                })
            }
            None => {
                self.total_rejections.fetch_add(1, Ordering::Relaxed);
                CircuitBreakerMetrics::record_rejection(&self.config.name);
                tracing::warn!(breaker = %self.config.name, "Circuit breaker is OPEN, rejecting request");
                Err(ResilienceError::CircuitOpen {
                    name: self.config.name.clone(),
                })
            }
        }
    }

    /// Apply a transition under the lock and return it for notification.
    fn transition(&self, state: &mut CircuitBreakerState, to: State) -> StateChange {
        let from = state.state;
        debug_assert!(is_legal_transition(from, to), "illegal transition {from} -> {to}");

        state.state = to;
        state.generation = state.generation.wrapping_add(1);
        state.probe_in_flight = false;
        match to {
            State::Open => {
                state.opened_at = Some(Instant::now());
                state.consecutive_successes = 0;
            }
            State::HalfOpen => {
                state.consecutive_failures = 0;
                state.consecutive_successes = 0;
            }
            State::Closed => {
                state.consecutive_failures = 0;
                state.consecutive_successes = 0;
                state.opened_at = None;
            }
        }

        StateChange {
            breaker: self.config.name.clone(),
            from,
            to,
        }
    }

    /// Log, record and publish a transition. Must be called without the lock.
    fn notify(&self, change: StateChange) {
        match change.to {
            State::Open => tracing::warn!(
                breaker = %change.breaker,
                from = %change.from,
                "Circuit breaker transitioning to OPEN"
            ),
            State::HalfOpen => tracing::info!(
                breaker = %change.breaker,
                "Circuit breaker transitioning OPEN -> HALF_OPEN"
            ),
            State::Closed => tracing::info!(
                breaker = %change.breaker,
                "Circuit breaker transitioning HALF_OPEN -> CLOSED"
            ),
        }
        CircuitBreakerMetrics::record_transition(&change.breaker, change.from, change.to);

        if let Some(listener) = &self.listener {
            listener(&change);
        }
    }

    fn on_success(&self, permit: Permit) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        CircuitBreakerMetrics::record_success(&self.config.name);

        let transition = {
            let mut state = self.lock();
            self.observe(&mut state, false);
            if state.generation != permit.generation {
                None
            } else {
                match state.state {
                    State::Closed => {
                        state.consecutive_failures = 0;
                        None
                    }
                    State::HalfOpen => {
                        state.probe_in_flight = false;
                        state.consecutive_successes += 1;
                        if state.consecutive_successes >= self.config.success_threshold {
                            Some(self.transition(&mut state, State::Closed))
                        } else {
                            None
                        }
                    }
                    State::Open => None,
                }
            }
        };

        if let Some(change) = transition {
            self.notify(change);
        }
    }

    fn on_failure(&self, permit: Permit) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        CircuitBreakerMetrics::record_failure(&self.config.name);

        let transition = {
            let mut state = self.lock();
            state.last_failure_at = Some(Instant::now());
            self.observe(&mut state, true);
            if state.generation != permit.generation {
                None
            } else {
                match state.state {
                    State::Closed => {
                        state.consecutive_failures += 1;
                        state.consecutive_successes = 0;
                        if state.consecutive_failures >= state.failure_threshold {
                            tracing::warn!(
                                breaker = %self.config.name,
                                failures = state.consecutive_failures,
                                threshold = state.failure_threshold,
                                "Failure threshold reached"
                            );
                            Some(self.transition(&mut state, State::Open))
                        } else {
                            None
                        }
                    }
                    State::HalfOpen => {
                        tracing::warn!(breaker = %self.config.name, "Half-open probe failed (recovery failed)");
                        Some(self.transition(&mut state, State::Open))
                    }
                    State::Open => None,
                }
            }
        };

        if let Some(change) = transition {
            self.notify(change);
        }
    }

    /// Count a completed call in the adaptation window and step the threshold
    /// once the period has elapsed with enough samples.
    fn observe(&self, state: &mut CircuitBreakerState, failed: bool) {
        let Some(adaptive) = &self.config.adaptive else {
            return;
        };
        state.window_calls = state.window_calls.saturating_add(1);
        if failed {
            state.window_failures = state.window_failures.saturating_add(1);
        }

        let now = Instant::now();
        if now.saturating_duration_since(state.window_started) < adaptive.adaptation_period
            || state.window_calls < adaptive.min_samples
        {
            return;
        }

        let error_rate = f64::from(state.window_failures) / f64::from(state.window_calls);
        let current = state.failure_threshold;
        let next = adaptive.next_threshold(current, error_rate);
        if next != current {
            tracing::info!(
                breaker = %self.config.name,
                from = current,
                to = next,
                error_rate,
                "Adapting failure threshold"
            );
            state.failure_threshold = next;
        }
        state.window_started = now;
        state.window_calls = 0;
        state.window_failures = 0;
    }

    /// Free the probe gate without changing state.
    fn release_probe(&self, permit: Permit) {
        if !permit.probe {
            return;
        }
        let mut state = self.lock();
        if state.generation == permit.generation && state.state == State::HalfOpen {
            state.probe_in_flight = false;
        }
    }
}

/// Holds an admitted permit; releases the probe gate if dropped unfinished.
struct PermitGuard<'a> {
    breaker: &'a CircuitBreaker,
    permit: Permit,
    completed: bool,
}

impl PermitGuard<'_> {
    fn complete<T, E>(&mut self, result: &Result<T, ResilienceError<E>>) {
        self.completed = true;
        match result {
            Ok(_) => self.breaker.on_success(self.permit),
            Err(err) if self.breaker.config.failure_classifier.matches_error(err) => {
                self.breaker.on_failure(self.permit);
            }
            Err(err) => {
                tracing::debug!(
                    breaker = %self.breaker.config.name,
                    kind = %err.kind(),
                    "Unclassified error passed through breaker"
                );
                self.breaker.release_probe(self.permit);
            }
        }
    }
}

impl Drop for PermitGuard<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.breaker.release_probe(self.permit);
        }
    }
}

/// Read-only snapshot of a circuit breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerStatus {
    /// Breaker name
    pub name: String,
    /// Current state
    pub state: State,
    /// Consecutive classified failures
    pub failure_count: u32,
    /// Consecutive probe successes
    pub success_count: u32,
    /// Failure threshold currently in effect
    pub failure_threshold: u32,
    /// Time left before the next call becomes a probe (Open only)
    pub time_until_half_open: Option<Duration>,
    /// Time since the most recent classified failure
    pub last_failure_age: Option<Duration>,
    /// Total number of calls attempted
    pub total_calls: u64,
    /// Total number of successful calls
    pub total_successes: u64,
    /// Total number of classified failures
    pub total_failures: u64,
    /// Total number of rejected calls
    pub total_rejections: u64,
}

impl CircuitBreakerStatus {
    /// Calculate success rate (0.0 to 1.0) over admitted calls.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> f64 {
        let admitted = self.total_calls.saturating_sub(self.total_rejections);
        if admitted == 0 {
            return 1.0;
        }
        self.total_successes as f64 / admitted as f64
    }

    /// Calculate failure rate (0.0 to 1.0) over admitted calls.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn failure_rate(&self) -> f64 {
        let admitted = self.total_calls.saturating_sub(self.total_rejections);
        if admitted == 0 {
            return 0.0;
        }
        self.total_failures as f64 / admitted as f64
    }

    /// Calculate rejection rate (0.0 to 1.0).
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn rejection_rate(&self) -> f64 {
        if self.total_calls == 0 {
            return 0.0;
        }
        self.total_rejections as f64 / self.total_calls as f64
    }
}

/// Lazily created breakers, one per dependency key, from a shared template.
///
/// Each breaker has its own lock; the map itself is sharded so looking up
/// one dependency never blocks another.
pub struct BreakerRegistry {
    template: CircuitBreakerConfig,
    listener: Option<StateListener>,
    breakers: DashMap<String, CircuitBreaker>,
}

impl fmt::Debug for BreakerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerRegistry")
            .field("template", &self.template)
            .field("breakers", &self.breakers.len())
            .finish_non_exhaustive()
    }
}

impl BreakerRegistry {
    /// Create an empty registry. Each breaker gets `template` with its key as name.
    #[must_use]
    pub fn new(template: CircuitBreakerConfig) -> Self {
        Self {
            template,
            listener: None,
            breakers: DashMap::new(),
        }
    }

    /// Attach a state-change listener to every breaker created from now on.
    #[must_use]
    pub fn on_state_change(mut self, listener: StateListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Breaker for `key`, created on first use.
    pub fn get_or_create(&self, key: &str) -> CircuitBreaker {
        if let Some(existing) = self.breakers.get(key) {
            return existing.value().clone();
        }

        self.breakers
            .entry(key.to_owned())
            .or_insert_with(|| {
                let config = CircuitBreakerConfig {
                    name: key.to_owned(),
                    ..self.template.clone()
                };
                let breaker = CircuitBreaker::new(config);
                match &self.listener {
                    Some(listener) => breaker.on_state_change(Arc::clone(listener)),
                    None => breaker,
                }
            })
            .value()
            .clone()
    }

    /// Breaker for `key` if it exists.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<CircuitBreaker> {
        self.breakers.get(key).map(|entry| entry.value().clone())
    }

    /// Status of every breaker, sorted by name.
    #[must_use]
    pub fn statuses(&self) -> Vec<CircuitBreakerStatus> {
        let mut statuses: Vec<_> = self
            .breakers
            .iter()
            .map(|entry| entry.value().status())
            .collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Number of breakers created so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// Whether no breaker has been created yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}
