//! Admission path benchmarks
//!
//! Measures the per-call overhead each pattern adds before the wrapped
//! operation runs:
//! - `RateLimiter`: token checks on one hot key and across many keys
//! - `CircuitBreaker`: closed-state calls and open-state rejections
//! - `RetryPolicy`: delay calculation
//! - `ResiliencePipeline`: the full stack around a successful call
//!
//! Run with: `cargo bench --bench admission`

#![allow(missing_docs)] // Benchmarks don't need extensive docs
#![allow(clippy::expect_used)] // Benchmarks can use expect for setup

use bulwark_core::ResilienceError;
use bulwark_runtime::{
    BreakerRegistry, CircuitBreaker, CircuitBreakerConfig, RateLimiter, RateLimiterConfig,
    ResiliencePipeline, RetryPolicy,
};
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use std::sync::Arc;
use std::time::Duration;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("Failed to build runtime")
}

/// Benchmark token bucket checks
fn benchmark_rate_limiter(c: &mut Criterion) {
    let mut group = c.benchmark_group("rate_limiter");
    group.throughput(Throughput::Elements(1));

    let limiter = RateLimiter::new(RateLimiterConfig::new(1e9, Duration::from_secs(1)));

    group.bench_function("allow_hot_key", |b| {
        b.iter(|| black_box(limiter.allow(black_box("api"))));
    });

    for keys in [10usize, 1_000] {
        let names: Vec<String> = (0..keys).map(|i| format!("user-{i}")).collect();
        group.bench_with_input(BenchmarkId::new("allow_spread", keys), &names, |b, names| {
            let mut i = 0;
            b.iter(|| {
                i = (i + 1) % names.len();
                black_box(limiter.allow(&names[i]))
            });
        });
    }

    group.finish();
}

/// Benchmark circuit breaker admission
fn benchmark_circuit_breaker(c: &mut Criterion) {
    let mut group = c.benchmark_group("circuit_breaker");
    group.throughput(Throughput::Elements(1));
    let runtime = runtime();

    group.bench_function("state_check", |b| {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
        b.iter(|| black_box(breaker.state()));
    });

    group.bench_function("call_closed", |b| {
        let breaker = CircuitBreaker::new(CircuitBreakerConfig::default());
        b.to_async(&runtime).iter(|| async {
            let _ = breaker
                .call(|| async { Ok::<i32, ResilienceError<String>>(42) })
                .await;
        });
    });

    group.bench_function("reject_open", |b| {
        let config = CircuitBreakerConfig::builder()
            .failure_threshold(1)
            .open_timeout(Duration::from_secs(3600))
            .build()
            .expect("valid config");
        let breaker = CircuitBreaker::new(config);
        let _ = breaker.call_blocking(|| Err::<(), _>(ResilienceError::Transient("down")));

        b.iter(|| {
            black_box(breaker.call_blocking(|| Ok::<i32, ResilienceError<&str>>(1)).is_err())
        });
    });

    group.finish();
}

/// Benchmark backoff calculation
fn benchmark_retry_policy(c: &mut Criterion) {
    let mut group = c.benchmark_group("retry_policy");
    let policy = RetryPolicy::default();

    group.bench_function("delay_for_attempt", |b| {
        b.iter(|| black_box(policy.delay_for_attempt(black_box(4))));
    });

    group.bench_function("with_jitter", |b| {
        b.iter(|| black_box(policy.with_jitter(black_box(Duration::from_millis(400)))));
    });

    group.finish();
}

/// Benchmark the composed stack on the success path
fn benchmark_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline");
    group.throughput(Throughput::Elements(1));
    let runtime = runtime();

    let pipeline = ResiliencePipeline::builder()
        .rate_limiter(Arc::new(RateLimiter::new(RateLimiterConfig::new(
            1e9,
            Duration::from_secs(1),
        ))))
        .breakers(Arc::new(BreakerRegistry::new(CircuitBreakerConfig::default())))
        .retry(RetryPolicy::default())
        .build();

    group.bench_function("execute_success", |b| {
        b.to_async(&runtime).iter(|| async {
            let _ = pipeline
                .execute("inventory", || async { Ok::<i32, ResilienceError<String>>(42) })
                .await;
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    benchmark_rate_limiter,
    benchmark_circuit_breaker,
    benchmark_retry_policy,
    benchmark_pipeline,
);
criterion_main!(benches);
