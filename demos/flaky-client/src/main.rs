//! Flaky Client - Full Resilience Stack Demo
//!
//! A checkout service charges orders against a payment gateway that drops
//! requests, declines some cards, and suffers a full outage midway through.
//! Every charge goes through the rate limiter, circuit breaker, retry policy
//! and dead letter queue.
//!
//! # Running the Example
//!
//! ```bash
//! BULWARK_CONFIG=demos/flaky-client/flaky-client.toml cargo run -p flaky-client
//! ```
//!
//! Without `BULWARK_CONFIG` the bundled `flaky-client.toml` is used.
//! Metrics are served at <http://localhost:9000/metrics> while the demo runs
//! (override with `METRICS_ADDR`). Press Ctrl+C to stop early.

#![allow(missing_docs)]

use bulwark_core::{FailureClass, ResilienceError, cancellation};
use bulwark_runtime::config::CONFIG_ENV_VAR;
use bulwark_runtime::{
    BreakerRegistry, DeadLetterQueue, MessageFilter, MetricsServer, ResilienceConfig,
    ResiliencePipeline, StateChange,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEPENDENCY: &str = "payment-gateway";
const ORDERS: u32 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Order {
    id: String,
    customer: String,
    amount_cents: u64,
}

#[derive(Debug)]
enum GatewayError {
    Unavailable,
    Declined(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable => write!(f, "gateway unavailable"),
            Self::Declined(reason) => write!(f, "card declined: {reason}"),
        }
    }
}

/// Simulated payment gateway.
struct Gateway {
    failure_rate: f64,
    decline_rate: f64,
    outage: AtomicBool,
}

impl Gateway {
    const fn new(failure_rate: f64, decline_rate: f64) -> Self {
        Self {
            failure_rate,
            decline_rate,
            outage: AtomicBool::new(false),
        }
    }

    fn set_outage(&self, down: bool) {
        if self.outage.swap(down, Ordering::SeqCst) != down {
            tracing::warn!(down, "Gateway outage toggled");
        }
    }

    async fn charge(&self, order: &Order) -> Result<String, ResilienceError<GatewayError>> {
        // Roll before the first await: the thread RNG must not cross it
        let (latency_ms, roll) = {
            let mut rng = rand::thread_rng();
            (rng.gen_range(5..40), rng.gen_range(0.0..1.0))
        };
        tokio::time::sleep(Duration::from_millis(latency_ms)).await;

        if self.outage.load(Ordering::SeqCst) || roll < self.failure_rate {
            return Err(ResilienceError::Transient(GatewayError::Unavailable));
        }
        if roll < self.failure_rate + self.decline_rate {
            return Err(ResilienceError::Permanent(GatewayError::Declined(
                "insufficient funds".to_string(),
            )));
        }
        Ok(format!("rcpt-{}", order.id))
    }
}

fn load_config() -> anyhow::Result<ResilienceConfig> {
    if std::env::var_os(CONFIG_ENV_VAR).is_some() {
        return Ok(ResilienceConfig::from_env()?);
    }
    Ok(ResilienceConfig::from_toml_str(include_str!("../flaky-client.toml"))?)
}

fn log_transition(change: &StateChange) {
    tracing::warn!(
        breaker = %change.breaker,
        from = change.from.as_str(),
        to = change.to.as_str(),
        "Circuit breaker transition"
    );
}

#[tokio::main]
#[allow(clippy::too_many_lines)] // Demo walkthrough
async fn main() -> anyhow::Result<()> {
    // 1. Initialize tracing subscriber
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,bulwark_runtime=info,flaky_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    tracing::info!("Starting flaky client demo");

    // 2. Configuration and metrics
    let config = load_config()?;
    let metrics_addr: SocketAddr = std::env::var("METRICS_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:9000".to_string())
        .parse()?;
    let mut metrics = MetricsServer::new(metrics_addr);
    if let Err(e) = metrics.start() {
        tracing::warn!(error = %e, "Metrics exporter not started");
    }

    // 3. Dead letter queue from the configured backend
    let dlq_config = &config.dead_letter_queue;
    let storage = DeadLetterQueue::open_storage(&dlq_config.backend()?).await?;
    let mut dlq = DeadLetterQueue::new(storage).with_retention(dlq_config.retention());
    if let Some(threshold) = dlq_config.alert_threshold {
        dlq = dlq.with_alert_threshold(threshold);
    }
    let dlq = Arc::new(dlq);

    // 4. Pipeline: limiter -> breaker -> retry -> DLQ
    let breakers = Arc::new(
        BreakerRegistry::new(config.circuit_breaker.to_config(DEPENDENCY)?)
            .on_state_change(Arc::new(log_transition)),
    );
    let pipeline = ResiliencePipeline::from_config(&config)?
        .breakers(Arc::clone(&breakers))
        .dead_letter_queue(Arc::clone(&dlq))
        .build();

    // 5. Ctrl+C stops the run between calls and aborts retry loops
    let (stop, stop_signal) = cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Ctrl+C received, stopping");
            stop.cancel();
        }
    });

    // 6. Traffic, with an outage for orders 20..35
    let gateway = Gateway::new(0.2, 0.05);
    let customers = ["alice", "bob", "carol", "dave"];
    let (mut charged, mut failed) = (0u32, 0u32);

    for n in 0..ORDERS {
        if stop_signal.is_cancelled() {
            break;
        }
        gateway.set_outage((20..35).contains(&n));

        let order = Order {
            id: format!("ORD-{n:03}"),
            customer: customers[n as usize % customers.len()].to_string(),
            amount_cents: 1_000 + u64::from(n) * 25,
        };

        let result = pipeline
            .call(DEPENDENCY)
            .rate_key(&order.customer)
            .payload(&order)
            .metadata("customer", order.customer.clone())
            .cancel_on(stop_signal.clone())
            .run(|| gateway.charge(&order))
            .await;

        match result {
            Ok(receipt) => {
                charged += 1;
                tracing::info!(order = %order.id, %receipt, "Order charged");
            }
            Err(e) => {
                failed += 1;
                tracing::info!(order = %order.id, kind = %e.kind(), error = %e, "Order failed");
            }
        }
        tokio::time::sleep(Duration::from_millis(60)).await;
    }

    // 7. Report
    tracing::info!(charged, failed, "Traffic finished");
    for status in breakers.statuses() {
        tracing::info!(
            breaker = %status.name,
            state = status.state.as_str(),
            calls = status.total_calls,
            rejections = status.total_rejections,
            failure_rate = status.failure_rate(),
            "Breaker summary"
        );
    }
    if let Some(limiter) = pipeline.rate_limiter() {
        let stats = limiter.stats();
        tracing::info!(
            requests = stats.total_requests,
            rejected = stats.total_rejected,
            rejection_rate = stats.rejection_rate(),
            active_keys = stats.active_keys,
            "Rate limiter summary"
        );
    }

    let stats = dlq.stats().await?;
    tracing::info!(
        size = stats.size,
        transient = stats.by_class.get(FailureClass::Transient.as_str()).copied().unwrap_or(0),
        permanent = stats.by_class.get(FailureClass::Permanent.as_str()).copied().unwrap_or(0),
        oldest_age_secs = stats.oldest_message_age.map(|age| age.as_secs()),
        "Dead letter queue before replay"
    );

    // 8. The gateway recovered: replay transient failures, leave declines for a human
    gateway.set_outage(false);
    let recovered = Gateway::new(0.0, 0.0);
    let summary = dlq
        .replay_all(&MessageFilter::default(), |message| {
            let recovered = &recovered;
            async move {
                let order: Order = serde_json::from_value(message.payload)
                    .map_err(|e| format!("unreadable payload: {e}"))?;
                recovered
                    .charge(&order)
                    .await
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            }
        })
        .await?;
    tracing::info!(
        acknowledged = summary.acknowledged,
        failed = summary.failed,
        skipped = summary.skipped,
        "Replay finished"
    );

    let purged = dlq.purge_expired().await?;
    tracing::info!(purged, remaining = dlq.size().await?, "Demo complete");

    Ok(())
}
