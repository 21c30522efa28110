//! External cancellation for retry loops and pipelines.
//!
//! A [`CancellationHandle`] flips a shared flag once; every cloned
//! [`CancellationSignal`] observes it. Dropping every handle without
//! cancelling leaves the signal un-cancelled forever.

use std::sync::Arc;
use tokio::sync::watch;

/// Create a connected handle/signal pair.
#[must_use]
pub fn cancellation() -> (CancellationHandle, CancellationSignal) {
    let (tx, rx) = watch::channel(false);
    (
        CancellationHandle { tx: Arc::new(tx) },
        CancellationSignal { rx: Some(rx) },
    )
}

/// Side that requests cancellation.
#[derive(Debug, Clone)]
pub struct CancellationHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancellationHandle {
    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Whether [`cancel`](Self::cancel) has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Side that observes cancellation.
#[derive(Debug, Clone)]
pub struct CancellationSignal {
    rx: Option<watch::Receiver<bool>>,
}

impl CancellationSignal {
    /// A signal that is never cancelled.
    #[must_use]
    pub const fn never() -> Self {
        Self { rx: None }
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.rx.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Resolve once cancellation is requested.
    ///
    /// Stays pending forever if the handle is dropped without cancelling.
    pub async fn cancelled(&self) {
        let Some(rx) = &self.rx else {
            std::future::pending::<()>().await;
            return;
        };

        let mut rx = rx.clone();
        let observed = rx.wait_for(|cancelled| *cancelled).await.is_ok();
        if !observed {
            std::future::pending::<()>().await;
        }
    }
}

impl Default for CancellationSignal {
    fn default() -> Self {
        Self::never()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)] // Test code can use unwrap/expect
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn cancel_wakes_every_clone() {
        let (handle, signal) = cancellation();
        let other = signal.clone();

        assert!(!signal.is_cancelled());
        handle.cancel();

        tokio::time::timeout(Duration::from_secs(1), other.cancelled())
            .await
            .expect("clone should observe cancellation");
        assert!(signal.is_cancelled());
        assert!(handle.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_handle_never_cancels() {
        let (handle, signal) = cancellation();
        drop(handle);

        let result = tokio::time::timeout(Duration::from_secs(5), signal.cancelled()).await;
        assert!(result.is_err());
        assert!(!signal.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn never_signal_stays_pending() {
        let signal = CancellationSignal::never();
        let result = tokio::time::timeout(Duration::from_millis(10), signal.cancelled()).await;
        assert!(result.is_err());
    }
}
