// Package shutdown provides graceful shutdown functionality.

use anyhow::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
#[error("graceful shutdown timeout exceeded")]
pub struct TimeoutError;

/// Waits for a stop signal, cancels the token and then for registered tasks.
#[derive(Clone)]
pub struct GracefulShutdown {
    shutdown_token: CancellationToken,
    timeout: Arc<parking_lot::RwLock<Duration>>,
    pending: Arc<AtomicUsize>,
    finished: Arc<Notify>,
}

impl GracefulShutdown {
    /// Creates a new graceful shutdown handler
    pub fn new(shutdown_token: CancellationToken) -> Self {
        Self {
            shutdown_token,
            timeout: Arc::new(parking_lot::RwLock::new(Duration::from_secs(10))),
            pending: Arc::new(AtomicUsize::new(0)),
            finished: Arc::new(Notify::new()),
        }
    }

    /// Sets the graceful shutdown timeout
    pub fn set_graceful_timeout(&self, timeout: Duration) {
        *self.timeout.write() = timeout;
    }

    /// Registers `n` tasks to wait for.
    pub fn add(&self, n: usize) {
        self.pending.fetch_add(n, Ordering::SeqCst);
    }

    /// Marks one task as done.
    pub fn done(&self) {
        let prev = self
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .unwrap_or(0);
        if prev <= 1 {
            self.finished.notify_waiters();
        }
    }

    /// Waits for SIGINT, SIGTERM or cancellation, then for all tasks.
    pub async fn await_shutdown(&self) -> Result<()> {
        tokio::select! {
            signal = stop_signal() => {
                info!(
                    component = "graceful-shutdown",
                    event = "os_signal",
                    signal = signal,
                    "cancellation started"
                );
            }
            _ = self.shutdown_token.cancelled() => {
                info!(
                    component = "graceful-shutdown",
                    event = "ctx_done",
                    "cancellation started"
                );
            }
        }

        self.cancel_and_await_with_timeout().await
    }

    async fn cancel_and_await_with_timeout(&self) -> Result<()> {
        self.shutdown_token.cancel();

        let timeout_duration = *self.timeout.read();
        match timeout(timeout_duration, self.wait_for_completion()).await {
            Ok(_) => {
                info!(
                    component = "graceful-shutdown",
                    event = "shutdown_success",
                    "service was gracefully shut down"
                );
                Ok(())
            }
            Err(_) => {
                warn!(
                    component = "graceful-shutdown",
                    event = "shutdown_timeout",
                    timeout_secs = timeout_duration.as_secs(),
                    pending = self.pending.load(Ordering::SeqCst),
                    "not all tasks were closed within timeout"
                );
                Err(TimeoutError.into())
            }
        }
    }

    async fn wait_for_completion(&self) {
        loop {
            let notified = self.finished.notified();
            if self.pending.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

async fn stop_signal() -> &'static str {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => tokio::select! {
                _ = tokio::signal::ctrl_c() => "SIGINT",
                _ = term.recv() => "SIGTERM",
            },
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                "SIGINT"
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        "SIGINT"
    }
}
