//! Signal-interruptible periodic task runner
//!
//! A refresher sleeps until it is signalled or its ceiling elapses, then
//! runs its action if at least `min_interval` has passed since the last run.
//! Wakes inside the debounce window are dropped; the next signal or tick
//! gets another chance.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Cloneable handle used to wake a refresher
#[derive(Debug, Clone, Default)]
pub struct RefreshSignal {
    notify: Arc<Notify>,
}

impl RefreshSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a run; never blocks, repeated calls coalesce
    pub fn signal(&self) {
        self.notify.notify_one();
    }

    async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// Periodic refresher
pub struct PeriodicRefresher<F> {
    name: &'static str,
    /// `None` means purely signal driven
    max_interval: Option<Duration>,
    min_interval: Duration,
    action: F,
    signal: RefreshSignal,
    cancel: CancellationToken,
    last_run: Option<Instant>,
}

impl<F, Fut> PeriodicRefresher<F>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    /// Create a refresher with its own signal
    pub fn new(
        name: &'static str,
        max_interval: Option<Duration>,
        min_interval: Duration,
        action: F,
        cancel: CancellationToken,
    ) -> Self {
        Self::with_signal(
            name,
            RefreshSignal::new(),
            max_interval,
            min_interval,
            action,
            cancel,
        )
    }

    /// Create a refresher woken by an existing signal
    ///
    /// Lets the action of one refresher hold the signal of another before
    /// either is built.
    pub fn with_signal(
        name: &'static str,
        signal: RefreshSignal,
        max_interval: Option<Duration>,
        min_interval: Duration,
        action: F,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            name,
            max_interval,
            min_interval,
            action,
            signal,
            cancel,
            last_run: None,
        }
    }

    /// Handle for waking this refresher
    pub fn signal(&self) -> RefreshSignal {
        self.signal.clone()
    }

    /// Run until cancelled
    ///
    /// An action that is already running is awaited to completion.
    pub async fn run_loop(mut self) {
        loop {
            let woken = match self.max_interval {
                Some(max) => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = self.signal.notified() => true,
                        _ = tokio::time::sleep(max) => false,
                    }
                }
                None => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = self.signal.notified() => true,
                    }
                }
            };

            let now = Instant::now();
            if let Some(last) = self.last_run {
                if now.duration_since(last) < self.min_interval {
                    trace!("{}: wake inside debounce window dropped", self.name);
                    continue;
                }
            }

            trace!(
                "{}: running ({})",
                self.name,
                if woken { "signalled" } else { "periodic" }
            );
            self.last_run = Some(now);
            (self.action)().await;
        }

        trace!("{}: stopped", self.name);
    }
}
