//! A single process-wide cancellation signal (spec.md §5 "Cancellation").
//!
//! Every consumer (the window engine, cleanup timers, adapters) holds a
//! clone of a [`Shutdown`]. Consumers observe it between suspension points —
//! a channel `recv`, a cleanup batch, an adapter reconnect loop — and drain
//! at most one more item before exiting, never mid-operation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

#[derive(Clone)]
pub struct Shutdown {
    triggered: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    pub fn new() -> Self {
        Self {
            triggered: Arc::new(AtomicBool::new(false)),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    pub fn trigger(&self) {
        self.triggered.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Suspends until [`Shutdown::trigger`] is called. Used by cleanup
    /// timers between batches and adapters between reconnect attempts.
    pub async fn cancelled(&self) {
        if self.is_triggered() {
            return;
        }
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trigger_wakes_waiters() {
        let shutdown = Shutdown::new();
        let waiter = shutdown.clone();
        let handle = tokio::spawn(async move {
            waiter.cancelled().await;
        });
        tokio::task::yield_now().await;
        shutdown.trigger();
        handle.await.unwrap();
        assert!(shutdown.is_triggered());
    }
}
