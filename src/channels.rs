//! Bounded typed queues with drop-oldest overflow (spec.md §4.1).
//!
//! Each consumer owns its queue; there is no shared queue between consumers
//! (the spec explicitly rejects a competing-consumer pattern here). The
//! publish side is `try_publish`: it never suspends, even when the queue is
//! full — on overflow it drops the oldest queued item, counts the drop, and
//! returns immediately. The receive side suspends only on an empty queue,
//! which is the one suspension point the cold-path consumers are allowed
//! (spec.md §5).

use crate::metrics::ChannelMetrics;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

struct Inner<T> {
    queue: Mutex<VecDeque<T>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    pub metrics: ChannelMetrics,
}

/// The publish half. Cheap to clone; every clone shares the same backing
/// queue and metrics.
pub struct Publisher<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Publisher<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

/// The receive half. Not `Clone` — exactly one consumer owns a queue, per
/// spec.md §4.1.
pub struct Consumer<T> {
    inner: Arc<Inner<T>>,
}

/// Creates a bounded drop-oldest channel and returns its two halves.
pub fn bounded<T>(capacity: usize) -> (Publisher<T>, Consumer<T>) {
    let inner = Arc::new(Inner {
        queue: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        capacity,
        notify: Notify::new(),
        closed: AtomicBool::new(false),
        metrics: ChannelMetrics::default(),
    });
    (
        Publisher {
            inner: inner.clone(),
        },
        Consumer { inner },
    )
}

impl<T> Publisher<T> {
    /// Non-blocking. Returns `true` if the item was admitted without
    /// dropping anything, `false` if admitting it required evicting the
    /// oldest queued item (the drop counter has already been incremented).
    pub fn try_publish(&self, item: T) -> bool {
        let mut dropped = false;
        {
            let mut q = self.inner.queue.lock();
            if q.len() >= self.inner.capacity {
                q.pop_front();
                dropped = true;
            }
            q.push_back(item);
        }
        if dropped {
            self.inner.metrics.record_dropped();
        } else {
            self.inner.metrics.record_published();
        }
        self.inner.notify.notify_one();
        !dropped
    }

    pub fn depth(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn metrics(&self) -> &ChannelMetrics {
        &self.inner.metrics
    }

    /// Signals shutdown: wakes any blocked `recv` so it can observe
    /// cancellation and drain the last item (spec.md §5).
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }
}

impl<T> Consumer<T> {
    /// Suspends until an item is available or the channel is closed and
    /// drained. Returns `None` only once the channel is closed and empty.
    pub async fn recv(&self) -> Option<T> {
        loop {
            if let Some(item) = self.inner.queue.lock().pop_front() {
                return Some(item);
            }
            if self.inner.closed.load(Ordering::SeqCst) {
                return None;
            }
            self.inner.notified().await;
        }
    }

    pub fn depth(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn metrics(&self) -> &ChannelMetrics {
        &self.inner.metrics
    }
}

impl<T> Inner<T> {
    async fn notified(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s4_back_pressure_drop_oldest() {
        let (tx, rx) = bounded::<u32>(4);
        for i in 0..5 {
            tx.try_publish(i);
        }
        assert_eq!(tx.metrics().dropped.load(Ordering::Relaxed), 1);
        // queue should contain the last 4: 1,2,3,4
        let mut items = Vec::new();
        while let Some(item) = rx.inner.queue.lock().pop_front() {
            items.push(item);
        }
        assert_eq!(items, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn recv_suspends_until_publish() {
        let (tx, rx) = bounded::<u32>(4);
        let handle = tokio::spawn(async move { rx.recv().await });
        tokio::task::yield_now().await;
        tx.try_publish(42);
        let got = handle.await.unwrap();
        assert_eq!(got, Some(42));
    }

    #[tokio::test]
    async fn close_unblocks_recv_with_none_once_drained() {
        let (tx, rx) = bounded::<u32>(4);
        tx.try_publish(1);
        tx.close();
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, None);
    }
}
