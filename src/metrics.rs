//! Lightweight atomic counters surfaced on `/health` (spec.md §6.3 [AMBIENT]).
//!
//! Mirrors the teacher's `performance::queues::QueueMetrics` shape (atomic
//! counters collected into a serializable snapshot) rather than pulling in a
//! Prometheus exporter, since this crate's scope has no metrics-scrape
//! surface (see DESIGN.md for the dropped `metrics` dependency).

use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Counters for one bounded try-publish channel (§4.1).
#[derive(Debug, Default)]
pub struct ChannelMetrics {
    pub published: AtomicU64,
    pub dropped: AtomicU64,
}

impl ChannelMetrics {
    pub fn record_published(&self) {
        self.published.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dropped(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, depth: usize, capacity: usize) -> ChannelSnapshot {
        ChannelSnapshot {
            depth,
            capacity,
            published: self.published.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelSnapshot {
    pub depth: usize,
    pub capacity: usize,
    pub published: u64,
    pub dropped: u64,
}

/// Counters for the rolling-window engine (§4.3).
#[derive(Debug, Default)]
pub struct WindowEngineMetrics {
    pub points_appended: AtomicU64,
    pub windows_evicted_lru: AtomicU64,
    pub windows_evicted_timer: AtomicU64,
    pub latest_ticks_evicted_lru: AtomicU64,
    pub latest_ticks_evicted_timer: AtomicU64,
    pub windows_count: AtomicUsize,
    pub latest_ticks_count: AtomicUsize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowEngineSnapshot {
    pub points_appended: u64,
    pub windows_evicted_lru: u64,
    pub windows_evicted_timer: u64,
    pub latest_ticks_evicted_lru: u64,
    pub latest_ticks_evicted_timer: u64,
    pub windows_count: usize,
    pub windows_capacity: usize,
    pub latest_ticks_count: usize,
    pub latest_ticks_capacity: usize,
}

impl WindowEngineMetrics {
    pub fn snapshot(&self, windows_capacity: usize, latest_ticks_capacity: usize) -> WindowEngineSnapshot {
        WindowEngineSnapshot {
            points_appended: self.points_appended.load(Ordering::Relaxed),
            windows_evicted_lru: self.windows_evicted_lru.load(Ordering::Relaxed),
            windows_evicted_timer: self.windows_evicted_timer.load(Ordering::Relaxed),
            latest_ticks_evicted_lru: self.latest_ticks_evicted_lru.load(Ordering::Relaxed),
            latest_ticks_evicted_timer: self.latest_ticks_evicted_timer.load(Ordering::Relaxed),
            windows_count: self.windows_count.load(Ordering::Relaxed),
            windows_capacity,
            latest_ticks_count: self.latest_ticks_count.load(Ordering::Relaxed),
            latest_ticks_capacity,
        }
    }
}

/// Counters for the WebSocket fan-out layer (§4.4).
#[derive(Debug, Default)]
pub struct WsMetrics {
    pub realtime_connected: AtomicUsize,
    pub realtime_evicted: AtomicU64,
    pub charts_connected: AtomicUsize,
    pub charts_evicted: AtomicU64,
    pub signals_connected: AtomicUsize,
    pub send_timeouts: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WsSnapshot {
    pub realtime_connected: usize,
    pub realtime_evicted: u64,
    pub charts_connected: usize,
    pub charts_evicted: u64,
    pub signals_connected: usize,
    pub send_timeouts: u64,
}

impl WsMetrics {
    pub fn snapshot(&self) -> WsSnapshot {
        WsSnapshot {
            realtime_connected: self.realtime_connected.load(Ordering::Relaxed),
            realtime_evicted: self.realtime_evicted.load(Ordering::Relaxed),
            charts_connected: self.charts_connected.load(Ordering::Relaxed),
            charts_evicted: self.charts_evicted.load(Ordering::Relaxed),
            signals_connected: self.signals_connected.load(Ordering::Relaxed),
            send_timeouts: self.send_timeouts.load(Ordering::Relaxed),
        }
    }
}

/// Per-adapter reconnect/health bookkeeping, rolled into `/health`'s
/// `degraded` determination (spec.md §7 "user-visible failure behavior").
#[derive(Debug, Default)]
pub struct AdapterHealth {
    pub connected: std::sync::atomic::AtomicBool,
    pub reconnecting: std::sync::atomic::AtomicBool,
    pub reconnect_count: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterHealthSnapshot {
    pub exchange: String,
    pub connected: bool,
    pub reconnecting: bool,
    pub reconnect_count: u64,
}

impl AdapterHealth {
    pub fn snapshot(&self, exchange: &str) -> AdapterHealthSnapshot {
        use std::sync::atomic::Ordering as O;
        AdapterHealthSnapshot {
            exchange: exchange.to_string(),
            connected: self.connected.load(O::Relaxed),
            reconnecting: self.reconnecting.load(O::Relaxed),
            reconnect_count: self.reconnect_count.load(O::Relaxed),
        }
    }
}

/// A small rate limiter for noisy log sites (back-pressure drops, WS send
/// failures), mirroring the teacher's inline `DataSourceKillSwitch`
/// throttling style rather than pulling in a dedicated crate.
pub struct LogThrottle {
    interval: std::time::Duration,
    last: parking_lot::Mutex<Option<std::time::Instant>>,
}

impl LogThrottle {
    pub fn new(interval: std::time::Duration) -> Self {
        Self {
            interval,
            last: parking_lot::Mutex::new(None),
        }
    }

    /// Returns `true` if the caller should emit a log line now.
    pub fn should_log(&self) -> bool {
        let now = std::time::Instant::now();
        let mut last = self.last.lock();
        match *last {
            Some(prev) if now.duration_since(prev) < self.interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_metrics_counts_publish_and_drop() {
        let m = ChannelMetrics::default();
        m.record_published();
        m.record_published();
        m.record_dropped();
        let snap = m.snapshot(3, 100_000);
        assert_eq!(snap.published, 2);
        assert_eq!(snap.dropped, 1);
        assert_eq!(snap.depth, 3);
    }

    #[test]
    fn log_throttle_suppresses_within_interval() {
        let throttle = LogThrottle::new(std::time::Duration::from_secs(60));
        assert!(throttle.should_log());
        assert!(!throttle.should_log());
    }
}
