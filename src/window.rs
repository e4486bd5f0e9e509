//! The rolling-window engine (spec.md §4.3) — the hardest subsystem.
//!
//! Maintains three bounded structures off the hot path: a last-tick cache
//! keyed by `(exchange, symbol)`, a sliding window of [`SpreadPoint`]s keyed
//! by canonical `(exchange1, exchange2, symbol)`, and an index from
//! `(exchange, symbol)` to the windows it affects. Last-tick matching turns
//! each incoming tick into up to `N-1` spread points without ever joining
//! against history (§4.3.1) — the data loss the tolerance-window join in the
//! source exhibited (≈63% loss at 20ms tolerance) is eliminated by
//! construction.

use crate::channels::Consumer;
use crate::metrics::WindowEngineMetrics;
use crate::models::{ChartFrame, SpreadPoint, Tick, WindowKey};
use crate::shutdown::Shutdown;
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::{HashSet, VecDeque};
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct WindowEngineConfig {
    pub window_size: Duration,
    pub hard_cap_points: usize,
    pub max_windows: usize,
    pub max_latest_ticks: usize,
    pub window_cleanup_interval: Duration,
    pub last_tick_cleanup_interval: Duration,
    pub last_tick_max_age: Duration,
    pub chart_recent_window: Duration,
    pub chart_quantile_window: usize,
    pub chart_upper_quantile: Decimal,
    pub chart_lower_quantile: Decimal,
}

impl From<&crate::config::Config> for WindowEngineConfig {
    fn from(cfg: &crate::config::Config) -> Self {
        Self {
            window_size: cfg.window_size,
            hard_cap_points: cfg.hard_cap_points,
            max_windows: cfg.max_windows,
            max_latest_ticks: cfg.max_latest_ticks,
            window_cleanup_interval: cfg.window_cleanup_interval,
            last_tick_cleanup_interval: cfg.last_tick_cleanup_interval,
            last_tick_max_age: cfg.last_tick_max_age,
            chart_recent_window: cfg.chart_recent_window,
            chart_quantile_window: cfg.chart_quantile_window,
            chart_upper_quantile: cfg.chart_upper_quantile,
            chart_lower_quantile: cfg.chart_lower_quantile,
        }
    }
}

/// `(timestamp, best_bid, best_ask)` per `(exchange, symbol)`, replaced
/// atomically on each new tick (spec.md §3).
#[derive(Debug, Clone, Copy)]
struct LastTickCacheEntry {
    timestamp: Instant,
    best_bid: Decimal,
}

/// A time-bounded sliding sequence of [`SpreadPoint`]s for one canonical
/// `(exchange1, exchange2, symbol)` triple (spec.md §3).
#[derive(Debug, Default)]
pub struct Window {
    pub window_start: Option<Instant>,
    pub window_end: Option<Instant>,
    pub points: VecDeque<SpreadPoint>,
}

impl Window {
    /// §4.3.2: append, incremental slide, hard cap — all O(1) amortized.
    fn append(&mut self, point: SpreadPoint, window_size: Duration, hard_cap: usize) {
        let ts = point.instant;
        self.points.push_back(point);

        while let Some(front) = self.points.front() {
            if ts.saturating_duration_since(front.instant) > window_size {
                self.points.pop_front();
            } else {
                break;
            }
        }
        while self.points.len() > hard_cap {
            self.points.pop_front();
        }

        self.window_end = Some(ts);
        // window_start is derived as window_end - WINDOW_SIZE; Instant subtraction
        // would panic on underflow this close to process start, so fall back to `ts`.
        self.window_start = Some(ts.checked_sub(window_size).unwrap_or(ts));
    }
}

type WindowHandler = Arc<dyn Fn(SpreadPoint) + Send + Sync>;

struct Subscription {
    token: Uuid,
    handler: WindowHandler,
}

/// Opaque handle returned by [`RollingWindowEngine::subscribe_to_window`].
/// Cancellation is first-class: holding a token and calling `unsubscribe`
/// is the only way dispatch to a handler stops (spec.md §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken(Uuid);

pub struct RollingWindowEngine {
    config: WindowEngineConfig,
    metrics: Arc<WindowEngineMetrics>,
    latest_ticks: Mutex<LruCache<String, LastTickCacheEntry>>,
    windows: Mutex<LruCache<String, Arc<Mutex<Window>>>>,
    symbol_exchanges: DashMap<String, Mutex<HashSet<String>>>,
    /// `window_key -> subscriber list` (§4.3.4).
    window_events: DashMap<String, Mutex<Vec<Subscription>>>,
    /// `"{exchange}_{symbol}" -> set of window keys affected` (§4.3.4).
    exchange_symbol_index: DashMap<String, Mutex<HashSet<String>>>,
    token_index: DashMap<Uuid, String>,
    cleanup_running: AtomicBool,
}

fn cap(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n.max(1)).unwrap()
}

impl RollingWindowEngine {
    pub fn new(config: WindowEngineConfig, metrics: Arc<WindowEngineMetrics>) -> Self {
        Self {
            latest_ticks: Mutex::new(LruCache::new(cap(config.max_latest_ticks))),
            windows: Mutex::new(LruCache::new(cap(config.max_windows))),
            symbol_exchanges: DashMap::new(),
            window_events: DashMap::new(),
            exchange_symbol_index: DashMap::new(),
            token_index: DashMap::new(),
            cleanup_running: AtomicBool::new(false),
            config,
            metrics,
        }
    }

    fn last_tick_key(exchange: &str, symbol: &str) -> String {
        format!("{exchange}_{symbol}")
    }

    /// The last-tick matching algorithm (§4.3.1). Consumes one tick from the
    /// Window channel, returns every `SpreadPoint` it produced (already
    /// appended to their windows and dispatched to subscribers).
    pub fn process_tick(&self, tick: &Tick) -> Vec<SpreadPoint> {
        let exchange = tick.exchange.as_str();
        let symbol = tick.symbol.as_str();

        // Step 1: others = symbol_exchanges[S] (create if missing), insert E.
        let others: Vec<String> = {
            let entry = self
                .symbol_exchanges
                .entry(symbol.to_string())
                .or_insert_with(|| Mutex::new(HashSet::new()));
            let mut set = entry.lock();
            set.insert(exchange.to_string());
            set.iter().cloned().collect()
        };

        let mut produced = Vec::new();

        // Step 2: for each other exchange with a cached tick on the same symbol.
        for other_exchange in others.iter().filter(|e| e.as_str() != exchange) {
            let other_key = Self::last_tick_key(other_exchange, symbol);
            let other_entry = {
                let mut map = self.latest_ticks.lock();
                map.get(&other_key).copied()
            };
            let Some(other) = other_entry else { continue };

            let Some(point) = SpreadPoint::new(
                exchange,
                symbol,
                tick.best_bid,
                tick.local_timestamp,
                tick.observed_at,
                other_exchange,
                other.best_bid,
                other.timestamp,
            ) else {
                continue;
            };

            self.append_and_dispatch(point.clone());
            produced.push(point);
        }

        // Step 3: update latest_ticks[(E,S)] after matching so T never matches itself.
        let key = Self::last_tick_key(exchange, symbol);
        let entry = LastTickCacheEntry {
            timestamp: tick.local_timestamp,
            best_bid: tick.best_bid,
        };
        {
            let mut map = self.latest_ticks.lock();
            if let Some((evicted_key, _)) = map.push(key.clone(), entry) {
                if evicted_key != key {
                    self.metrics.latest_ticks_evicted_lru.fetch_add(1, Ordering::Relaxed);
                }
            }
            self.metrics
                .latest_ticks_count
                .store(map.len(), Ordering::Relaxed);
        }

        produced
    }

    fn append_and_dispatch(&self, point: SpreadPoint) {
        let key = WindowKey::new(&point.exchange1, &point.exchange2, &point.symbol);
        let cache_key = key.cache_key();

        let window_arc = {
            let mut map = self.windows.lock();
            if let Some(existing) = map.get(&cache_key) {
                existing.clone()
            } else {
                let arc = Arc::new(Mutex::new(Window::default()));
                if let Some((evicted_key, _)) = map.push(cache_key.clone(), arc.clone()) {
                    if evicted_key != cache_key {
                        self.evict_window_indexes(&evicted_key);
                        self.metrics.windows_evicted_lru.fetch_add(1, Ordering::Relaxed);
                    }
                }
                self.register_window_indexes(&key, &cache_key);
                arc
            }
        };
        self.metrics
            .windows_count
            .store(self.windows.lock().len(), Ordering::Relaxed);

        {
            let mut window = window_arc.lock();
            window.append(point.clone(), self.config.window_size, self.config.hard_cap_points);
        }
        self.metrics.points_appended.fetch_add(1, Ordering::Relaxed);

        self.dispatch_event(&cache_key, &point);
    }

    fn register_window_indexes(&self, key: &WindowKey, cache_key: &str) {
        for exch in [&key.exchange1, &key.exchange2] {
            let idx_key = Self::last_tick_key(exch, &key.symbol);
            self.exchange_symbol_index
                .entry(idx_key)
                .or_insert_with(|| Mutex::new(HashSet::new()))
                .lock()
                .insert(cache_key.to_string());
        }
    }

    fn evict_window_indexes(&self, cache_key: &str) {
        self.window_events.remove(cache_key);
        for mut entry in self.exchange_symbol_index.iter_mut() {
            entry.lock().remove(cache_key);
        }
    }

    /// Invokes every subscriber of `window_key`, plus any subscriber reached
    /// only via the trigger's exchange/symbol index — a defensive union so a
    /// subscriber registered before the window existed is never missed
    /// (spec.md §4.3.4).
    fn dispatch_event(&self, window_key: &str, point: &SpreadPoint) {
        let mut invoked: HashSet<Uuid> = HashSet::new();
        let mut candidate_keys: HashSet<String> = HashSet::new();
        candidate_keys.insert(window_key.to_string());

        for exch in [point.exchange1.as_str(), point.exchange2.as_str()] {
            let idx_key = Self::last_tick_key(exch, &point.symbol);
            if let Some(set) = self.exchange_symbol_index.get(&idx_key) {
                for k in set.lock().iter() {
                    candidate_keys.insert(k.clone());
                }
            }
        }

        for key in candidate_keys {
            let Some(subs) = self.window_events.get(&key) else {
                continue;
            };
            for sub in subs.lock().iter() {
                if invoked.insert(sub.token) {
                    (sub.handler)(point.clone());
                }
            }
        }
    }

    /// Subscribes `handler` to window `(ex1, ex2, sym)`. Multiple handlers
    /// per window are supported; invocation order equals subscription order.
    pub fn subscribe_to_window(
        &self,
        ex1: &str,
        ex2: &str,
        sym: &str,
        handler: WindowHandler,
    ) -> SubscriptionToken {
        let key = WindowKey::new(ex1, ex2, sym).cache_key();
        let token = Uuid::new_v4();
        self.window_events
            .entry(key.clone())
            .or_insert_with(|| Mutex::new(Vec::new()))
            .lock()
            .push(Subscription { token, handler });
        self.token_index.insert(token, key);
        SubscriptionToken(token)
    }

    /// Subsequent dispatches to this subscriber become no-ops.
    pub fn unsubscribe(&self, token: SubscriptionToken) {
        if let Some((_, key)) = self.token_index.remove(&token.0) {
            if let Some(subs) = self.window_events.get(&key) {
                subs.lock().retain(|s| s.token != token.0);
            }
        }
    }

    /// Chart-frame query for `/ws/realtime_charts` — the 15-minute recent
    /// window with a last-10-points fallback (§4.3.5).
    pub fn chart_frame(&self, ex1: &str, ex2: &str, sym: &str) -> Option<ChartFrame> {
        self.chart_frame_with_window(ex1, ex2, sym, Some(self.config.chart_recent_window))
    }

    /// The NDJSON dashboard variant: the entire retained window, no recent
    /// slice (spec.md SPEC_FULL §6 [SUPPLEMENT]).
    pub fn chart_frame_full(&self, ex1: &str, ex2: &str, sym: &str) -> Option<ChartFrame> {
        self.chart_frame_with_window(ex1, ex2, sym, None)
    }

    fn chart_frame_with_window(
        &self,
        ex1: &str,
        ex2: &str,
        sym: &str,
        recent_window: Option<Duration>,
    ) -> Option<ChartFrame> {
        let cache_key = WindowKey::new(ex1, ex2, sym).cache_key();
        let arc = {
            let mut map = self.windows.lock();
            map.get(&cache_key).cloned()
        }?;
        let points: Vec<SpreadPoint> = {
            let window = arc.lock();
            window.points.iter().cloned().collect()
        };
        if points.is_empty() {
            return None;
        }

        let n = points.len();
        let spreads: Vec<Decimal> = points.iter().map(|p| p.spread_percent).collect();
        let q = self.config.chart_quantile_window;

        let mut upper = Vec::with_capacity(n);
        let mut lower = Vec::with_capacity(n);
        for i in 0..n {
            let start = (i + 1).saturating_sub(q);
            let slice = &spreads[start..=i];
            upper.push(quantile(slice, self.config.chart_upper_quantile));
            lower.push(quantile(slice, self.config.chart_lower_quantile));
        }

        let indices: Vec<usize> = match recent_window {
            None => (0..n).collect(),
            Some(window_dur) => {
                let now = Instant::now();
                let recent: Vec<usize> = (0..n)
                    .filter(|&i| now.saturating_duration_since(points[i].instant) <= window_dur)
                    .collect();
                if recent.is_empty() {
                    let start = n.saturating_sub(10);
                    (start..n).collect()
                } else {
                    recent
                }
            }
        };

        Some(ChartFrame {
            timestamps: indices.iter().map(|&i| points[i].timestamp).collect(),
            spreads: indices.iter().map(|&i| Some(spreads[i])).collect(),
            upper_band: indices.iter().map(|&i| Some(upper[i])).collect(),
            lower_band: indices.iter().map(|&i| Some(lower[i])).collect(),
        })
    }

    /// Runs the Window-channel consumer loop: suspends on channel read only
    /// (spec.md §5), processes each tick, and invokes `on_points` with every
    /// produced `SpreadPoint` (the SignalDetector's entry point).
    pub async fn run_consumer(
        self: Arc<Self>,
        consumer: Consumer<Tick>,
        shutdown: Shutdown,
        on_points: impl Fn(&SpreadPoint) + Send + Sync + 'static,
    ) {
        loop {
            let next = tokio::select! {
                tick = consumer.recv() => tick,
                _ = shutdown.cancelled() => None,
            };
            let Some(tick) = next else {
                if shutdown.is_triggered() {
                    return;
                }
                continue;
            };
            for point in self.process_tick(&tick) {
                on_points(&point);
            }
        }
    }

    /// The two periodic cleanup tasks (§4.3.3), run off the hot path on a
    /// dedicated worker. A single atomic flag forbids concurrent runs.
    pub async fn run_cleanup_loop(self: Arc<Self>, shutdown: Shutdown) {
        let mut window_timer = tokio::time::interval(self.config.window_cleanup_interval);
        let mut tick_timer = tokio::time::interval(self.config.last_tick_cleanup_interval);
        window_timer.tick().await; // first tick fires immediately; skip it
        tick_timer.tick().await;

        loop {
            tokio::select! {
                _ = window_timer.tick() => self.run_window_cleanup().await,
                _ = tick_timer.tick() => self.run_last_tick_cleanup().await,
                _ = shutdown.cancelled() => return,
            }
        }
    }

    async fn run_window_cleanup(&self) {
        if self.cleanup_running.swap(true, Ordering::SeqCst) {
            return;
        }
        let now = Instant::now();
        let keys: Vec<String> = self.windows.lock().iter().map(|(k, _)| k.clone()).collect();

        for batch in keys.chunks(100) {
            for key in batch {
                let arc_opt = self.windows.lock().peek(key).cloned();
                let Some(arc) = arc_opt else { continue };
                let expired = {
                    let w = arc.lock();
                    match w.window_end {
                        Some(end) => now.saturating_duration_since(end) > self.config.window_size,
                        None => false,
                    }
                };
                if expired {
                    let mut map = self.windows.lock();
                    if map.pop(key).is_some() {
                        self.evict_window_indexes(key);
                        self.metrics.windows_evicted_timer.fetch_add(1, Ordering::Relaxed);
                        debug!(window = key, "window evicted by cleanup timer");
                    }
                }
            }
            tokio::task::yield_now().await;
        }
        self.metrics
            .windows_count
            .store(self.windows.lock().len(), Ordering::Relaxed);
        self.cleanup_running.store(false, Ordering::SeqCst);
    }

    async fn run_last_tick_cleanup(&self) {
        let now = Instant::now();
        let keys: Vec<String> = self
            .latest_ticks
            .lock()
            .iter()
            .map(|(k, _)| k.clone())
            .collect();

        for key in keys {
            let mut map = self.latest_ticks.lock();
            let expired = map
                .peek(&key)
                .map(|e| now.saturating_duration_since(e.timestamp) > self.config.last_tick_max_age)
                .unwrap_or(false);
            if expired && map.pop(&key).is_some() {
                self.metrics
                    .latest_ticks_evicted_timer
                    .fetch_add(1, Ordering::Relaxed);
            }
        }
        self.metrics
            .latest_ticks_count
            .store(self.latest_ticks.lock().len(), Ordering::Relaxed);
        debug!("last-tick cleanup pass complete");
    }

    pub fn windows_len(&self) -> usize {
        self.windows.lock().len()
    }

    pub fn latest_ticks_len(&self) -> usize {
        self.latest_ticks.lock().len()
    }

    pub fn metrics_snapshot(&self) -> crate::metrics::WindowEngineSnapshot {
        self.metrics
            .snapshot(self.config.max_windows, self.config.max_latest_ticks)
    }
}

/// Stable quantile by the spec's index rule: `idx = ceil(count*q) - 1`,
/// clamped to `[0, count-1]`. Sorts the included window and selects by
/// index; ties are broken by position in the sort.
fn quantile(values: &[Decimal], q: Decimal) -> Decimal {
    let mut sorted = values.to_vec();
    sorted.sort();
    let count = sorted.len();
    let idx_f = (Decimal::from(count as u64) * q).ceil();
    let idx = idx_f
        .to_usize()
        .unwrap_or(count)
        .saturating_sub(1)
        .min(count.saturating_sub(1));
    sorted[idx]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn engine() -> RollingWindowEngine {
        RollingWindowEngine::new(
            WindowEngineConfig {
                window_size: Duration::from_secs(300),
                hard_cap_points: 5000,
                max_windows: 10_000,
                max_latest_ticks: 50_000,
                window_cleanup_interval: Duration::from_secs(300),
                last_tick_cleanup_interval: Duration::from_secs(120),
                last_tick_max_age: Duration::from_secs(300),
                chart_recent_window: Duration::from_secs(900),
                chart_quantile_window: 200,
                chart_upper_quantile: dec!(0.97),
                chart_lower_quantile: dec!(0.03),
            },
            Arc::new(WindowEngineMetrics::default()),
        )
    }

    fn tick(exchange: &str, symbol: &str, bid: Decimal, ask: Decimal, at: Instant) -> Tick {
        Tick {
            exchange: exchange.to_string(),
            symbol: symbol.to_string(),
            best_bid: bid,
            best_ask: ask,
            quote_volume_24h: Decimal::from(1_000_000),
            local_timestamp: at,
            observed_at: Utc::now(),
            server_timestamp: None,
            spread_percent_intra: None,
            min_volume: None,
            max_volume: None,
        }
    }

    #[test]
    fn s1_first_cross_exchange_match() {
        let engine = engine();
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_millis(50);

        let produced_a = engine.process_tick(&tick("A", "BTCUSDT", dec!(100.00), dec!(100.10), t0));
        assert!(produced_a.is_empty());
        assert_eq!(engine.windows_len(), 0);

        let produced_b = engine.process_tick(&tick("B", "BTCUSDT", dec!(100.05), dec!(100.15), t1));
        assert_eq!(produced_b.len(), 1);
        let point = &produced_b[0];
        assert_eq!(point.exchange1, "A");
        assert_eq!(point.exchange2, "B");
        assert_eq!(point.bid1, dec!(100.00));
        assert_eq!(point.bid2, dec!(100.05));
        assert_eq!(point.staleness_ms, 50);
        assert_eq!(point.triggered_by, "B");
        assert_eq!(engine.windows_len(), 1);
    }

    #[test]
    fn no_self_match_on_repeated_tick_same_exchange() {
        let engine = engine();
        let t0 = Instant::now();
        engine.process_tick(&tick("A", "BTCUSDT", dec!(100.00), dec!(100.10), t0));
        let t1 = t0 + Duration::from_millis(10);
        let produced = engine.process_tick(&tick("A", "BTCUSDT", dec!(100.02), dec!(100.12), t1));
        assert!(produced.is_empty(), "only one exchange trading symbol so far");
    }

    #[test]
    fn s5_lru_eviction_of_windows() {
        let mut cfg_engine = RollingWindowEngine::new(
            WindowEngineConfig {
                window_size: Duration::from_secs(300),
                hard_cap_points: 5000,
                max_windows: 2,
                max_latest_ticks: 50_000,
                window_cleanup_interval: Duration::from_secs(300),
                last_tick_cleanup_interval: Duration::from_secs(120),
                last_tick_max_age: Duration::from_secs(300),
                chart_recent_window: Duration::from_secs(900),
                chart_quantile_window: 200,
                chart_upper_quantile: dec!(0.97),
                chart_lower_quantile: dec!(0.03),
            },
            Arc::new(WindowEngineMetrics::default()),
        );
        let t0 = Instant::now();
        cfg_engine.process_tick(&tick("A", "X", dec!(1), dec!(1.01), t0));
        cfg_engine.process_tick(&tick("B", "X", dec!(1), dec!(1.01), t0));
        cfg_engine.process_tick(&tick("A", "Y", dec!(1), dec!(1.01), t0));
        cfg_engine.process_tick(&tick("B", "Y", dec!(1), dec!(1.01), t0));
        assert_eq!(cfg_engine.windows_len(), 2);

        cfg_engine.process_tick(&tick("A", "Z", dec!(1), dec!(1.01), t0));
        cfg_engine.process_tick(&tick("B", "Z", dec!(1), dec!(1.01), t0));
        assert_eq!(cfg_engine.windows_len(), 2);
        assert!(cfg_engine.chart_frame_full("A", "B", "X").is_none());
        assert!(cfg_engine.chart_frame_full("A", "B", "Y").is_some());
        assert!(cfg_engine.chart_frame_full("A", "B", "Z").is_some());
    }

    #[test]
    fn subscribe_then_unsubscribe_stops_dispatch() {
        let engine = engine();
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let count_cl = count.clone();
        let token = engine.subscribe_to_window(
            "A",
            "B",
            "BTCUSDT",
            Arc::new(move |_p| {
                count_cl.fetch_add(1, Ordering::Relaxed);
            }),
        );

        let t0 = Instant::now();
        engine.process_tick(&tick("A", "BTCUSDT", dec!(100), dec!(100.1), t0));
        engine.process_tick(&tick("B", "BTCUSDT", dec!(100), dec!(100.1), t0 + Duration::from_millis(1)));
        assert_eq!(count.load(Ordering::Relaxed), 1);

        engine.unsubscribe(token);
        engine.process_tick(&tick("A", "BTCUSDT", dec!(101), dec!(101.1), t0 + Duration::from_millis(2)));
        assert_eq!(count.load(Ordering::Relaxed), 1, "no further dispatch after unsubscribe");
    }

    #[test]
    fn chart_frame_timestamps_are_monotonic_and_quantiles_are_stable() {
        let engine = engine();
        let t0 = Instant::now();
        engine.process_tick(&tick("A", "BTCUSDT", dec!(100), dec!(100.1), t0));
        for i in 1..20u64 {
            let bid = Decimal::from(100) + Decimal::new(i as i64, 1);
            engine.process_tick(&tick(
                "B",
                "BTCUSDT",
                bid,
                bid + dec!(0.1),
                t0 + Duration::from_millis(i * 10),
            ));
        }
        let frame = engine.chart_frame_full("A", "B", "BTCUSDT").expect("frame present");
        assert_eq!(frame.timestamps.len(), 19);
        for pair in frame.timestamps.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        assert_eq!(frame.upper_band.len(), frame.spreads.len());
    }

    #[test]
    fn quantile_index_rule_matches_spec() {
        let values: Vec<Decimal> = (1..=10).map(Decimal::from).collect();
        // ceil(10*0.97)-1 = ceil(9.7)-1 = 10-1 = 9 -> max value
        assert_eq!(quantile(&values, dec!(0.97)), Decimal::from(10));
        // ceil(10*0.03)-1 = ceil(0.3)-1 = 1-1 = 0 -> min value
        assert_eq!(quantile(&values, dec!(0.03)), Decimal::from(1));
    }

    #[tokio::test]
    async fn consumer_loop_drains_and_stops_on_shutdown() {
        let engine = Arc::new(engine());
        let (tx, rx) = crate::channels::bounded::<Tick>(16);
        let shutdown = Shutdown::new();
        let produced = Arc::new(Mutex::new(Vec::new()));
        let produced_cl = produced.clone();
        let shutdown_cl = shutdown.clone();
        let handle = tokio::spawn(async move {
            engine
                .run_consumer(rx, shutdown_cl, move |p| {
                    produced_cl.lock().push(p.clone());
                })
                .await;
        });

        let t0 = Instant::now();
        tx.try_publish(tick("A", "BTCUSDT", dec!(100), dec!(100.1), t0));
        tx.try_publish(tick("B", "BTCUSDT", dec!(100), dec!(100.1), t0 + Duration::from_millis(5)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.trigger();
        tx.close();
        handle.await.unwrap();

        assert_eq!(produced.lock().len(), 1);
    }
}
