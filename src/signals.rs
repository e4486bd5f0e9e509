//! The signal detector (spec.md §4.5): an event-driven threshold state
//! machine with cooldown, duplicate-entry suppression, and a synchronous
//! executor callback.
//!
//! One [`SignalDetector`] instance is shared across every monitored
//! `(ex1, ex2, sym)` triple; per-triple state lives in a concurrent map so
//! triples never contend with each other.

use crate::models::{Direction, Signal, SignalKind, SpreadPoint};
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::error;

#[derive(Debug, Clone)]
pub struct SignalDetectorConfig {
    pub entry_threshold_pct: Decimal,
    pub exit_threshold_pct: Decimal,
    pub cooldown: Duration,
}

impl From<&crate::config::Config> for SignalDetectorConfig {
    fn from(cfg: &crate::config::Config) -> Self {
        Self {
            entry_threshold_pct: cfg.entry_threshold_pct,
            exit_threshold_pct: cfg.exit_threshold_pct,
            cooldown: cfg.cooldown,
        }
    }
}

struct TripleState {
    /// Latches to `true` the instant the deviation crosses the entry
    /// threshold, independent of whether the Entry *signal* is actually
    /// emitted (cooldown can suppress emission without suppressing the
    /// underlying state transition — see `on_spread_point` and the S3
    /// cooldown-suppression scenario this mirrors).
    active: bool,
    /// Cooldown clock: set only when an Entry signal is actually emitted.
    /// Exits do not touch it, so a suppressed-then-later Entry measures
    /// cooldown from the last real entry, not the intervening exit.
    last_entry_time: Option<Instant>,
}

/// Invoked synchronously, in-process, with every emitted [`Signal`]. Its
/// latency directly affects detector throughput (spec.md §6.4); executors
/// that must do I/O are expected to dispatch to their own queue.
pub type ExecutorCallback = Arc<dyn Fn(Signal) + Send + Sync>;

pub struct SignalDetector {
    config: SignalDetectorConfig,
    states: DashMap<String, Mutex<TripleState>>,
    executor: ExecutorCallback,
}

impl SignalDetector {
    pub fn new(config: SignalDetectorConfig, executor: ExecutorCallback) -> Self {
        Self {
            config,
            states: DashMap::new(),
            executor,
        }
    }

    fn triple_key(point: &SpreadPoint) -> String {
        format!("{}_{}_{}", point.exchange1, point.exchange2, point.symbol)
    }

    fn cheap_expensive(point: &SpreadPoint) -> (String, String) {
        if point.spread_percent > Decimal::ZERO {
            (point.exchange1.clone(), point.exchange2.clone())
        } else {
            (point.exchange2.clone(), point.exchange1.clone())
        }
    }

    /// Evaluates one incoming [`SpreadPoint`] against the triple's state
    /// machine (§4.5 steps 1-2). Emits at most one [`Signal`], invoking the
    /// executor callback synchronously before returning it for the caller
    /// to fan out to `/ws/signals`.
    pub fn on_spread_point(&self, point: &SpreadPoint) -> Option<Signal> {
        let key = Self::triple_key(point);
        let entry = self
            .states
            .entry(key)
            .or_insert_with(|| Mutex::new(TripleState {
                active: false,
                last_entry_time: None,
            }));
        let mut state = entry.lock();

        let abs_dev = point.spread_percent.abs();
        let now = point.instant;

        let signal = if abs_dev >= self.config.entry_threshold_pct && !state.active {
            // The deviation episode starts regardless of cooldown; only the
            // notification is gated, so a later exit from this same episode
            // still fires even if the entry itself was suppressed.
            state.active = true;
            let cooldown_elapsed = state
                .last_entry_time
                .map(|t| now.saturating_duration_since(t) >= self.config.cooldown)
                .unwrap_or(true);
            if cooldown_elapsed {
                state.last_entry_time = Some(now);
                let (cheap, expensive) = Self::cheap_expensive(point);
                Some(Signal {
                    symbol: point.symbol.clone(),
                    exchange1: point.exchange1.clone(),
                    exchange2: point.exchange2.clone(),
                    deviation: point.spread_percent,
                    direction: Direction::of(point.spread_percent),
                    cheap_exchange: cheap,
                    expensive_exchange: expensive,
                    kind: SignalKind::Entry,
                    timestamp: point.timestamp,
                })
            } else {
                None
            }
        } else if state.active && abs_dev <= self.config.exit_threshold_pct {
            // Exit is never cooldown-gated.
            state.active = false;
            let (cheap, expensive) = Self::cheap_expensive(point);
            Some(Signal {
                symbol: point.symbol.clone(),
                exchange1: point.exchange1.clone(),
                exchange2: point.exchange2.clone(),
                deviation: point.spread_percent,
                direction: Direction::of(point.spread_percent),
                cheap_exchange: cheap,
                expensive_exchange: expensive,
                kind: SignalKind::Exit,
                timestamp: point.timestamp,
            })
        } else {
            None
        };
        drop(state);

        if let Some(ref sig) = signal {
            self.invoke_executor(sig.clone());
        }
        signal
    }

    /// Guards the executor boundary (spec.md §7): a panicking executor is
    /// caught, logged, and never corrupts detector state.
    fn invoke_executor(&self, signal: Signal) {
        let executor = self.executor.clone();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| executor(signal)));
        if result.is_err() {
            error!("signal executor callback panicked; detector state unchanged");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn detector(executor: ExecutorCallback) -> SignalDetector {
        SignalDetector::new(
            SignalDetectorConfig {
                entry_threshold_pct: dec!(0.35),
                exit_threshold_pct: dec!(0.05),
                cooldown: Duration::from_secs(10),
            },
            executor,
        )
    }

    fn point_at(spread_percent: Decimal, instant: Instant) -> SpreadPoint {
        SpreadPoint {
            instant,
            timestamp: instant.elapsed().as_secs_f64(),
            symbol: "BTCUSDT".to_string(),
            exchange1: "A".to_string(),
            exchange2: "B".to_string(),
            bid1: dec!(100),
            bid2: dec!(100),
            spread_percent,
            staleness_ms: 0,
            triggered_by: "A".to_string(),
        }
    }

    #[test]
    fn s2_entry_then_exit_sequence() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_cl = calls.clone();
        let d = detector(Arc::new(move |_s| {
            calls_cl.fetch_add(1, Ordering::Relaxed);
        }));

        let t0 = Instant::now();
        let values = [dec!(0.10), dec!(0.20), dec!(0.35), dec!(0.40), dec!(0.20), dec!(0.04), dec!(0.01)];
        let mut emitted = Vec::new();
        for (i, v) in values.iter().enumerate() {
            let t = t0 + Duration::from_secs(i as u64 * 20); // spaced past cooldown
            if let Some(sig) = d.on_spread_point(&point_at(*v, t)) {
                emitted.push((i, sig.kind));
            }
        }

        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[0], (2, SignalKind::Entry));
        assert_eq!(emitted[1], (5, SignalKind::Exit));
        assert_eq!(calls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn s3_cooldown_suppresses_reentry() {
        let d = detector(Arc::new(|_s| {}));
        let t0 = Instant::now();

        let steps = [
            (dec!(0.40), 0u64, Some(SignalKind::Entry)),
            (dec!(0.02), 1, Some(SignalKind::Exit)),
            // entry suppressed: only 4s since the t=0 entry, cooldown is 10s.
            // The episode still latches `active`, so...
            (dec!(0.40), 5, None),
            // ...this exit still fires even though its entry was suppressed.
            (dec!(0.02), 6, Some(SignalKind::Exit)),
            // 11s since the t=0 entry: cooldown has passed.
            (dec!(0.40), 11, Some(SignalKind::Entry)),
        ];

        for (spread, secs, expected) in steps {
            let t = t0 + Duration::from_secs(secs);
            let got = d.on_spread_point(&point_at(spread, t)).map(|s| s.kind);
            assert_eq!(got, expected, "at t={secs}s");
        }
    }

    #[test]
    fn boundary_thresholds_fire_inclusively() {
        let d = detector(Arc::new(|_s| {}));
        let t0 = Instant::now();
        let entry = d.on_spread_point(&point_at(dec!(0.35), t0));
        assert_eq!(entry.unwrap().kind, SignalKind::Entry);
        let exit = d.on_spread_point(&point_at(dec!(0.05), t0 + Duration::from_secs(20)));
        assert_eq!(exit.unwrap().kind, SignalKind::Exit);
    }

    #[test]
    fn cheap_expensive_follows_sign_of_spread() {
        let d = detector(Arc::new(|_s| {}));
        let t0 = Instant::now();
        let sig = d
            .on_spread_point(&point_at(dec!(0.40), t0))
            .expect("entry fires");
        assert_eq!(sig.cheap_exchange, "A");
        assert_eq!(sig.expensive_exchange, "B");
    }

    #[test]
    fn executor_panic_is_caught_and_state_unaffected() {
        let d = detector(Arc::new(|_s| panic!("executor boom")));
        let t0 = Instant::now();
        let sig = d.on_spread_point(&point_at(dec!(0.40), t0));
        assert!(sig.is_some(), "detector still returns the signal despite a panicking executor");
        // second identical point should be suppressed as a duplicate entry (still active)
        let sig2 = d.on_spread_point(&point_at(dec!(0.40), t0 + Duration::from_millis(5)));
        assert!(sig2.is_none());
        let _ = Utc::now();
    }
}
