//! Core data model shared by the ingestion pipeline, the rolling-window
//! engine, and the signal detector.
//!
//! All prices, volumes and derived percentages use [`rust_decimal::Decimal`]
//! end-to-end so spread arithmetic never touches a float intermediate.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// One top-of-book update from one exchange for one symbol.
///
/// `local_timestamp` is the monotonic instant captured at ingest; it is the
/// clock used for all window/staleness arithmetic. `observed_at` is the
/// wall-clock twin captured at the same instant, carried purely for JSON
/// serialization (monotonic instants have no epoch).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tick {
    pub exchange: String,
    pub symbol: String,
    pub best_bid: Decimal,
    pub best_ask: Decimal,
    pub quote_volume_24h: Decimal,
    #[serde(skip, default = "Instant::now")]
    pub local_timestamp: Instant,
    pub observed_at: DateTime<Utc>,
    pub server_timestamp: Option<Decimal>,
    /// `(best_ask - best_bid) / best_ask * 100`, annotated by the orchestrator.
    pub spread_percent_intra: Option<Decimal>,
    pub min_volume: Option<Decimal>,
    pub max_volume: Option<Decimal>,
}

impl Tick {
    /// Strips `/`, `-`, `_` and spaces from a raw exchange symbol, per spec §4.2 step 2.
    pub fn normalize_symbol(raw: &str) -> String {
        raw.chars()
            .filter(|c| !matches!(c, '/' | '-' | '_' | ' '))
            .collect::<String>()
            .to_uppercase()
    }

    /// `false` when the tick must be dropped before it reaches any channel (§3 invariant).
    pub fn is_admissible(&self) -> bool {
        self.best_ask > Decimal::ZERO && self.best_bid > Decimal::ZERO
    }
}

/// Per-exchange trading-pair static metadata, produced once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SymbolInfo {
    pub exchange: String,
    pub symbol: String,
    pub price_step: Decimal,
    pub quantity_step: Decimal,
    pub min_notional: Decimal,
}

/// A 24h ticker snapshot used for symbol-set construction (§4.2).
#[derive(Debug, Clone)]
pub struct TickerInfo {
    pub symbol: String,
    pub quote_volume_24h: Decimal,
}

/// The unit of the spread stream: one cross-exchange comparison produced by
/// last-tick matching (§4.3.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpreadPoint {
    #[serde(skip, default = "Instant::now")]
    pub instant: Instant,
    /// Epoch seconds, millisecond precision, per §6.3.
    pub timestamp: f64,
    pub symbol: String,
    /// Canonical ordering: `exchange1 < exchange2` lexicographically.
    pub exchange1: String,
    pub exchange2: String,
    pub bid1: Decimal,
    pub bid2: Decimal,
    pub spread_percent: Decimal,
    pub staleness_ms: u64,
    pub triggered_by: String,
}

impl SpreadPoint {
    /// Builds a point from a triggering tick and the counter-side cache
    /// entry, applying canonical exchange ordering. Returns `None` if either
    /// bid is non-positive (§3 invariant) — the caller logs and drops.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        trigger_exchange: &str,
        trigger_symbol: &str,
        trigger_bid: Decimal,
        trigger_instant: Instant,
        trigger_wall: DateTime<Utc>,
        other_exchange: &str,
        other_bid: Decimal,
        other_instant: Instant,
    ) -> Option<Self> {
        if trigger_bid <= Decimal::ZERO || other_bid <= Decimal::ZERO {
            return None;
        }

        let (exchange1, bid1, exchange2, bid2) = if trigger_exchange < other_exchange {
            (
                trigger_exchange.to_string(),
                trigger_bid,
                other_exchange.to_string(),
                other_bid,
            )
        } else {
            (
                other_exchange.to_string(),
                other_bid,
                trigger_exchange.to_string(),
                trigger_bid,
            )
        };

        let spread_percent = (bid1 / bid2 - Decimal::ONE) * Decimal::from(100);
        let staleness = if trigger_instant >= other_instant {
            trigger_instant - other_instant
        } else {
            other_instant - trigger_instant
        };

        Some(Self {
            instant: trigger_instant,
            timestamp: wall_clock_seconds(trigger_wall),
            symbol: trigger_symbol.to_string(),
            exchange1,
            exchange2,
            bid1,
            bid2,
            spread_percent,
            staleness_ms: staleness.as_millis() as u64,
            triggered_by: trigger_exchange.to_string(),
        })
    }
}

/// Converts a wall-clock instant into epoch seconds with millisecond precision.
pub fn wall_clock_seconds(ts: DateTime<Utc>) -> f64 {
    ts.timestamp_millis() as f64 / 1000.0
}

/// Sign of a spread deviation, used by the signal detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Up,
    Down,
}

impl Direction {
    pub fn of(spread_percent: Decimal) -> Self {
        if spread_percent >= Decimal::ZERO {
            Direction::Up
        } else {
            Direction::Down
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SignalKind {
    Entry,
    Exit,
}

/// An arbitrage entry/exit event emitted by the [`crate::signals::SignalDetector`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Signal {
    pub symbol: String,
    pub exchange1: String,
    pub exchange2: String,
    pub deviation: Decimal,
    pub direction: Direction,
    pub cheap_exchange: String,
    pub expensive_exchange: String,
    pub kind: SignalKind,
    pub timestamp: f64,
}

/// Wire envelope for the `/ws/realtime` and `/ws/signals` surfaces (§6.3).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "payload")]
pub enum WsEvent {
    Spread(Tick),
    Signal(Signal),
}

/// A chart-frame response for the targeted charts WS and the NDJSON dashboard
/// endpoint (§4.3.5).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ChartFrame {
    pub timestamps: Vec<f64>,
    pub spreads: Vec<Option<Decimal>>,
    pub upper_band: Vec<Option<Decimal>>,
    pub lower_band: Vec<Option<Decimal>>,
}

/// Key identifying a canonical `(exchange1, exchange2, symbol)` window triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
    pub exchange1: String,
    pub exchange2: String,
    pub symbol: String,
}

impl WindowKey {
    pub fn new(exchange1: &str, exchange2: &str, symbol: &str) -> Self {
        if exchange1 <= exchange2 {
            Self {
                exchange1: exchange1.to_string(),
                exchange2: exchange2.to_string(),
                symbol: symbol.to_string(),
            }
        } else {
            Self {
                exchange1: exchange2.to_string(),
                exchange2: exchange1.to_string(),
                symbol: symbol.to_string(),
            }
        }
    }

    pub fn cache_key(&self) -> String {
        format!("{}_{}_{}", self.exchange1, self.exchange2, self.symbol)
    }
}
