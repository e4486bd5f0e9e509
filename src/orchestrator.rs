//! The ingestion orchestrator (spec.md §4.2) — the hot path.
//!
//! For each configured exchange: discovers and filters its symbol set,
//! starts the adapter, and for every inbound tick runs a fixed pipeline that
//! never suspends. Broadcasting to WebSocket clients is fire-and-forget; the
//! Raw and Window channels are only ever `try_publish`ed.

use crate::adapter::ExchangeAdapter;
use crate::channels::Publisher;
use crate::config::ExchangeConfig;
use crate::metrics::LogThrottle;
use crate::models::{SymbolInfo, Tick};
use anyhow::Result;
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Suffixes a symbol must end with to be admissible (spec.md §4.2).
const ADMISSIBLE_SUFFIXES: [&str; 2] = ["USDT", "USDC"];

/// Retrieves symbols + tickers from the adapter and applies the
/// admission filter: ends in USDT/USDC, has a matching ticker, and its 24h
/// quote volume falls within `[min_volume, max_volume]`. Deduplicated by
/// `(exchange, symbol)`.
pub async fn build_symbol_set(
    adapter: &dyn ExchangeAdapter,
    min_volume: Decimal,
    max_volume: Decimal,
) -> Result<Vec<SymbolInfo>> {
    let symbols = adapter.get_symbols().await?;
    let tickers = adapter.get_tickers().await?;

    let mut seen = HashSet::new();
    let mut admitted = Vec::new();

    for info in symbols {
        if !ADMISSIBLE_SUFFIXES.iter().any(|suffix| info.symbol.ends_with(suffix)) {
            continue;
        }
        let Some(ticker) = tickers.iter().find(|t| t.symbol == info.symbol) else {
            continue;
        };
        if ticker.quote_volume_24h < min_volume || ticker.quote_volume_24h > max_volume {
            continue;
        }
        let key = (info.exchange.clone(), info.symbol.clone());
        if !seen.insert(key) {
            continue;
        }
        admitted.push(info);
    }

    Ok(admitted)
}

/// The fixed per-tick pipeline (spec.md §4.2). Broadcasts the normalized
/// tick to WebSocket subscribers first (hot path, fire-and-forget), then
/// attempts the two cold-path publishes.
pub struct Orchestrator {
    raw_tx: Publisher<Tick>,
    window_tx: Publisher<Tick>,
    broadcast: Arc<dyn Fn(Tick) + Send + Sync>,
    raw_drop_throttle: LogThrottle,
    window_drop_throttle: LogThrottle,
}

impl Orchestrator {
    pub fn new(
        raw_tx: Publisher<Tick>,
        window_tx: Publisher<Tick>,
        broadcast: Arc<dyn Fn(Tick) + Send + Sync>,
    ) -> Self {
        Self {
            raw_tx,
            window_tx,
            broadcast,
            raw_drop_throttle: LogThrottle::new(Duration::from_secs(10)),
            window_drop_throttle: LogThrottle::new(Duration::from_secs(10)),
        }
    }

    /// Runs the fixed pipeline for one inbound tick. Never suspends, never
    /// panics out of a caller's hot path — every fallible step here is
    /// logged and the tick simply drops, per spec.md §7.
    pub fn handle_tick(&self, mut tick: Tick, exchange_cfg: &ExchangeConfig) {
        // Step 1: reject non-admissible ticks before they touch anything else.
        if !tick.is_admissible() {
            debug!(exchange = %tick.exchange, symbol = %tick.symbol, "dropping tick: non-positive bid/ask");
            return;
        }

        // Step 2: normalize the symbol.
        tick.symbol = Tick::normalize_symbol(&tick.symbol);

        // Step 3: annotate intra-exchange spread and the exchange's volume bounds.
        tick.spread_percent_intra =
            Some((tick.best_ask - tick.best_bid) / tick.best_ask * Decimal::from(100));
        tick.min_volume = Some(exchange_cfg.min_usd_volume);
        tick.max_volume = Some(exchange_cfg.max_usd_volume);

        // Step 4: hot path — fire-and-forget broadcast, never awaited.
        (self.broadcast)(tick.clone());

        // Step 5: cold path — non-blocking try-publish only.
        if !self.raw_tx.try_publish(tick.clone()) && self.raw_drop_throttle.should_log() {
            warn!(
                exchange = %tick.exchange,
                dropped = self.raw_tx.metrics().dropped.load(std::sync::atomic::Ordering::Relaxed),
                "raw channel overflow, dropping oldest"
            );
        }
        if !self.window_tx.try_publish(tick.clone()) && self.window_drop_throttle.should_log() {
            warn!(
                exchange = %tick.exchange,
                dropped = self.window_tx.metrics().dropped.load(std::sync::atomic::Ordering::Relaxed),
                "window channel overflow, dropping oldest"
            );
        }
    }
}

/// Starts one exchange end-to-end: discovers its symbol set, then runs the
/// adapter's subscription loop with reconnect, routing every tick through
/// the orchestrator pipeline. Adapter startup failure is logged and the
/// exchange is skipped — it must never crash the process (spec.md §4.2
/// "Failure semantics").
pub async fn run_exchange(
    adapter: Arc<dyn ExchangeAdapter>,
    exchange_cfg: ExchangeConfig,
    orchestrator: Arc<Orchestrator>,
    health: Arc<crate::metrics::AdapterHealth>,
    shutdown: crate::shutdown::Shutdown,
) {
    let symbols = match build_symbol_set(
        adapter.as_ref(),
        exchange_cfg.min_usd_volume,
        exchange_cfg.max_usd_volume,
    )
    .await
    {
        Ok(symbols) if !symbols.is_empty() => symbols,
        Ok(_) => {
            warn!(exchange = %exchange_cfg.name, "no admissible symbols, skipping exchange");
            return;
        }
        Err(err) => {
            warn!(exchange = %exchange_cfg.name, error = %err, "symbol discovery failed, skipping exchange");
            return;
        }
    };

    info!(exchange = %exchange_cfg.name, symbols = symbols.len(), "exchange admitted");
    let symbol_names: Vec<String> = symbols.into_iter().map(|s| s.symbol).collect();

    let cfg_for_tick = exchange_cfg.clone();
    let on_tick: crate::adapter::OnTick = Arc::new(move |tick| {
        // Never let a panicking handler escape into the adapter's thread.
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            orchestrator.handle_tick(tick, &cfg_for_tick);
        }));
        if result.is_err() {
            tracing::error!("tick handler panicked; tick dropped");
        }
    });

    crate::adapter::run_with_reconnect(adapter, symbol_names, on_tick, health, shutdown).await;
}
