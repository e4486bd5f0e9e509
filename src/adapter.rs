//! The `ExchangeAdapter` contract (spec.md §6.1) and a reference
//! implementation.
//!
//! Real exchange protocol clients (Binance, Coinbase, ...) are deliberately
//! out of scope (spec.md §1); this module gives them a uniform interface to
//! implement and ships one concrete, self-contained adapter —
//! [`SimulatedAdapter`] — that generates synthetic top-of-book ticks so the
//! crate runs end-to-end with no network access.

use crate::metrics::AdapterHealth;
use crate::models::{SymbolInfo, Tick, TickerInfo};
use crate::shutdown::Shutdown;
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// A normalized top-of-book callback. The adapter must call it from any
/// thread but never concurrently for the same symbol (spec.md §6.1).
pub type OnTick = Arc<dyn Fn(Tick) + Send + Sync>;

#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn exchange_name(&self) -> &str;

    /// One-shot at startup: all tradable symbols this adapter knows about.
    async fn get_symbols(&self) -> Result<Vec<SymbolInfo>>;

    /// One-shot at startup: 24h ticker volumes, used for symbol-set filtering.
    async fn get_tickers(&self) -> Result<Vec<TickerInfo>>;

    /// Subscribes to top-of-book updates for `symbols`, invoking `on_tick`
    /// for each. Must reconnect on disconnect without external prompting and
    /// survive at least 100 consecutive reconnects without leaking
    /// handlers. Returns only once `shutdown` is triggered.
    async fn subscribe_tickers(
        &self,
        symbols: Vec<String>,
        on_tick: OnTick,
        health: Arc<AdapterHealth>,
        shutdown: Shutdown,
    ) -> Result<()>;
}

/// Synthetic top-of-book generator. One instance simulates one "exchange":
/// it runs an independent random walk per symbol and emits a tick on a fixed
/// interval, the way a real adapter would emit on every book update.
pub struct SimulatedAdapter {
    name: String,
    symbols: Vec<String>,
    tick_interval: Duration,
    base_prices: Vec<Decimal>,
    volatility_bps: u32,
}

impl SimulatedAdapter {
    pub fn new(name: impl Into<String>, symbols: Vec<String>) -> Self {
        let base_prices = symbols.iter().map(|_| Decimal::from(100)).collect();
        Self {
            name: name.into(),
            symbols,
            tick_interval: Duration::from_millis(200),
            base_prices,
            volatility_bps: 5,
        }
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_base_price(mut self, symbol: &str, price: Decimal) -> Self {
        if let Some(idx) = self.symbols.iter().position(|s| s == symbol) {
            self.base_prices[idx] = price;
        }
        self
    }

    fn random_walk_step(price: Decimal, volatility_bps: u32) -> Decimal {
        let mut rng = rand::thread_rng();
        let bps: i64 = rng.gen_range(-(volatility_bps as i64)..=(volatility_bps as i64));
        let delta = price * Decimal::from(bps) / Decimal::from(10_000);
        (price + delta).max(Decimal::new(1, 2))
    }
}

#[async_trait]
impl ExchangeAdapter for SimulatedAdapter {
    fn exchange_name(&self) -> &str {
        &self.name
    }

    async fn get_symbols(&self) -> Result<Vec<SymbolInfo>> {
        Ok(self
            .symbols
            .iter()
            .map(|s| SymbolInfo {
                exchange: self.name.clone(),
                symbol: s.clone(),
                price_step: Decimal::new(1, 2),
                quantity_step: Decimal::new(1, 4),
                min_notional: Decimal::from(10),
            })
            .collect())
    }

    async fn get_tickers(&self) -> Result<Vec<TickerInfo>> {
        let mut rng = rand::thread_rng();
        Ok(self
            .symbols
            .iter()
            .map(|s| TickerInfo {
                symbol: s.clone(),
                quote_volume_24h: Decimal::from(rng.gen_range(500_000u64..5_000_000u64)),
            })
            .collect())
    }

    async fn subscribe_tickers(
        &self,
        symbols: Vec<String>,
        on_tick: OnTick,
        health: Arc<AdapterHealth>,
        shutdown: Shutdown,
    ) -> Result<()> {
        use std::sync::atomic::Ordering;

        health.connected.store(true, Ordering::Relaxed);
        health.reconnecting.store(false, Ordering::Relaxed);
        info!(exchange = %self.name, symbols = symbols.len(), "adapter subscribed");

        let mut prices: Vec<Decimal> = symbols
            .iter()
            .map(|s| {
                self.symbols
                    .iter()
                    .position(|known| known == s)
                    .map(|idx| self.base_prices[idx])
                    .unwrap_or(Decimal::from(100))
            })
            .collect();

        let mut ticker = tokio::time::interval(self.tick_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(exchange = %self.name, "adapter observed shutdown");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    for (idx, symbol) in symbols.iter().enumerate() {
                        let mid = Self::random_walk_step(prices[idx], self.volatility_bps);
                        prices[idx] = mid;
                        let spread = mid * Decimal::new(2, 4); // ~2 bps intra-exchange spread
                        let best_bid = mid - spread / Decimal::from(2);
                        let best_ask = mid + spread / Decimal::from(2);
                        let now = Instant::now();
                        let tick = Tick {
                            exchange: self.name.clone(),
                            symbol: symbol.clone(),
                            best_bid,
                            best_ask,
                            quote_volume_24h: Decimal::from(1_000_000),
                            local_timestamp: now,
                            observed_at: Utc::now(),
                            server_timestamp: None,
                            spread_percent_intra: None,
                            min_volume: None,
                            max_volume: None,
                        };
                        on_tick(tick);
                    }
                }
            }
        }
    }
}

/// Runs `adapter.subscribe_tickers`, retrying with backoff on error and
/// bumping `health.reconnect_count`, so a transient failure in a real
/// adapter's implementation cannot take the process down (spec.md §4.2
/// "Failure semantics").
pub async fn run_with_reconnect(
    adapter: Arc<dyn ExchangeAdapter>,
    symbols: Vec<String>,
    on_tick: OnTick,
    health: Arc<AdapterHealth>,
    shutdown: Shutdown,
) {
    use std::sync::atomic::Ordering;

    let mut backoff = Duration::from_millis(250);
    const MAX_BACKOFF: Duration = Duration::from_secs(30);

    loop {
        if shutdown.is_triggered() {
            return;
        }
        let result = adapter
            .clone()
            .subscribe_tickers(symbols.clone(), on_tick.clone(), health.clone(), shutdown.clone())
            .await;

        if shutdown.is_triggered() {
            return;
        }

        match result {
            Ok(()) => return,
            Err(err) => {
                health.connected.store(false, Ordering::Relaxed);
                health.reconnecting.store(true, Ordering::Relaxed);
                health.reconnect_count.fetch_add(1, Ordering::Relaxed);
                warn!(exchange = %adapter.exchange_name(), error = %err, backoff_ms = backoff.as_millis(), "adapter disconnected, reconnecting");
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = shutdown.cancelled() => return,
                }
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    #[tokio::test]
    async fn simulated_adapter_emits_ticks_until_shutdown() {
        let adapter = SimulatedAdapter::new("sim", vec!["BTCUSDT".to_string()])
            .with_tick_interval(Duration::from_millis(5));
        let count = Arc::new(AtomicUsize::new(0));
        let received: Arc<Mutex<Vec<Tick>>> = Arc::new(Mutex::new(Vec::new()));
        let count_cl = count.clone();
        let received_cl = received.clone();
        let on_tick: OnTick = Arc::new(move |tick| {
            count_cl.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            received_cl.lock().unwrap().push(tick);
        });

        let health = Arc::new(AdapterHealth::default());
        let shutdown = Shutdown::new();
        let shutdown_cl = shutdown.clone();
        let handle = tokio::spawn(async move {
            adapter
                .subscribe_tickers(vec!["BTCUSDT".to_string()], on_tick, health, shutdown_cl)
                .await
        });

        tokio::time::sleep(Duration::from_millis(40)).await;
        shutdown.trigger();
        handle.await.unwrap().unwrap();

        assert!(count.load(std::sync::atomic::Ordering::Relaxed) > 0);
        for tick in received.lock().unwrap().iter() {
            assert!(tick.is_admissible());
        }
    }

    #[tokio::test]
    async fn get_symbols_and_tickers_cover_configured_symbols() {
        let adapter = SimulatedAdapter::new("sim", vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()]);
        let symbols = adapter.get_symbols().await.unwrap();
        let tickers = adapter.get_tickers().await.unwrap();
        assert_eq!(symbols.len(), 2);
        assert_eq!(tickers.len(), 2);
    }
}
