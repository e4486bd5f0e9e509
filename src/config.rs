//! Startup configuration surface (spec.md §6.2).
//!
//! Loaded once from environment variables (via `dotenv` + `std::env::var`,
//! matching the teacher's `Config::from_env` pattern) plus a small set of
//! CLI overrides via `clap`. Env vars cannot express the dotted
//! `exchanges.<name>.*` keys from §6.2 directly, so per-exchange tables are
//! flattened to `EXCHANGES_<NAME>_<FIELD>`, driven by a top-level
//! `EXCHANGES` name list.
//!
//! Missing/malformed *required* keys (no enabled exchange at all) are a
//! configuration error: `main` must bail before binding the HTTP listener
//! (spec.md §7).

use anyhow::{bail, Context, Result};
use clap::Parser;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;

/// CLI overrides layered on top of the environment. Every field is optional;
/// `None` means "defer to the environment / built-in default".
#[derive(Debug, Parser)]
#[command(name = "xarb", about = "Cross-exchange spread aggregator & arbitrage signal engine")]
pub struct Cli {
    /// HTTP/WebSocket bind port (overrides PORT)
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// tracing-subscriber EnvFilter directive (overrides RUST_LOG)
    #[arg(long, env = "RUST_LOG")]
    pub log_filter: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExchangeConfig {
    pub name: String,
    pub enabled: bool,
    pub min_usd_volume: Decimal,
    pub max_usd_volume: Decimal,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub log_filter: String,

    pub exchanges: Vec<ExchangeConfig>,
    pub streams_tickers: bool,

    pub raw_channel_capacity: usize,
    pub window_channel_capacity: usize,

    pub window_size: Duration,
    pub hard_cap_points: usize,
    pub max_windows: usize,
    pub max_latest_ticks: usize,

    pub entry_threshold_pct: Decimal,
    pub exit_threshold_pct: Decimal,
    pub cooldown: Duration,

    pub chart_recent_window: Duration,
    pub chart_quantile_window: usize,
    pub chart_upper_quantile: Decimal,
    pub chart_lower_quantile: Decimal,

    pub ws_per_send_timeout: Duration,

    /// How often the window-cleanup timer runs (§4.3.3); default 5 min.
    pub window_cleanup_interval: Duration,
    /// How often the last-tick cleanup timer runs (§4.3.3); default 2 min.
    pub last_tick_cleanup_interval: Duration,
    /// Cache entries older than this are dropped by last-tick cleanup; default 5 min.
    pub last_tick_max_age: Duration,
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env_var(key)
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

fn env_decimal(key: &str, default: Decimal) -> Result<Decimal> {
    match env_var(key) {
        Some(v) => Decimal::from_str(&v).with_context(|| format!("malformed decimal for {key}: {v}")),
        None => Ok(default),
    }
}

fn env_duration_secs(key: &str, default_secs: u64) -> Result<Duration> {
    let secs = env_parse::<u64>(key, default_secs);
    Ok(Duration::from_secs(secs))
}

fn env_duration_ms(key: &str, default_ms: u64) -> Result<Duration> {
    let ms = env_parse::<u64>(key, default_ms);
    Ok(Duration::from_millis(ms))
}

impl Config {
    pub fn from_env(cli: &Cli) -> Result<Self> {
        dotenv::dotenv().ok();

        let port = cli.port.unwrap_or_else(|| env_parse("PORT", 8080));
        let log_filter = cli
            .log_filter
            .clone()
            .unwrap_or_else(|| "xarb_engine=debug,tower_http=debug".to_string());

        let exchange_names: Vec<String> = env_var("EXCHANGES")
            .unwrap_or_else(|| "simulated".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let mut exchanges = Vec::with_capacity(exchange_names.len());
        for name in &exchange_names {
            let upper = name.to_uppercase();
            let enabled = env_var(&format!("EXCHANGES_{upper}_ENABLED"))
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
                .unwrap_or(true);
            let min_usd_volume =
                env_decimal(&format!("EXCHANGES_{upper}_MIN_USD_VOLUME"), Decimal::from(100_000))?;
            let max_usd_volume = env_decimal(
                &format!("EXCHANGES_{upper}_MAX_USD_VOLUME"),
                Decimal::from(1_000_000_000),
            )?;
            exchanges.push(ExchangeConfig {
                name: name.clone(),
                enabled,
                min_usd_volume,
                max_usd_volume,
            });
        }

        if !exchanges.iter().any(|e| e.enabled) {
            bail!("configuration error: no enabled exchange (set EXCHANGES and EXCHANGES_<NAME>_ENABLED)");
        }

        let streams_tickers = env_var("STREAMS_TICKERS")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
            .unwrap_or(true);

        let raw_channel_capacity = env_parse("CHANNELS_RAW_CAPACITY", 100_000usize);
        let window_channel_capacity = env_parse("CHANNELS_WINDOW_CAPACITY", 100_000usize);

        let window_size = env_duration_secs("WINDOW_SIZE_SECS", 5 * 60)?;
        let hard_cap_points = env_parse("WINDOW_HARD_CAP_POINTS", 5_000usize);
        let max_windows = env_parse("WINDOW_MAX_WINDOWS", 10_000usize);
        let max_latest_ticks = env_parse("WINDOW_MAX_LATEST_TICKS", 50_000usize);

        let entry_threshold_pct =
            env_decimal("SIGNALS_ENTRY_THRESHOLD_PCT", Decimal::new(35, 2))?; // 0.35
        let exit_threshold_pct = env_decimal("SIGNALS_EXIT_THRESHOLD_PCT", Decimal::new(5, 2))?; // 0.05
        let cooldown = env_duration_secs("SIGNALS_COOLDOWN_SECS", 10)?;

        let chart_recent_window = env_duration_secs("CHART_RECENT_WINDOW_SECS", 15 * 60)?;
        let chart_quantile_window = env_parse("CHART_QUANTILE_WINDOW", 200usize);
        let chart_upper_quantile = env_decimal("CHART_UPPER_QUANTILE", Decimal::new(97, 2))?;
        let chart_lower_quantile = env_decimal("CHART_LOWER_QUANTILE", Decimal::new(3, 2))?;

        let ws_per_send_timeout = env_duration_ms("WS_PER_SEND_TIMEOUT_MS", 250)?;

        let window_cleanup_interval = env_duration_secs("WINDOW_CLEANUP_INTERVAL_SECS", 5 * 60)?;
        let last_tick_cleanup_interval =
            env_duration_secs("LAST_TICK_CLEANUP_INTERVAL_SECS", 2 * 60)?;
        let last_tick_max_age = env_duration_secs("LAST_TICK_MAX_AGE_SECS", 5 * 60)?;

        Ok(Self {
            port,
            log_filter,
            exchanges,
            streams_tickers,
            raw_channel_capacity,
            window_channel_capacity,
            window_size,
            hard_cap_points,
            max_windows,
            max_latest_ticks,
            entry_threshold_pct,
            exit_threshold_pct,
            cooldown,
            chart_recent_window,
            chart_quantile_window,
            chart_upper_quantile,
            chart_lower_quantile,
            ws_per_send_timeout,
            window_cleanup_interval,
            last_tick_cleanup_interval,
            last_tick_max_age,
        })
    }

    pub fn enabled_exchanges(&self) -> impl Iterator<Item = &ExchangeConfig> {
        self.exchanges.iter().filter(|e| e.enabled)
    }
}
