//! xarb — cross-exchange spread aggregator & arbitrage signal engine.
//!
//! This is the composition root: it wires the channels, the rolling-window
//! engine, the signal detector and the reference adapters into a single
//! process, then exposes the HTTP/WebSocket surface (spec.md §6.3) on top of
//! them. Everything reusable across a binary and integration tests lives in
//! `xarb_engine` (see `src/lib.rs`); this file owns only `AppState`, axum
//! routing, and the WebSocket fan-out, since both depend on the composition
//! root itself.

use anyhow::{Context, Result};
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use clap::Parser;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use xarb_engine::adapter::{ExchangeAdapter, SimulatedAdapter};
use xarb_engine::channels::{self, Publisher};
use xarb_engine::config::{Cli, Config};
use xarb_engine::metrics::{AdapterHealth, AdapterHealthSnapshot, WsSnapshot};
use xarb_engine::models::{Signal, Tick, WsEvent};
use xarb_engine::orchestrator::{self, Orchestrator};
use xarb_engine::shutdown::Shutdown;
use xarb_engine::signals::{SignalDetector, SignalDetectorConfig};
use xarb_engine::window::{RollingWindowEngine, WindowEngineConfig};

/// The synthetic universe the bundled [`SimulatedAdapter`] trades, since real
/// exchange protocol clients are deliberately out of scope (spec.md §1).
const REFERENCE_SYMBOLS: [&str; 3] = ["BTCUSDT", "ETHUSDT", "SOLUSDT"];

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::from_env(&cli).context("configuration error")?;
    init_tracing(&config.log_filter);

    info!(port = config.port, exchanges = config.exchanges.len(), "xarb starting up");

    let shutdown = Shutdown::new();
    let config = Arc::new(config);

    let (raw_tx, raw_rx) = channels::bounded::<Tick>(config.raw_channel_capacity);
    let (window_tx, window_rx) = channels::bounded::<Tick>(config.window_channel_capacity);

    tokio::spawn(run_persistence_consumer(raw_rx, shutdown.clone()));

    let window_engine = Arc::new(RollingWindowEngine::new(
        WindowEngineConfig::from(config.as_ref()),
        Arc::new(xarb_engine::metrics::WindowEngineMetrics::default()),
    ));

    let realtime_hub = Arc::new(ClientHub::new());
    let signals_hub = Arc::new(ClientHub::new());

    let signal_detector = {
        let signals_hub = signals_hub.clone();
        let executor: xarb_engine::signals::ExecutorCallback = Arc::new(move |signal: Signal| {
            trade_executor(&signal);
            broadcast_json(&signals_hub, &WsEvent::Signal(signal));
        });
        Arc::new(SignalDetector::new(SignalDetectorConfig::from(config.as_ref()), executor))
    };

    tokio::spawn({
        let window_engine = window_engine.clone();
        let signal_detector = signal_detector.clone();
        let shutdown = shutdown.clone();
        async move {
            window_engine
                .run_consumer(window_rx, shutdown, move |point| {
                    let _ = signal_detector.on_spread_point(point);
                })
                .await;
        }
    });

    tokio::spawn(window_engine.clone().run_cleanup_loop(shutdown.clone()));

    let adapter_health: Arc<DashMap<String, Arc<AdapterHealth>>> = Arc::new(DashMap::new());

    for exchange_cfg in config.enabled_exchanges().cloned() {
        let health = Arc::new(AdapterHealth::default());
        adapter_health.insert(exchange_cfg.name.clone(), health.clone());

        let adapter: Arc<dyn ExchangeAdapter> = Arc::new(SimulatedAdapter::new(
            exchange_cfg.name.clone(),
            REFERENCE_SYMBOLS.iter().map(|s| s.to_string()).collect(),
        ));

        let realtime_hub = realtime_hub.clone();
        let orch = Arc::new(Orchestrator::new(
            raw_tx.clone(),
            window_tx.clone(),
            Arc::new(move |tick: Tick| broadcast_json(&realtime_hub, &WsEvent::Spread(tick))),
        ));

        tokio::spawn(orchestrator::run_exchange(
            adapter,
            exchange_cfg,
            orch,
            health,
            shutdown.clone(),
        ));
    }

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("ctrl-c received, triggering shutdown");
                shutdown.trigger();
            }
        }
    });

    let state = AppState {
        config: config.clone(),
        window_engine,
        realtime_hub,
        signals_hub,
        adapter_health,
        raw_tx,
        window_tx,
        shutdown: shutdown.clone(),
    };

    let app = build_router(state);
    let addr: SocketAddr = ([0, 0, 0, 0], config.port).into();
    let listener = TcpListener::bind(addr).await.context("failed to bind HTTP listener")?;
    info!(%addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("server error")?;

    Ok(())
}

fn init_tracing(filter: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Stand-in for the trade-execution module (spec.md §1 — out of core scope).
/// A real executor dispatches to its own queue; this one only logs, matching
/// spec.md §6.4's requirement that the callback itself never blocks the
/// detector.
fn trade_executor(signal: &Signal) {
    debug!(
        symbol = %signal.symbol,
        kind = ?signal.kind,
        deviation = %signal.deviation,
        cheap = %signal.cheap_exchange,
        expensive = %signal.expensive_exchange,
        "signal executor callback invoked"
    );
}

/// Drains the Raw channel. The parquet writer itself is an external
/// collaborator out of this crate's scope (spec.md §1); this is the minimal
/// stand-in that keeps the channel's single consumer contract honest (§4.1 —
/// "each consumer owns its queue") rather than leaving Raw permanently
/// un-drained.
async fn run_persistence_consumer(consumer: channels::Consumer<Tick>, shutdown: Shutdown) {
    let mut count: u64 = 0;
    loop {
        let next = tokio::select! {
            tick = consumer.recv() => tick,
            _ = shutdown.cancelled() => None,
        };
        let Some(_tick) = next else {
            if shutdown.is_triggered() {
                return;
            }
            continue;
        };
        count += 1;
        if count % 10_000 == 0 {
            debug!(count, "persistence consumer drained raw ticks");
        }
    }
}

// ---------------------------------------------------------------------------
// WebSocket fan-out (spec.md §4.4)
// ---------------------------------------------------------------------------

/// A targeted, non-global client registry. Publishers snapshot the live set
/// and `try_send` into each client's own bounded mailbox — non-blocking, and a
/// slow client only ever backs up its own mailbox (spec.md §4.4). The actual
/// socket write (and its timeout) happens in each client's dedicated
/// forwarding task, never on the publisher's thread.
struct ClientHub {
    clients: DashMap<Uuid, mpsc::Sender<String>>,
    connected: AtomicUsize,
    evicted: AtomicU64,
}

impl ClientHub {
    fn new() -> Self {
        Self {
            clients: DashMap::new(),
            connected: AtomicUsize::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    /// Bounded so a stuck client can't grow memory unboundedly; overflow here
    /// is dropped silently (same "never block the publisher" discipline as
    /// the try-publish channels in §4.1).
    fn register(&self) -> (Uuid, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(256);
        let id = Uuid::new_v4();
        self.clients.insert(id, tx);
        self.connected.fetch_add(1, Ordering::Relaxed);
        (id, rx)
    }

    fn remove(&self, id: Uuid) {
        if self.clients.remove(&id).is_some() {
            self.connected.fetch_sub(1, Ordering::Relaxed);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn broadcast(&self, text: &str) {
        for entry in self.clients.iter() {
            let _ = entry.value().try_send(text.to_string());
        }
    }

    fn send_to(&self, id: Uuid, text: String) {
        if let Some(tx) = self.clients.get(&id) {
            let _ = tx.try_send(text);
        }
    }

    fn snapshot(&self) -> (usize, u64) {
        (
            self.connected.load(Ordering::Relaxed),
            self.evicted.load(Ordering::Relaxed),
        )
    }
}

fn broadcast_json(hub: &ClientHub, event: &WsEvent) {
    match serde_json::to_string(event) {
        Ok(text) => hub.broadcast(&text),
        Err(err) => warn!(error = %err, "failed to serialize WS event, dropping broadcast"),
    }
}

/// Forwards one client's mailbox to its socket. Serialized by construction —
/// a single task owns the socket — so message order within a client is
/// preserved (spec.md §4.4). Every send is bounded by `ws.per_send_timeout`;
/// a send that exceeds it, or a closed/erroring socket, evicts the client.
/// A self-ping every `per_send_timeout * 40` (roughly every 10s at the
/// default 250ms) bounds detection of silently-dead peers to well under the
/// 30s ceiling even when no application data is flowing.
async fn run_client_forwarder(
    mut socket: WebSocket,
    mut mailbox: mpsc::Receiver<String>,
    send_timeout: Duration,
) {
    let mut heartbeat = tokio::time::interval(send_timeout.saturating_mul(40).max(Duration::from_secs(5)));
    heartbeat.tick().await;

    loop {
        tokio::select! {
            msg = mailbox.recv() => {
                let Some(text) = msg else { return };
                match tokio::time::timeout(send_timeout, socket.send(Message::Text(text))).await {
                    Ok(Ok(())) => {}
                    _ => return,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => return,
                    Some(Err(_)) => return,
                    _ => {}
                }
            }
            _ = heartbeat.tick() => {
                match tokio::time::timeout(send_timeout, socket.send(Message::Ping(Vec::new()))).await {
                    Ok(Ok(())) => {}
                    _ => return,
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// AppState & routing
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct AppState {
    config: Arc<Config>,
    window_engine: Arc<RollingWindowEngine>,
    realtime_hub: Arc<ClientHub>,
    signals_hub: Arc<ClientHub>,
    adapter_health: Arc<DashMap<String, Arc<AdapterHealth>>>,
    raw_tx: Publisher<Tick>,
    window_tx: Publisher<Tick>,
    shutdown: Shutdown,
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/ping", get(ping_handler))
        .route("/api/dashboard_data", get(dashboard_data_handler))
        .route("/ws/realtime", get(ws_realtime_handler))
        .route("/ws/realtime_charts", get(ws_charts_handler))
        .route("/ws/signals", get(ws_signals_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct HealthResponse {
    status: &'static str,
    adapters: Vec<AdapterHealthSnapshot>,
    channels: ChannelsHealth,
    windows: xarb_engine::metrics::WindowEngineSnapshot,
    ws: WsSnapshot,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChannelsHealth {
    raw: xarb_engine::metrics::ChannelSnapshot,
    window: xarb_engine::metrics::ChannelSnapshot,
}

/// `GET /health` — spec.md §6.3 and SPEC_FULL.md §6 [AMBIENT]. `degraded`
/// reflects any adapter currently reconnecting, per spec.md §7's
/// user-visible failure behavior.
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let adapters: Vec<AdapterHealthSnapshot> = state
        .adapter_health
        .iter()
        .map(|entry| entry.value().snapshot(entry.key()))
        .collect();
    let degraded = adapters.iter().any(|a| a.reconnecting || !a.connected);

    let windows = state.window_engine.metrics_snapshot();
    let ws = {
        let (realtime_connected, realtime_evicted) = state.realtime_hub.snapshot();
        let (signals_connected, _signals_evicted) = state.signals_hub.snapshot();
        // Charts clients each own a private per-connection hub (see
        // `handle_chart_socket`), so there is no shared registry to report
        // connected/evicted counts from here.
        WsSnapshot {
            realtime_connected,
            realtime_evicted,
            charts_connected: 0,
            charts_evicted: 0,
            signals_connected,
            send_timeouts: 0,
        }
    };

    Json(HealthResponse {
        status: if degraded { "degraded" } else { "healthy" },
        adapters,
        channels: ChannelsHealth {
            raw: state
                .raw_tx
                .metrics()
                .snapshot(state.raw_tx.depth(), state.raw_tx.capacity()),
            window: state
                .window_tx
                .metrics()
                .snapshot(state.window_tx.depth(), state.window_tx.capacity()),
        },
        windows,
        ws,
    })
}

#[derive(Debug, Serialize)]
struct PingResponse {
    status: &'static str,
    timestamp: f64,
}

/// `GET /ping` — must respond even when every adapter is dark (spec.md §7).
async fn ping_handler() -> Json<PingResponse> {
    Json(PingResponse {
        status: "alive",
        timestamp: xarb_engine::models::wall_clock_seconds(chrono::Utc::now()),
    })
}

#[derive(Debug, Deserialize)]
struct DashboardQuery {
    symbol: String,
    exchange1: String,
    exchange2: String,
}

/// `GET /api/dashboard_data` — NDJSON stream of the requested triple's entire
/// retained window (SPEC_FULL.md §6 [SUPPLEMENT]). Missing/blank parameters
/// are a 400 before the window engine is touched; an absent or empty window
/// yields a 200 with a zero-line body (NDJSON EOF is the terminator).
async fn dashboard_data_handler(
    State(state): State<AppState>,
    Query(query): Query<DashboardQuery>,
) -> Response {
    if query.symbol.trim().is_empty() || query.exchange1.trim().is_empty() || query.exchange2.trim().is_empty() {
        return (StatusCode::BAD_REQUEST, "symbol, exchange1 and exchange2 are required").into_response();
    }

    let body = match state
        .window_engine
        .chart_frame_full(&query.exchange1, &query.exchange2, &query.symbol)
    {
        Some(frame) => serde_json::to_string(&frame).unwrap_or_default() + "\n",
        None => String::new(),
    };

    (
        StatusCode::OK,
        [("content-type", "application/x-ndjson")],
        body,
    )
        .into_response()
}

/// `GET /ws/realtime` — every normalized tick, broadcast to all connected
/// clients (spec.md §6.3, §4.4).
async fn ws_realtime_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| async move {
        let (id, mailbox) = state.realtime_hub.register();
        run_client_forwarder(socket, mailbox, state.config.ws_per_send_timeout).await;
        state.realtime_hub.remove(id);
    })
}

/// `GET /ws/signals` — active Entry/Exit signal stream (spec.md §6.3).
async fn ws_signals_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| async move {
        let (id, mailbox) = state.signals_hub.register();
        run_client_forwarder(socket, mailbox, state.config.ws_per_send_timeout).await;
        state.signals_hub.remove(id);
    })
}

#[derive(Debug, Deserialize)]
struct ChartsQuery {
    symbol: String,
    ex1: String,
    ex2: String,
}

/// `GET /ws/realtime_charts?symbol=&ex1=&ex2=` — targeted subscription to one
/// window's chart frame (spec.md §4.3.4, §4.3.5, §6.3). Subscribes on
/// connect, unsubscribes on disconnect; never touches any other client's
/// window.
async fn ws_charts_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<ChartsQuery>,
) -> Response {
    ws.on_upgrade(move |socket| handle_chart_socket(socket, state, query))
}

async fn handle_chart_socket(socket: WebSocket, state: AppState, query: ChartsQuery) {
    let charts_hub = ClientHub::new();
    let (client_id, mailbox) = charts_hub.register();
    let charts_hub = Arc::new(charts_hub);

    let hub_for_handler = charts_hub.clone();
    let engine = state.window_engine.clone();
    let (ex1, ex2, sym) = (query.ex1.clone(), query.ex2.clone(), query.symbol.clone());
    let token = state.window_engine.subscribe_to_window(
        &query.ex1,
        &query.ex2,
        &query.symbol,
        Arc::new(move |_point| {
            if let Some(frame) = engine.chart_frame(&ex1, &ex2, &sym) {
                if let Ok(text) = serde_json::to_string(&frame) {
                    hub_for_handler.send_to(client_id, text);
                }
            }
        }),
    );

    // Best-effort initial frame so the client isn't empty until the next event.
    if let Some(frame) = state.window_engine.chart_frame(&query.ex1, &query.ex2, &query.symbol) {
        if let Ok(text) = serde_json::to_string(&frame) {
            charts_hub.send_to(client_id, text);
        }
    }

    run_client_forwarder(socket, mailbox, state.config.ws_per_send_timeout).await;

    state.window_engine.unsubscribe(token);
    charts_hub.remove(client_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use rust_decimal::Decimal;
    use tokio_tungstenite::connect_async;
    use tower::ServiceExt;

    fn test_config() -> Config {
        Config {
            port: 0,
            log_filter: "error".to_string(),
            exchanges: vec![],
            streams_tickers: true,
            raw_channel_capacity: 1_000,
            window_channel_capacity: 1_000,
            window_size: Duration::from_secs(300),
            hard_cap_points: 5_000,
            max_windows: 10_000,
            max_latest_ticks: 50_000,
            entry_threshold_pct: Decimal::new(35, 2),
            exit_threshold_pct: Decimal::new(5, 2),
            cooldown: Duration::from_secs(10),
            chart_recent_window: Duration::from_secs(900),
            chart_quantile_window: 200,
            chart_upper_quantile: Decimal::new(97, 2),
            chart_lower_quantile: Decimal::new(3, 2),
            ws_per_send_timeout: Duration::from_millis(50),
            window_cleanup_interval: Duration::from_secs(300),
            last_tick_cleanup_interval: Duration::from_secs(120),
            last_tick_max_age: Duration::from_secs(300),
        }
    }

    fn test_state() -> AppState {
        let config = Arc::new(test_config());
        let (raw_tx, _raw_rx) = channels::bounded::<Tick>(config.raw_channel_capacity);
        let (window_tx, _window_rx) = channels::bounded::<Tick>(config.window_channel_capacity);
        AppState {
            window_engine: Arc::new(RollingWindowEngine::new(
                WindowEngineConfig::from(config.as_ref()),
                Arc::new(xarb_engine::metrics::WindowEngineMetrics::default()),
            )),
            realtime_hub: Arc::new(ClientHub::new()),
            signals_hub: Arc::new(ClientHub::new()),
            adapter_health: Arc::new(DashMap::new()),
            raw_tx,
            window_tx,
            shutdown: Shutdown::new(),
            config,
        }
    }

    #[tokio::test]
    async fn health_reports_healthy_with_no_adapters_and_ping_always_responds() {
        let router = build_router(test_state());

        let health = router
            .clone()
            .oneshot(axum::http::Request::get("/health").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(health.status(), StatusCode::OK);

        let ping = router
            .oneshot(axum::http::Request::get("/ping").body(axum::body::Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(ping.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn dashboard_data_rejects_missing_params_with_400() {
        let router = build_router(test_state());
        let resp = router
            .oneshot(
                axum::http::Request::get("/api/dashboard_data?symbol=&exchange1=a&exchange2=b")
                    .body(axum::body::Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn dashboard_data_returns_empty_ndjson_for_unknown_triple() {
        let router = build_router(test_state());
        let resp = router
            .oneshot(
                axum::http::Request::get(
                    "/api/dashboard_data?symbol=BTCUSDT&exchange1=a&exchange2=b",
                )
                .body(axum::body::Body::empty())
                .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert!(body.is_empty());
    }

    /// S6 — dead WebSocket isolation (spec.md §8). Three `/ws/realtime`
    /// clients connect; one never reads its socket. A burst of broadcasts
    /// must still reach the two healthy clients in full, and the stuck
    /// client must eventually be evicted rather than wedging the broadcaster.
    #[tokio::test]
    async fn dead_realtime_socket_is_isolated_and_evicted() {
        let state = test_state();
        let hub = state.realtime_hub.clone();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let router = build_router(state);
        tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });

        let url = format!("ws://{addr}/ws/realtime");
        let (mut healthy_a, _) = connect_async(&url).await.expect("client A connects");
        let (mut healthy_b, _) = connect_async(&url).await.expect("client B connects");
        let (_stuck, _) = connect_async(&url).await.expect("stuck client connects");
        // Never polled again: its read buffer fills and, once our own kernel
        // send buffer fills too, writes to it start blocking past
        // `ws_per_send_timeout`. Held alive (not dropped) for the rest of the
        // test so this really exercises a backed-up peer, not a closed one.

        tokio::time::sleep(Duration::from_millis(20)).await;

        const N: usize = 50;
        let filler = "x".repeat(4096);
        for i in 0..N {
            hub.broadcast(&format!("{{\"seq\":{i},\"pad\":\"{filler}\"}}"));
        }

        let mut received_a = 0;
        let mut received_b = 0;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while (received_a < N || received_b < N) && tokio::time::Instant::now() < deadline {
            tokio::select! {
                msg = healthy_a.next() => if matches!(msg, Some(Ok(_))) { received_a += 1; },
                msg = healthy_b.next() => if matches!(msg, Some(Ok(_))) { received_b += 1; },
                _ = tokio::time::sleep(Duration::from_millis(10)) => {}
            }
        }
        assert_eq!(received_a, N, "healthy client A must receive every broadcast");
        assert_eq!(received_b, N, "healthy client B must receive every broadcast");

        healthy_a.close(None).await.ok();
        healthy_b.close(None).await.ok();
    }
}
