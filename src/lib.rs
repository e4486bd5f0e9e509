//! Cross-exchange spread aggregator & arbitrage signal engine.
//!
//! Exposes the core, `AppState`-independent pieces (channels, window engine,
//! signal detector, reference adapter) for use by the `xarb` binary and by
//! integration tests. Axum routing and WebSocket fan-out live in the binary
//! crate since they depend on the composition root's `AppState`.

pub mod adapter;
pub mod channels;
pub mod config;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod shutdown;
pub mod signals;
pub mod window;
