//! Tradeloop - multi-strategy trading engine.
//!
//! This crate orchestrates multiple concurrent, independently configured
//! trading strategies against a market-data feed, routing their order intents
//! through shared position and risk state, and broadcasting every state
//! transition as an ordered event.
//!
//! # Architecture
//!
//! - [`bus`] - ordered, at-least-once publish/subscribe with bounded history
//! - [`domain`] - exchange-agnostic value types and the position ledger
//! - [`risk`] - account-level risk engine: threshold checks, protective
//!   stop-loss/take-profit orders, daily-loss circuit breaker
//! - [`strategy`] - the strategy lifecycle base and the concrete strategies
//!   (inventory-skewed market making, Avellaneda-Stoikov quoting,
//!   cross-market arbitrage, hedging)
//! - [`orchestrator`] - instance registry, lifecycle, and market-data fan-out
//! - [`exchange`] - the connector trait the engine consumes, plus a paper
//!   implementation for tests and the demo binary
//! - [`snapshot`] - periodic JSON state snapshotting
//!
//! Position and risk state are shared mutably across all strategy instances:
//! risk is managed at the account level, not per strategy. Every mutation of
//! that shared state is a single atomic map update, so no strategy can
//! observe a half-applied transition.
//!
//! # Example
//!
//! ```no_run
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use tradeloop::bus::EventBus;
//! use tradeloop::domain::position::PositionLedger;
//! use tradeloop::exchange::PaperConnector;
//! use tradeloop::orchestrator::Orchestrator;
//! use tradeloop::risk::{RiskConfig, RiskEngine};
//!
//! # async fn run() -> tradeloop::Result<()> {
//! let bus = Arc::new(EventBus::new());
//! let ledger = Arc::new(PositionLedger::new());
//! let risk = Arc::new(RiskEngine::new(RiskConfig::default()));
//! let (connector, _fills) = PaperConnector::new(HashMap::new());
//! let orchestrator = Orchestrator::new(bus, ledger, risk, Arc::new(connector));
//!
//! let mut config = serde_json::Map::new();
//! config.insert("symbol".to_string(), serde_json::json!("BTC-USDT"));
//! let id = orchestrator.create_instance("market_maker", config)?;
//! orchestrator.start_instance(&id);
//! # Ok(())
//! # }
//! ```

pub mod app;
pub mod bus;
pub mod config;
pub mod domain;
pub mod error;
pub mod exchange;
pub mod orchestrator;
pub mod risk;
pub mod snapshot;
pub mod strategy;

pub use error::{Error, Result};
