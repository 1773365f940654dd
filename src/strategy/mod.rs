//! Strategy lifecycle base and the concrete strategy implementations.
//!
//! Every strategy owns a [`StrategyCore`] holding the shared engine
//! handles (bus, ledger, risk, connector) plus its own config map, running
//! flag, and active-order set. The lifecycle is Idle -> Running -> Idle:
//! [`start`] marks the instance running and spawns its main loop as an
//! independent task, [`stop`] clears the flag and cancels tracked orders
//! best-effort. There is no paused state; the main loop only checks the
//! running flag.

pub mod arbitrage;
pub mod avellaneda;
pub mod hedge;
pub mod market_maker;
pub mod volatility;

pub use arbitrage::ArbitrageStrategy;
pub use avellaneda::AvellanedaStrategy;
pub use hedge::HedgeStrategy;
pub use market_maker::MarketMakerStrategy;
pub use volatility::VolatilityEstimator;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use tokio::time::{sleep, Duration};
use tracing::{info, warn};

use crate::bus::EventBus;
use crate::domain::position::PositionLedger;
use crate::domain::{ActiveOrder, Fill, OrderBook, OrderId, OrderType, PositionSide, Symbol, Ticker};
use crate::error::{Error, ValidationError};
use crate::exchange::ExchangeConnector;
use crate::risk::{RiskCheckResult, RiskEngine};

/// How often each strategy's main loop wakes to run [`Strategy::poll`].
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Shared per-instance state owned by every strategy.
pub struct StrategyCore {
    instance_id: String,
    symbol: Symbol,
    bus: Arc<EventBus>,
    ledger: Arc<PositionLedger>,
    risk: Arc<RiskEngine>,
    connector: Arc<dyn ExchangeConnector>,
    config: RwLock<Map<String, Value>>,
    running: AtomicBool,
    active_orders: DashMap<OrderId, ActiveOrder>,
}

impl StrategyCore {
    pub fn new(
        instance_id: String,
        symbol: Symbol,
        bus: Arc<EventBus>,
        ledger: Arc<PositionLedger>,
        risk: Arc<RiskEngine>,
        connector: Arc<dyn ExchangeConnector>,
        config: Map<String, Value>,
    ) -> Self {
        Self {
            instance_id,
            symbol,
            bus,
            ledger,
            risk,
            connector,
            config: RwLock::new(config),
            running: AtomicBool::new(false),
            active_orders: DashMap::new(),
        }
    }

    #[must_use]
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    #[must_use]
    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    #[must_use]
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    #[must_use]
    pub fn ledger(&self) -> &Arc<PositionLedger> {
        &self.ledger
    }

    #[must_use]
    pub fn risk(&self) -> &Arc<RiskEngine> {
        &self.risk
    }

    #[must_use]
    pub fn connector(&self) -> &Arc<dyn ExchangeConnector> {
        &self.connector
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Number of orders currently tracked.
    #[must_use]
    pub fn active_order_count(&self) -> usize {
        self.active_orders.len()
    }

    /// Snapshot of tracked orders.
    #[must_use]
    pub fn active_orders(&self) -> Vec<ActiveOrder> {
        self.active_orders
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Deserialize the whole config map into a typed config struct.
    pub fn typed_config<T: DeserializeOwned>(&self) -> Result<T, ValidationError> {
        serde_json::from_value(Value::Object(self.config.read().clone())).map_err(|e| {
            ValidationError::InvalidConfig {
                reason: e.to_string(),
            }
        })
    }

    /// A boolean config flag, defaulting to false. Read at use time so a
    /// config patch is observed on the next fill or tick.
    #[must_use]
    pub fn config_flag(&self, key: &str) -> bool {
        self.config
            .read()
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Copy of the current config map.
    #[must_use]
    pub fn config(&self) -> Map<String, Value> {
        self.config.read().clone()
    }

    /// Shallow-merge a patch into the config map. Strategies that parsed
    /// a typed config at construction keep their cached values.
    pub fn merge_config(&self, patch: &Map<String, Value>) {
        let mut config = self.config.write();
        for (key, value) in patch {
            config.insert(key.clone(), value.clone());
        }
    }

    /// Submit an order on this instance's own symbol.
    pub async fn submit_order(
        &self,
        side: crate::domain::Side,
        size: Decimal,
        price: Option<Decimal>,
        order_type: OrderType,
    ) -> Option<OrderId> {
        let symbol = self.symbol.clone();
        self.submit_order_for(&symbol, side, size, price, order_type)
            .await
    }

    /// Submit an order on an arbitrary symbol (cross-market strategies).
    ///
    /// Consults the risk engine first: order size, then position limit
    /// against the ledger's current size for the resulting key. A denial
    /// returns `None` without contacting the exchange; a connector failure
    /// is logged and also returns `None`. Never retries.
    pub async fn submit_order_for(
        &self,
        symbol: &Symbol,
        side: crate::domain::Side,
        size: Decimal,
        price: Option<Decimal>,
        order_type: OrderType,
    ) -> Option<OrderId> {
        if let RiskCheckResult::Rejected(denial) = self.risk.check_order_size(size) {
            self.bus.publish_log("warning", &denial.to_string());
            return None;
        }
        let (long, short) = self.ledger.position_sizes(symbol);
        let current = match side.position_side() {
            PositionSide::Long => long,
            PositionSide::Short => short,
        };
        if let RiskCheckResult::Rejected(denial) =
            self.risk.check_position_limit(symbol, current, size)
        {
            self.bus.publish_log("warning", &denial.to_string());
            return None;
        }

        match self
            .connector
            .create_order(symbol, side, size, price, order_type)
            .await
        {
            Ok(order_id) => {
                let quote_price = price.unwrap_or(Decimal::ZERO);
                self.active_orders.insert(
                    order_id.clone(),
                    ActiveOrder {
                        order_id: order_id.clone(),
                        symbol: symbol.clone(),
                        side,
                        size,
                        price: quote_price,
                        order_type,
                        created_at: Utc::now(),
                    },
                );
                info!(
                    instance = %self.instance_id,
                    order_id = %order_id,
                    symbol = %symbol,
                    side = %side,
                    size = %size,
                    "Order submitted"
                );
                self.bus
                    .publish_order_update(&order_id, "submitted", symbol, Decimal::ZERO, quote_price);
                Some(order_id)
            }
            Err(e) => {
                warn!(instance = %self.instance_id, symbol = %symbol, error = %e, "Order failed");
                self.bus.publish_error("connector_failure", &e.to_string());
                None
            }
        }
    }

    /// Cancel one tracked order. Untracked ids are a no-op failure; a
    /// connector failure leaves the order tracked.
    pub async fn cancel_order(&self, order_id: &OrderId) -> bool {
        let Some(order) = self.active_orders.get(order_id).map(|e| e.value().clone()) else {
            warn!(instance = %self.instance_id, order_id = %order_id, "Cancel of untracked order");
            return false;
        };
        match self.connector.cancel_order(order_id).await {
            Ok(()) => {
                self.active_orders.remove(order_id);
                self.bus.publish_order_update(
                    order_id,
                    "cancelled",
                    &order.symbol,
                    Decimal::ZERO,
                    order.price,
                );
                true
            }
            Err(e) => {
                warn!(instance = %self.instance_id, order_id = %order_id, error = %e, "Cancel failed");
                false
            }
        }
    }

    /// Cancel every tracked order best-effort and empty the tracking set.
    ///
    /// Failures are logged, not retried; the set is emptied regardless so
    /// a stopped instance never keeps stale tracking state. Returns the
    /// number of cancel attempts.
    pub async fn cancel_all_tracked(&self) -> usize {
        let ids: Vec<OrderId> = self
            .active_orders
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        let mut attempted = 0;
        for order_id in &ids {
            attempted += 1;
            match self.connector.cancel_order(order_id).await {
                Ok(()) => {
                    if let Some((_, order)) = self.active_orders.remove(order_id) {
                        self.bus.publish_order_update(
                            order_id,
                            "cancelled",
                            &order.symbol,
                            Decimal::ZERO,
                            order.price,
                        );
                    }
                }
                Err(e) => {
                    warn!(instance = %self.instance_id, order_id = %order_id, error = %e, "Cancel failed");
                    self.active_orders.remove(order_id);
                }
            }
        }
        attempted
    }

    /// Route a fill reported by the connector.
    ///
    /// Ignores order ids this instance is not tracking and returns false.
    /// A fill whose implied direction opposes an open position closes
    /// that position and forwards realized PnL to the daily accumulator;
    /// otherwise it opens or accumulates, optionally installing stop-loss
    /// and take-profit when the config enables them.
    pub fn on_fill(&self, fill: &Fill) -> bool {
        if self.active_orders.remove(&fill.order_id).is_none() {
            return false;
        }
        let implied = fill.side.position_side();
        let held_opposite = implied.opposite();

        if self.ledger.get(&fill.symbol, held_opposite).is_some() {
            if let Some(closed) = self.ledger.close(&fill.symbol, held_opposite, fill.price) {
                self.risk.update_daily_pnl(closed.realized_pnl);
                self.risk.cancel_stop_loss(&fill.symbol, held_opposite);
                self.risk.cancel_take_profit(&fill.symbol, held_opposite);
                self.bus.publish_position(
                    &fill.symbol,
                    held_opposite,
                    Decimal::ZERO,
                    closed.realized_pnl,
                );
            }
        } else {
            let position =
                self.ledger
                    .open_or_accumulate(&fill.symbol, implied, fill.size, fill.price);
            if self.config_flag("enable_stop_loss") {
                self.risk
                    .set_stop_loss(&fill.symbol, implied, position.entry_price, None);
            }
            if self.config_flag("enable_take_profit") {
                self.risk
                    .set_take_profit(&fill.symbol, implied, position.entry_price, None);
            }
            self.bus.publish_position(
                &fill.symbol,
                implied,
                position.size,
                position.unrealized_pnl,
            );
        }

        self.bus.publish_trade(
            &fill.order_id,
            &fill.symbol,
            fill.price,
            fill.size,
            fill.side.as_str(),
        );
        true
    }

    /// Check installed stop-loss/take-profit orders on this instance's
    /// symbol against `price` and flatten any triggered side with a
    /// market order.
    pub async fn enforce_protective_orders(&self, price: Decimal) {
        let symbol = self.symbol.clone();
        for side in [PositionSide::Long, PositionSide::Short] {
            let triggered = self.risk.check_stop_loss(&symbol, side, price).is_some()
                || self.risk.check_take_profit(&symbol, side, price).is_some();
            if !triggered {
                continue;
            }
            if let Some(position) = self.ledger.get(&symbol, side) {
                self.submit_order_for(
                    &symbol,
                    side.closing_side(),
                    position.size,
                    None,
                    OrderType::Market,
                )
                .await;
            }
        }
    }

    /// Common status fields shared by every strategy's snapshot.
    #[must_use]
    pub fn status_base(&self) -> Value {
        let (long, short) = self.ledger.position_sizes(&self.symbol);
        json!({
            "id": self.instance_id,
            "symbol": self.symbol,
            "running": self.is_running(),
            "active_orders": self.active_orders.len(),
            "long": long,
            "short": short,
        })
    }
}

/// One strategy algorithm bound to a [`StrategyCore`].
#[async_trait]
pub trait Strategy: Send + Sync {
    /// Algorithm name for logs and summaries.
    fn name(&self) -> &'static str;

    /// The lifecycle core this strategy owns.
    fn core(&self) -> &StrategyCore;

    /// React to a market-data tick.
    async fn on_tick(&self, ticker: &Ticker) -> Result<(), Error>;

    /// React to an order-book snapshot. Most strategies only need ticks.
    async fn on_order_book(&self, _book: &OrderBook) -> Result<(), Error> {
        Ok(())
    }

    /// One iteration of the main loop, run every second while Running.
    async fn poll(&self) -> Result<(), Error>;

    /// Status snapshot for summaries.
    fn status(&self) -> Value;
}

/// Mark a strategy Running and spawn its main loop. No-op when already
/// Running.
pub fn start(strategy: Arc<dyn Strategy>) {
    let core = strategy.core();
    if core.running.swap(true, Ordering::SeqCst) {
        return;
    }
    info!(instance = %core.instance_id, strategy = strategy.name(), "Strategy started");
    core.bus
        .publish_strategy(&core.instance_id, "started", None);
    tokio::spawn(run_loop(strategy.clone()));
}

/// Mark a strategy Idle and cancel its tracked orders best-effort. No-op
/// when already Idle.
pub async fn stop(strategy: &Arc<dyn Strategy>) {
    let core = strategy.core();
    if !core.running.swap(false, Ordering::SeqCst) {
        return;
    }
    let cancelled = core.cancel_all_tracked().await;
    info!(instance = %core.instance_id, strategy = strategy.name(), cancelled, "Strategy stopped");
    core.bus.publish_strategy(
        &core.instance_id,
        "stopped",
        Some(json!({ "cancelled_orders": cancelled })),
    );
}

async fn run_loop(strategy: Arc<dyn Strategy>) {
    while strategy.core().is_running() {
        if let Err(e) = strategy.poll().await {
            warn!(
                instance = %strategy.core().instance_id,
                strategy = strategy.name(),
                error = %e,
                "Strategy poll failed"
            );
        }
        sleep(POLL_INTERVAL).await;
    }
}
