//! Account-level risk engine shared by every strategy instance.
//!
//! There is no per-instance isolation of limits: a breach raised by one
//! instance's activity is enforceable against all instances. Checks are
//! pure threshold comparisons at call time; they deny with a reason, never
//! error. Protective stop-loss/take-profit orders are priced once at set
//! time and consumed on the call that reports them triggered.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use crate::domain::{PositionSide, Symbol};
use crate::error::RiskError;

/// Risk configuration with the engine defaults.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Largest single order size.
    pub max_order_size: Decimal,
    /// Largest combined position size per (symbol, side).
    pub max_position_size: Decimal,
    /// Daily realized-loss fraction that trips the circuit breaker.
    pub max_daily_loss: Decimal,
    /// Default stop-loss offset from entry.
    pub stop_loss_pct: Decimal,
    /// Default take-profit offset from entry.
    pub take_profit_pct: Decimal,
    /// Install a stop-loss after every opening fill.
    pub enable_stop_loss: bool,
    /// Install a take-profit after every opening fill.
    pub enable_take_profit: bool,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_order_size: dec!(0.01),
            max_position_size: dec!(0.1),
            max_daily_loss: dec!(0.05),
            stop_loss_pct: dec!(0.02),
            take_profit_pct: dec!(0.03),
            enable_stop_loss: false,
            enable_take_profit: false,
        }
    }
}

/// What to do when a limit is breached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitAction {
    Warn,
    Stop,
}

/// One tracked limit. Breach state is recomputed on each check call, as a
/// pure function of current vs limit value.
#[derive(Debug, Clone, Serialize)]
pub struct RiskLimit {
    pub name: &'static str,
    pub limit_value: Decimal,
    pub current_value: Decimal,
    pub action: LimitAction,
    pub breached: bool,
}

impl RiskLimit {
    fn new(name: &'static str, limit_value: Decimal, action: LimitAction) -> Self {
        Self {
            name,
            limit_value,
            current_value: Decimal::ZERO,
            action,
            breached: false,
        }
    }

    /// Recompute and return the breach flag.
    pub fn check(&mut self) -> bool {
        self.breached = self.current_value.abs() > self.limit_value;
        self.breached
    }
}

/// A protective stop-loss or take-profit order.
///
/// At most one of each kind exists per (symbol, side); setting a new one
/// overwrites the old.
#[derive(Debug, Clone, Serialize)]
pub struct ProtectiveOrder {
    pub symbol: Symbol,
    pub side: PositionSide,
    pub entry_price: Decimal,
    pub trigger_price: Decimal,
    pub percentage: Decimal,
    pub created_at: DateTime<Utc>,
}

/// Outcome of a risk check.
#[derive(Debug, Clone)]
pub enum RiskCheckResult {
    Approved,
    Rejected(RiskError),
}

impl RiskCheckResult {
    /// Returns true when the check passed.
    #[must_use]
    pub fn is_approved(&self) -> bool {
        matches!(self, RiskCheckResult::Approved)
    }

    /// The denial, if the check failed.
    #[must_use]
    pub fn rejection(&self) -> Option<&RiskError> {
        match self {
            RiskCheckResult::Approved => None,
            RiskCheckResult::Rejected(e) => Some(e),
        }
    }
}

const MAX_ORDER_SIZE: &str = "max_order_size";
const MAX_POSITION_SIZE: &str = "max_position_size";
const DAILY_LOSS: &str = "daily_loss";

/// The risk engine.
pub struct RiskEngine {
    config: RiskConfig,
    limits: RwLock<HashMap<&'static str, RiskLimit>>,
    stop_orders: DashMap<(Symbol, PositionSide), ProtectiveOrder>,
    take_profit_orders: DashMap<(Symbol, PositionSide), ProtectiveOrder>,
    daily_pnl: RwLock<Decimal>,
}

impl RiskEngine {
    /// Create an engine with the given limits.
    #[must_use]
    pub fn new(config: RiskConfig) -> Self {
        let mut limits = HashMap::new();
        limits.insert(
            MAX_ORDER_SIZE,
            RiskLimit::new("Max Order Size", config.max_order_size, LimitAction::Warn),
        );
        limits.insert(
            MAX_POSITION_SIZE,
            RiskLimit::new(
                "Max Position Size",
                config.max_position_size,
                LimitAction::Stop,
            ),
        );
        limits.insert(
            DAILY_LOSS,
            RiskLimit::new("Daily Loss Limit", config.max_daily_loss, LimitAction::Stop),
        );
        Self {
            config,
            limits: RwLock::new(limits),
            stop_orders: DashMap::new(),
            take_profit_orders: DashMap::new(),
            daily_pnl: RwLock::new(Decimal::ZERO),
        }
    }

    /// The configuration this engine was built with.
    #[must_use]
    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Deny orders larger than the configured maximum.
    #[must_use]
    pub fn check_order_size(&self, size: Decimal) -> RiskCheckResult {
        let limit = self.config.max_order_size;
        if size > limit {
            warn!(size = %size, limit = %limit, "Order size exceeds limit");
            return RiskCheckResult::Rejected(RiskError::OrderSizeExceeded { size, limit });
        }
        RiskCheckResult::Approved
    }

    /// Deny when the combined position size after `delta` would exceed the
    /// per-key maximum.
    #[must_use]
    pub fn check_position_limit(
        &self,
        symbol: &Symbol,
        current_size: Decimal,
        delta: Decimal,
    ) -> RiskCheckResult {
        let limit = self.config.max_position_size;
        let total = (current_size + delta).abs();
        if total > limit {
            warn!(symbol = %symbol, total = %total, limit = %limit, "Position size exceeds limit");
            return RiskCheckResult::Rejected(RiskError::PositionLimitExceeded {
                symbol: symbol.to_string(),
                total,
                limit,
            });
        }
        RiskCheckResult::Approved
    }

    /// Deny when accumulated daily PnL is negative and its magnitude
    /// exceeds the daily-loss limit. A snapshot comparison, not a standing
    /// lock: the next check after a reset passes again.
    #[must_use]
    pub fn check_daily_loss(&self) -> RiskCheckResult {
        let pnl = *self.daily_pnl.read();
        let limit = self.config.max_daily_loss;
        let breached = {
            let mut limits = self.limits.write();
            limits.get_mut(DAILY_LOSS).is_some_and(|entry| {
                entry.current_value = pnl;
                entry.check()
            })
        };
        if breached && pnl < Decimal::ZERO {
            error!(daily_pnl = %pnl, limit = %limit, "Daily loss exceeds limit");
            return RiskCheckResult::Rejected(RiskError::DailyLossExceeded {
                loss: pnl.abs(),
                limit,
            });
        }
        RiskCheckResult::Approved
    }

    /// Price and install a stop-loss for (symbol, side) from the entry
    /// price. Returns the trigger price.
    pub fn set_stop_loss(
        &self,
        symbol: &Symbol,
        side: PositionSide,
        entry_price: Decimal,
        percentage: Option<Decimal>,
    ) -> Decimal {
        let percentage = percentage.unwrap_or(self.config.stop_loss_pct);
        let trigger_price = match side {
            PositionSide::Long => entry_price * (Decimal::ONE - percentage),
            PositionSide::Short => entry_price * (Decimal::ONE + percentage),
        };
        self.stop_orders.insert(
            (symbol.clone(), side),
            ProtectiveOrder {
                symbol: symbol.clone(),
                side,
                entry_price,
                trigger_price,
                percentage,
                created_at: Utc::now(),
            },
        );
        info!(symbol = %symbol, side = %side, trigger = %trigger_price, "Stop loss set");
        trigger_price
    }

    /// Price and install a take-profit for (symbol, side) from the entry
    /// price. Returns the trigger price.
    pub fn set_take_profit(
        &self,
        symbol: &Symbol,
        side: PositionSide,
        entry_price: Decimal,
        percentage: Option<Decimal>,
    ) -> Decimal {
        let percentage = percentage.unwrap_or(self.config.take_profit_pct);
        let trigger_price = match side {
            PositionSide::Long => entry_price * (Decimal::ONE + percentage),
            PositionSide::Short => entry_price * (Decimal::ONE - percentage),
        };
        self.take_profit_orders.insert(
            (symbol.clone(), side),
            ProtectiveOrder {
                symbol: symbol.clone(),
                side,
                entry_price,
                trigger_price,
                percentage,
                created_at: Utc::now(),
            },
        );
        info!(symbol = %symbol, side = %side, trigger = %trigger_price, "Take profit set");
        trigger_price
    }

    /// Check the stop-loss for (symbol, side) against the current price.
    ///
    /// A triggered stop is consumed: it is removed on the call that reports
    /// it, so it will not re-trigger on the next tick. The caller must act
    /// on the returned order before the position changes again.
    pub fn check_stop_loss(
        &self,
        symbol: &Symbol,
        side: PositionSide,
        current_price: Decimal,
    ) -> Option<ProtectiveOrder> {
        let key = (symbol.clone(), side);
        let triggered = {
            let order = self.stop_orders.get(&key)?;
            match side {
                PositionSide::Long => current_price <= order.trigger_price,
                PositionSide::Short => current_price >= order.trigger_price,
            }
        };
        if !triggered {
            return None;
        }
        let (_, order) = self.stop_orders.remove(&key)?;
        warn!(symbol = %symbol, side = %side, price = %current_price, "Stop loss triggered");
        Some(order)
    }

    /// Check the take-profit for (symbol, side) against the current price.
    /// Consumed on trigger, like [`check_stop_loss`](Self::check_stop_loss).
    pub fn check_take_profit(
        &self,
        symbol: &Symbol,
        side: PositionSide,
        current_price: Decimal,
    ) -> Option<ProtectiveOrder> {
        let key = (symbol.clone(), side);
        let triggered = {
            let order = self.take_profit_orders.get(&key)?;
            match side {
                PositionSide::Long => current_price >= order.trigger_price,
                PositionSide::Short => current_price <= order.trigger_price,
            }
        };
        if !triggered {
            return None;
        }
        let (_, order) = self.take_profit_orders.remove(&key)?;
        info!(symbol = %symbol, side = %side, price = %current_price, "Take profit triggered");
        Some(order)
    }

    /// Remove the stop-loss for (symbol, side) without triggering.
    pub fn cancel_stop_loss(&self, symbol: &Symbol, side: PositionSide) {
        if self.stop_orders.remove(&(symbol.clone(), side)).is_some() {
            info!(symbol = %symbol, side = %side, "Stop loss cancelled");
        }
    }

    /// Remove the take-profit for (symbol, side) without triggering.
    pub fn cancel_take_profit(&self, symbol: &Symbol, side: PositionSide) {
        if self
            .take_profit_orders
            .remove(&(symbol.clone(), side))
            .is_some()
        {
            info!(symbol = %symbol, side = %side, "Take profit cancelled");
        }
    }

    /// Add realized PnL to the daily accumulator.
    pub fn update_daily_pnl(&self, delta: Decimal) {
        let mut pnl = self.daily_pnl.write();
        *pnl += delta;
        info!(daily_pnl = %*pnl, "Daily PnL updated");
    }

    /// Reset the daily accumulator. Invoked by an external scheduler at
    /// the day boundary.
    pub fn reset_daily_pnl(&self) {
        *self.daily_pnl.write() = Decimal::ZERO;
        if let Some(entry) = self.limits.write().get_mut(DAILY_LOSS) {
            entry.current_value = Decimal::ZERO;
            entry.breached = false;
        }
        info!("Daily PnL reset");
    }

    /// Current daily PnL accumulator value.
    #[must_use]
    pub fn daily_pnl(&self) -> Decimal {
        *self.daily_pnl.read()
    }

    /// Serializable view of limits and protective orders for status
    /// snapshots.
    #[must_use]
    pub fn status(&self) -> serde_json::Value {
        let limits: Vec<RiskLimit> = self.limits.read().values().cloned().collect();
        let stops: Vec<ProtectiveOrder> =
            self.stop_orders.iter().map(|e| e.value().clone()).collect();
        let takes: Vec<ProtectiveOrder> = self
            .take_profit_orders
            .iter()
            .map(|e| e.value().clone())
            .collect();
        json!({
            "limits": limits,
            "stop_orders": stops,
            "take_profit_orders": takes,
            "daily_pnl": self.daily_pnl(),
        })
    }
}
