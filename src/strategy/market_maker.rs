//! Inventory-skewed market making.
//!
//! On each tick: record the mid price, and on a refresh cooldown cancel
//! outstanding quotes and re-quote both sides around the mid. The spread
//! per side is the configured base spread plus a volatility term, plus an
//! inventory-deviation term applied only on the side that discourages
//! drifting further from the target base-asset percentage. All spreads are
//! fractions of the mid (0.001 = 0.1%).

use std::time::Instant;

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::domain::{OrderType, Side, Ticker};
use crate::error::{Error, ValidationError};

use super::{Strategy, StrategyCore, VolatilityEstimator};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MarketMakerConfig {
    /// Size of each quote.
    pub order_amount: Decimal,
    /// Base bid spread as a fraction of mid.
    pub bid_spread: Decimal,
    /// Base ask spread as a fraction of mid.
    pub ask_spread: Decimal,
    /// Per-side spread ceiling.
    pub max_spread: Decimal,
    /// Weight of the volatility estimate in the spread.
    pub volatility_multiplier: Decimal,
    /// Desired base-asset share of portfolio value, in [0, 1].
    pub target_base_pct: Decimal,
    /// Divisor turning inventory deviation into added spread.
    pub inventory_range_multiplier: Decimal,
    /// Seconds between quote refreshes.
    pub order_refresh_secs: u64,
}

impl Default for MarketMakerConfig {
    fn default() -> Self {
        Self {
            order_amount: dec!(0.001),
            bid_spread: dec!(0.001),
            ask_spread: dec!(0.001),
            max_spread: dec!(0.01),
            volatility_multiplier: dec!(0.5),
            target_base_pct: dec!(0.5),
            inventory_range_multiplier: dec!(100),
            order_refresh_secs: 5,
        }
    }
}

struct MakerState {
    volatility: VolatilityEstimator,
    last_quote_at: Option<Instant>,
    last_mid: Option<Decimal>,
}

pub struct MarketMakerStrategy {
    core: StrategyCore,
    config: MarketMakerConfig,
    state: Mutex<MakerState>,
}

impl MarketMakerStrategy {
    pub fn new(core: StrategyCore) -> Result<Self, ValidationError> {
        let config: MarketMakerConfig = core.typed_config()?;
        if config.order_amount <= Decimal::ZERO {
            return Err(ValidationError::InvalidConfig {
                reason: "order_amount must be positive".to_string(),
            });
        }
        Ok(Self {
            core,
            config,
            state: Mutex::new(MakerState {
                volatility: VolatilityEstimator::default(),
                last_quote_at: None,
                last_mid: None,
            }),
        })
    }

    /// Inventory deviation from target, as a fraction of mid to add to
    /// one side's spread. Positive values discourage buying, negative
    /// values discourage selling.
    async fn inventory_deviation(&self, mid: Decimal) -> Option<Decimal> {
        let balances = self.core.connector().get_balance().await.ok()?;
        let base = self.core.symbol().base_asset()?;
        let quote = self.core.symbol().quote_asset()?;
        let base_value = balances.get(base).map_or(Decimal::ZERO, |b| b.total) * mid;
        let quote_value = balances.get(quote).map_or(Decimal::ZERO, |b| b.total);
        let total = base_value + quote_value;
        if total <= Decimal::ZERO {
            return None;
        }
        let base_pct = base_value / total;
        Some((base_pct - self.config.target_base_pct) / self.config.inventory_range_multiplier)
    }
}

#[async_trait]
impl Strategy for MarketMakerStrategy {
    fn name(&self) -> &'static str {
        "market_maker"
    }

    fn core(&self) -> &StrategyCore {
        &self.core
    }

    async fn on_tick(&self, ticker: &Ticker) -> Result<(), Error> {
        if &ticker.symbol != self.core.symbol() {
            return Ok(());
        }
        let Some(mid) = ticker.mid_price() else {
            return Ok(());
        };

        let (due, volatility) = {
            let mut state = self.state.lock();
            state.last_mid = Some(mid);
            if let Some(mid_f) = mid.to_f64() {
                state.volatility.record(mid_f);
            }
            let due = state
                .last_quote_at
                .map_or(true, |t| t.elapsed().as_secs() >= self.config.order_refresh_secs);
            (due, state.volatility.estimate())
        };
        if !due {
            return Ok(());
        }

        let Some(deviation) = self.inventory_deviation(mid).await else {
            debug!(instance = %self.core.instance_id(), "No portfolio value, skipping quote");
            return Ok(());
        };
        let vol_term =
            Decimal::from_f64_retain(volatility).unwrap_or(Decimal::ZERO) * self.config.volatility_multiplier;

        // Excess base inventory widens the bid; excess quote widens the ask.
        let bid_skew = deviation.max(Decimal::ZERO);
        let ask_skew = (-deviation).max(Decimal::ZERO);
        let bid_spread = (self.config.bid_spread + vol_term + bid_skew)
            .clamp(Decimal::ZERO, self.config.max_spread);
        let ask_spread = (self.config.ask_spread + vol_term + ask_skew)
            .clamp(Decimal::ZERO, self.config.max_spread);

        let bid = mid * (Decimal::ONE - bid_spread);
        let ask = mid * (Decimal::ONE + ask_spread);
        if bid <= Decimal::ZERO || bid >= ask {
            return Ok(());
        }

        self.core.cancel_all_tracked().await;
        let amount = self.config.order_amount;
        self.core
            .submit_order(Side::Buy, amount, Some(bid), OrderType::Limit)
            .await;
        self.core
            .submit_order(Side::Sell, amount, Some(ask), OrderType::Limit)
            .await;
        self.state.lock().last_quote_at = Some(Instant::now());
        debug!(
            instance = %self.core.instance_id(),
            bid = %bid,
            ask = %ask,
            "Quotes refreshed"
        );
        Ok(())
    }

    async fn poll(&self) -> Result<(), Error> {
        let last_mid = self.state.lock().last_mid;
        if let Some(price) = last_mid {
            self.core.enforce_protective_orders(price).await;
        }
        Ok(())
    }

    fn status(&self) -> Value {
        let state = self.state.lock();
        let mut status = self.core.status_base();
        status["strategy"] = json!(self.name());
        status["volatility"] = json!(state.volatility.estimate());
        status["last_mid"] = json!(state.last_mid);
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::domain::position::PositionLedger;
    use crate::domain::Symbol;
    use crate::exchange::PaperConnector;
    use crate::risk::{RiskConfig, RiskEngine};
    use chrono::Utc;
    use serde_json::Map;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn ticker(last: Decimal, bid: Decimal, ask: Decimal) -> Ticker {
        Ticker {
            symbol: Symbol::from("BTC-USDT"),
            last,
            bid,
            ask,
            high: ask,
            low: bid,
            volume: dec!(10),
            timestamp: Utc::now(),
        }
    }

    fn maker(
        config: Map<String, Value>,
        balances: HashMap<String, Decimal>,
    ) -> (MarketMakerStrategy, Arc<PaperConnector>) {
        let (connector, _fills) = PaperConnector::new(balances);
        let connector = Arc::new(connector);
        let core = StrategyCore::new(
            "mm-test".to_string(),
            Symbol::from("BTC-USDT"),
            Arc::new(EventBus::new()),
            Arc::new(PositionLedger::new()),
            Arc::new(RiskEngine::new(RiskConfig::default())),
            connector.clone(),
            config,
        );
        (MarketMakerStrategy::new(core).unwrap(), connector)
    }

    fn balanced_book() -> HashMap<String, Decimal> {
        // Base value at mid 50000 equals quote value, so inventory is on
        // target and no skew applies.
        let mut balances = HashMap::new();
        balances.insert("BTC".to_string(), dec!(1));
        balances.insert("USDT".to_string(), dec!(50000));
        balances
    }

    fn no_vol_config() -> Map<String, Value> {
        let mut config = Map::new();
        config.insert("volatility_multiplier".to_string(), json!("0"));
        config
    }

    #[tokio::test]
    async fn quotes_symmetrically_around_mid_when_on_target() {
        let (strategy, connector) = maker(no_vol_config(), balanced_book());
        connector.set_ticker(ticker(dec!(50000), dec!(49995), dec!(50005)));

        strategy
            .on_tick(&ticker(dec!(50000), dec!(49995), dec!(50005)))
            .await
            .unwrap();

        let orders = strategy.core().active_orders();
        assert_eq!(orders.len(), 2);
        let bid = orders.iter().find(|o| o.side == Side::Buy).unwrap();
        let ask = orders.iter().find(|o| o.side == Side::Sell).unwrap();
        assert_eq!(bid.price, dec!(49950));
        assert_eq!(ask.price, dec!(50050));
    }

    #[tokio::test]
    async fn excess_base_inventory_widens_the_bid() {
        let mut balances = HashMap::new();
        balances.insert("BTC".to_string(), dec!(2));
        balances.insert("USDT".to_string(), dec!(10000));
        let mut config = no_vol_config();
        config.insert("inventory_range_multiplier".to_string(), json!("10"));
        let (strategy, connector) = maker(config, balances);
        connector.set_ticker(ticker(dec!(50000), dec!(49995), dec!(50005)));

        strategy
            .on_tick(&ticker(dec!(50000), dec!(49995), dec!(50005)))
            .await
            .unwrap();

        let orders = strategy.core().active_orders();
        let bid = orders.iter().find(|o| o.side == Side::Buy).unwrap();
        let ask = orders.iter().find(|o| o.side == Side::Sell).unwrap();
        // Ask stays at base spread, bid is pushed further from mid.
        assert_eq!(ask.price, dec!(50050));
        assert!(bid.price < dec!(49950));
    }

    #[tokio::test]
    async fn refresh_cooldown_suppresses_requoting() {
        let (strategy, connector) = maker(no_vol_config(), balanced_book());
        connector.set_ticker(ticker(dec!(50000), dec!(49995), dec!(50005)));

        let tick = ticker(dec!(50000), dec!(49995), dec!(50005));
        strategy.on_tick(&tick).await.unwrap();
        let first: Vec<_> = strategy
            .core()
            .active_orders()
            .iter()
            .map(|o| o.order_id.clone())
            .collect();

        strategy.on_tick(&tick).await.unwrap();
        let second: Vec<_> = strategy
            .core()
            .active_orders()
            .iter()
            .map(|o| o.order_id.clone())
            .collect();

        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn unusable_mid_short_circuits() {
        let (strategy, _connector) = maker(no_vol_config(), balanced_book());
        strategy
            .on_tick(&ticker(Decimal::ZERO, Decimal::ZERO, Decimal::ZERO))
            .await
            .unwrap();
        assert_eq!(strategy.core().active_order_count(), 0);
    }

    #[tokio::test]
    async fn empty_portfolio_short_circuits() {
        let (strategy, connector) = maker(no_vol_config(), HashMap::new());
        connector.set_ticker(ticker(dec!(50000), dec!(49995), dec!(50005)));

        strategy
            .on_tick(&ticker(dec!(50000), dec!(49995), dec!(50005)))
            .await
            .unwrap();

        assert_eq!(strategy.core().active_order_count(), 0);
    }

    #[tokio::test]
    async fn foreign_symbol_is_ignored() {
        let (strategy, _connector) = maker(no_vol_config(), balanced_book());
        let mut tick = ticker(dec!(3000), dec!(2999), dec!(3001));
        tick.symbol = Symbol::from("ETH-USDT");

        strategy.on_tick(&tick).await.unwrap();
        assert_eq!(strategy.core().active_order_count(), 0);
    }

    #[tokio::test]
    async fn rejects_non_positive_order_amount() {
        let mut config = Map::new();
        config.insert("order_amount".to_string(), json!("0"));
        let (connector, _fills) = PaperConnector::new(HashMap::new());
        let core = StrategyCore::new(
            "mm-bad".to_string(),
            Symbol::from("BTC-USDT"),
            Arc::new(EventBus::new()),
            Arc::new(PositionLedger::new()),
            Arc::new(RiskEngine::new(RiskConfig::default())),
            Arc::new(connector),
            config,
        );
        assert!(MarketMakerStrategy::new(core).is_err());
    }
}
