//! Ratio-targeted hedging.
//!
//! The instance's own symbol is the derivative market it hedges on. Each
//! poll it compares the target hedge size (spot position recorded in the
//! shared ledger times the hedge ratio) against the current short on the
//! derivative market, and rebalances with a single market order sized to
//! the delta whenever the relative deviation exceeds the threshold.
//! Independently of rebalancing, it closes the hedge outright when the
//! price moves beyond the configured stop-loss or take-profit offset from
//! the hedge's entry price.

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::domain::{OrderType, PositionSide, Side, Symbol, Ticker};
use crate::error::{Error, ValidationError};

use super::{Strategy, StrategyCore};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HedgeConfig {
    /// The spot market whose ledger position is being hedged.
    pub spot_symbol: Option<Symbol>,
    /// Hedge size per unit of spot position.
    pub hedge_ratio: Decimal,
    /// Relative deviation from target that triggers a rebalance.
    pub rebalance_threshold: Decimal,
    /// Entry-relative adverse move that closes the hedge.
    pub stop_loss_pct: Decimal,
    /// Entry-relative favorable move that closes the hedge.
    pub take_profit_pct: Decimal,
    pub enable_stop_loss: bool,
    pub enable_take_profit: bool,
}

impl Default for HedgeConfig {
    fn default() -> Self {
        Self {
            spot_symbol: None,
            hedge_ratio: Decimal::ONE,
            rebalance_threshold: dec!(0.01),
            stop_loss_pct: dec!(0.02),
            take_profit_pct: dec!(0.03),
            enable_stop_loss: true,
            enable_take_profit: true,
        }
    }
}

pub struct HedgeStrategy {
    core: StrategyCore,
    config: HedgeConfig,
    spot_symbol: Symbol,
    last_price: Mutex<Option<Decimal>>,
}

impl HedgeStrategy {
    pub fn new(core: StrategyCore) -> Result<Self, ValidationError> {
        let config: HedgeConfig = core.typed_config()?;
        let Some(spot_symbol) = config.spot_symbol.clone() else {
            return Err(ValidationError::InvalidConfig {
                reason: "spot_symbol is required".to_string(),
            });
        };
        if &spot_symbol == core.symbol() {
            return Err(ValidationError::InvalidConfig {
                reason: "spot_symbol must differ from the hedge market".to_string(),
            });
        }
        if config.hedge_ratio <= Decimal::ZERO {
            return Err(ValidationError::InvalidConfig {
                reason: "hedge_ratio must be positive".to_string(),
            });
        }
        Ok(Self {
            core,
            config,
            spot_symbol,
            last_price: Mutex::new(None),
        })
    }

    /// Target hedge size: spot long size times the hedge ratio.
    fn target_size(&self) -> Decimal {
        self.core
            .ledger()
            .get(&self.spot_symbol, PositionSide::Long)
            .map_or(Decimal::ZERO, |p| p.size)
            * self.config.hedge_ratio
    }

    fn current_short(&self) -> Decimal {
        self.core
            .ledger()
            .get(self.core.symbol(), PositionSide::Short)
            .map_or(Decimal::ZERO, |p| p.size)
    }

    /// Close the whole hedge with one market buy. Returns true when an
    /// order went out.
    async fn flatten(&self, size: Decimal, reason: &str) -> bool {
        info!(
            instance = %self.core.instance_id(),
            size = %size,
            reason,
            "Flattening hedge"
        );
        self.core
            .submit_order(Side::Buy, size, None, OrderType::Market)
            .await
            .is_some()
    }
}

#[async_trait]
impl Strategy for HedgeStrategy {
    fn name(&self) -> &'static str {
        "hedge"
    }

    fn core(&self) -> &StrategyCore {
        &self.core
    }

    async fn on_tick(&self, ticker: &Ticker) -> Result<(), Error> {
        if &ticker.symbol == self.core.symbol() {
            *self.last_price.lock() = ticker.mid_price();
        }
        Ok(())
    }

    async fn poll(&self) -> Result<(), Error> {
        let Ok(ticker) = self.core.connector().get_ticker(self.core.symbol()).await else {
            return Ok(());
        };
        let Some(price) = ticker.mid_price() else {
            return Ok(());
        };
        *self.last_price.lock() = Some(price);

        let current = self.current_short();

        // Entry-relative protection comes before rebalancing: a stopped-out
        // hedge is not immediately re-opened in the same poll.
        if current > Decimal::ZERO {
            if let Some(position) = self.core.ledger().get(self.core.symbol(), PositionSide::Short)
            {
                let entry = position.entry_price;
                if self.config.enable_stop_loss
                    && price >= entry * (Decimal::ONE + self.config.stop_loss_pct)
                {
                    self.flatten(current, "stop_loss").await;
                    return Ok(());
                }
                if self.config.enable_take_profit
                    && price <= entry * (Decimal::ONE - self.config.take_profit_pct)
                {
                    self.flatten(current, "take_profit").await;
                    return Ok(());
                }
            }
        }

        let target = self.target_size();
        if target <= Decimal::ZERO {
            if current > Decimal::ZERO {
                self.flatten(current, "no_spot_position").await;
            }
            return Ok(());
        }

        let delta = target - current;
        let deviation = delta.abs() / target;
        if deviation <= self.config.rebalance_threshold {
            return Ok(());
        }

        debug!(
            instance = %self.core.instance_id(),
            target = %target,
            current = %current,
            delta = %delta,
            "Rebalancing hedge"
        );
        if delta > Decimal::ZERO {
            self.core
                .submit_order(Side::Sell, delta, None, OrderType::Market)
                .await;
        } else {
            self.core
                .submit_order(Side::Buy, -delta, None, OrderType::Market)
                .await;
        }
        Ok(())
    }

    fn status(&self) -> Value {
        let mut status = self.core.status_base();
        status["strategy"] = json!(self.name());
        status["spot_symbol"] = json!(self.spot_symbol);
        status["target_size"] = json!(self.target_size());
        status["current_short"] = json!(self.current_short());
        status["last_price"] = json!(*self.last_price.lock());
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::domain::position::PositionLedger;
    use crate::domain::Fill;
    use crate::exchange::PaperConnector;
    use crate::risk::{RiskConfig, RiskEngine};
    use chrono::Utc;
    use serde_json::Map;
    use std::sync::Arc;
    use tokio::sync::mpsc::UnboundedReceiver;

    const PERP: &str = "BTC-PERP";
    const SPOT: &str = "BTC-USDT";

    fn tick(bid: Decimal, ask: Decimal) -> Ticker {
        Ticker {
            symbol: Symbol::from(PERP),
            last: (bid + ask) / Decimal::TWO,
            bid,
            ask,
            high: ask,
            low: bid,
            volume: dec!(10),
            timestamp: Utc::now(),
        }
    }

    fn hedge() -> (HedgeStrategy, Arc<PaperConnector>, UnboundedReceiver<Fill>) {
        let mut config = Map::new();
        config.insert("spot_symbol".to_string(), json!(SPOT));
        let mut balances = std::collections::HashMap::new();
        balances.insert("USDT".to_string(), dec!(1000000));
        let (connector, fills) = PaperConnector::new(balances);
        let connector = Arc::new(connector);
        let core = StrategyCore::new(
            "hedge-test".to_string(),
            Symbol::from(PERP),
            Arc::new(EventBus::new()),
            Arc::new(PositionLedger::new()),
            Arc::new(RiskEngine::new(RiskConfig::default())),
            connector.clone(),
            config,
        );
        (HedgeStrategy::new(core).unwrap(), connector, fills)
    }

    fn route_fills(strategy: &HedgeStrategy, fills: &mut UnboundedReceiver<Fill>) {
        while let Ok(fill) = fills.try_recv() {
            strategy.core().on_fill(&fill);
        }
    }

    fn seed_spot_long(strategy: &HedgeStrategy, size: Decimal) {
        strategy.core().ledger().open_or_accumulate(
            &Symbol::from(SPOT),
            PositionSide::Long,
            size,
            dec!(50000),
        );
    }

    #[tokio::test]
    async fn rebalances_to_target_short() {
        let (strategy, connector, mut fills) = hedge();
        seed_spot_long(&strategy, dec!(0.008));
        connector.set_ticker(tick(dec!(49995), dec!(50005)));

        strategy.poll().await.unwrap();
        route_fills(&strategy, &mut fills);

        let short = strategy
            .core()
            .ledger()
            .get(&Symbol::from(PERP), PositionSide::Short)
            .unwrap();
        assert_eq!(short.size, dec!(0.008));
    }

    #[tokio::test]
    async fn within_threshold_does_nothing() {
        let (strategy, connector, mut fills) = hedge();
        seed_spot_long(&strategy, dec!(0.008));
        connector.set_ticker(tick(dec!(49995), dec!(50005)));

        strategy.poll().await.unwrap();
        route_fills(&strategy, &mut fills);
        let entry_short = strategy.current_short();

        strategy.poll().await.unwrap();
        route_fills(&strategy, &mut fills);

        assert_eq!(strategy.current_short(), entry_short);
    }

    #[tokio::test]
    async fn spot_growth_adds_to_hedge() {
        let (strategy, connector, mut fills) = hedge();
        seed_spot_long(&strategy, dec!(0.008));
        connector.set_ticker(tick(dec!(49995), dec!(50005)));
        strategy.poll().await.unwrap();
        route_fills(&strategy, &mut fills);

        seed_spot_long(&strategy, dec!(0.002));
        strategy.poll().await.unwrap();
        route_fills(&strategy, &mut fills);

        assert_eq!(strategy.current_short(), dec!(0.01));
    }

    #[tokio::test]
    async fn stop_loss_flattens_hedge_on_adverse_move() {
        let (strategy, connector, mut fills) = hedge();
        seed_spot_long(&strategy, dec!(0.008));
        connector.set_ticker(tick(dec!(49995), dec!(50005)));
        strategy.poll().await.unwrap();
        route_fills(&strategy, &mut fills);
        assert_eq!(strategy.current_short(), dec!(0.008));

        // Short entry near 49995; +3% is past the 2% stop.
        connector.set_ticker(tick(dec!(51495), dec!(51505)));
        strategy.poll().await.unwrap();
        route_fills(&strategy, &mut fills);

        assert_eq!(strategy.current_short(), Decimal::ZERO);
        // The close was a loss, forwarded to the daily accumulator.
        assert!(strategy.core().risk().daily_pnl() < Decimal::ZERO);
    }

    #[tokio::test]
    async fn take_profit_flattens_hedge_on_favorable_move() {
        let (strategy, connector, mut fills) = hedge();
        seed_spot_long(&strategy, dec!(0.008));
        connector.set_ticker(tick(dec!(49995), dec!(50005)));
        strategy.poll().await.unwrap();
        route_fills(&strategy, &mut fills);

        // -4% is past the 3% take-profit.
        connector.set_ticker(tick(dec!(47995), dec!(48005)));
        strategy.poll().await.unwrap();
        route_fills(&strategy, &mut fills);

        assert_eq!(strategy.current_short(), Decimal::ZERO);
        assert!(strategy.core().risk().daily_pnl() > Decimal::ZERO);
    }

    #[tokio::test]
    async fn no_spot_position_flattens_existing_hedge() {
        let (strategy, connector, mut fills) = hedge();
        seed_spot_long(&strategy, dec!(0.008));
        connector.set_ticker(tick(dec!(49995), dec!(50005)));
        strategy.poll().await.unwrap();
        route_fills(&strategy, &mut fills);

        strategy
            .core()
            .ledger()
            .close(&Symbol::from(SPOT), PositionSide::Long, dec!(50000));
        strategy.poll().await.unwrap();
        route_fills(&strategy, &mut fills);

        assert_eq!(strategy.current_short(), Decimal::ZERO);
    }

    #[tokio::test]
    async fn flat_book_does_nothing() {
        let (strategy, connector, _fills) = hedge();
        connector.set_ticker(tick(dec!(49995), dec!(50005)));

        strategy.poll().await.unwrap();
        assert_eq!(strategy.core().active_order_count(), 0);
    }

    #[tokio::test]
    async fn missing_spot_symbol_is_rejected() {
        let (connector, _fills) = PaperConnector::new(std::collections::HashMap::new());
        let core = StrategyCore::new(
            "hedge-bad".to_string(),
            Symbol::from(PERP),
            Arc::new(EventBus::new()),
            Arc::new(PositionLedger::new()),
            Arc::new(RiskEngine::new(RiskConfig::default())),
            Arc::new(connector),
            Map::new(),
        );
        assert!(HedgeStrategy::new(core).is_err());
    }
}
