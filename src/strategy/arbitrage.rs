//! Cross-market spread arbitrage.
//!
//! Watches two markets and, when the buffered price gap between them
//! reaches the opening threshold, buys the cheap market and sells the
//! expensive one. While the pair of legs is open it monitors the gap and
//! closes both legs once the gap decays to the (smaller) closing
//! threshold, then sits out a cooldown before the next opening check.
//!
//! A stopped instance does not unwind open legs: the sub-state remains
//! visible in the status snapshot for an operator to reconcile. A close
//! that only offsets one leg still ends the pair, and the leftover leg is
//! reported in the status snapshot as `residual_leg`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::domain::{OrderType, PositionSide, Side, Symbol, Ticker};
use crate::error::{Error, ValidationError};

use super::{Strategy, StrategyCore};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArbitrageConfig {
    /// The second market; the first is the instance's own symbol.
    pub secondary_symbol: Option<Symbol>,
    /// Size of each leg.
    pub order_amount: Decimal,
    /// Minimum buffered gap to open, as a fraction of the buy price.
    pub min_opening_spread: Decimal,
    /// Gap at or below which open legs are closed.
    pub min_closing_spread: Decimal,
    /// Per-market slippage buffer applied to both legs.
    pub slippage_buffer: Decimal,
    /// Seconds to sit out after closing before the next opening check.
    pub cooldown_secs: u64,
}

impl Default for ArbitrageConfig {
    fn default() -> Self {
        Self {
            secondary_symbol: None,
            order_amount: dec!(0.001),
            min_opening_spread: dec!(0.005),
            min_closing_spread: dec!(0.001),
            slippage_buffer: dec!(0.0005),
            cooldown_secs: 60,
        }
    }
}

/// Arbitrage sub-state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArbState {
    Closed,
    Opening,
    Opened,
    Closing,
}

/// Which market each leg trades.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArbDirection {
    pub buy_symbol: Symbol,
    pub sell_symbol: Symbol,
}

/// Buffered spread of buying `buy` at its ask and selling `sell` at its
/// bid, as a fraction of the effective buy price. `None` when either side
/// has no usable price.
#[must_use]
pub fn effective_spread(buy: &Ticker, sell: &Ticker, buffer: Decimal) -> Option<Decimal> {
    if buy.ask <= Decimal::ZERO || sell.bid <= Decimal::ZERO {
        return None;
    }
    let buy_price = buy.ask * (Decimal::ONE + buffer);
    let sell_price = sell.bid * (Decimal::ONE - buffer);
    if buy_price <= Decimal::ZERO {
        return None;
    }
    Some((sell_price - buy_price) / buy_price)
}

/// The more profitable of the two possible directions, with its spread.
#[must_use]
pub fn best_opportunity(
    primary: &Ticker,
    secondary: &Ticker,
    buffer: Decimal,
) -> Option<(ArbDirection, Decimal)> {
    let forward = effective_spread(primary, secondary, buffer).map(|spread| {
        (
            ArbDirection {
                buy_symbol: primary.symbol.clone(),
                sell_symbol: secondary.symbol.clone(),
            },
            spread,
        )
    });
    let reverse = effective_spread(secondary, primary, buffer).map(|spread| {
        (
            ArbDirection {
                buy_symbol: secondary.symbol.clone(),
                sell_symbol: primary.symbol.clone(),
            },
            spread,
        )
    });
    match (forward, reverse) {
        (Some(f), Some(r)) => Some(if f.1 >= r.1 { f } else { r }),
        (Some(f), None) => Some(f),
        (None, Some(r)) => Some(r),
        (None, None) => None,
    }
}

struct ArbMachine {
    state: ArbState,
    direction: Option<ArbDirection>,
    cooldown_until: Option<Instant>,
    tickers: HashMap<Symbol, Ticker>,
    // Leg left un-offset by the most recent close. The ledger stays
    // authoritative; this only keeps the leftover visible in status().
    residual: Option<(Symbol, PositionSide)>,
}

pub struct ArbitrageStrategy {
    core: StrategyCore,
    config: ArbitrageConfig,
    secondary: Symbol,
    machine: Mutex<ArbMachine>,
}

impl ArbitrageStrategy {
    pub fn new(core: StrategyCore) -> Result<Self, ValidationError> {
        let config: ArbitrageConfig = core.typed_config()?;
        let Some(secondary) = config.secondary_symbol.clone() else {
            return Err(ValidationError::InvalidConfig {
                reason: "secondary_symbol is required".to_string(),
            });
        };
        if &secondary == core.symbol() {
            return Err(ValidationError::InvalidConfig {
                reason: "secondary_symbol must differ from symbol".to_string(),
            });
        }
        if config.min_closing_spread >= config.min_opening_spread {
            return Err(ValidationError::InvalidConfig {
                reason: "min_closing_spread must be below min_opening_spread".to_string(),
            });
        }
        Ok(Self {
            core,
            config,
            secondary,
            machine: Mutex::new(ArbMachine {
                state: ArbState::Closed,
                direction: None,
                cooldown_until: None,
                tickers: HashMap::new(),
                residual: None,
            }),
        })
    }

    /// Current sub-state.
    #[must_use]
    pub fn state(&self) -> ArbState {
        self.machine.lock().state
    }

    async fn try_open(&self, direction: ArbDirection, spread: Decimal) {
        info!(
            instance = %self.core.instance_id(),
            buy = %direction.buy_symbol,
            sell = %direction.sell_symbol,
            spread = %spread,
            "Opening arbitrage"
        );
        let amount = self.config.order_amount;
        let (buy, sell) = tokio::join!(
            self.core.submit_order_for(
                &direction.buy_symbol,
                Side::Buy,
                amount,
                None,
                OrderType::Market,
            ),
            self.core.submit_order_for(
                &direction.sell_symbol,
                Side::Sell,
                amount,
                None,
                OrderType::Market,
            ),
        );

        let mut machine = self.machine.lock();
        match (buy, sell) {
            (None, None) => {
                warn!(instance = %self.core.instance_id(), "Both legs failed, no exposure");
                machine.state = ArbState::Closed;
            }
            (buy, sell) => {
                if buy.is_none() || sell.is_none() {
                    warn!(
                        instance = %self.core.instance_id(),
                        "One leg failed, carrying un-hedged exposure"
                    );
                }
                machine.state = ArbState::Opened;
                machine.direction = Some(direction);
            }
        }
    }

    async fn try_close(&self, direction: ArbDirection, spread: Decimal) {
        info!(
            instance = %self.core.instance_id(),
            spread = %spread,
            "Closing arbitrage"
        );
        let amount = self.config.order_amount;
        let (sell, buy) = tokio::join!(
            self.core.submit_order_for(
                &direction.buy_symbol,
                Side::Sell,
                amount,
                None,
                OrderType::Market,
            ),
            self.core.submit_order_for(
                &direction.sell_symbol,
                Side::Buy,
                amount,
                None,
                OrderType::Market,
            ),
        );

        let mut machine = self.machine.lock();
        if sell.is_none() && buy.is_none() {
            warn!(instance = %self.core.instance_id(), "Close failed, staying opened");
            machine.state = ArbState::Opened;
            machine.direction = Some(direction);
            return;
        }
        machine.residual = if sell.is_none() {
            warn!(
                instance = %self.core.instance_id(),
                symbol = %direction.buy_symbol,
                "Close leg failed, long leg remains"
            );
            Some((direction.buy_symbol.clone(), PositionSide::Long))
        } else if buy.is_none() {
            warn!(
                instance = %self.core.instance_id(),
                symbol = %direction.sell_symbol,
                "Close leg failed, short leg remains"
            );
            Some((direction.sell_symbol.clone(), PositionSide::Short))
        } else {
            None
        };
        machine.state = ArbState::Closed;
        machine.direction = None;
        machine.cooldown_until =
            Some(Instant::now() + Duration::from_secs(self.config.cooldown_secs));
    }
}

#[async_trait]
impl Strategy for ArbitrageStrategy {
    fn name(&self) -> &'static str {
        "arbitrage"
    }

    fn core(&self) -> &StrategyCore {
        &self.core
    }

    async fn on_tick(&self, ticker: &Ticker) -> Result<(), Error> {
        if &ticker.symbol != self.core.symbol() && ticker.symbol != self.secondary {
            return Ok(());
        }

        enum Action {
            None,
            Open(ArbDirection, Decimal),
            Close(ArbDirection, Decimal),
        }

        let action = {
            let mut machine = self.machine.lock();
            machine.tickers.insert(ticker.symbol.clone(), ticker.clone());
            let (Some(primary), Some(secondary)) = (
                machine.tickers.get(self.core.symbol()).cloned(),
                machine.tickers.get(&self.secondary).cloned(),
            ) else {
                return Ok(());
            };

            match machine.state {
                ArbState::Closed => {
                    if machine
                        .cooldown_until
                        .map_or(false, |until| Instant::now() < until)
                    {
                        Action::None
                    } else {
                        match best_opportunity(&primary, &secondary, self.config.slippage_buffer) {
                            Some((direction, spread))
                                if spread >= self.config.min_opening_spread =>
                            {
                                machine.state = ArbState::Opening;
                                Action::Open(direction, spread)
                            }
                            _ => Action::None,
                        }
                    }
                }
                ArbState::Opened => {
                    let Some(direction) = machine.direction.clone() else {
                        return Ok(());
                    };
                    let (buy, sell) = if direction.buy_symbol == primary.symbol {
                        (primary, secondary)
                    } else {
                        (secondary, primary)
                    };
                    match effective_spread(&buy, &sell, self.config.slippage_buffer) {
                        Some(spread) if spread <= self.config.min_closing_spread => {
                            machine.state = ArbState::Closing;
                            Action::Close(direction, spread)
                        }
                        _ => Action::None,
                    }
                }
                // Mid-transition; the in-flight branch finishes the move.
                ArbState::Opening | ArbState::Closing => Action::None,
            }
        };

        match action {
            Action::None => {}
            Action::Open(direction, spread) => self.try_open(direction, spread).await,
            Action::Close(direction, spread) => self.try_close(direction, spread).await,
        }
        Ok(())
    }

    async fn poll(&self) -> Result<(), Error> {
        debug!(
            instance = %self.core.instance_id(),
            state = ?self.state(),
            "Arbitrage poll"
        );
        Ok(())
    }

    fn status(&self) -> Value {
        let machine = self.machine.lock();
        let mut status = self.core.status_base();
        status["strategy"] = json!(self.name());
        status["state"] = json!(machine.state);
        status["direction"] = json!(machine.direction);
        status["residual_leg"] = machine
            .residual
            .as_ref()
            .map_or(Value::Null, |(symbol, side)| {
                json!({ "symbol": symbol, "side": side })
            });
        status["cooldown_remaining_secs"] = json!(machine
            .cooldown_until
            .and_then(|until| until.checked_duration_since(Instant::now()))
            .map(|d| d.as_secs()));
        status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::domain::position::PositionLedger;
    use crate::exchange::PaperConnector;
    use crate::risk::{RiskConfig, RiskEngine};
    use chrono::Utc;
    use serde_json::Map;
    use std::sync::Arc;

    fn tick(symbol: &str, bid: Decimal, ask: Decimal) -> Ticker {
        Ticker {
            symbol: Symbol::from(symbol),
            last: (bid + ask) / Decimal::TWO,
            bid,
            ask,
            high: ask,
            low: bid,
            volume: dec!(10),
            timestamp: Utc::now(),
        }
    }

    fn arb(
        config: Map<String, Value>,
    ) -> (
        ArbitrageStrategy,
        Arc<PaperConnector>,
        tokio::sync::mpsc::UnboundedReceiver<crate::domain::Fill>,
    ) {
        let mut balances = std::collections::HashMap::new();
        balances.insert("BTC".to_string(), dec!(10));
        balances.insert("USDT".to_string(), dec!(1000000));
        balances.insert("USDC".to_string(), dec!(1000000));
        let (connector, fills) = PaperConnector::new(balances);
        let connector = Arc::new(connector);
        let core = StrategyCore::new(
            "arb-test".to_string(),
            Symbol::from("BTC-USDT"),
            Arc::new(EventBus::new()),
            Arc::new(PositionLedger::new()),
            Arc::new(RiskEngine::new(RiskConfig::default())),
            connector.clone(),
            config,
        );
        (ArbitrageStrategy::new(core).unwrap(), connector, fills)
    }

    fn route_fills(
        strategy: &ArbitrageStrategy,
        fills: &mut tokio::sync::mpsc::UnboundedReceiver<crate::domain::Fill>,
    ) {
        while let Ok(fill) = fills.try_recv() {
            strategy.core().on_fill(&fill);
        }
    }

    fn no_buffer_config() -> Map<String, Value> {
        let mut config = Map::new();
        config.insert("secondary_symbol".to_string(), json!("BTC-USDC"));
        config.insert("slippage_buffer".to_string(), json!("0"));
        config
    }

    #[test]
    fn effective_spread_applies_buffers() {
        let buy = tick("BTC-USDT", dec!(49990), dec!(50000));
        let sell = tick("BTC-USDC", dec!(50500), dec!(50510));
        // buy at 50000 * 1.001 = 50050, sell at 50500 * 0.999 = 50449.5
        let spread = effective_spread(&buy, &sell, dec!(0.001)).unwrap();
        assert_eq!(spread, (dec!(50449.5) - dec!(50050)) / dec!(50050));
    }

    #[test]
    fn effective_spread_requires_usable_prices() {
        let buy = tick("BTC-USDT", dec!(49990), Decimal::ZERO);
        let sell = tick("BTC-USDC", dec!(50500), dec!(50510));
        assert!(effective_spread(&buy, &sell, Decimal::ZERO).is_none());
    }

    #[test]
    fn best_opportunity_picks_the_profitable_direction() {
        let cheap = tick("BTC-USDT", dec!(49990), dec!(50000));
        let rich = tick("BTC-USDC", dec!(50500), dec!(50510));

        let (direction, spread) = best_opportunity(&cheap, &rich, Decimal::ZERO).unwrap();
        assert_eq!(direction.buy_symbol, Symbol::from("BTC-USDT"));
        assert_eq!(direction.sell_symbol, Symbol::from("BTC-USDC"));
        assert!(spread > Decimal::ZERO);

        let (reverse, _) = best_opportunity(&rich, &cheap, Decimal::ZERO).unwrap();
        assert_eq!(reverse.buy_symbol, Symbol::from("BTC-USDT"));
    }

    #[tokio::test]
    async fn gap_at_threshold_opens_both_legs() {
        let (strategy, connector, mut fills) = arb(no_buffer_config());
        connector.set_ticker(tick("BTC-USDT", dec!(49990), dec!(50000)));
        connector.set_ticker(tick("BTC-USDC", dec!(50250), dec!(50260)));

        strategy
            .on_tick(&tick("BTC-USDT", dec!(49990), dec!(50000)))
            .await
            .unwrap();
        assert_eq!(strategy.state(), ArbState::Closed);

        // Sell 50250 against buy 50000: exactly the 0.005 opening spread.
        strategy
            .on_tick(&tick("BTC-USDC", dec!(50250), dec!(50260)))
            .await
            .unwrap();
        route_fills(&strategy, &mut fills);

        assert_eq!(strategy.state(), ArbState::Opened);
        let ledger = strategy.core().ledger();
        assert!(ledger
            .get(&Symbol::from("BTC-USDT"), crate::domain::PositionSide::Long)
            .is_some());
        assert!(ledger
            .get(&Symbol::from("BTC-USDC"), crate::domain::PositionSide::Short)
            .is_some());
    }

    #[tokio::test]
    async fn below_threshold_stays_closed() {
        let (strategy, connector, _fills) = arb(no_buffer_config());
        connector.set_ticker(tick("BTC-USDT", dec!(49990), dec!(50000)));
        connector.set_ticker(tick("BTC-USDC", dec!(50100), dec!(50110)));

        strategy
            .on_tick(&tick("BTC-USDT", dec!(49990), dec!(50000)))
            .await
            .unwrap();
        strategy
            .on_tick(&tick("BTC-USDC", dec!(50100), dec!(50110)))
            .await
            .unwrap();

        assert_eq!(strategy.state(), ArbState::Closed);
    }

    #[tokio::test]
    async fn gap_decay_closes_and_starts_cooldown() {
        let (strategy, connector, mut fills) = arb(no_buffer_config());
        connector.set_ticker(tick("BTC-USDT", dec!(49990), dec!(50000)));
        connector.set_ticker(tick("BTC-USDC", dec!(50300), dec!(50310)));

        strategy
            .on_tick(&tick("BTC-USDT", dec!(49990), dec!(50000)))
            .await
            .unwrap();
        strategy
            .on_tick(&tick("BTC-USDC", dec!(50300), dec!(50310)))
            .await
            .unwrap();
        route_fills(&strategy, &mut fills);
        assert_eq!(strategy.state(), ArbState::Opened);

        // Gap collapses below the closing threshold.
        connector.set_ticker(tick("BTC-USDC", dec!(50010), dec!(50020)));
        strategy
            .on_tick(&tick("BTC-USDC", dec!(50010), dec!(50020)))
            .await
            .unwrap();
        route_fills(&strategy, &mut fills);

        assert_eq!(strategy.state(), ArbState::Closed);
        // Both legs are flat again.
        assert_eq!(strategy.core().ledger().open_count(), 0);

        // A fresh opportunity during cooldown is ignored.
        connector.set_ticker(tick("BTC-USDC", dec!(50300), dec!(50310)));
        strategy
            .on_tick(&tick("BTC-USDC", dec!(50300), dec!(50310)))
            .await
            .unwrap();
        route_fills(&strategy, &mut fills);
        assert_eq!(strategy.state(), ArbState::Closed);
        assert_eq!(strategy.core().ledger().open_count(), 0);
    }

    #[tokio::test]
    async fn partial_close_reports_the_leftover_leg() {
        use crate::domain::{Balance, OrderBook, OrderId};
        use crate::error::ConnectorError;
        use crate::exchange::ExchangeConnector;
        use std::collections::HashMap;
        use std::sync::atomic::{AtomicBool, Ordering};

        struct VetoingConnector {
            paper: Arc<PaperConnector>,
            veto_symbol: Symbol,
            vetoing: AtomicBool,
        }

        #[async_trait]
        impl ExchangeConnector for VetoingConnector {
            fn name(&self) -> &str {
                "vetoing"
            }

            async fn create_order(
                &self,
                symbol: &Symbol,
                side: Side,
                size: Decimal,
                price: Option<Decimal>,
                order_type: OrderType,
            ) -> Result<OrderId, ConnectorError> {
                if self.vetoing.load(Ordering::SeqCst) && symbol == &self.veto_symbol {
                    return Err(ConnectorError::OrderRejected("venue rejected".to_string()));
                }
                self.paper
                    .create_order(symbol, side, size, price, order_type)
                    .await
            }

            async fn cancel_order(&self, order_id: &OrderId) -> Result<(), ConnectorError> {
                self.paper.cancel_order(order_id).await
            }

            async fn cancel_all_orders(
                &self,
                symbol: Option<&Symbol>,
            ) -> Result<usize, ConnectorError> {
                self.paper.cancel_all_orders(symbol).await
            }

            async fn get_balance(&self) -> Result<HashMap<String, Balance>, ConnectorError> {
                self.paper.get_balance().await
            }

            async fn get_ticker(&self, symbol: &Symbol) -> Result<Ticker, ConnectorError> {
                self.paper.get_ticker(symbol).await
            }

            async fn get_order_book(
                &self,
                symbol: &Symbol,
                limit: usize,
            ) -> Result<OrderBook, ConnectorError> {
                self.paper.get_order_book(symbol, limit).await
            }
        }

        let mut balances = HashMap::new();
        balances.insert("BTC".to_string(), dec!(10));
        balances.insert("USDT".to_string(), dec!(1000000));
        balances.insert("USDC".to_string(), dec!(1000000));
        let (paper, mut fills) = PaperConnector::new(balances);
        let paper = Arc::new(paper);
        let connector = Arc::new(VetoingConnector {
            paper: paper.clone(),
            veto_symbol: Symbol::from("BTC-USDC"),
            vetoing: AtomicBool::new(false),
        });
        let core = StrategyCore::new(
            "arb-partial".to_string(),
            Symbol::from("BTC-USDT"),
            Arc::new(EventBus::new()),
            Arc::new(PositionLedger::new()),
            Arc::new(RiskEngine::new(RiskConfig::default())),
            connector.clone(),
            no_buffer_config(),
        );
        let strategy = ArbitrageStrategy::new(core).unwrap();

        paper.set_ticker(tick("BTC-USDT", dec!(49990), dec!(50000)));
        paper.set_ticker(tick("BTC-USDC", dec!(50300), dec!(50310)));
        strategy
            .on_tick(&tick("BTC-USDT", dec!(49990), dec!(50000)))
            .await
            .unwrap();
        strategy
            .on_tick(&tick("BTC-USDC", dec!(50300), dec!(50310)))
            .await
            .unwrap();
        route_fills(&strategy, &mut fills);
        assert_eq!(strategy.state(), ArbState::Opened);

        // The buy-back on the short market starts failing before the gap
        // collapses, so only the long leg gets offset.
        connector.vetoing.store(true, Ordering::SeqCst);
        paper.set_ticker(tick("BTC-USDC", dec!(50010), dec!(50020)));
        strategy
            .on_tick(&tick("BTC-USDC", dec!(50010), dec!(50020)))
            .await
            .unwrap();
        route_fills(&strategy, &mut fills);

        assert_eq!(strategy.state(), ArbState::Closed);
        let status = strategy.status();
        assert_eq!(status["residual_leg"]["symbol"], "BTC-USDC");
        assert_eq!(status["residual_leg"]["side"], "short");

        let ledger = strategy.core().ledger();
        assert!(ledger
            .get(&Symbol::from("BTC-USDT"), crate::domain::PositionSide::Long)
            .is_none());
        assert!(ledger
            .get(&Symbol::from("BTC-USDC"), crate::domain::PositionSide::Short)
            .is_some());
    }

    #[tokio::test]
    async fn missing_secondary_symbol_is_rejected() {
        let (connector, _fills) = PaperConnector::new(std::collections::HashMap::new());
        let core = StrategyCore::new(
            "arb-bad".to_string(),
            Symbol::from("BTC-USDT"),
            Arc::new(EventBus::new()),
            Arc::new(PositionLedger::new()),
            Arc::new(RiskEngine::new(RiskConfig::default())),
            Arc::new(connector),
            Map::new(),
        );
        assert!(ArbitrageStrategy::new(core).is_err());
    }

    #[tokio::test]
    async fn status_reports_sub_state() {
        let (strategy, _connector, _fills) = arb(no_buffer_config());
        let status = strategy.status();
        assert_eq!(status["state"], "closed");
        assert_eq!(status["strategy"], "arbitrage");
        assert!(status["residual_leg"].is_null());
    }
}
