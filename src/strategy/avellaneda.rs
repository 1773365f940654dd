//! Avellaneda-Stoikov reservation-price quoting.
//!
//! Quotes are centered on a reservation price that shifts away from the
//! mid against current inventory: `r = mid * (1 + gamma * q * sigma^2)`
//! with q a normalized inventory position in [-1, 1]. The half-spread is
//! `sigma * sqrt(gamma / kappa)` as a fraction of the reservation price,
//! clamped to a configured band. With flat inventory (q = 0) the
//! reservation price equals the mid exactly.

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
pub struct AvellanedaConfig {
    /// Size of each quote.
    pub order_amount: Decimal,
    /// Risk aversion (gamma).
    pub risk_aversion: f64,
    /// Order-book depth parameter (kappa).
    pub book_depth: f64,
    /// Half-spread floor as a fraction of the reservation price.
    pub min_spread: f64,
    /// Half-spread ceiling.
    pub max_spread: f64,
    /// Desired base-asset share of portfolio value, in [0, 1].
    pub target_base_pct: Decimal,
    /// Hard floor for the bid quote.
    pub price_floor: Option<Decimal>,
    /// Hard ceiling for the ask quote.
    pub price_ceiling: Option<Decimal>,
    /// Skip requoting when both quotes moved less than this fraction.
    pub quote_tolerance: Decimal,
    /// Seconds between quote refreshes.
    pub order_refresh_secs: u64,
}

impl Default for AvellanedaConfig {
    fn default() -> Self {
        Self {
            order_amount: dec!(0.001),
            risk_aversion: 0.1,
            book_depth: 1.5,
            min_spread: 0.0005,
            max_spread: 0.02,
            target_base_pct: dec!(0.5),
            price_floor: None,
            price_ceiling: None,
            quote_tolerance: dec!(0.0001),
            order_refresh_secs: 5,
        }
    }
}

/// `r = mid * (1 + gamma * q * sigma^2)`.
#[must_use]
pub fn reservation_price(mid: f64, q: f64, gamma: f64, sigma: f64) -> f64 {
    mid * (1.0 + gamma * q * sigma * sigma)
}

/// `sigma * sqrt(gamma / kappa)`, clamped to `[min, max]`.
#[must_use]
pub fn optimal_half_spread(sigma: f64, gamma: f64, kappa: f64, min: f64, max: f64) -> f64 {
    if kappa <= 0.0 {
        return min;
    }
    (sigma * (gamma / kappa).sqrt()).clamp(min, max)
}

struct QuoteState {
    volatility: VolatilityEstimator,
    last_quote_at: Option<Instant>,
    last_mid: Option<Decimal>,
    last_bid: Option<Decimal>,
    last_ask: Option<Decimal>,
}

pub struct AvellanedaStrategy {
    core: StrategyCore,
    config: AvellanedaConfig,
    state: Mutex<QuoteState>,
}

impl AvellanedaStrategy {
    pub fn new(core: StrategyCore) -> Result<Self, ValidationError> {
        let config: AvellanedaConfig = core.typed_config()?;
        if config.order_amount <= Decimal::ZERO {
            return Err(ValidationError::InvalidConfig {
                reason: "order_amount must be positive".to_string(),
            });
        }
        if config.risk_aversion <= 0.0 || config.book_depth <= 0.0 {
            return Err(ValidationError::InvalidConfig {
                reason: "risk_aversion and book_depth must be positive".to_string(),
            });
        }
        Ok(Self {
            core,
            config,
            state: Mutex::new(QuoteState {
                volatility: VolatilityEstimator::default(),
                last_quote_at: None,
                last_mid: None,
                last_bid: None,
                last_ask: None,
            }),
        })
    }

    /// Normalized inventory q in [-1, 1]: twice the deviation of the
    /// base-asset share from target, so a fully lopsided book saturates.
    async fn inventory_q(&self, mid: Decimal) -> Option<f64> {
        let balances = self.core.connector().get_balance().await.ok()?;
        let base = self.core.symbol().base_asset()?;
        let quote = self.core.symbol().quote_asset()?;
        let base_value = balances.get(base).map_or(Decimal::ZERO, |b| b.total) * mid;
        let quote_value = balances.get(quote).map_or(Decimal::ZERO, |b| b.total);
        let total = base_value + quote_value;
        if total <= Decimal::ZERO {
            return None;
        }
        let base_pct = (base_value / total).to_f64()?;
        let target = self.config.target_base_pct.to_f64()?;
        Some(((base_pct - target) * 2.0).clamp(-1.0, 1.0))
    }

    fn within_tolerance(&self, previous: Option<Decimal>, current: Decimal) -> bool {
        let Some(previous) = previous else {
            return false;
        };
        if previous <= Decimal::ZERO {
            return false;
        }
        ((current - previous) / previous).abs() < self.config.quote_tolerance
    }
}

#[async_trait]
impl Strategy for AvellanedaStrategy {
    fn name(&self) -> &'static str {
        "avellaneda"
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

        let (due, sigma) = {
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

        let Some(q) = self.inventory_q(mid).await else {
            debug!(instance = %self.core.instance_id(), "No portfolio value, skipping quote");
            return Ok(());
        };
        let Some(mid_f) = mid.to_f64() else {
            return Ok(());
        };

        let gamma = self.config.risk_aversion;
        let r = reservation_price(mid_f, q, gamma, sigma);
        let half = optimal_half_spread(
            sigma,
            gamma,
            self.config.book_depth,
            self.config.min_spread,
            self.config.max_spread,
        );
        let mut bid = Decimal::from_f64_retain(r * (1.0 - half)).unwrap_or(Decimal::ZERO);
        let mut ask = Decimal::from_f64_retain(r * (1.0 + half)).unwrap_or(Decimal::ZERO);
        if let Some(floor) = self.config.price_floor {
            bid = bid.max(floor);
        }
        if let Some(ceiling) = self.config.price_ceiling {
            ask = ask.min(ceiling);
        }
        if bid <= Decimal::ZERO || bid >= ask {
            return Ok(());
        }

        let (prev_bid, prev_ask) = {
            let state = self.state.lock();
            (state.last_bid, state.last_ask)
        };
        if self.within_tolerance(prev_bid, bid) && self.within_tolerance(prev_ask, ask) {
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
        {
            let mut state = self.state.lock();
            state.last_quote_at = Some(Instant::now());
            state.last_bid = Some(bid);
            state.last_ask = Some(ask);
        }
        debug!(
            instance = %self.core.instance_id(),
            reservation = r,
            q,
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
        status["last_bid"] = json!(state.last_bid);
        status["last_ask"] = json!(state.last_ask);
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

    #[test]
    fn flat_inventory_reservation_equals_mid() {
        for gamma in [0.01, 0.1, 1.0] {
            for sigma in [0.001, 0.05, 0.1] {
                assert_eq!(reservation_price(50000.0, 0.0, gamma, sigma), 50000.0);
            }
        }
    }

    #[test]
    fn reservation_shift_follows_inventory_sign() {
        let long = reservation_price(50000.0, 1.0, 0.1, 0.05);
        let short = reservation_price(50000.0, -1.0, 0.1, 0.05);
        assert!(long > 50000.0);
        assert!(short < 50000.0);
        assert_eq!(long - 50000.0, 50000.0 - short);
    }

    #[test]
    fn reservation_shift_scales_with_mid() {
        // The inventory shift is a fraction of the mid, so doubling the
        // mid doubles the absolute displacement.
        let at_50k = reservation_price(50000.0, 1.0, 0.1, 0.05) - 50000.0;
        let at_100k = reservation_price(100000.0, 1.0, 0.1, 0.05) - 100000.0;
        assert!(at_50k > 0.0);
        assert!((at_100k - 2.0 * at_50k).abs() < 1e-6);
    }

    #[test]
    fn half_spread_is_clamped() {
        assert_eq!(optimal_half_spread(0.0, 0.1, 1.5, 0.0005, 0.02), 0.0005);
        assert_eq!(optimal_half_spread(10.0, 0.1, 1.5, 0.0005, 0.02), 0.02);
        let mid_range = optimal_half_spread(0.02, 0.1, 1.5, 0.0005, 0.02);
        assert!(mid_range > 0.0005 && mid_range < 0.02);
    }

    fn ticker(bid: Decimal, ask: Decimal) -> Ticker {
        Ticker {
            symbol: Symbol::from("BTC-USDT"),
            last: (bid + ask) / Decimal::TWO,
            bid,
            ask,
            high: ask,
            low: bid,
            volume: dec!(10),
            timestamp: Utc::now(),
        }
    }

    fn avellaneda(config: Map<String, Value>) -> (AvellanedaStrategy, Arc<PaperConnector>) {
        let mut balances = HashMap::new();
        balances.insert("BTC".to_string(), dec!(1));
        balances.insert("USDT".to_string(), dec!(50000));
        let (connector, _fills) = PaperConnector::new(balances);
        let connector = Arc::new(connector);
        let core = StrategyCore::new(
            "avl-test".to_string(),
            Symbol::from("BTC-USDT"),
            Arc::new(EventBus::new()),
            Arc::new(PositionLedger::new()),
            Arc::new(RiskEngine::new(RiskConfig::default())),
            connector.clone(),
            config,
        );
        (AvellanedaStrategy::new(core).unwrap(), connector)
    }

    #[tokio::test]
    async fn flat_inventory_quotes_symmetrically() {
        let (strategy, connector) = avellaneda(Map::new());
        connector.set_ticker(ticker(dec!(49995), dec!(50005)));

        strategy
            .on_tick(&ticker(dec!(49995), dec!(50005)))
            .await
            .unwrap();

        let orders = strategy.core().active_orders();
        assert_eq!(orders.len(), 2);
        let bid = orders.iter().find(|o| o.side == Side::Buy).unwrap().price;
        let ask = orders.iter().find(|o| o.side == Side::Sell).unwrap().price;
        // q = 0, so quotes sit symmetrically around the mid.
        assert!(bid < dec!(50000) && ask > dec!(50000));
        assert!((dec!(50000) - bid) - (ask - dec!(50000)) < dec!(0.0001));
    }

    #[tokio::test]
    async fn price_floor_and_ceiling_clamp_quotes() {
        let mut config = Map::new();
        config.insert("price_floor".to_string(), json!("49990"));
        config.insert("price_ceiling".to_string(), json!("50010"));
        let (strategy, connector) = avellaneda(config);
        connector.set_ticker(ticker(dec!(49995), dec!(50005)));

        strategy
            .on_tick(&ticker(dec!(49995), dec!(50005)))
            .await
            .unwrap();

        let orders = strategy.core().active_orders();
        let bid = orders.iter().find(|o| o.side == Side::Buy).unwrap().price;
        let ask = orders.iter().find(|o| o.side == Side::Sell).unwrap().price;
        assert!(bid >= dec!(49990));
        assert!(ask <= dec!(50010));
    }

    #[tokio::test]
    async fn stale_quotes_within_tolerance_are_kept() {
        let mut config = Map::new();
        config.insert("order_refresh_secs".to_string(), json!(0));
        let (strategy, connector) = avellaneda(config);
        connector.set_ticker(ticker(dec!(49995), dec!(50005)));

        let tick = ticker(dec!(49995), dec!(50005));
        strategy.on_tick(&tick).await.unwrap();
        let first: Vec<_> = strategy
            .core()
            .active_orders()
            .iter()
            .map(|o| o.order_id.clone())
            .collect();

        // Same mid again with refresh due: quotes unchanged within
        // tolerance, so no requote happens.
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
    async fn zero_mid_short_circuits() {
        let (strategy, _connector) = avellaneda(Map::new());
        strategy
            .on_tick(&ticker(Decimal::ZERO, Decimal::ZERO))
            .await
            .unwrap();
        assert_eq!(strategy.core().active_order_count(), 0);
    }

    #[tokio::test]
    async fn invalid_parameters_are_rejected() {
        let mut config = Map::new();
        config.insert("risk_aversion".to_string(), json!(0.0));
        let (connector, _fills) = PaperConnector::new(HashMap::new());
        let core = StrategyCore::new(
            "avl-bad".to_string(),
            Symbol::from("BTC-USDT"),
            Arc::new(EventBus::new()),
            Arc::new(PositionLedger::new()),
            Arc::new(RiskEngine::new(RiskConfig::default())),
            Arc::new(connector),
            config,
        );
        assert!(AvellanedaStrategy::new(core).is_err());
    }
}
