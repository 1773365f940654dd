//! In-memory paper-trading connector.
//!
//! Accepts orders without touching a real venue. Market orders fill
//! immediately against the last ticker; limit orders fill on submission if
//! marketable, otherwise they rest and fill when a later ticker crosses
//! their price. Fills are reported over an unbounded channel so the engine
//! consumes them the same way it would a live execution feed.
//!
//! Balances are adjusted on fill only; resting orders do not reserve funds.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::domain::{
    ActiveOrder, Balance, BookLevel, Fill, OrderBook, OrderId, OrderType, Side, Symbol, Ticker,
};
use crate::error::ConnectorError;

use super::ExchangeConnector;

/// Simulated exchange connector.
pub struct PaperConnector {
    name: String,
    tickers: DashMap<Symbol, Ticker>,
    open_orders: DashMap<OrderId, ActiveOrder>,
    balances: DashMap<String, Balance>,
    fills_tx: mpsc::UnboundedSender<Fill>,
    next_order_id: AtomicU64,
}

impl PaperConnector {
    /// Create a connector with the given starting balances, returning it
    /// together with the fill feed.
    pub fn new(
        initial_balances: HashMap<String, Decimal>,
    ) -> (Self, mpsc::UnboundedReceiver<Fill>) {
        let (fills_tx, fills_rx) = mpsc::unbounded_channel();
        let balances = DashMap::new();
        for (asset, total) in initial_balances {
            balances.insert(asset, Balance::free(total));
        }
        let connector = Self {
            name: "paper".to_string(),
            tickers: DashMap::new(),
            open_orders: DashMap::new(),
            balances,
            fills_tx,
            next_order_id: AtomicU64::new(1),
        };
        (connector, fills_rx)
    }

    /// Override the venue name, for multi-venue setups.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Publish a new ticker and fill any resting limit orders it crosses.
    pub fn set_ticker(&self, ticker: Ticker) {
        let symbol = ticker.symbol.clone();
        self.tickers.insert(symbol.clone(), ticker.clone());

        let crossed: Vec<OrderId> = self
            .open_orders
            .iter()
            .filter(|entry| {
                entry.symbol == symbol
                    && match entry.side {
                        Side::Buy => ticker.ask > Decimal::ZERO && ticker.ask <= entry.price,
                        Side::Sell => ticker.bid >= entry.price,
                    }
            })
            .map(|entry| entry.key().clone())
            .collect();

        for order_id in crossed {
            if let Some((_, order)) = self.open_orders.remove(&order_id) {
                let price = order.price;
                self.fill(order, price);
            }
        }
    }

    /// Resting order count, optionally for one symbol.
    #[must_use]
    pub fn open_order_count(&self, symbol: Option<&Symbol>) -> usize {
        self.open_orders
            .iter()
            .filter(|entry| symbol.map_or(true, |s| &entry.symbol == s))
            .count()
    }

    fn next_id(&self) -> OrderId {
        let n = self.next_order_id.fetch_add(1, Ordering::Relaxed);
        OrderId::new(format!("paper-{n}"))
    }

    fn fill(&self, order: ActiveOrder, price: Decimal) {
        self.apply_fill_to_balances(&order.symbol, order.side, order.size, price);
        info!(
            order_id = %order.order_id,
            symbol = %order.symbol,
            side = %order.side,
            size = %order.size,
            price = %price,
            "Paper fill"
        );
        let fill = Fill {
            order_id: order.order_id,
            symbol: order.symbol,
            side: order.side,
            size: order.size,
            price,
            timestamp: Utc::now(),
        };
        // Send only fails when the engine side has shut down.
        let _ = self.fills_tx.send(fill);
    }

    fn apply_fill_to_balances(&self, symbol: &Symbol, side: Side, size: Decimal, price: Decimal) {
        let (Some(base), Some(quote)) = (symbol.base_asset(), symbol.quote_asset()) else {
            return;
        };
        let cost = size * price;
        match side {
            Side::Buy => {
                self.adjust_balance(base, size);
                self.adjust_balance(quote, -cost);
            }
            Side::Sell => {
                self.adjust_balance(base, -size);
                self.adjust_balance(quote, cost);
            }
        }
    }

    fn adjust_balance(&self, asset: &str, delta: Decimal) {
        let mut entry = self.balances.entry(asset.to_string()).or_default();
        entry.total += delta;
        entry.available += delta;
    }
}

#[async_trait]
impl ExchangeConnector for PaperConnector {
    fn name(&self) -> &str {
        &self.name
    }

    async fn create_order(
        &self,
        symbol: &Symbol,
        side: Side,
        size: Decimal,
        price: Option<Decimal>,
        order_type: OrderType,
    ) -> Result<OrderId, ConnectorError> {
        if size <= Decimal::ZERO {
            return Err(ConnectorError::OrderRejected(format!(
                "non-positive size {size}"
            )));
        }

        let order_id = self.next_id();
        match order_type {
            OrderType::Market => {
                let ticker = self
                    .tickers
                    .get(symbol)
                    .ok_or_else(|| ConnectorError::UnknownSymbol(symbol.to_string()))?
                    .clone();
                let fill_price = match side {
                    Side::Buy => ticker.ask,
                    Side::Sell => ticker.bid,
                };
                if fill_price <= Decimal::ZERO {
                    return Err(ConnectorError::OrderRejected(
                        "no marketable price".to_string(),
                    ));
                }
                self.fill(
                    ActiveOrder {
                        order_id: order_id.clone(),
                        symbol: symbol.clone(),
                        side,
                        size,
                        price: fill_price,
                        order_type,
                        created_at: Utc::now(),
                    },
                    fill_price,
                );
            }
            OrderType::Limit => {
                let price = price.ok_or_else(|| {
                    ConnectorError::OrderRejected("limit order requires a price".to_string())
                })?;
                if price <= Decimal::ZERO {
                    return Err(ConnectorError::OrderRejected(format!(
                        "non-positive price {price}"
                    )));
                }
                let order = ActiveOrder {
                    order_id: order_id.clone(),
                    symbol: symbol.clone(),
                    side,
                    size,
                    price,
                    order_type,
                    created_at: Utc::now(),
                };
                let marketable = self.tickers.get(symbol).map_or(false, |t| match side {
                    Side::Buy => t.ask > Decimal::ZERO && price >= t.ask,
                    Side::Sell => t.bid > Decimal::ZERO && price <= t.bid,
                });
                if marketable {
                    self.fill(order, price);
                } else {
                    debug!(order_id = %order_id, symbol = %symbol, price = %price, "Order resting");
                    self.open_orders.insert(order_id.clone(), order);
                }
            }
        }
        Ok(order_id)
    }

    async fn cancel_order(&self, order_id: &OrderId) -> Result<(), ConnectorError> {
        match self.open_orders.remove(order_id) {
            Some(_) => {
                debug!(order_id = %order_id, "Order cancelled");
                Ok(())
            }
            None => Err(ConnectorError::UnknownOrder(order_id.to_string())),
        }
    }

    async fn cancel_all_orders(&self, symbol: Option<&Symbol>) -> Result<usize, ConnectorError> {
        let targets: Vec<OrderId> = self
            .open_orders
            .iter()
            .filter(|entry| symbol.map_or(true, |s| &entry.symbol == s))
            .map(|entry| entry.key().clone())
            .collect();
        let mut cancelled = 0;
        for order_id in targets {
            if self.open_orders.remove(&order_id).is_some() {
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    async fn get_balance(&self) -> Result<HashMap<String, Balance>, ConnectorError> {
        Ok(self
            .balances
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect())
    }

    async fn get_ticker(&self, symbol: &Symbol) -> Result<Ticker, ConnectorError> {
        self.tickers
            .get(symbol)
            .map(|entry| entry.clone())
            .ok_or_else(|| ConnectorError::UnknownSymbol(symbol.to_string()))
    }

    async fn get_order_book(
        &self,
        symbol: &Symbol,
        limit: usize,
    ) -> Result<OrderBook, ConnectorError> {
        let ticker = self.get_ticker(symbol).await?;
        let step = ticker.last * dec!(0.0001);
        let mut bids = Vec::with_capacity(limit);
        let mut asks = Vec::with_capacity(limit);
        for i in 0..limit {
            let offset = step * Decimal::from(i as u64);
            bids.push(BookLevel {
                price: ticker.bid - offset,
                size: dec!(1),
            });
            asks.push(BookLevel {
                price: ticker.ask + offset,
                size: dec!(1),
            });
        }
        Ok(OrderBook {
            symbol: symbol.clone(),
            bids,
            asks,
            timestamp: Utc::now(),
        })
    }
}

/// Synthetic random-walk price feed for the demo binary.
pub struct RandomWalk {
    symbol: Symbol,
    mid: f64,
    step_pct: f64,
    spread_pct: f64,
    rng: StdRng,
}

impl RandomWalk {
    /// A walk starting at `start_mid`, moving up to `step_pct` per tick.
    #[must_use]
    pub fn new(symbol: Symbol, start_mid: f64, step_pct: f64) -> Self {
        Self::with_rng(symbol, start_mid, step_pct, StdRng::from_entropy())
    }

    /// Deterministic walk for tests.
    #[must_use]
    pub fn seeded(symbol: Symbol, start_mid: f64, step_pct: f64, seed: u64) -> Self {
        Self::with_rng(symbol, start_mid, step_pct, StdRng::seed_from_u64(seed))
    }

    fn with_rng(symbol: Symbol, start_mid: f64, step_pct: f64, rng: StdRng) -> Self {
        Self {
            symbol,
            mid: start_mid,
            step_pct,
            spread_pct: 0.0002,
            rng,
        }
    }

    /// Advance the walk one step and produce the resulting ticker.
    pub fn next_tick(&mut self) -> Ticker {
        let drift = self.rng.gen_range(-self.step_pct..=self.step_pct);
        self.mid *= 1.0 + drift;
        let half_spread = self.mid * self.spread_pct / 2.0;
        let to_dec = |v: f64| Decimal::from_f64_retain(v).unwrap_or(Decimal::ZERO);
        Ticker {
            symbol: self.symbol.clone(),
            last: to_dec(self.mid),
            bid: to_dec(self.mid - half_spread),
            ask: to_dec(self.mid + half_spread),
            high: to_dec(self.mid * 1.01),
            low: to_dec(self.mid * 0.99),
            volume: dec!(100),
            timestamp: Utc::now(),
        }
    }
}
