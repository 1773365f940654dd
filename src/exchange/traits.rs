//! The connector interface every venue implementation must provide.

use std::collections::HashMap;

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::domain::{Balance, OrderBook, OrderId, OrderType, Side, Symbol, Ticker};
use crate::error::ConnectorError;

/// Async order and market-data operations against one venue.
///
/// Injected into strategies at construction. Every method may fail, and a
/// failure always means "no effect occurred": callers never assume partial
/// success and never retry here (retry policy, if any, lives inside the
/// connector).
#[async_trait]
pub trait ExchangeConnector: Send + Sync {
    /// Venue name for logging.
    fn name(&self) -> &str;

    /// Place an order. `price` is required for limit orders and ignored
    /// for market orders.
    async fn create_order(
        &self,
        symbol: &Symbol,
        side: Side,
        size: Decimal,
        price: Option<Decimal>,
        order_type: OrderType,
    ) -> Result<OrderId, ConnectorError>;

    /// Cancel a resting order.
    async fn cancel_order(&self, order_id: &OrderId) -> Result<(), ConnectorError>;

    /// Cancel every resting order, optionally restricted to one symbol.
    /// Returns the number of orders cancelled.
    async fn cancel_all_orders(&self, symbol: Option<&Symbol>) -> Result<usize, ConnectorError>;

    /// Balances by asset.
    async fn get_balance(&self) -> Result<HashMap<String, Balance>, ConnectorError>;

    /// Latest ticker for a symbol.
    async fn get_ticker(&self, symbol: &Symbol) -> Result<Ticker, ConnectorError>;

    /// Order-book snapshot with up to `limit` levels per side.
    async fn get_order_book(
        &self,
        symbol: &Symbol,
        limit: usize,
    ) -> Result<OrderBook, ConnectorError>;
}
