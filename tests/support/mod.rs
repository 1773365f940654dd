#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use tradeloop::bus::EventBus;
use tradeloop::domain::position::PositionLedger;
use tradeloop::domain::{
    Balance, BookLevel, OrderBook, OrderId, OrderType, Side, Symbol, Ticker,
};
use tradeloop::error::ConnectorError;
use tradeloop::exchange::ExchangeConnector;
use tradeloop::orchestrator::Orchestrator;
use tradeloop::risk::{RiskConfig, RiskEngine};

/// One order the recording connector accepted.
#[derive(Debug, Clone)]
pub struct SubmittedOrder {
    pub order_id: OrderId,
    pub symbol: Symbol,
    pub side: Side,
    pub size: Decimal,
    pub price: Option<Decimal>,
    pub order_type: OrderType,
}

/// Connector fake that records every call and never fills anything.
/// Cancels can be made to fail to exercise best-effort paths.
pub struct RecordingConnector {
    submitted: Mutex<Vec<SubmittedOrder>>,
    cancelled: Mutex<Vec<OrderId>>,
    fail_cancels: bool,
    balances: Mutex<HashMap<String, Balance>>,
    tickers: Mutex<HashMap<Symbol, Ticker>>,
    next_id: AtomicU64,
}

impl RecordingConnector {
    pub fn new() -> Self {
        Self {
            submitted: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            fail_cancels: false,
            balances: Mutex::new(HashMap::new()),
            tickers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_failing_cancels() -> Self {
        Self {
            fail_cancels: true,
            ..Self::new()
        }
    }

    pub fn set_balance(&self, asset: &str, total: Decimal) {
        self.balances
            .lock()
            .insert(asset.to_string(), Balance::free(total));
    }

    pub fn set_ticker(&self, ticker: Ticker) {
        self.tickers.lock().insert(ticker.symbol.clone(), ticker);
    }

    pub fn submitted(&self) -> Vec<SubmittedOrder> {
        self.submitted.lock().clone()
    }

    pub fn cancel_calls(&self) -> Vec<OrderId> {
        self.cancelled.lock().clone()
    }
}

#[async_trait]
impl ExchangeConnector for RecordingConnector {
    fn name(&self) -> &str {
        "recording"
    }

    async fn create_order(
        &self,
        symbol: &Symbol,
        side: Side,
        size: Decimal,
        price: Option<Decimal>,
        order_type: OrderType,
    ) -> Result<OrderId, ConnectorError> {
        let n = self.next_id.fetch_add(1, Ordering::Relaxed);
        let order_id = OrderId::new(format!("rec-{n}"));
        self.submitted.lock().push(SubmittedOrder {
            order_id: order_id.clone(),
            symbol: symbol.clone(),
            side,
            size,
            price,
            order_type,
        });
        Ok(order_id)
    }

    async fn cancel_order(&self, order_id: &OrderId) -> Result<(), ConnectorError> {
        self.cancelled.lock().push(order_id.clone());
        if self.fail_cancels {
            return Err(ConnectorError::Unavailable("cancel disabled".to_string()));
        }
        Ok(())
    }

    async fn cancel_all_orders(&self, _symbol: Option<&Symbol>) -> Result<usize, ConnectorError> {
        Ok(0)
    }

    async fn get_balance(&self) -> Result<HashMap<String, Balance>, ConnectorError> {
        Ok(self.balances.lock().clone())
    }

    async fn get_ticker(&self, symbol: &Symbol) -> Result<Ticker, ConnectorError> {
        self.tickers
            .lock()
            .get(symbol)
            .cloned()
            .ok_or_else(|| ConnectorError::UnknownSymbol(symbol.to_string()))
    }

    async fn get_order_book(
        &self,
        symbol: &Symbol,
        _limit: usize,
    ) -> Result<OrderBook, ConnectorError> {
        let ticker = self.get_ticker(symbol).await?;
        Ok(OrderBook {
            symbol: symbol.clone(),
            bids: vec![BookLevel {
                price: ticker.bid,
                size: dec!(1),
            }],
            asks: vec![BookLevel {
                price: ticker.ask,
                size: dec!(1),
            }],
            timestamp: Utc::now(),
        })
    }
}

/// A ticker with the given touch, mid derived from it.
pub fn ticker(symbol: &str, bid: Decimal, ask: Decimal) -> Ticker {
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

/// An orchestrator over the given connector with fresh shared state and a
/// balanced paper book at mid 50000.
pub fn engine(connector: Arc<dyn ExchangeConnector>) -> Arc<Orchestrator> {
    Arc::new(Orchestrator::new(
        Arc::new(EventBus::new()),
        Arc::new(PositionLedger::new()),
        Arc::new(RiskEngine::new(RiskConfig::default())),
        connector,
    ))
}
