//! Exchange-agnostic value types shared across the engine.
//!
//! Prices, sizes, and PnL are [`rust_decimal::Decimal`] end to end; only the
//! quantitative strategy internals (volatility, Avellaneda-Stoikov terms)
//! drop to `f64`, converting back at the order-submission boundary.

pub mod position;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A trading pair symbol such as `BTC-USDT`.
///
/// The inner string is private so all construction goes through the
/// defined constructors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Symbol(String);

impl Symbol {
    /// Create a new `Symbol`.
    #[must_use]
    pub fn new(symbol: impl Into<String>) -> Self {
        Self(symbol.into())
    }

    /// Get the underlying string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Base asset of a `BASE-QUOTE` pair, if the symbol has that shape.
    #[must_use]
    pub fn base_asset(&self) -> Option<&str> {
        self.0.split('-').next().filter(|s| !s.is_empty())
    }

    /// Quote asset of a `BASE-QUOTE` pair, if the symbol has that shape.
    #[must_use]
    pub fn quote_asset(&self) -> Option<&str> {
        self.0.splitn(2, '-').nth(1).filter(|s| !s.is_empty())
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Unique identifier for an order on an exchange.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(pub String);

impl OrderId {
    /// Create a new `OrderId`.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the underlying ID string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Lowercase wire representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }

    /// The opposing side.
    #[must_use]
    pub fn opposite(&self) -> Side {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// The position direction a fill on this side establishes.
    #[must_use]
    pub fn position_side(&self) -> PositionSide {
        match self {
            Side::Buy => PositionSide::Long,
            Side::Sell => PositionSide::Short,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a held position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    /// Lowercase wire representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "long",
            PositionSide::Short => "short",
        }
    }

    /// The opposing direction.
    #[must_use]
    pub fn opposite(&self) -> PositionSide {
        match self {
            PositionSide::Long => PositionSide::Short,
            PositionSide::Short => PositionSide::Long,
        }
    }

    /// The order side that closes a position held in this direction.
    #[must_use]
    pub fn closing_side(&self) -> Side {
        match self {
            PositionSide::Long => Side::Sell,
            PositionSide::Short => Side::Buy,
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PositionSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "long" => Ok(PositionSide::Long),
            "short" => Ok(PositionSide::Short),
            other => Err(format!("unknown position side: {other}")),
        }
    }
}

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Limit,
    Market,
}

impl OrderType {
    /// Lowercase wire representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderType::Limit => "limit",
            OrderType::Market => "market",
        }
    }
}

/// One market-data update for a symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: Symbol,
    pub last: Decimal,
    pub bid: Decimal,
    pub ask: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub volume: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl Ticker {
    /// Midpoint of the best bid and ask, falling back to the last trade
    /// price when either side is missing. Returns `None` when no usable
    /// price exists, so callers short-circuit instead of quoting off zero.
    #[must_use]
    pub fn mid_price(&self) -> Option<Decimal> {
        if self.bid > Decimal::ZERO && self.ask > Decimal::ZERO {
            Some((self.bid + self.ask) / Decimal::TWO)
        } else if self.last > Decimal::ZERO {
            Some(self.last)
        } else {
            None
        }
    }
}

/// A single price level of an order book.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: Decimal,
    pub size: Decimal,
}

/// An order-book snapshot for a symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBook {
    pub symbol: Symbol,
    /// Bids, best (highest) first.
    pub bids: Vec<BookLevel>,
    /// Asks, best (lowest) first.
    pub asks: Vec<BookLevel>,
    pub timestamp: DateTime<Utc>,
}

impl OrderBook {
    /// Best bid price, if any.
    #[must_use]
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.first().map(|l| l.price)
    }

    /// Best ask price, if any.
    #[must_use]
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.first().map(|l| l.price)
    }
}

/// Balance of a single asset.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Balance {
    pub total: Decimal,
    pub available: Decimal,
}

impl Balance {
    /// Create a balance with everything available.
    #[must_use]
    pub fn free(total: Decimal) -> Self {
        Self {
            total,
            available: total,
        }
    }
}

/// A reported order fill.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub order_id: OrderId,
    pub symbol: Symbol,
    pub side: Side,
    pub size: Decimal,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
}

/// An order a strategy has submitted and is still tracking.
///
/// Removed from the tracking set on fill or successful cancel.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveOrder {
    pub order_id: OrderId,
    pub symbol: Symbol,
    pub side: Side,
    pub size: Decimal,
    pub price: Decimal,
    pub order_type: OrderType,
    pub created_at: DateTime<Utc>,
}
