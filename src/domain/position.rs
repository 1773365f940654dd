//! Position ledger: per-(symbol, side) position state shared by all
//! strategy instances.
//!
//! Every mutation is a single atomic map update, so a concurrent reader in
//! the same cooperative tick never observes a partial state.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{PositionSide, Symbol};

/// A position held in one direction on one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: Symbol,
    pub side: PositionSide,
    /// Quantity, always >= 0 within a side.
    pub size: Decimal,
    /// Size-weighted average entry price.
    pub entry_price: Decimal,
    pub exit_price: Option<Decimal>,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Position {
    fn new(symbol: Symbol, side: PositionSide, size: Decimal, entry_price: Decimal) -> Self {
        Self {
            symbol,
            side,
            size,
            entry_price,
            exit_price: None,
            realized_pnl: Decimal::ZERO,
            unrealized_pnl: Decimal::ZERO,
            opened_at: Utc::now(),
            closed_at: None,
        }
    }

    /// A position is open iff no close timestamp has been recorded.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.closed_at.is_none()
    }

    /// Absolute notional value at entry.
    #[must_use]
    pub fn notional_value(&self) -> Decimal {
        (self.size * self.entry_price).abs()
    }

    /// Side-aware PnL of exiting at `price`: long profit is
    /// `(exit - entry) * size`, short profit is `(entry - exit) * size`.
    #[must_use]
    pub fn pnl_at(&self, price: Decimal) -> Decimal {
        match self.side {
            PositionSide::Long => (price - self.entry_price) * self.size,
            PositionSide::Short => (self.entry_price - price) * self.size,
        }
    }

    fn close(&mut self, exit_price: Decimal) {
        self.realized_pnl = self.pnl_at(exit_price);
        self.exit_price = Some(exit_price);
        self.closed_at = Some(Utc::now());
    }
}

/// Tracks open positions keyed by `(symbol, side)` and an append-only
/// history of closed positions.
#[derive(Debug, Default)]
pub struct PositionLedger {
    open: DashMap<(Symbol, PositionSide), Position>,
    closed: Mutex<Vec<Position>>,
}

impl PositionLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a position, or accumulate into an existing one on the same key.
    ///
    /// Accumulation averages the entry price by size:
    /// `(old_entry * old_size + price * size) / (old_size + size)`.
    /// Returns the resulting position.
    pub fn open_or_accumulate(
        &self,
        symbol: &Symbol,
        side: PositionSide,
        size: Decimal,
        price: Decimal,
    ) -> Position {
        let entry = self
            .open
            .entry((symbol.clone(), side))
            .and_modify(|pos| {
                let total = pos.size + size;
                if total > Decimal::ZERO {
                    pos.entry_price = (pos.entry_price * pos.size + price * size) / total;
                }
                pos.size = total;
                info!(symbol = %pos.symbol, side = %pos.side, size = %pos.size, "Position accumulated");
            })
            .or_insert_with(|| {
                info!(symbol = %symbol, side = %side, size = %size, price = %price, "Position opened");
                Position::new(symbol.clone(), side, size, price)
            });
        entry.clone()
    }

    /// Close the position on `(symbol, side)` at `exit_price`.
    ///
    /// Removes the key from the open set and appends the closed record to
    /// history. Returns `None` when no such position exists; callers must
    /// check rather than expect an error.
    pub fn close(
        &self,
        symbol: &Symbol,
        side: PositionSide,
        exit_price: Decimal,
    ) -> Option<Position> {
        let Some((_, mut position)) = self.open.remove(&(symbol.clone(), side)) else {
            warn!(symbol = %symbol, side = %side, "No position to close");
            return None;
        };
        position.close(exit_price);
        info!(
            symbol = %symbol,
            side = %side,
            pnl = %position.realized_pnl,
            "Position closed"
        );
        self.closed.lock().push(position.clone());
        Some(position)
    }

    /// Get the open position on `(symbol, side)`, if any.
    #[must_use]
    pub fn get(&self, symbol: &Symbol, side: PositionSide) -> Option<Position> {
        self.open
            .get(&(symbol.clone(), side))
            .map(|entry| entry.clone())
    }

    /// Snapshot of all open positions.
    #[must_use]
    pub fn all_open(&self) -> Vec<Position> {
        self.open.iter().map(|entry| entry.value().clone()).collect()
    }

    /// The most recent `limit` closed positions, most recent last.
    #[must_use]
    pub fn closed(&self, limit: usize) -> Vec<Position> {
        let closed = self.closed.lock();
        let start = closed.len().saturating_sub(limit);
        closed[start..].to_vec()
    }

    /// Recompute unrealized PnL for every open position on `symbol`,
    /// regardless of side.
    pub fn update_unrealized(&self, symbol: &Symbol, mark_price: Decimal) {
        for mut entry in self.open.iter_mut() {
            if &entry.symbol == symbol {
                entry.unrealized_pnl = entry.pnl_at(mark_price);
            }
        }
    }

    /// Open sizes for `symbol` as `(long, short)`.
    #[must_use]
    pub fn position_sizes(&self, symbol: &Symbol) -> (Decimal, Decimal) {
        let long = self
            .get(symbol, PositionSide::Long)
            .map_or(Decimal::ZERO, |p| p.size);
        let short = self
            .get(symbol, PositionSide::Short)
            .map_or(Decimal::ZERO, |p| p.size);
        (long, short)
    }

    /// Sum of realized PnL over all closed positions.
    #[must_use]
    pub fn total_realized(&self) -> Decimal {
        self.closed.lock().iter().map(|p| p.realized_pnl).sum()
    }

    /// Sum of unrealized PnL over all open positions.
    #[must_use]
    pub fn total_unrealized(&self) -> Decimal {
        self.open.iter().map(|entry| entry.unrealized_pnl).sum()
    }

    /// Number of open positions.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.open.len()
    }
}
