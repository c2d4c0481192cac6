// =============================================================================
// Position Book — owns every open and closed position record
// =============================================================================
//
// Life-cycle:
//   open -> partial closes as take-profit levels fill -> full close
//
// Invariants:
//   - sum of take-profit sizePercent <= 100 (validated at open)
//   - quantity only ever decreases after open
//   - closing stamps closed_at / closure_reason / closure_pnl exactly once
//
// Thread-safety: all mutable state is behind `parking_lot::RwLock`.
// =============================================================================

use anyhow::Result;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::types::Side;

// ---------------------------------------------------------------------------
// Position model
// ---------------------------------------------------------------------------

/// A single take-profit level attached to a position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TakeProfit {
    /// 1-based level (TP1, TP2, TP3...).
    pub level: u8,
    /// Fraction of the *initial* quantity closed when this level fills.
    pub size_percent: f64,
    pub price: f64,
    #[serde(default)]
    pub hit: bool,
}

/// A tracked position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Unique identifier (UUID v4).
    pub position_id: String,
    pub symbol: String,
    pub side: Side,
    /// Remaining open quantity (reduced on partial close).
    pub quantity: f64,
    /// Quantity at open; basis for take-profit sizing.
    pub initial_quantity: f64,
    pub entry_price: f64,
    /// UNIX-epoch milliseconds at open; basis for holding-time checks.
    pub entry_time_ms: u64,
    #[serde(default)]
    pub current_price: f64,
    #[serde(default)]
    pub unrealized_pnl: f64,
    #[serde(default)]
    pub unrealized_pnl_pct: f64,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profits: Vec<TakeProfit>,
    /// Realised PnL accumulated from partial closes.
    #[serde(default)]
    pub realized_pnl: f64,
    pub opened_at: String,
    #[serde(default)]
    pub closed_at: Option<String>,
    #[serde(default)]
    pub closure_reason: Option<String>,
    #[serde(default)]
    pub closure_pnl: Option<f64>,
}

/// Everything required to open a position.
#[derive(Debug, Clone)]
pub struct PositionSpec {
    pub symbol: String,
    pub side: Side,
    pub quantity: f64,
    pub entry_price: f64,
    pub entry_time_ms: u64,
    pub stop_loss: Option<f64>,
    pub take_profits: Vec<TakeProfit>,
}

// ---------------------------------------------------------------------------
// Position Book
// ---------------------------------------------------------------------------

/// Thread-safe book that owns the lists of open and closed positions.
pub struct PositionBook {
    open: RwLock<Vec<Position>>,
    closed: RwLock<Vec<Position>>,
}

impl PositionBook {
    pub fn new() -> Self {
        Self {
            open: RwLock::new(Vec::new()),
            closed: RwLock::new(Vec::new()),
        }
    }

    // -------------------------------------------------------------------------
    // Open
    // -------------------------------------------------------------------------

    /// Validate and open a new position, returning its id.
    pub fn open_position(&self, spec: PositionSpec) -> Result<String> {
        if spec.quantity <= 0.0 {
            anyhow::bail!("quantity must be positive, got {}", spec.quantity);
        }
        if spec.entry_price <= 0.0 {
            anyhow::bail!("entry price must be positive, got {}", spec.entry_price);
        }
        let tp_total: f64 = spec.take_profits.iter().map(|tp| tp.size_percent).sum();
        if tp_total > 100.0 {
            anyhow::bail!("take-profit size percents sum to {tp_total}, exceeding 100");
        }

        let position_id = Uuid::new_v4().to_string();
        let pos = Position {
            position_id: position_id.clone(),
            symbol: spec.symbol.clone(),
            side: spec.side,
            quantity: spec.quantity,
            initial_quantity: spec.quantity,
            entry_price: spec.entry_price,
            entry_time_ms: spec.entry_time_ms,
            current_price: spec.entry_price,
            unrealized_pnl: 0.0,
            unrealized_pnl_pct: 0.0,
            stop_loss: spec.stop_loss,
            take_profits: spec.take_profits,
            realized_pnl: 0.0,
            opened_at: Utc::now().to_rfc3339(),
            closed_at: None,
            closure_reason: None,
            closure_pnl: None,
        };

        info!(
            position_id = %position_id,
            symbol = %spec.symbol,
            side = %spec.side,
            entry_price = spec.entry_price,
            quantity = spec.quantity,
            "position opened"
        );

        self.open.write().push(pos);
        Ok(position_id)
    }

    /// Insert an already-built position (state recovery path). Closed
    /// positions are ignored with a warning.
    pub fn restore(&self, pos: Position) {
        if pos.closed_at.is_some() {
            warn!(position_id = %pos.position_id, "refusing to restore a closed position");
            return;
        }
        info!(position_id = %pos.position_id, symbol = %pos.symbol, "position restored");
        self.open.write().push(pos);
    }

    // -------------------------------------------------------------------------
    // Price updates
    // -------------------------------------------------------------------------

    /// Update `current_price` for every open position on `symbol` and
    /// recompute unrealised PnL.
    pub fn update_price(&self, symbol: &str, current_price: f64) {
        let mut positions = self.open.write();
        for pos in positions.iter_mut().filter(|p| p.symbol == symbol) {
            pos.current_price = current_price;
            let sign = pos.side.sign();
            pos.unrealized_pnl = sign * (current_price - pos.entry_price) * pos.quantity;
            pos.unrealized_pnl_pct = if pos.entry_price > 0.0 {
                sign * ((current_price - pos.entry_price) / pos.entry_price) * 100.0
            } else {
                0.0
            };
        }
    }

    // -------------------------------------------------------------------------
    // Take-profit fills
    // -------------------------------------------------------------------------

    /// Record a take-profit fill: marks the level hit, reduces the remaining
    /// quantity by its share of the initial quantity, and accumulates
    /// realised PnL. Returns the realised PnL of the partial close, or `None`
    /// if the position or level is unknown or already hit.
    pub fn apply_take_profit(
        &self,
        position_id: &str,
        level: u8,
        fill_price: f64,
    ) -> Option<f64> {
        let mut positions = self.open.write();
        let pos = positions.iter_mut().find(|p| p.position_id == position_id)?;

        let tp = pos
            .take_profits
            .iter_mut()
            .find(|tp| tp.level == level && !tp.hit)?;
        tp.hit = true;
        let size_percent = tp.size_percent;

        let close_qty = (pos.initial_quantity * size_percent / 100.0).min(pos.quantity);
        let partial_pnl = pos.side.sign() * (fill_price - pos.entry_price) * close_qty;

        pos.quantity -= close_qty;
        pos.realized_pnl += partial_pnl;

        info!(
            position_id = %position_id,
            level,
            close_qty,
            remaining_qty = pos.quantity,
            partial_pnl,
            "take-profit fill applied"
        );

        Some(partial_pnl)
    }

    // -------------------------------------------------------------------------
    // Close
    // -------------------------------------------------------------------------

    /// Close a position and move it to the closed list. Returns the total
    /// realised PnL (partial + final), or `None` if no matching open
    /// position exists.
    pub fn close_position(&self, position_id: &str, reason: &str, close_price: f64) -> Option<f64> {
        let mut open = self.open.write();
        let idx = open.iter().position(|p| p.position_id == position_id)?;
        let mut pos = open.remove(idx);
        drop(open);

        let final_pnl = pos.side.sign() * (close_price - pos.entry_price) * pos.quantity;
        pos.realized_pnl += final_pnl;
        pos.quantity = 0.0;
        pos.current_price = close_price;
        pos.unrealized_pnl = 0.0;
        pos.unrealized_pnl_pct = 0.0;
        pos.closed_at = Some(Utc::now().to_rfc3339());
        pos.closure_reason = Some(reason.to_string());
        pos.closure_pnl = Some(pos.realized_pnl);

        let total_pnl = pos.realized_pnl;

        info!(
            position_id = %position_id,
            reason,
            close_price,
            realized_pnl = total_pnl,
            "position closed"
        );

        self.closed.write().push(pos);
        Some(total_pnl)
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    /// Snapshot of all currently open positions.
    pub fn get_open_positions(&self) -> Vec<Position> {
        self.open.read().clone()
    }

    /// Snapshot of one open position by id.
    pub fn get_position(&self, position_id: &str) -> Option<Position> {
        self.open
            .read()
            .iter()
            .find(|p| p.position_id == position_id)
            .cloned()
    }

    /// The most recent `count` closed positions (newest first).
    pub fn get_closed_positions(&self, count: usize) -> Vec<Position> {
        let closed = self.closed.read();
        closed.iter().rev().take(count).cloned().collect()
    }

    pub fn open_count(&self) -> usize {
        self.open.read().len()
    }
}

impl Default for PositionBook {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for PositionBook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PositionBook")
            .field("open_positions", &self.open.read().len())
            .field("closed_positions", &self.closed.read().len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    pub(crate) fn spec_with_tps(symbol: &str, side: Side, tps: Vec<TakeProfit>) -> PositionSpec {
        PositionSpec {
            symbol: symbol.into(),
            side,
            quantity: 10.0,
            entry_price: 100.0,
            entry_time_ms: 1_700_000_000_000,
            stop_loss: Some(95.0),
            take_profits: tps,
        }
    }

    fn tp(level: u8, size_percent: f64, price: f64) -> TakeProfit {
        TakeProfit {
            level,
            size_percent,
            price,
            hit: false,
        }
    }

    #[test]
    fn open_rejects_invalid_specs() {
        let book = PositionBook::new();

        let mut bad_qty = spec_with_tps("BTCUSDT", Side::Long, vec![]);
        bad_qty.quantity = 0.0;
        assert!(book.open_position(bad_qty).is_err());

        let mut bad_price = spec_with_tps("BTCUSDT", Side::Long, vec![]);
        bad_price.entry_price = -1.0;
        assert!(book.open_position(bad_price).is_err());

        let oversized = spec_with_tps(
            "BTCUSDT",
            Side::Long,
            vec![tp(1, 60.0, 102.0), tp(2, 50.0, 104.0)],
        );
        assert!(book.open_position(oversized).is_err());
        assert_eq!(book.open_count(), 0);
    }

    #[test]
    fn quantity_decreases_monotonically_as_tps_hit() {
        let book = PositionBook::new();
        let id = book
            .open_position(spec_with_tps(
                "BTCUSDT",
                Side::Long,
                vec![tp(1, 40.0, 102.0), tp(2, 30.0, 104.0), tp(3, 30.0, 106.0)],
            ))
            .unwrap();

        let pnl1 = book.apply_take_profit(&id, 1, 102.0).unwrap();
        assert!((pnl1 - 8.0).abs() < 1e-9); // 4 units * +2
        assert!((book.get_position(&id).unwrap().quantity - 6.0).abs() < 1e-9);

        let pnl2 = book.apply_take_profit(&id, 2, 104.0).unwrap();
        assert!((pnl2 - 12.0).abs() < 1e-9); // 3 units * +4
        assert!((book.get_position(&id).unwrap().quantity - 3.0).abs() < 1e-9);

        // A level never fills twice.
        assert!(book.apply_take_profit(&id, 2, 105.0).is_none());
    }

    #[test]
    fn close_stamps_closure_fields_and_accumulates_pnl() {
        let book = PositionBook::new();
        let id = book
            .open_position(spec_with_tps("ETHUSDT", Side::Long, vec![tp(1, 50.0, 110.0)]))
            .unwrap();

        book.apply_take_profit(&id, 1, 110.0).unwrap(); // 5 * +10 = 50
        let total = book.close_position(&id, "StopLoss", 98.0).unwrap();
        // Remaining 5 units closed at -2 => -10; total = 40.
        assert!((total - 40.0).abs() < 1e-9);

        assert!(book.get_position(&id).is_none());
        let closed = &book.get_closed_positions(1)[0];
        assert!(closed.closed_at.is_some());
        assert_eq!(closed.closure_reason.as_deref(), Some("StopLoss"));
        assert!((closed.closure_pnl.unwrap() - 40.0).abs() < 1e-9);
        assert_eq!(closed.quantity, 0.0);
    }

    #[test]
    fn short_position_pnl_signs() {
        let book = PositionBook::new();
        let id = book
            .open_position(spec_with_tps("SOLUSDT", Side::Short, vec![]))
            .unwrap();

        book.update_price("SOLUSDT", 90.0);
        let pos = book.get_position(&id).unwrap();
        assert!((pos.unrealized_pnl - 100.0).abs() < 1e-9); // 10 units * +10
        assert!((pos.unrealized_pnl_pct - 10.0).abs() < 1e-9);

        let total = book.close_position(&id, "TakeProfit", 90.0).unwrap();
        assert!((total - 100.0).abs() < 1e-9);
    }

    #[test]
    fn close_unknown_position_returns_none() {
        let book = PositionBook::new();
        assert!(book.close_position("nope", "Manual", 100.0).is_none());
    }
}
