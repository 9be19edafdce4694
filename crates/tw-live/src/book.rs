//! Shared book of execution positions.
//!
//! The execution subsystem opens positions here and the position monitor marks
//! and closes them. Closing is the only way into history.

use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info, warn};

use tw_types::{ExecutionPosition, ExitReason, PositionError, PositionStatus};

/// Closed positions kept for lookups and execution reports.
pub const DEFAULT_HISTORY_LIMIT: usize = 1_000;

#[derive(Debug)]
pub struct PositionBook {
    open: RwLock<HashMap<String, ExecutionPosition>>,
    history: RwLock<VecDeque<ExecutionPosition>>,
    history_limit: usize,
}

impl Default for PositionBook {
    fn default() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }
}

impl PositionBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Book that keeps at most `limit` closed positions, dropping the oldest.
    pub fn with_history_limit(limit: usize) -> Self {
        Self {
            open: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::new()),
            history_limit: limit.max(1),
        }
    }

    /// Track a new position. Closed positions cannot be opened.
    pub fn open(&self, position: ExecutionPosition) -> Result<(), PositionError> {
        if !position.is_open() {
            return Err(PositionError::InvalidTransition {
                id: position.id.clone(),
                from: position.status.to_string(),
                to: PositionStatus::Active.to_string(),
            });
        }

        info!(
            position_id = %position.id,
            symbol = %position.symbol,
            side = %position.side,
            quantity = %position.quantity,
            entry = %position.entry_price,
            "position opened"
        );
        self.open.write().insert(position.id.clone(), position);
        Ok(())
    }

    /// Open positions, oldest entry first.
    pub fn active_positions(&self) -> Vec<ExecutionPosition> {
        let mut positions: Vec<ExecutionPosition> = self.open.read().values().cloned().collect();
        positions.sort_by(|a, b| a.entry_time.cmp(&b.entry_time).then_with(|| a.id.cmp(&b.id)));
        positions
    }

    /// Open or closed position by id.
    pub fn get(&self, id: &str) -> Option<ExecutionPosition> {
        if let Some(position) = self.open.read().get(id) {
            return Some(position.clone());
        }
        self.history.read().iter().rev().find(|p| p.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.open.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.read().is_empty()
    }

    /// Move an open position along its fill lifecycle. Closing goes through
    /// [`PositionBook::close`].
    pub fn update_status(&self, id: &str, status: PositionStatus) -> Result<(), PositionError> {
        let mut open = self.open.write();
        let position = open
            .get_mut(id)
            .ok_or_else(|| PositionError::NotFound { id: id.to_string() })?;

        if status == PositionStatus::Closed {
            return Err(PositionError::InvalidTransition {
                id: id.to_string(),
                from: position.status.to_string(),
                to: status.to_string(),
            });
        }
        position.transition(status)
    }

    /// Re-mark an open position. Returns the updated copy.
    pub fn mark_price(&self, id: &str, price: Decimal) -> Result<ExecutionPosition, PositionError> {
        let mut open = self.open.write();
        let position = open
            .get_mut(id)
            .ok_or_else(|| PositionError::NotFound { id: id.to_string() })?;
        position.mark_price(price);
        Ok(position.clone())
    }

    /// Close an open position at `price` and move it into history.
    pub fn close(
        &self,
        id: &str,
        price: Decimal,
        reason: ExitReason,
        order_id: Option<String>,
    ) -> Result<ExecutionPosition, PositionError> {
        let position = {
            let mut open = self.open.write();
            let mut position = open
                .get(id)
                .cloned()
                .ok_or_else(|| PositionError::NotFound { id: id.to_string() })?;
            position.close(price, reason, order_id)?;
            open.remove(id);
            position
        };

        info!(
            position_id = %position.id,
            symbol = %position.symbol,
            ?reason,
            %price,
            realized_pnl = %position.unrealized_pnl,
            "position closed"
        );
        self.archive(vec![position.clone()]);
        Ok(position)
    }

    /// Close every open position at its last mark.
    pub fn close_all(&self, reason: ExitReason) -> Vec<ExecutionPosition> {
        let mut closed = Vec::new();
        {
            let mut open = self.open.write();
            let ids: Vec<String> = open.keys().cloned().collect();
            for id in ids {
                let Some(mut position) = open.get(&id).cloned() else {
                    continue;
                };
                let price = position.current_price;
                match position.close(price, reason, None) {
                    Ok(()) => {
                        open.remove(&id);
                        closed.push(position);
                    }
                    Err(e) => warn!(position_id = %id, error = %e, "position could not be closed"),
                }
            }
        }

        closed.sort_by(|a, b| a.entry_time.cmp(&b.entry_time).then_with(|| a.id.cmp(&b.id)));
        self.archive(closed.clone());
        closed
    }

    /// Shrink every open position by `fraction` of its quantity. Positions
    /// reduced to nothing are closed. Returns how many positions changed.
    pub fn reduce_all(&self, fraction: Decimal) -> usize {
        let fraction = fraction.max(Decimal::ZERO).min(Decimal::ONE);
        if fraction.is_zero() {
            return 0;
        }

        let mut emptied = Vec::new();
        let reduced = {
            let mut open = self.open.write();
            for position in open.values_mut() {
                position.quantity -= position.quantity * fraction;
                let price = position.current_price;
                position.mark_price(price);
                if position.quantity.is_zero() {
                    emptied.push((position.id.clone(), price));
                }
            }
            open.len()
        };

        for (id, price) in emptied {
            if let Err(e) = self.close(&id, price, ExitReason::Manual, None) {
                warn!(position_id = %id, error = %e, "emptied position could not be closed");
            }
        }

        debug!(reduced, %fraction, "open positions reduced");
        reduced
    }

    /// Closed positions in close order, at most the history limit.
    pub fn history(&self) -> Vec<ExecutionPosition> {
        self.history.read().iter().cloned().collect()
    }

    pub fn history_limit(&self) -> usize {
        self.history_limit
    }

    fn archive(&self, closed: Vec<ExecutionPosition>) {
        let mut history = self.history.write();
        history.extend(closed);
        while history.len() > self.history_limit {
            history.pop_front();
        }
    }
}
