use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::errors::PositionError;
use crate::orders::Side;

/// Lifecycle status of an execution position.
///
/// `Active → {PartialFilled → Filled} → Closed`, with `Closed` terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PositionStatus {
    Active,
    PartialFilled,
    Filled,
    Closed,
}

impl PositionStatus {
    pub fn is_open(&self) -> bool {
        !matches!(self, PositionStatus::Closed)
    }

    pub fn can_transition_to(&self, next: PositionStatus) -> bool {
        use PositionStatus::*;
        matches!(
            (self, next),
            (Active, PartialFilled)
                | (Active, Filled)
                | (Active, Closed)
                | (PartialFilled, Filled)
                | (PartialFilled, Closed)
                | (Filled, Closed)
        )
    }
}

impl fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PositionStatus::Active => "ACTIVE",
            PositionStatus::PartialFilled => "PARTIAL_FILLED",
            PositionStatus::Filled => "FILLED",
            PositionStatus::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

/// Why a position was exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    Emergency,
    Manual,
}

/// Pattern-detection match that originated a position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternMatchRef {
    pub pattern_type: String,
    pub confidence: Decimal,
}

/// Execution quality data captured when the position was opened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    pub confidence: Decimal,
    pub execution_latency_ms: u64,
    pub slippage: Decimal,
    pub order_type: String,
}

impl Default for ExecutionMetadata {
    fn default() -> Self {
        Self {
            confidence: Decimal::ZERO,
            execution_latency_ms: 0,
            slippage: Decimal::ZERO,
            order_type: "market".to_string(),
        }
    }
}

/// Exit record attached when a position is closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PositionExit {
    pub price: Decimal,
    pub reason: ExitReason,
    pub order_id: Option<String>,
    pub closed_at: DateTime<Utc>,
    pub realized_pnl: Decimal,
}

/// An open (or historical) position managed by the execution subsystem
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionPosition {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub current_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub unrealized_pnl_pct: Decimal,
    pub stop_loss_price: Option<Decimal>,
    pub take_profit_price: Option<Decimal>,
    pub status: PositionStatus,
    pub entry_time: DateTime<Utc>,
    pub pattern_match: Option<PatternMatchRef>,
    pub metadata: ExecutionMetadata,
    pub exit: Option<PositionExit>,
}

impl ExecutionPosition {
    pub fn new(
        id: impl Into<String>,
        symbol: impl Into<String>,
        side: Side,
        quantity: Decimal,
        entry_price: Decimal,
    ) -> Self {
        Self {
            id: id.into(),
            symbol: symbol.into(),
            side,
            quantity,
            entry_price,
            current_price: entry_price,
            unrealized_pnl: Decimal::ZERO,
            unrealized_pnl_pct: Decimal::ZERO,
            stop_loss_price: None,
            take_profit_price: None,
            status: PositionStatus::Active,
            entry_time: Utc::now(),
            pattern_match: None,
            metadata: ExecutionMetadata::default(),
            exit: None,
        }
    }

    pub fn with_stop_loss(mut self, price: Decimal) -> Self {
        self.stop_loss_price = Some(price);
        self
    }

    pub fn with_take_profit(mut self, price: Decimal) -> Self {
        self.take_profit_price = Some(price);
        self
    }

    pub fn with_pattern(mut self, pattern: PatternMatchRef) -> Self {
        self.pattern_match = Some(pattern);
        self
    }

    pub fn is_open(&self) -> bool {
        self.status.is_open()
    }

    /// Notional value at the current mark.
    pub fn market_value(&self) -> Decimal {
        self.quantity.abs() * self.current_price
    }

    /// Re-mark the position and recompute unrealized P&L (absolute and %).
    pub fn mark_price(&mut self, price: Decimal) {
        self.current_price = price;
        self.unrealized_pnl = (price - self.entry_price) * self.quantity * self.side.sign();

        let cost_basis = self.entry_price * self.quantity;
        self.unrealized_pnl_pct = if cost_basis > Decimal::ZERO {
            self.unrealized_pnl / cost_basis * Decimal::ONE_HUNDRED
        } else {
            Decimal::ZERO
        };
    }

    /// Exit trigger at the current mark, if any. Stop-loss wins over
    /// take-profit when both are crossed.
    pub fn exit_trigger(&self) -> Option<ExitReason> {
        let price = self.current_price;
        let (stop_hit, target_hit) = match self.side {
            Side::Buy => (
                self.stop_loss_price.is_some_and(|stop| price <= stop),
                self.take_profit_price.is_some_and(|target| price >= target),
            ),
            Side::Sell => (
                self.stop_loss_price.is_some_and(|stop| price >= stop),
                self.take_profit_price.is_some_and(|target| price <= target),
            ),
        };

        if stop_hit {
            Some(ExitReason::StopLoss)
        } else if target_hit {
            Some(ExitReason::TakeProfit)
        } else {
            None
        }
    }

    /// Apply a validated status transition.
    pub fn transition(&mut self, next: PositionStatus) -> Result<(), PositionError> {
        if !self.status.can_transition_to(next) {
            return Err(PositionError::InvalidTransition {
                id: self.id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }

    /// Close the position at `price`, realizing the P&L at that mark.
    pub fn close(
        &mut self,
        price: Decimal,
        reason: ExitReason,
        order_id: Option<String>,
    ) -> Result<(), PositionError> {
        self.transition(PositionStatus::Closed)?;
        self.mark_price(price);
        self.exit = Some(PositionExit {
            price,
            reason,
            order_id,
            closed_at: Utc::now(),
            realized_pnl: self.unrealized_pnl,
        });
        Ok(())
    }
}
