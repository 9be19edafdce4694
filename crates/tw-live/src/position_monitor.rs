//! Stop-loss / take-profit watcher for open positions.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use tw_risk::AlertSink;
use tw_types::{
    AlertCategory, AlertDraft, AlertSeverity, AlertType, ExchangeGateway, ExecutionPosition,
    ExitReason, OrderRequest, PositionError, ServiceError,
};

use crate::book::PositionBook;

pub const POSITION_MONITOR_SOURCE: &str = "position_monitor";

/// Counts from one monitoring pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoringPassSummary {
    /// Open positions at the start of the pass.
    pub checked: usize,
    /// Positions re-marked at a fresh price.
    pub updated: usize,
    /// Positions closed by an exit trigger.
    pub closed: usize,
    /// Positions whose price lookup or exit order failed.
    pub failed: usize,
}

enum CheckOutcome {
    Marked,
    Closed,
    /// Closed by someone else between the snapshot and the check.
    Gone,
    Failed,
}

pub struct PositionMonitor {
    book: Arc<PositionBook>,
    gateway: Arc<dyn ExchangeGateway>,
    alerts: Option<Arc<dyn AlertSink>>,
}

impl PositionMonitor {
    pub fn new(
        book: Arc<PositionBook>,
        gateway: Arc<dyn ExchangeGateway>,
        alerts: Option<Arc<dyn AlertSink>>,
    ) -> Self {
        Self { book, gateway, alerts }
    }

    /// Check every open position concurrently and wait for all of them.
    ///
    /// A failure on one position never affects the others.
    pub async fn monitor_positions(&self) -> MonitoringPassSummary {
        let positions = self.book.active_positions();
        let mut summary = MonitoringPassSummary {
            checked: positions.len(),
            ..Default::default()
        };
        if positions.is_empty() {
            return summary;
        }

        let mut tasks = JoinSet::new();
        for position in positions {
            let checker = PositionCheck {
                book: self.book.clone(),
                gateway: self.gateway.clone(),
                alerts: self.alerts.clone(),
            };
            tasks.spawn(async move { checker.run(position).await });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(CheckOutcome::Marked) => summary.updated += 1,
                Ok(CheckOutcome::Closed) => {
                    summary.updated += 1;
                    summary.closed += 1;
                }
                Ok(CheckOutcome::Gone) => {}
                Ok(CheckOutcome::Failed) => summary.failed += 1,
                Err(e) => {
                    error!(error = %e, "position check task failed");
                    summary.failed += 1;
                }
            }
        }

        debug!(
            checked = summary.checked,
            updated = summary.updated,
            closed = summary.closed,
            failed = summary.failed,
            "position monitoring pass complete"
        );
        summary
    }
}

struct PositionCheck {
    book: Arc<PositionBook>,
    gateway: Arc<dyn ExchangeGateway>,
    alerts: Option<Arc<dyn AlertSink>>,
}

impl PositionCheck {
    async fn run(self, position: ExecutionPosition) -> CheckOutcome {
        let price = match self.gateway.get_ticker_price(&position.symbol).await {
            Ok(price) => price,
            Err(e) => {
                warn!(
                    position_id = %position.id,
                    symbol = %position.symbol,
                    error = %e,
                    "price fetch failed, position left unchanged"
                );
                return CheckOutcome::Failed;
            }
        };

        let marked = match self.book.mark_price(&position.id, price) {
            Ok(marked) => marked,
            Err(_) => {
                debug!(position_id = %position.id, "position closed before it could be marked");
                return CheckOutcome::Gone;
            }
        };

        let Some(reason) = marked.exit_trigger() else {
            return CheckOutcome::Marked;
        };

        info!(
            position_id = %marked.id,
            symbol = %marked.symbol,
            ?reason,
            %price,
            "exit trigger hit"
        );

        let order = OrderRequest::exit(marked.symbol.clone(), marked.side, marked.quantity.abs());
        let ack = match self.gateway.place_order(order).await {
            Ok(ack) => ack,
            Err(e) => {
                error!(
                    position_id = %marked.id,
                    symbol = %marked.symbol,
                    error = %e,
                    "exit order failed"
                );
                self.raise(execution_error_alert(&marked, reason, &e)).await;
                return CheckOutcome::Failed;
            }
        };

        let exit_price = ack.fill_price.unwrap_or(price);
        match self
            .book
            .close(&marked.id, exit_price, reason, Some(ack.order_id.clone()))
        {
            Ok(closed) => {
                self.raise(exit_alert(&closed, reason, exit_price)).await;
                CheckOutcome::Closed
            }
            Err(e) => {
                error!(
                    position_id = %marked.id,
                    order_id = %ack.order_id,
                    error = %e,
                    "exit filled but position was no longer open"
                );
                self.raise(orphaned_exit_alert(&marked, reason, &ack.order_id, exit_price, &e))
                    .await;
                CheckOutcome::Failed
            }
        }
    }

    async fn raise(&self, draft: AlertDraft) {
        if let Some(alerts) = &self.alerts {
            alerts.raise(draft).await;
        }
    }
}

fn exit_alert(position: &ExecutionPosition, reason: ExitReason, exit_price: Decimal) -> AlertDraft {
    let realized = position
        .exit
        .as_ref()
        .map(|exit| exit.realized_pnl)
        .unwrap_or(position.unrealized_pnl);

    let (alert_type, severity, risk_level, title, level) = match reason {
        ExitReason::TakeProfit => (
            AlertType::TakeProfitHit,
            AlertSeverity::Low,
            20,
            "Take-profit triggered",
            position.take_profit_price,
        ),
        _ => (
            AlertType::StopLossHit,
            AlertSeverity::Medium,
            60,
            "Stop-loss triggered",
            position.stop_loss_price,
        ),
    };

    let mut draft = AlertDraft::new(
        alert_type,
        severity,
        AlertCategory::Portfolio,
        title,
        format!(
            "{} {} position {} closed at {} (realized P&L {})",
            position.symbol, position.side, position.id, exit_price, realized
        ),
    )
    .with_risk_level(Decimal::from(risk_level))
    .with_source(POSITION_MONITOR_SOURCE)
    .with_metadata("position_id", &position.id)
    .with_metadata("symbol", &position.symbol)
    .with_metadata("exit_price", exit_price)
    .with_metadata("realized_pnl", realized);

    if let Some(level) = level {
        draft = draft.with_metadata("trigger_price", level);
    }
    if let Some(order_id) = position.exit.as_ref().and_then(|e| e.order_id.as_ref()) {
        draft = draft.with_metadata("order_id", order_id);
    }
    draft
}

fn execution_error_alert(position: &ExecutionPosition, reason: ExitReason, error: &ServiceError) -> AlertDraft {
    AlertDraft::new(
        AlertType::ExecutionError,
        AlertSeverity::High,
        AlertCategory::Api,
        "Exit order failed",
        format!(
            "Could not exit {} position {} on {:?}: {}",
            position.symbol, position.id, reason, error
        ),
    )
    .with_risk_level(Decimal::from(70))
    .with_source(POSITION_MONITOR_SOURCE)
    .with_metadata("position_id", &position.id)
    .with_metadata("symbol", &position.symbol)
    .with_metadata("exit_reason", reason)
    .with_metadata("error", error.to_string())
}

/// The exit order filled but the book no longer held the position, so the
/// fill may have opened unintended exposure on the exchange.
fn orphaned_exit_alert(
    position: &ExecutionPosition,
    reason: ExitReason,
    order_id: &str,
    fill_price: Decimal,
    error: &PositionError,
) -> AlertDraft {
    AlertDraft::new(
        AlertType::ExecutionError,
        AlertSeverity::High,
        AlertCategory::Api,
        "Exit filled for a position no longer open",
        format!(
            "Exit order {} for {} position {} filled at {} but the position could not be closed: {}",
            order_id, position.symbol, position.id, fill_price, error
        ),
    )
    .with_risk_level(Decimal::from(80))
    .with_source(POSITION_MONITOR_SOURCE)
    .with_metadata("position_id", &position.id)
    .with_metadata("symbol", &position.symbol)
    .with_metadata("order_id", order_id)
    .with_metadata("fill_price", fill_price)
    .with_metadata("exit_reason", reason)
    .with_metadata("error", error.to_string())
}
