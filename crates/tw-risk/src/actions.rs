//! Execution of mitigation actions against the execution service.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use tw_types::{ActionResult, ActionType, ExecutionService, SafetyAction};

/// Runs [`SafetyAction`]s and tracks the trading restrictions they impose.
pub struct ActionExecutor {
    execution: Arc<dyn ExecutionService>,
    trading_halted: AtomicBool,
    exposure_limited: AtomicBool,
    circuit_breaker_tripped_at: RwLock<Option<DateTime<Utc>>>,
}

impl ActionExecutor {
    pub fn new(execution: Arc<dyn ExecutionService>) -> Self {
        Self {
            execution,
            trading_halted: AtomicBool::new(false),
            exposure_limited: AtomicBool::new(false),
            circuit_breaker_tripped_at: RwLock::new(None),
        }
    }

    /// Execute `action` once and record its terminal result.
    ///
    /// Already-executed actions are returned unchanged. Failures are recorded
    /// on the action, never raised.
    pub async fn execute(&self, mut action: SafetyAction, reduce_fraction: Decimal) -> SafetyAction {
        if action.executed {
            debug!(action_id = %action.id, "action already executed, skipping");
            return action;
        }

        let (result, details) = match action.action_type {
            ActionType::HaltTrading => match self.execution.stop_execution().await {
                Ok(()) => {
                    self.trading_halted.store(true, Ordering::SeqCst);
                    (ActionResult::Success, "trading halted".to_string())
                }
                Err(e) => (ActionResult::Failed, format!("failed to halt trading: {e}")),
            },
            ActionType::EmergencyClose => match self.execution.emergency_close_all().await {
                Ok(closed) => (ActionResult::Success, format!("closed {closed} positions")),
                Err(e) => (ActionResult::Failed, format!("emergency close failed: {e}")),
            },
            ActionType::ReducePositions => self.reduce_positions(reduce_fraction).await,
            ActionType::LimitExposure => {
                self.exposure_limited.store(true, Ordering::SeqCst);
                (
                    ActionResult::Success,
                    "new exposure limited until restrictions are cleared".to_string(),
                )
            }
            ActionType::NotifyAdmin => {
                warn!(
                    action_id = %action.id,
                    description = %action.description,
                    "ADMIN NOTIFICATION"
                );
                (ActionResult::Success, "administrator notified".to_string())
            }
            ActionType::CircuitBreaker => match self.execution.stop_execution().await {
                Ok(()) => {
                    self.trading_halted.store(true, Ordering::SeqCst);
                    *self.circuit_breaker_tripped_at.write() = Some(Utc::now());
                    (ActionResult::Success, "circuit breaker tripped".to_string())
                }
                Err(e) => (ActionResult::Failed, format!("circuit breaker failed: {e}")),
            },
            ActionType::Unrecognized => (
                ActionResult::Failed,
                "unsupported action type; nothing was executed".to_string(),
            ),
        };

        match result {
            ActionResult::Failed => {
                error!(action_id = %action.id, action = ?action.action_type, %details, "safety action failed")
            }
            _ => {
                info!(action_id = %action.id, action = ?action.action_type, ?result, %details, "safety action executed")
            }
        }

        action.complete(result, details);
        action
    }

    async fn reduce_positions(&self, fraction: Decimal) -> (ActionResult, String) {
        let open = match self.execution.get_active_positions().await {
            Ok(positions) => Some(positions.len()),
            Err(e) => {
                warn!(error = %e, "could not count open positions before reduction");
                None
            }
        };

        match self.execution.reduce_exposure(fraction).await {
            Ok(reduced) => {
                let pct = (fraction * Decimal::ONE_HUNDRED).normalize();
                let details = format!("reduced {reduced} positions by {pct}%");
                match open {
                    Some(open) if reduced < open => (ActionResult::Partial, format!("{details} of {open} open")),
                    _ => (ActionResult::Success, details),
                }
            }
            Err(e) => (ActionResult::Failed, format!("position reduction failed: {e}")),
        }
    }

    pub fn is_trading_halted(&self) -> bool {
        self.trading_halted.load(Ordering::SeqCst)
    }

    pub fn is_exposure_limited(&self) -> bool {
        self.exposure_limited.load(Ordering::SeqCst)
    }

    pub fn circuit_breaker_tripped_at(&self) -> Option<DateTime<Utc>> {
        *self.circuit_breaker_tripped_at.read()
    }

    /// Lift every restriction imposed by previous actions.
    pub fn clear_restrictions(&self) {
        self.trading_halted.store(false, Ordering::SeqCst);
        self.exposure_limited.store(false, Ordering::SeqCst);
        *self.circuit_breaker_tripped_at.write() = None;
        info!("trading restrictions cleared");
    }
}
