//! Collaborators handed to the safety monitor at construction.

use std::sync::Arc;

use tw_types::{ExchangeGateway, ExecutionService, HealthService, PatternMonitoringService};

use crate::book::PositionBook;
use crate::paper::{PaperExchange, PaperExecutionService, StaticHealthService, StaticPatternMonitor};

/// Everything the safety monitor talks to. The position book is shared with
/// the execution service.
#[derive(Clone)]
pub struct SafetyContext {
    pub execution: Arc<dyn ExecutionService>,
    pub patterns: Arc<dyn PatternMonitoringService>,
    pub health: Arc<dyn HealthService>,
    pub gateway: Arc<dyn ExchangeGateway>,
    pub positions: Arc<PositionBook>,
}

impl SafetyContext {
    /// Fully in-process context. The concrete paper services are returned
    /// alongside so callers can drive them.
    pub fn paper() -> PaperContext {
        let positions = Arc::new(PositionBook::new());
        let exchange = Arc::new(PaperExchange::new());
        let execution = Arc::new(PaperExecutionService::new(positions.clone()));
        let patterns = Arc::new(StaticPatternMonitor::default());
        let health = Arc::new(StaticHealthService::default());

        let context = SafetyContext {
            execution: execution.clone(),
            patterns: patterns.clone(),
            health: health.clone(),
            gateway: exchange.clone(),
            positions,
        };

        PaperContext {
            context,
            exchange,
            execution,
            patterns,
            health,
        }
    }
}

pub struct PaperContext {
    pub context: SafetyContext,
    pub exchange: Arc<PaperExchange>,
    pub execution: Arc<PaperExecutionService>,
    pub patterns: Arc<StaticPatternMonitor>,
    pub health: Arc<StaticHealthService>,
}
