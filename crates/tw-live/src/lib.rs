//! Live side of the Tripwire safety monitor.
//!
//! Provides:
//! - A single-task coordinator for periodic safety operations
//! - The shared position book and a stop-loss / take-profit monitor
//! - Paper collaborators for sandbox runs
//! - The [`SafetyMonitor`] facade

pub mod book;
pub mod context;
pub mod coordinator;
pub mod paper;
pub mod position_monitor;
pub mod safety;

pub use book::PositionBook;
pub use context::{PaperContext, SafetyContext};
pub use coordinator::{
    handler_fn, CoordinatorConfig, OperationCoordinator, OperationHandler, OperationStatus,
    ScheduledOperation,
};
pub use paper::{PaperExchange, PaperExecutionService, StaticHealthService, StaticPatternMonitor};
pub use position_monitor::{MonitoringPassSummary, PositionMonitor};
pub use safety::{
    CycleOutcome, MonitoringStats, SafetyMonitor, SafetyMonitoringReport, SafetyStatus,
};
