//! Risk core for the Tripwire safety monitor.
//!
//! Provides:
//! - Risk metric aggregation from execution and pattern telemetry
//! - A weighted composite risk score
//! - Threshold evaluation with per-breach alerts
//! - Alert lifecycle and automatic mitigation actions

pub mod actions;
pub mod alerts;
pub mod metrics;
pub mod thresholds;

#[cfg(test)]
mod testing;

pub use actions::ActionExecutor;
pub use alerts::{AlertManager, AlertPolicy, AlertSink, AlertStats, PolicyBoundSink};
pub use metrics::{RiskMetricsAggregator, RiskScoreCalculator};
pub use thresholds::{ThresholdEvaluator, CORE_MONITORING_SOURCE};
