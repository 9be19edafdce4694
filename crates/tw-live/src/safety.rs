//! The safety monitor facade.
//!
//! [`SafetyMonitor`] wires the risk core, the alert manager, the position
//! monitor and the operation coordinator together and exposes the lifecycle
//! and reporting surface used by operators.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

use tw_risk::{
    AlertManager, AlertPolicy, AlertSink, AlertStats, PolicyBoundSink, RiskMetricsAggregator,
    RiskScoreCalculator, ThresholdEvaluator,
};
use tw_types::{
    ActionResult, ActionType, AlertCategory, AlertDraft, AlertSeverity, AlertType, HealthStatus,
    MonitoringConfig, RiskMetrics, SafetyAction, SafetyAlert, SafetyConfig, SafetyError,
    SafetyResult, SafetyThresholds, SystemHealthReport, Violation,
};

use crate::book::PositionBook;
use crate::context::SafetyContext;
use crate::coordinator::{
    handler_fn, CoordinatorConfig, OperationCoordinator, OperationHandler, OperationStatus,
    ScheduledOperation,
};
use crate::position_monitor::{MonitoringPassSummary, PositionMonitor};

pub const SAFETY_MONITOR_SOURCE: &str = "safety_monitor";

pub const RISK_MONITORING: &str = "risk_monitoring";
pub const POSITION_MONITORING: &str = "position_monitoring";
pub const HEALTH_CHECK: &str = "health_check";
pub const ALERT_CLEANUP: &str = "alert_cleanup";

/// Score at which the report moves from safe to warning.
const WARNING_RISK_SCORE: i64 = 50;

/// Share of a limit at which a recommendation is issued.
fn near_limit_ratio() -> Decimal {
    Decimal::new(8, 1)
}

/// Overall posture shown in the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SafetyStatus {
    Safe,
    Warning,
    Critical,
    Emergency,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MonitoringStats {
    pub cycles_completed: u64,
    pub cycles_failed: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_risk_score: Decimal,
    pub health_checks: u64,
    pub health_check_failures: u64,
    pub position_passes: u64,
    pub positions_closed: u64,
    pub emergency_responses: u64,
    pub alerts: AlertStats,
    pub operations: Vec<OperationStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyMonitoringReport {
    pub status: SafetyStatus,
    pub overall_risk_score: Decimal,
    pub risk_metrics: RiskMetrics,
    pub thresholds: SafetyThresholds,
    pub active_alerts: Vec<SafetyAlert>,
    pub recent_actions: Vec<SafetyAction>,
    pub system_health: Option<SystemHealthReport>,
    pub recommendations: Vec<String>,
    pub monitoring_stats: MonitoringStats,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Result of one risk monitoring cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleOutcome {
    pub metrics: RiskMetrics,
    pub violations: Vec<Violation>,
    pub risk_score: Decimal,
    pub emergency_raised: bool,
}

/// Configuration-dependent part of the monitor. Rebuilt and swapped whole on
/// every configuration change; a cycle sees thresholds and alert policy from
/// the same configuration.
struct RiskCore {
    config: SafetyConfig,
    policy: AlertPolicy,
    aggregator: RiskMetricsAggregator,
    evaluator: ThresholdEvaluator,
}

impl RiskCore {
    fn new(config: SafetyConfig, snapshot: RiskMetrics) -> Self {
        Self {
            policy: AlertPolicy::from_config(&config.alerts),
            aggregator: RiskMetricsAggregator::with_snapshot(config.base_capital, snapshot),
            evaluator: ThresholdEvaluator::new(config.thresholds.clone()),
            config,
        }
    }
}

pub struct SafetyMonitor {
    context: SafetyContext,
    core: RwLock<Arc<RiskCore>>,
    alerts: Arc<AlertManager>,
    position_monitor: PositionMonitor,
    coordinator: Mutex<Option<Arc<OperationCoordinator>>>,
    active: AtomicBool,
    lifecycle: tokio::sync::Mutex<()>,
    stats: Mutex<MonitoringStats>,
    last_health: RwLock<Option<SystemHealthReport>>,
}

impl SafetyMonitor {
    pub fn new(context: SafetyContext, config: SafetyConfig) -> SafetyResult<Arc<Self>> {
        config.validate()?;

        let core = RiskCore::new(config, RiskMetrics::default());
        let alerts = Arc::new(AlertManager::new(core.policy.clone(), context.execution.clone()));
        let position_monitor = PositionMonitor::new(
            context.positions.clone(),
            context.gateway.clone(),
            Some(alerts.clone() as Arc<dyn AlertSink>),
        );

        info!(
            emergency_risk_score = %core.config.emergency_risk_score,
            auto_actions = core.policy.auto_action_enabled,
            "safety monitor initialized"
        );

        Ok(Arc::new(Self {
            context,
            core: RwLock::new(Arc::new(core)),
            alerts,
            position_monitor,
            coordinator: Mutex::new(None),
            active: AtomicBool::new(false),
            lifecycle: tokio::sync::Mutex::new(()),
            stats: Mutex::new(MonitoringStats::default()),
            last_health: RwLock::new(None),
        }))
    }

    fn core(&self) -> Arc<RiskCore> {
        self.core.read().clone()
    }

    pub fn config(&self) -> SafetyConfig {
        self.core().config.clone()
    }

    pub fn alert_manager(&self) -> &Arc<AlertManager> {
        &self.alerts
    }

    pub fn positions(&self) -> &Arc<PositionBook> {
        &self.context.positions
    }

    pub fn is_monitoring(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Register the periodic operations and start the coordinator.
    pub async fn start_monitoring(self: &Arc<Self>) -> SafetyResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if self.active.load(Ordering::SeqCst) {
            return Err(SafetyError::MonitoringAlreadyActive);
        }

        let monitoring = self.core().config.monitoring.clone();
        self.launch_coordinator(&monitoring);
        self.active.store(true, Ordering::SeqCst);

        info!(
            risk_interval_ms = monitoring.risk_check_interval_ms,
            position_interval_ms = monitoring.position_check_interval_ms,
            "safety monitoring started"
        );
        Ok(())
    }

    /// Stop the coordinator, waiting for any operation already in flight.
    pub async fn stop_monitoring(&self) -> SafetyResult<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if !self.active.load(Ordering::SeqCst) {
            return Err(SafetyError::MonitoringNotActive);
        }

        self.shutdown_coordinator().await;
        self.active.store(false, Ordering::SeqCst);
        info!("safety monitoring stopped");
        Ok(())
    }

    fn launch_coordinator(self: &Arc<Self>, monitoring: &MonitoringConfig) {
        let coordinator = Arc::new(OperationCoordinator::new(CoordinatorConfig::from(monitoring)));
        let weak = Arc::downgrade(self);

        coordinator.register(ScheduledOperation::new(
            RISK_MONITORING,
            "Risk monitoring",
            Duration::from_millis(monitoring.risk_check_interval_ms),
            monitor_handler(&weak, |monitor| async move {
                monitor.run_monitoring_cycle().await.map(|_| ())
            }),
        ));
        coordinator.register(ScheduledOperation::new(
            POSITION_MONITORING,
            "Position monitoring",
            Duration::from_millis(monitoring.position_check_interval_ms),
            monitor_handler(&weak, |monitor| async move {
                monitor.run_position_monitoring().await;
                Ok::<(), SafetyError>(())
            }),
        ));
        coordinator.register(ScheduledOperation::new(
            HEALTH_CHECK,
            "System health check",
            Duration::from_millis(monitoring.health_check_interval_ms),
            monitor_handler(&weak, |monitor| async move {
                monitor.run_health_check().await.map(|_| ())
            }),
        ));
        coordinator.register(ScheduledOperation::new(
            ALERT_CLEANUP,
            "Alert cleanup",
            Duration::from_millis(monitoring.alert_cleanup_interval_ms),
            monitor_handler(&weak, |monitor| async move {
                monitor.alerts.cleanup_old_alerts();
                Ok::<(), SafetyError>(())
            }),
        ));

        coordinator.start();
        *self.coordinator.lock() = Some(coordinator);
    }

    async fn shutdown_coordinator(&self) {
        let coordinator = self.coordinator.lock().take();
        let Some(handle) = coordinator.and_then(|c| c.stop()) else {
            return;
        };
        if let Err(e) = handle.await {
            error!(error = %e, "coordinator loop ended abnormally");
        }
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    /// Refresh metrics, evaluate thresholds and score the result.
    pub async fn run_monitoring_cycle(&self) -> SafetyResult<CycleOutcome> {
        let core = self.core();
        let sink = PolicyBoundSink::new(&self.alerts, &core.policy);

        let metrics = match core
            .aggregator
            .update_risk_metrics(self.context.execution.as_ref(), self.context.patterns.as_ref())
            .await
        {
            Ok(metrics) => metrics,
            Err(e) => {
                self.stats.lock().cycles_failed += 1;
                error!(error = %e, "risk metrics update failed, keeping previous snapshot");
                sink.raise(
                    AlertDraft::new(
                        AlertType::SystemFailure,
                        AlertSeverity::High,
                        AlertCategory::System,
                        "Risk metrics update failed",
                        format!("Could not refresh risk metrics: {e}"),
                    )
                    .with_risk_level(Decimal::from(60))
                    .with_source(SAFETY_MONITOR_SOURCE)
                    .with_metadata("error", e.to_string()),
                )
                .await;
                return Err(e.into());
            }
        };

        let violations = core
            .evaluator
            .check_safety_thresholds(&metrics, Some(&sink as &dyn AlertSink))
            .await;
        let risk_score = RiskScoreCalculator::compute(&metrics, core.evaluator.thresholds());

        let emergency_raised = risk_score >= core.config.emergency_risk_score
            && self.raise_emergency_condition(&sink, risk_score).await;

        {
            let mut stats = self.stats.lock();
            stats.cycles_completed += 1;
            stats.last_cycle_at = Some(Utc::now());
            stats.last_risk_score = risk_score;
        }

        if violations.is_empty() {
            info!(%risk_score, "risk monitoring cycle complete");
        } else {
            warn!(%risk_score, violations = violations.len(), "risk monitoring cycle found violations");
        }

        Ok(CycleOutcome {
            metrics,
            violations,
            risk_score,
            emergency_raised,
        })
    }

    /// Raise an emergency-condition alert unless one is still open.
    async fn raise_emergency_condition(&self, sink: &dyn AlertSink, risk_score: Decimal) -> bool {
        let already_open = self.alerts.active_alerts().iter().any(|a| {
            a.alert_type == AlertType::EmergencyCondition && a.source == SAFETY_MONITOR_SOURCE
        });
        if already_open {
            return false;
        }

        sink.raise(
            AlertDraft::new(
                AlertType::EmergencyCondition,
                AlertSeverity::Critical,
                AlertCategory::Portfolio,
                "Overall risk score at emergency level",
                format!("Overall risk score {risk_score} reached the emergency level"),
            )
            .with_risk_level(risk_score)
            .with_source(SAFETY_MONITOR_SOURCE)
            .with_metadata("risk_score", risk_score)
            .with_action(SafetyAction::new(
                ActionType::HaltTrading,
                "Halt trading at emergency risk score",
            ))
            .with_action(SafetyAction::new(
                ActionType::NotifyAdmin,
                "Notify administrator of emergency risk score",
            )),
        )
        .await;
        true
    }

    pub async fn run_position_monitoring(&self) -> MonitoringPassSummary {
        let summary = self.position_monitor.monitor_positions().await;
        let mut stats = self.stats.lock();
        stats.position_passes += 1;
        stats.positions_closed += summary.closed as u64;
        summary
    }

    /// Run a health check and fold memory usage into the metrics.
    pub async fn run_health_check(&self) -> SafetyResult<SystemHealthReport> {
        let report = match self.context.health.perform_system_health_check().await {
            Ok(report) => report,
            Err(e) => {
                self.stats.lock().health_check_failures += 1;
                self.alerts
                    .add_alert(
                        AlertDraft::new(
                            AlertType::SystemFailure,
                            AlertSeverity::High,
                            AlertCategory::System,
                            "Health check failed",
                            format!("System health check could not run: {e}"),
                        )
                        .with_risk_level(Decimal::from(60))
                        .with_source(SAFETY_MONITOR_SOURCE)
                        .with_metadata("error", e.to_string()),
                    )
                    .await;
                return Err(e.into());
            }
        };

        self.core().aggregator.record_system_health(&report);
        *self.last_health.write() = Some(report.clone());
        self.stats.lock().health_checks += 1;

        if !report.is_healthy() {
            let (severity, risk_level) = match report.overall {
                HealthStatus::Degraded => (AlertSeverity::Medium, 40),
                HealthStatus::Critical => (AlertSeverity::High, 75),
                _ => (AlertSeverity::Critical, 90),
            };
            let detail = if report.issues.is_empty() {
                "no details reported".to_string()
            } else {
                report.issues.join("; ")
            };
            self.alerts
                .add_alert(
                    AlertDraft::new(
                        AlertType::SystemFailure,
                        severity,
                        AlertCategory::System,
                        "System health degraded",
                        format!("System health is {:?}: {detail}", report.overall),
                    )
                    .with_risk_level(Decimal::from(risk_level))
                    .with_source(SAFETY_MONITOR_SOURCE)
                    .with_metadata("status", report.overall)
                    .with_metadata("issues", &report.issues),
                )
                .await;
        }

        Ok(report)
    }

    // ------------------------------------------------------------------
    // Reporting
    // ------------------------------------------------------------------

    pub fn get_report(&self) -> SafetyMonitoringReport {
        let core = self.core();
        let metrics = core.aggregator.current_metrics();
        let thresholds = core.config.thresholds.clone();
        let risk_score = RiskScoreCalculator::compute(&metrics, &thresholds);
        let active_alerts = self.alerts.active_alerts();
        let executor = self.alerts.executor();

        let status = if executor.is_trading_halted() {
            SafetyStatus::Emergency
        } else if risk_score >= core.config.emergency_risk_score
            || active_alerts.iter().any(|a| a.severity == AlertSeverity::Critical)
        {
            SafetyStatus::Critical
        } else if risk_score >= Decimal::from(WARNING_RISK_SCORE)
            || active_alerts.iter().any(|a| a.severity == AlertSeverity::High)
        {
            SafetyStatus::Warning
        } else {
            SafetyStatus::Safe
        };

        let mut recommendations = if metrics.is_untouched() {
            Vec::new()
        } else {
            recommendations(&metrics, &thresholds)
        };
        if executor.is_trading_halted() {
            recommendations.push(
                "Trading is halted; review open alerts and clear restrictions before resuming".to_string(),
            );
        } else if executor.is_exposure_limited() {
            recommendations.push("New exposure is limited; rebalance before lifting the limit".to_string());
        }

        let mut monitoring_stats = self.stats.lock().clone();
        monitoring_stats.alerts = self.alerts.stats();
        monitoring_stats.operations = self.operation_status();

        SafetyMonitoringReport {
            status,
            overall_risk_score: risk_score,
            risk_metrics: metrics,
            thresholds,
            active_alerts,
            recent_actions: self.alerts.recent_actions(),
            system_health: self.last_health.read().clone(),
            recommendations,
            monitoring_stats,
            last_updated: core.aggregator.last_updated(),
        }
    }

    pub fn operation_status(&self) -> Vec<OperationStatus> {
        self.coordinator
            .lock()
            .as_ref()
            .map(|c| c.operation_statuses())
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Control
    // ------------------------------------------------------------------

    /// Validate and apply a new configuration. Invalid configurations are
    /// rejected without touching the running one.
    pub async fn update_configuration(self: &Arc<Self>, config: SafetyConfig) -> SafetyResult<()> {
        config.validate()?;
        let _lifecycle = self.lifecycle.lock().await;

        let monitoring = config.monitoring.clone();
        {
            let mut core = self.core.write();
            let next = RiskCore::new(config, core.aggregator.current_metrics());
            self.alerts.set_policy(next.policy.clone());
            *core = Arc::new(next);
        }

        if self.active.load(Ordering::SeqCst) {
            self.shutdown_coordinator().await;
            self.launch_coordinator(&monitoring);
            info!("coordinator restarted with updated intervals");
        }

        info!("safety configuration updated");
        Ok(())
    }

    /// Halt trading, flatten every position and notify an administrator,
    /// regardless of the auto-action setting.
    pub async fn trigger_emergency_response(&self, reason: &str) -> SafetyResult<Vec<SafetyAction>> {
        warn!(%reason, "EMERGENCY RESPONSE TRIGGERED");

        let executed = self
            .alerts
            .execute_actions(vec![
                SafetyAction::new(ActionType::HaltTrading, format!("Emergency halt: {reason}")),
                SafetyAction::new(ActionType::EmergencyClose, "Close all open positions"),
                SafetyAction::new(ActionType::NotifyAdmin, format!("Emergency response: {reason}")),
            ])
            .await;

        let mut draft = AlertDraft::new(
            AlertType::EmergencyCondition,
            AlertSeverity::Critical,
            AlertCategory::System,
            "Emergency response triggered",
            reason.to_string(),
        )
        .with_risk_level(Decimal::ONE_HUNDRED)
        .with_source(SAFETY_MONITOR_SOURCE)
        .with_metadata("reason", reason);
        for action in &executed {
            draft = draft.with_action(action.clone());
        }
        self.alerts.add_alert(draft).await;

        let failed: Vec<&SafetyAction> = executed
            .iter()
            .filter(|a| a.result == Some(ActionResult::Failed))
            .collect();
        if !failed.is_empty() {
            let summary = failed
                .iter()
                .map(|a| format!("{:?}: {}", a.action_type, a.details.as_deref().unwrap_or("no details")))
                .collect::<Vec<_>>()
                .join("; ");
            error!(failed = failed.len(), %summary, "emergency response incomplete");
            self.alerts
                .add_alert(
                    AlertDraft::new(
                        AlertType::SystemFailure,
                        AlertSeverity::Critical,
                        AlertCategory::System,
                        "Emergency response incomplete",
                        format!("{} emergency actions failed: {summary}", failed.len()),
                    )
                    .with_risk_level(Decimal::ONE_HUNDRED)
                    .with_source(SAFETY_MONITOR_SOURCE)
                    .with_metadata("reason", reason),
                )
                .await;
        }

        self.stats.lock().emergency_responses += 1;
        Ok(executed)
    }

    pub fn acknowledge_alert(&self, id: Uuid) -> bool {
        self.alerts.acknowledge_alert(id)
    }

    pub fn clear_acknowledged_alerts(&self) -> usize {
        self.alerts.clear_acknowledged()
    }

    pub fn subscribe_alerts(&self, capacity: usize) -> crossbeam_channel::Receiver<SafetyAlert> {
        self.alerts.subscribe(capacity)
    }

    /// Lift halts, exposure limits and a tripped circuit breaker.
    pub fn clear_trading_restrictions(&self) {
        self.alerts.executor().clear_restrictions();
    }
}

/// Wrap a monitor operation so the scheduled job does not keep the monitor
/// alive.
fn monitor_handler<F, Fut>(monitor: &Weak<SafetyMonitor>, f: F) -> Arc<dyn OperationHandler>
where
    F: Fn(Arc<SafetyMonitor>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SafetyResult<()>> + Send + 'static,
{
    let monitor = monitor.clone();
    handler_fn(move || {
        let pending = monitor.upgrade().map(&f);
        async move {
            match pending {
                Some(run) => run.await,
                None => Ok(()),
            }
        }
    })
}

fn near_ceiling(value: Decimal, limit: Decimal) -> bool {
    value >= limit * near_limit_ratio()
}

/// Floors are "near" once 80% of the headroom between 100 and the floor is
/// used up.
fn near_floor(value: Decimal, floor: Decimal) -> bool {
    Decimal::ONE_HUNDRED - value >= (Decimal::ONE_HUNDRED - floor) * near_limit_ratio()
}

fn recommendations(m: &RiskMetrics, t: &SafetyThresholds) -> Vec<String> {
    let mut out = Vec::new();

    if near_ceiling(m.current_drawdown, t.max_drawdown_pct) {
        out.push(format!(
            "Drawdown {}% is near the {}% limit; reduce position sizes",
            m.current_drawdown.round_dp(2),
            t.max_drawdown_pct
        ));
    }
    if near_floor(m.success_rate, t.min_success_rate_pct) {
        out.push(format!(
            "Success rate {}% is near the {}% floor; review strategy performance",
            m.success_rate.round_dp(2),
            t.min_success_rate_pct
        ));
    }
    if near_ceiling(Decimal::from(m.consecutive_losses), Decimal::from(t.max_consecutive_losses)) {
        out.push(format!(
            "{} consecutive losses; pause the strategy and review recent signals",
            m.consecutive_losses
        ));
    }
    if near_ceiling(Decimal::from(m.api_latency_ms), Decimal::from(t.max_api_latency_ms)) {
        out.push(format!(
            "API latency {}ms is near the {}ms limit; check exchange connectivity",
            m.api_latency_ms, t.max_api_latency_ms
        ));
    }
    if near_ceiling(m.concentration_risk, t.max_concentration_pct) {
        out.push(format!(
            "Largest position is {}% of the portfolio; diversify across symbols",
            m.concentration_risk.round_dp(2)
        ));
    }
    if near_floor(m.api_success_rate, t.min_api_success_rate_pct) {
        out.push(format!(
            "API success rate {}% is near the {}% floor; check exchange status",
            m.api_success_rate.round_dp(2),
            t.min_api_success_rate_pct
        ));
    }
    if near_ceiling(m.memory_usage_pct, t.max_memory_usage_pct) {
        out.push(format!(
            "Memory usage {}% is high; restart or scale the service",
            m.memory_usage_pct.round_dp(2)
        ));
    }
    if near_floor(m.pattern_accuracy, t.min_pattern_accuracy_pct) {
        out.push(format!(
            "Pattern accuracy {}% is near the {}% floor; recalibrate detection",
            m.pattern_accuracy.round_dp(2),
            t.min_pattern_accuracy_pct
        ));
    }
    if near_ceiling(m.false_positive_rate, t.max_false_positive_rate_pct) {
        out.push(format!(
            "Pattern false-positive rate {}% is high; retune detection thresholds",
            m.false_positive_rate.round_dp(2)
        ));
    }
    if near_ceiling(m.average_slippage, t.max_average_slippage_pct) {
        out.push(format!(
            "Average slippage {}% is high; prefer limit orders or smaller sizes",
            m.average_slippage.round_dp(2)
        ));
    }

    out
}
