//! Risk metrics aggregation and scoring.
//!
//! [`RiskMetricsAggregator`] pulls the execution and pattern-monitoring
//! reports and folds them into a [`RiskMetrics`] snapshot.
//! [`RiskScoreCalculator`] turns a snapshot into a single 0–100 score.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::time::Instant;
use tracing::debug;

use tw_types::{
    ExecutionPosition, ExecutionReport, ExecutionService, PatternMonitoringReport,
    PatternMonitoringService, RiskMetrics, SafetyThresholds, ServiceResult, SystemHealthReport,
};

/// Notional assigned to every open position when computing total exposure.
///
/// This is a stand-in for a real sizing model, kept so the exposure figure
/// stays comparable with existing dashboards.
pub const PLACEHOLDER_POSITION_VALUE: i64 = 100;

/// Capital the portfolio value is measured against when none is configured.
pub const DEFAULT_BASE_CAPITAL: i64 = 10_000;

#[derive(Debug, Default)]
struct AggregatorState {
    metrics: RiskMetrics,
    last_updated: Option<DateTime<Utc>>,
    updates: u64,
}

/// Owns the live [`RiskMetrics`] snapshot. Readers always receive a copy.
#[derive(Debug)]
pub struct RiskMetricsAggregator {
    base_capital: Decimal,
    state: RwLock<AggregatorState>,
}

impl Default for RiskMetricsAggregator {
    fn default() -> Self {
        Self::new(Decimal::from(DEFAULT_BASE_CAPITAL))
    }
}

impl RiskMetricsAggregator {
    pub fn new(base_capital: Decimal) -> Self {
        Self::with_snapshot(base_capital, RiskMetrics::default())
    }

    /// Start from an existing snapshot, e.g. when the risk core is rebuilt
    /// after a configuration change.
    pub fn with_snapshot(base_capital: Decimal, metrics: RiskMetrics) -> Self {
        Self {
            base_capital,
            state: RwLock::new(AggregatorState {
                metrics,
                ..Default::default()
            }),
        }
    }

    /// Fetch both reports concurrently and replace the snapshot.
    ///
    /// If either fetch fails the previous snapshot is left untouched and the
    /// error is returned.
    pub async fn update_risk_metrics(
        &self,
        execution: &dyn ExecutionService,
        patterns: &dyn PatternMonitoringService,
    ) -> ServiceResult<RiskMetrics> {
        let started = Instant::now();
        let (execution_report, pattern_report) = tokio::try_join!(
            execution.get_execution_report(),
            patterns.get_monitoring_report()
        )?;
        let latency_ms = started.elapsed().as_millis() as u64;

        let mut state = self.state.write();
        let metrics = Self::derive(
            &execution_report,
            &pattern_report,
            latency_ms,
            state.metrics.memory_usage_pct,
            self.base_capital,
        );
        state.metrics = metrics.clone();
        state.last_updated = Some(Utc::now());
        state.updates += 1;

        debug!(
            drawdown = %metrics.current_drawdown,
            success_rate = %metrics.success_rate,
            concentration = %metrics.concentration_risk,
            consecutive_losses = metrics.consecutive_losses,
            latency_ms,
            "risk metrics updated"
        );
        Ok(metrics)
    }

    /// Build a snapshot from collaborator reports.
    pub fn derive(
        execution: &ExecutionReport,
        patterns: &PatternMonitoringReport,
        api_latency_ms: u64,
        memory_usage_pct: Decimal,
        base_capital: Decimal,
    ) -> RiskMetrics {
        let stats = &execution.stats;
        let pattern_stats = &patterns.stats;
        let position_count = Decimal::from(execution.active_positions.len() as u64);

        RiskMetrics {
            current_drawdown: stats.current_drawdown,
            max_drawdown: stats.max_drawdown,
            portfolio_value: stats.total_pnl + base_capital,
            total_exposure: position_count * Decimal::from(PLACEHOLDER_POSITION_VALUE),
            concentration_risk: Self::concentration_risk(&execution.active_positions),
            success_rate: stats.success_rate,
            consecutive_losses: Self::consecutive_losses(&execution.recent_executions),
            average_slippage: stats.average_slippage,
            api_latency_ms,
            api_success_rate: if execution.system_health.api_connection {
                Decimal::ONE_HUNDRED
            } else {
                Decimal::ZERO
            },
            memory_usage_pct,
            pattern_accuracy: pattern_stats.average_confidence,
            detection_failures: pattern_stats.consecutive_errors,
            false_positive_rate: Self::false_positive_rate(
                pattern_stats.consecutive_errors,
                pattern_stats.total_patterns_detected,
            ),
        }
        .clamped()
    }

    /// Largest single-symbol share of total position value, in percent.
    pub fn concentration_risk(positions: &[ExecutionPosition]) -> Decimal {
        let mut by_symbol: HashMap<&str, Decimal> = HashMap::new();
        for pos in positions {
            *by_symbol.entry(pos.symbol.as_str()).or_default() += pos.market_value();
        }

        let total: Decimal = by_symbol.values().copied().sum();
        if total <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let largest = by_symbol.values().copied().max().unwrap_or_default();
        largest / total * Decimal::ONE_HUNDRED
    }

    /// Losing trades at the newest end of `trades` (ordered oldest → newest).
    pub fn consecutive_losses(trades: &[ExecutionPosition]) -> u32 {
        trades
            .iter()
            .rev()
            .take_while(|trade| trade.unrealized_pnl < Decimal::ZERO)
            .count() as u32
    }

    pub fn false_positive_rate(failures: u32, total_detected: u64) -> Decimal {
        if total_detected == 0 {
            return Decimal::ZERO;
        }
        Decimal::from(failures) / Decimal::from(total_detected) * Decimal::ONE_HUNDRED
    }

    /// Fold the latest health-check result into the snapshot.
    pub fn record_system_health(&self, report: &SystemHealthReport) {
        if let Some(memory) = report.memory_usage_pct {
            let mut state = self.state.write();
            let mut metrics = state.metrics.clone();
            metrics.memory_usage_pct = memory;
            state.metrics = metrics.clamped();
        }
    }

    pub fn current_metrics(&self) -> RiskMetrics {
        self.state.read().metrics.clone()
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.state.read().last_updated
    }

    pub fn updates_performed(&self) -> u64 {
        self.state.read().updates
    }

    pub fn base_capital(&self) -> Decimal {
        self.base_capital
    }

    /// Score the current snapshot against `thresholds`.
    pub fn calculate_overall_risk_score(&self, thresholds: &SafetyThresholds) -> Decimal {
        RiskScoreCalculator::compute(&self.current_metrics(), thresholds)
    }
}

// Weights of the individual score drivers; they sum to 100.
const WEIGHT_DRAWDOWN: i64 = 25;
const WEIGHT_SUCCESS_RATE: i64 = 20;
const WEIGHT_CONSECUTIVE_LOSSES: i64 = 15;
const WEIGHT_CONCENTRATION: i64 = 15;
const WEIGHT_API_LATENCY: i64 = 10;
const WEIGHT_PATTERN_ACCURACY: i64 = 10;
const WEIGHT_MEMORY: i64 = 5;

/// Stateless calculator for the composite 0–100 risk score.
pub struct RiskScoreCalculator;

impl RiskScoreCalculator {
    pub fn compute(metrics: &RiskMetrics, thresholds: &SafetyThresholds) -> Decimal {
        if metrics.is_untouched() {
            return Decimal::ZERO;
        }

        let score = Self::ceiling_term(
            metrics.current_drawdown,
            thresholds.max_drawdown_pct,
            WEIGHT_DRAWDOWN,
        ) + Self::floor_term(
            metrics.success_rate,
            thresholds.min_success_rate_pct,
            WEIGHT_SUCCESS_RATE,
        ) + Self::ceiling_term(
            Decimal::from(metrics.consecutive_losses),
            Decimal::from(thresholds.max_consecutive_losses),
            WEIGHT_CONSECUTIVE_LOSSES,
        ) + Self::ceiling_term(
            metrics.concentration_risk,
            thresholds.max_concentration_pct,
            WEIGHT_CONCENTRATION,
        ) + Self::ceiling_term(
            Decimal::from(metrics.api_latency_ms),
            Decimal::from(thresholds.max_api_latency_ms),
            WEIGHT_API_LATENCY,
        ) + Self::floor_term(
            metrics.pattern_accuracy,
            thresholds.min_pattern_accuracy_pct,
            WEIGHT_PATTERN_ACCURACY,
        ) + Self::ceiling_term(
            metrics.memory_usage_pct,
            thresholds.max_memory_usage_pct,
            WEIGHT_MEMORY,
        );

        score
            .max(Decimal::ZERO)
            .min(Decimal::ONE_HUNDRED)
            .round_dp(2)
    }

    /// `metric / limit × weight` for lower-is-better metrics.
    fn ceiling_term(metric: Decimal, limit: Decimal, weight: i64) -> Decimal {
        if limit <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        metric / limit * Decimal::from(weight)
    }

    /// `limit / metric × weight` for higher-is-better metrics, capped at the
    /// weight. A metric at or below the floor (zero included) saturates it.
    fn floor_term(metric: Decimal, limit: Decimal, weight: i64) -> Decimal {
        let ratio = limit / metric.max(Decimal::ONE);
        ratio.min(Decimal::ONE) * Decimal::from(weight)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{position, trade, StubExecution, StubPatterns};
    use rust_decimal_macros::dec;
    use tw_types::{ExecutionStats, PatternStats, ServiceError};

    #[test]
    fn untouched_metrics_score_zero() {
        let score = RiskScoreCalculator::compute(&RiskMetrics::default(), &SafetyThresholds::default());
        assert_eq!(score, dec!(0));
    }

    #[test]
    fn score_sums_weighted_terms() {
        let thresholds = SafetyThresholds::default();
        let metrics = RiskMetrics {
            current_drawdown: dec!(7.5),      // 7.5/15 × 25 = 12.5
            success_rate: dec!(60),           // 60/60 × 20 = 20
            consecutive_losses: 1,            // 1/5 × 15 = 3
            concentration_risk: dec!(20),     // 20/40 × 15 = 7.5
            api_latency_ms: 500,              // 500/1000 × 10 = 5
            pattern_accuracy: dec!(65),       // 65/65 × 10 = 10
            memory_usage_pct: dec!(42.5),     // 42.5/85 × 5 = 2.5
            ..Default::default()
        };
        assert_eq!(RiskScoreCalculator::compute(&metrics, &thresholds), dec!(60.5));
    }

    #[test]
    fn score_is_clamped_to_one_hundred() {
        let metrics = RiskMetrics {
            current_drawdown: dec!(60),
            consecutive_losses: 12,
            ..Default::default()
        };
        assert_eq!(
            RiskScoreCalculator::compute(&metrics, &SafetyThresholds::default()),
            dec!(100)
        );
    }

    #[test]
    fn missing_pattern_data_stays_below_emergency() {
        let thresholds = SafetyThresholds::default();
        let metrics = RiskMetrics {
            current_drawdown: dec!(1),   // 1/15 × 25 ≈ 1.67
            success_rate: dec!(75),      // 60/75 × 20 = 16
            api_latency_ms: 40,          // 40/1000 × 10 = 0.4
            pattern_accuracy: dec!(0),   // capped at the full weight of 10
            ..Default::default()
        };

        let score = RiskScoreCalculator::compute(&metrics, &thresholds);
        assert_eq!(score, dec!(28.07));
        assert!(score < dec!(80));
    }

    #[test]
    fn floor_terms_never_exceed_their_weight() {
        let thresholds = SafetyThresholds::default();
        let metrics = RiskMetrics {
            api_latency_ms: 1,
            success_rate: dec!(0),
            pattern_accuracy: dec!(0),
            ..Default::default()
        };
        // 20 + 10 for the saturated floors, 0.01 for latency.
        assert_eq!(RiskScoreCalculator::compute(&metrics, &thresholds), dec!(30.01));
    }

    #[test]
    fn concentration_is_largest_symbol_share() {
        let positions = vec![
            position("BTCUSDT", dec!(0.1), dec!(45000)),
            position("ETHUSDT", dec!(2), dec!(3000)),
        ];
        let concentration = RiskMetricsAggregator::concentration_risk(&positions);
        assert_eq!(concentration.round_dp(2), dec!(57.14));
    }

    #[test]
    fn concentration_groups_by_symbol() {
        let positions = vec![
            position("BTCUSDT", dec!(1), dec!(100)),
            position("BTCUSDT", dec!(1), dec!(100)),
            position("ETHUSDT", dec!(2), dec!(100)),
        ];
        assert_eq!(RiskMetricsAggregator::concentration_risk(&positions), dec!(50));
        assert_eq!(RiskMetricsAggregator::concentration_risk(&[]), dec!(0));
    }

    #[test]
    fn consecutive_losses_counts_from_newest() {
        let winning_tail = [trade(dec!(-100)), trade(dec!(-50)), trade(dec!(-25)), trade(dec!(15))];
        assert_eq!(RiskMetricsAggregator::consecutive_losses(&winning_tail), 0);

        let losing_tail = [trade(dec!(15)), trade(dec!(-100)), trade(dec!(-50))];
        assert_eq!(RiskMetricsAggregator::consecutive_losses(&losing_tail), 2);

        let breakeven_breaks = [trade(dec!(-10)), trade(dec!(0)), trade(dec!(-5))];
        assert_eq!(RiskMetricsAggregator::consecutive_losses(&breakeven_breaks), 1);
    }

    #[test]
    fn false_positive_rate_guards_division() {
        assert_eq!(RiskMetricsAggregator::false_positive_rate(3, 0), dec!(0));
        assert_eq!(RiskMetricsAggregator::false_positive_rate(3, 12), dec!(25));
    }

    #[tokio::test]
    async fn update_populates_snapshot() {
        let execution = StubExecution::with_report(ExecutionReport {
            stats: ExecutionStats {
                current_drawdown: dec!(4),
                max_drawdown: dec!(9),
                success_rate: dec!(72),
                average_slippage: dec!(0.1),
                total_pnl: dec!(-250),
            },
            active_positions: vec![
                position("BTCUSDT", dec!(0.1), dec!(45000)),
                position("ETHUSDT", dec!(2), dec!(3000)),
            ],
            recent_executions: vec![trade(dec!(10)), trade(dec!(-5)), trade(dec!(-8))],
            ..Default::default()
        });
        let patterns = StubPatterns::new(PatternMonitoringReport {
            status: "running".into(),
            stats: PatternStats {
                average_confidence: dec!(81),
                consecutive_errors: 2,
                total_patterns_detected: 40,
            },
        });

        let aggregator = RiskMetricsAggregator::default();
        let metrics = aggregator
            .update_risk_metrics(&execution, &patterns)
            .await
            .unwrap();

        assert_eq!(metrics.portfolio_value, dec!(9750));
        assert_eq!(metrics.total_exposure, dec!(200));
        assert_eq!(metrics.consecutive_losses, 2);
        assert_eq!(metrics.pattern_accuracy, dec!(81));
        assert_eq!(metrics.detection_failures, 2);
        assert_eq!(metrics.false_positive_rate, dec!(5));
        assert_eq!(metrics.api_success_rate, dec!(100));
        assert_eq!(aggregator.current_metrics(), metrics);
        assert_eq!(aggregator.updates_performed(), 1);
        assert!(aggregator.last_updated().is_some());
    }

    #[tokio::test]
    async fn failed_fetch_keeps_previous_snapshot() {
        let previous = RiskMetrics {
            current_drawdown: dec!(3),
            ..Default::default()
        };
        let aggregator = RiskMetricsAggregator::with_snapshot(dec!(10000), previous.clone());

        let execution = StubExecution::default();
        execution.fail_reports(true);
        let patterns = StubPatterns::new(PatternMonitoringReport::default());

        let err = aggregator
            .update_risk_metrics(&execution, &patterns)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Unavailable { .. }));
        assert_eq!(aggregator.current_metrics(), previous);
        assert_eq!(aggregator.updates_performed(), 0);
    }

    #[test]
    fn health_report_feeds_memory_usage() {
        let aggregator = RiskMetricsAggregator::default();
        let mut report = SystemHealthReport::healthy();
        report.memory_usage_pct = Some(dec!(140));
        aggregator.record_system_health(&report);
        assert_eq!(aggregator.current_metrics().memory_usage_pct, dec!(100));
    }
}
