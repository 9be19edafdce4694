//! Threshold evaluation: compares a metrics snapshot against the configured
//! limits and turns every breach into a [`Violation`] plus an alert.

use rust_decimal::Decimal;
use tracing::debug;

use tw_types::{
    ActionType, AlertCategory, AlertDraft, AlertSeverity, AlertType, RiskMetrics, SafetyAction,
    SafetyThresholds, Violation, ViolationType,
};

use crate::alerts::AlertSink;

/// Source tag carried by every alert raised from threshold evaluation.
pub const CORE_MONITORING_SOURCE: &str = "core_monitoring";

/// How a violation type is presented as an alert.
struct AlertProfile {
    alert_type: AlertType,
    title: &'static str,
    risk_level: i64,
    actions: &'static [(ActionType, &'static str)],
}

fn alert_profile(violation_type: ViolationType) -> AlertProfile {
    match violation_type {
        ViolationType::Drawdown => AlertProfile {
            alert_type: AlertType::RiskThreshold,
            title: "Drawdown limit exceeded",
            risk_level: 90,
            actions: &[
                (ActionType::ReducePositions, "Reduce open positions after drawdown breach"),
                (ActionType::NotifyAdmin, "Notify administrator of drawdown breach"),
            ],
        },
        ViolationType::SuccessRate => AlertProfile {
            alert_type: AlertType::PerformanceDegradation,
            title: "Success rate below minimum",
            risk_level: 70,
            actions: &[],
        },
        ViolationType::ConsecutiveLosses => AlertProfile {
            alert_type: AlertType::RiskThreshold,
            title: "Consecutive loss limit reached",
            risk_level: 75,
            actions: &[(ActionType::CircuitBreaker, "Trip circuit breaker after loss streak")],
        },
        ViolationType::ApiLatency => AlertProfile {
            alert_type: AlertType::PerformanceDegradation,
            title: "API latency above limit",
            risk_level: 50,
            actions: &[],
        },
        ViolationType::Concentration => AlertProfile {
            alert_type: AlertType::RiskThreshold,
            title: "Position concentration above limit",
            risk_level: 80,
            actions: &[(ActionType::LimitExposure, "Limit new exposure while concentrated")],
        },
        ViolationType::ApiSuccessRate => AlertProfile {
            alert_type: AlertType::SystemFailure,
            title: "API success rate below minimum",
            risk_level: 65,
            actions: &[],
        },
        ViolationType::MemoryUsage => AlertProfile {
            alert_type: AlertType::SystemFailure,
            title: "Memory usage above limit",
            risk_level: 45,
            actions: &[],
        },
        ViolationType::PatternAccuracy => AlertProfile {
            alert_type: AlertType::PerformanceDegradation,
            title: "Pattern accuracy below minimum",
            risk_level: 55,
            actions: &[],
        },
        ViolationType::FalsePositiveRate => AlertProfile {
            alert_type: AlertType::PerformanceDegradation,
            title: "Pattern false-positive rate above limit",
            risk_level: 50,
            actions: &[],
        },
        ViolationType::Slippage => AlertProfile {
            alert_type: AlertType::PerformanceDegradation,
            title: "Average slippage above limit",
            risk_level: 35,
            actions: &[],
        },
    }
}

/// Evaluates one immutable threshold set.
#[derive(Debug, Clone)]
pub struct ThresholdEvaluator {
    thresholds: SafetyThresholds,
}

impl ThresholdEvaluator {
    pub fn new(thresholds: SafetyThresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &SafetyThresholds {
        &self.thresholds
    }

    /// Test every limit and raise one alert per breach on `sink`, if any.
    ///
    /// Returns the violations in evaluation order.
    pub async fn check_safety_thresholds(
        &self,
        metrics: &RiskMetrics,
        sink: Option<&dyn AlertSink>,
    ) -> Vec<Violation> {
        let violations = self.evaluate(metrics);

        if let Some(sink) = sink {
            for violation in &violations {
                sink.raise(Self::alert_for(violation)).await;
            }
        }

        debug!(violations = violations.len(), "safety thresholds checked");
        violations
    }

    /// Pure evaluation. Order: drawdown, success rate, consecutive losses,
    /// latency, concentration, api success rate, memory, pattern accuracy,
    /// false-positive rate, slippage.
    pub fn evaluate(&self, m: &RiskMetrics) -> Vec<Violation> {
        let t = &self.thresholds;
        let mut violations = Vec::new();

        // --- drawdown ---
        if m.current_drawdown > t.max_drawdown_pct {
            violations.push(Violation {
                violation_type: ViolationType::Drawdown,
                severity: AlertSeverity::Critical,
                message: format!(
                    "Drawdown {:.2}% exceeds {:.2}% limit",
                    m.current_drawdown, t.max_drawdown_pct
                ),
                current_value: m.current_drawdown,
                threshold_value: t.max_drawdown_pct,
                category: AlertCategory::Portfolio,
            });
        }

        // --- success rate ---
        if m.success_rate < t.min_success_rate_pct {
            violations.push(Violation {
                violation_type: ViolationType::SuccessRate,
                severity: AlertSeverity::High,
                message: format!(
                    "Success rate {:.2}% below {:.2}% minimum",
                    m.success_rate, t.min_success_rate_pct
                ),
                current_value: m.success_rate,
                threshold_value: t.min_success_rate_pct,
                category: AlertCategory::Performance,
            });
        }

        // --- consecutive losses ---
        if m.consecutive_losses > t.max_consecutive_losses {
            violations.push(Violation {
                violation_type: ViolationType::ConsecutiveLosses,
                severity: AlertSeverity::High,
                message: format!(
                    "{} consecutive losses exceed the limit of {}",
                    m.consecutive_losses, t.max_consecutive_losses
                ),
                current_value: Decimal::from(m.consecutive_losses),
                threshold_value: Decimal::from(t.max_consecutive_losses),
                category: AlertCategory::Portfolio,
            });
        }

        // --- api latency ---
        if m.api_latency_ms > t.max_api_latency_ms {
            violations.push(Violation {
                violation_type: ViolationType::ApiLatency,
                severity: AlertSeverity::Medium,
                message: format!(
                    "API latency {}ms exceeds {}ms limit",
                    m.api_latency_ms, t.max_api_latency_ms
                ),
                current_value: Decimal::from(m.api_latency_ms),
                threshold_value: Decimal::from(t.max_api_latency_ms),
                category: AlertCategory::Api,
            });
        }

        // --- concentration ---
        if m.concentration_risk > t.max_concentration_pct {
            violations.push(Violation {
                violation_type: ViolationType::Concentration,
                severity: AlertSeverity::High,
                message: format!(
                    "Largest position is {:.2}% of portfolio value, limit {:.2}%",
                    m.concentration_risk, t.max_concentration_pct
                ),
                current_value: m.concentration_risk,
                threshold_value: t.max_concentration_pct,
                category: AlertCategory::Portfolio,
            });
        }

        // --- api success rate ---
        if m.api_success_rate < t.min_api_success_rate_pct {
            violations.push(Violation {
                violation_type: ViolationType::ApiSuccessRate,
                severity: AlertSeverity::High,
                message: format!(
                    "API success rate {:.2}% below {:.2}% minimum",
                    m.api_success_rate, t.min_api_success_rate_pct
                ),
                current_value: m.api_success_rate,
                threshold_value: t.min_api_success_rate_pct,
                category: AlertCategory::Api,
            });
        }

        // --- memory ---
        if m.memory_usage_pct > t.max_memory_usage_pct {
            violations.push(Violation {
                violation_type: ViolationType::MemoryUsage,
                severity: AlertSeverity::Medium,
                message: format!(
                    "Memory usage {:.2}% exceeds {:.2}% limit",
                    m.memory_usage_pct, t.max_memory_usage_pct
                ),
                current_value: m.memory_usage_pct,
                threshold_value: t.max_memory_usage_pct,
                category: AlertCategory::System,
            });
        }

        // --- pattern accuracy ---
        if m.pattern_accuracy < t.min_pattern_accuracy_pct {
            violations.push(Violation {
                violation_type: ViolationType::PatternAccuracy,
                severity: AlertSeverity::Medium,
                message: format!(
                    "Pattern accuracy {:.2}% below {:.2}% minimum",
                    m.pattern_accuracy, t.min_pattern_accuracy_pct
                ),
                current_value: m.pattern_accuracy,
                threshold_value: t.min_pattern_accuracy_pct,
                category: AlertCategory::Pattern,
            });
        }

        // --- false positives ---
        if m.false_positive_rate > t.max_false_positive_rate_pct {
            violations.push(Violation {
                violation_type: ViolationType::FalsePositiveRate,
                severity: AlertSeverity::Medium,
                message: format!(
                    "Pattern false-positive rate {:.2}% exceeds {:.2}% limit",
                    m.false_positive_rate, t.max_false_positive_rate_pct
                ),
                current_value: m.false_positive_rate,
                threshold_value: t.max_false_positive_rate_pct,
                category: AlertCategory::Pattern,
            });
        }

        // --- slippage ---
        if m.average_slippage > t.max_average_slippage_pct {
            violations.push(Violation {
                violation_type: ViolationType::Slippage,
                severity: AlertSeverity::Low,
                message: format!(
                    "Average slippage {:.2}% exceeds {:.2}% limit",
                    m.average_slippage, t.max_average_slippage_pct
                ),
                current_value: m.average_slippage,
                threshold_value: t.max_average_slippage_pct,
                category: AlertCategory::Performance,
            });
        }

        violations
    }

    /// Alert raised for a violation, with its bound mitigation actions.
    pub fn alert_for(violation: &Violation) -> AlertDraft {
        let profile = alert_profile(violation.violation_type);
        let mut draft = AlertDraft::new(
            profile.alert_type,
            violation.severity,
            violation.category,
            profile.title,
            violation.message.clone(),
        )
        .with_risk_level(Decimal::from(profile.risk_level))
        .with_source(CORE_MONITORING_SOURCE)
        .with_metadata("violation_type", violation.violation_type)
        .with_metadata("current_value", violation.current_value)
        .with_metadata("threshold_value", violation.threshold_value);

        for (action_type, description) in profile.actions {
            draft = draft.with_action(SafetyAction::new(*action_type, *description));
        }
        draft
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerts::{AlertManager, AlertPolicy};
    use crate::testing::StubExecution;
    use rust_decimal_macros::dec;
    use std::sync::Arc;
    use tokio_test::assert_ok;

    fn healthy_metrics() -> RiskMetrics {
        RiskMetrics {
            current_drawdown: dec!(5),
            max_drawdown: dec!(8),
            portfolio_value: dec!(10500),
            total_exposure: dec!(200),
            concentration_risk: dec!(30),
            success_rate: dec!(72),
            consecutive_losses: 1,
            average_slippage: dec!(0.2),
            api_latency_ms: 150,
            api_success_rate: dec!(100),
            memory_usage_pct: dec!(40),
            pattern_accuracy: dec!(80),
            detection_failures: 0,
            false_positive_rate: dec!(3),
        }
    }

    fn alert_manager() -> AlertManager {
        AlertManager::new(AlertPolicy::default(), Arc::new(StubExecution::default()))
    }

    #[tokio::test]
    async fn no_breach_no_violation_no_alert() {
        let evaluator = ThresholdEvaluator::new(SafetyThresholds::default());
        let alerts = alert_manager();

        let violations = evaluator
            .check_safety_thresholds(&healthy_metrics(), Some(&alerts))
            .await;

        assert!(violations.is_empty());
        assert!(alerts.alerts().is_empty());
        assert_eq!(alerts.stats().alerts_generated, 0);
    }

    #[tokio::test]
    async fn single_drawdown_breach() {
        let evaluator = ThresholdEvaluator::new(SafetyThresholds {
            max_drawdown_pct: dec!(15),
            ..Default::default()
        });
        let alerts = alert_manager();
        let metrics = RiskMetrics {
            current_drawdown: dec!(20),
            ..healthy_metrics()
        };

        let violations = evaluator.check_safety_thresholds(&metrics, Some(&alerts)).await;

        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].violation_type, ViolationType::Drawdown);
        assert_eq!(violations[0].severity, AlertSeverity::Critical);
        assert_eq!(violations[0].current_value, dec!(20));
        assert_eq!(violations[0].threshold_value, dec!(15));

        let raised = alerts.alerts();
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].source, CORE_MONITORING_SOURCE);
        assert_eq!(raised[0].severity, AlertSeverity::Critical);
        assert_eq!(raised[0].category, AlertCategory::Portfolio);
        assert_eq!(raised[0].alert_type, AlertType::RiskThreshold);
        assert_eq!(raised[0].risk_level, dec!(90));
    }

    #[tokio::test]
    async fn success_rate_breach_mapping() {
        let evaluator = ThresholdEvaluator::new(SafetyThresholds::default());
        let alerts = alert_manager();
        let metrics = RiskMetrics {
            success_rate: dec!(40),
            ..healthy_metrics()
        };

        evaluator.check_safety_thresholds(&metrics, Some(&alerts)).await;

        let raised = alerts.alerts();
        assert_eq!(raised.len(), 1);
        assert_eq!(raised[0].severity, AlertSeverity::High);
        assert_eq!(raised[0].category, AlertCategory::Performance);
        assert_eq!(raised[0].risk_level, dec!(70));
    }

    #[tokio::test]
    async fn multiple_breaches_in_evaluation_order() {
        let evaluator = ThresholdEvaluator::new(SafetyThresholds::default());
        let alerts = alert_manager();
        let metrics = RiskMetrics {
            current_drawdown: dec!(25),
            success_rate: dec!(30),
            consecutive_losses: 7,
            api_latency_ms: 2500,
            ..healthy_metrics()
        };

        let violations = evaluator.check_safety_thresholds(&metrics, Some(&alerts)).await;
        let kinds: Vec<ViolationType> = violations.iter().map(|v| v.violation_type).collect();

        assert_eq!(
            kinds,
            vec![
                ViolationType::Drawdown,
                ViolationType::SuccessRate,
                ViolationType::ConsecutiveLosses,
                ViolationType::ApiLatency,
            ]
        );
        assert_eq!(alerts.alerts().len(), 4);
    }

    #[tokio::test]
    async fn evaluation_without_sink() {
        let evaluator = ThresholdEvaluator::new(SafetyThresholds::default());
        let metrics = RiskMetrics {
            memory_usage_pct: dec!(95),
            ..healthy_metrics()
        };

        let violations = evaluator.check_safety_thresholds(&metrics, None).await;
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].violation_type, ViolationType::MemoryUsage);
    }

    #[test]
    fn extended_thresholds_detected() {
        let evaluator = ThresholdEvaluator::new(SafetyThresholds::default());
        let metrics = RiskMetrics {
            concentration_risk: dec!(57.14),
            api_success_rate: dec!(0),
            pattern_accuracy: dec!(50),
            false_positive_rate: dec!(40),
            average_slippage: dec!(2),
            ..healthy_metrics()
        };

        let kinds: Vec<ViolationType> = evaluator
            .evaluate(&metrics)
            .into_iter()
            .map(|v| v.violation_type)
            .collect();
        assert_eq!(
            kinds,
            vec![
                ViolationType::Concentration,
                ViolationType::ApiSuccessRate,
                ViolationType::PatternAccuracy,
                ViolationType::FalsePositiveRate,
                ViolationType::Slippage,
            ]
        );
    }

    #[test]
    fn drawdown_alert_binds_mitigations() {
        let evaluator = ThresholdEvaluator::new(SafetyThresholds::default());
        let metrics = RiskMetrics {
            current_drawdown: dec!(30),
            ..healthy_metrics()
        };
        let violation = &evaluator.evaluate(&metrics)[0];
        let draft = ThresholdEvaluator::alert_for(violation);

        let kinds: Vec<ActionType> = draft.actions.iter().map(|a| a.action_type).collect();
        assert_eq!(kinds, vec![ActionType::ReducePositions, ActionType::NotifyAdmin]);
        assert!(draft.actions.iter().all(|a| !a.executed));
        assert_ok!(serde_json::to_string(&draft));
    }
}
