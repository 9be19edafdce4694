//! Risk posture, thresholds, alerts and mitigation actions.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::errors::ConfigError;

/// Loosely-typed diagnostic fields attached to alerts and actions.
pub type Metadata = HashMap<String, serde_json::Value>;

fn clamp_pct(value: Decimal) -> Decimal {
    value.max(Decimal::ZERO).min(Decimal::ONE_HUNDRED)
}

/// Point-in-time risk posture derived from execution and pattern telemetry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskMetrics {
    // --- portfolio ---
    pub current_drawdown: Decimal,
    pub max_drawdown: Decimal,
    pub portfolio_value: Decimal,
    pub total_exposure: Decimal,
    /// Largest single-symbol share of position value (0–100).
    pub concentration_risk: Decimal,

    // --- performance ---
    pub success_rate: Decimal,
    pub consecutive_losses: u32,
    pub average_slippage: Decimal,

    // --- system ---
    pub api_latency_ms: u64,
    pub api_success_rate: Decimal,
    pub memory_usage_pct: Decimal,

    // --- pattern detection ---
    pub pattern_accuracy: Decimal,
    pub detection_failures: u32,
    pub false_positive_rate: Decimal,
}

impl Default for RiskMetrics {
    fn default() -> Self {
        Self {
            current_drawdown: Decimal::ZERO,
            max_drawdown: Decimal::ZERO,
            portfolio_value: Decimal::ZERO,
            total_exposure: Decimal::ZERO,
            concentration_risk: Decimal::ZERO,
            success_rate: Decimal::ZERO,
            consecutive_losses: 0,
            average_slippage: Decimal::ZERO,
            api_latency_ms: 0,
            api_success_rate: Decimal::ONE_HUNDRED,
            memory_usage_pct: Decimal::ZERO,
            pattern_accuracy: Decimal::ZERO,
            detection_failures: 0,
            false_positive_rate: Decimal::ZERO,
        }
    }
}

impl RiskMetrics {
    /// Clamp every percentage field into `[0, 100]`.
    pub fn clamped(mut self) -> Self {
        self.current_drawdown = clamp_pct(self.current_drawdown);
        self.max_drawdown = clamp_pct(self.max_drawdown);
        self.concentration_risk = clamp_pct(self.concentration_risk);
        self.success_rate = clamp_pct(self.success_rate);
        self.api_success_rate = clamp_pct(self.api_success_rate);
        self.memory_usage_pct = clamp_pct(self.memory_usage_pct);
        self.pattern_accuracy = clamp_pct(self.pattern_accuracy);
        self.false_positive_rate = clamp_pct(self.false_positive_rate);
        self
    }

    /// True while none of the score drivers has moved off its initial value.
    pub fn is_untouched(&self) -> bool {
        self.current_drawdown.is_zero()
            && self.consecutive_losses == 0
            && self.concentration_risk.is_zero()
            && self.api_latency_ms == 0
            && self.success_rate.is_zero()
            && self.pattern_accuracy.is_zero()
    }
}

/// Configured ceilings and floors, one per tracked metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyThresholds {
    pub max_drawdown_pct: Decimal,
    pub min_success_rate_pct: Decimal,
    pub max_consecutive_losses: u32,
    pub max_api_latency_ms: u64,
    pub max_concentration_pct: Decimal,
    pub min_api_success_rate_pct: Decimal,
    pub max_memory_usage_pct: Decimal,
    pub min_pattern_accuracy_pct: Decimal,
    pub max_false_positive_rate_pct: Decimal,
    pub max_average_slippage_pct: Decimal,
}

impl Default for SafetyThresholds {
    fn default() -> Self {
        Self {
            max_drawdown_pct: Decimal::from(15),
            min_success_rate_pct: Decimal::from(60),
            max_consecutive_losses: 5,
            max_api_latency_ms: 1000,
            max_concentration_pct: Decimal::from(40),
            min_api_success_rate_pct: Decimal::from(90),
            max_memory_usage_pct: Decimal::from(85),
            min_pattern_accuracy_pct: Decimal::from(65),
            max_false_positive_rate_pct: Decimal::from(25),
            max_average_slippage_pct: Decimal::ONE,
        }
    }
}

impl SafetyThresholds {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let pct_limits = [
            ("max_drawdown_pct", self.max_drawdown_pct),
            ("min_success_rate_pct", self.min_success_rate_pct),
            ("max_concentration_pct", self.max_concentration_pct),
            ("min_api_success_rate_pct", self.min_api_success_rate_pct),
            ("max_memory_usage_pct", self.max_memory_usage_pct),
            ("min_pattern_accuracy_pct", self.min_pattern_accuracy_pct),
            ("max_false_positive_rate_pct", self.max_false_positive_rate_pct),
            ("max_average_slippage_pct", self.max_average_slippage_pct),
        ];
        for (name, value) in pct_limits {
            if value <= Decimal::ZERO || value > Decimal::ONE_HUNDRED {
                return Err(ConfigError::InvalidThreshold {
                    name: name.to_string(),
                    value,
                    reason: "must be within (0, 100]".to_string(),
                });
            }
        }

        if self.max_consecutive_losses == 0 {
            return Err(ConfigError::InvalidThreshold {
                name: "max_consecutive_losses".to_string(),
                value: Decimal::ZERO,
                reason: "must be at least 1".to_string(),
            });
        }
        if self.max_api_latency_ms == 0 {
            return Err(ConfigError::InvalidThreshold {
                name: "max_api_latency_ms".to_string(),
                value: Decimal::ZERO,
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Kind of alert raised by the safety system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    RiskThreshold,
    SystemFailure,
    PerformanceDegradation,
    EmergencyCondition,
    SafetyViolation,
    StopLossHit,
    TakeProfitHit,
    ExecutionError,
}

impl fmt::Display for AlertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AlertType::RiskThreshold => "risk_threshold",
            AlertType::SystemFailure => "system_failure",
            AlertType::PerformanceDegradation => "performance_degradation",
            AlertType::EmergencyCondition => "emergency_condition",
            AlertType::SafetyViolation => "safety_violation",
            AlertType::StopLossHit => "stop_loss_hit",
            AlertType::TakeProfitHit => "take_profit_hit",
            AlertType::ExecutionError => "execution_error",
        };
        f.write_str(s)
    }
}

/// Severity of an alert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// Area of the system an alert concerns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertCategory {
    Portfolio,
    System,
    Performance,
    Pattern,
    Api,
}

/// Mitigation an action performs when executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    HaltTrading,
    ReducePositions,
    EmergencyClose,
    LimitExposure,
    NotifyAdmin,
    CircuitBreaker,
    /// Any action type this build does not know how to execute.
    #[serde(other)]
    Unrecognized,
}

/// Terminal outcome of an executed action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionResult {
    Success,
    Failed,
    Partial,
}

/// A mitigation step, either bound to an alert or issued by an emergency
/// response. Executes at most once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyAction {
    pub id: Uuid,
    pub action_type: ActionType,
    pub description: String,
    pub executed: bool,
    pub executed_at: Option<DateTime<Utc>>,
    pub result: Option<ActionResult>,
    pub details: Option<String>,
}

impl SafetyAction {
    pub fn new(action_type: ActionType, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            action_type,
            description: description.into(),
            executed: false,
            executed_at: None,
            result: None,
            details: None,
        }
    }

    /// Record the terminal outcome. Returns `false` (and changes nothing) when
    /// the action has already been executed.
    pub fn complete(&mut self, result: ActionResult, details: impl Into<String>) -> bool {
        if self.executed {
            return false;
        }
        self.executed = true;
        self.executed_at = Some(Utc::now());
        self.result = Some(result);
        self.details = Some(details.into());
        true
    }

    pub fn succeeded(&self) -> bool {
        self.result == Some(ActionResult::Success)
    }
}

/// Caller-supplied content of an alert; the alert manager stamps the rest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertDraft {
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub category: AlertCategory,
    pub title: String,
    pub message: String,
    pub risk_level: Decimal,
    pub source: String,
    pub metadata: Metadata,
    pub actions: Vec<SafetyAction>,
}

impl AlertDraft {
    pub fn new(
        alert_type: AlertType,
        severity: AlertSeverity,
        category: AlertCategory,
        title: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            alert_type,
            severity,
            category,
            title: title.into(),
            message: message.into(),
            risk_level: Decimal::ZERO,
            source: String::new(),
            metadata: Metadata::new(),
            actions: Vec::new(),
        }
    }

    pub fn with_risk_level(mut self, risk_level: Decimal) -> Self {
        self.risk_level = clamp_pct(risk_level);
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(serde_json::Value::Null);
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn with_action(mut self, action: SafetyAction) -> Self {
        self.actions.push(action);
        self
    }
}

/// Alert materialized and owned by the alert manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SafetyAlert {
    pub id: Uuid,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub category: AlertCategory,
    pub title: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub acknowledged: bool,
    pub risk_level: Decimal,
    pub source: String,
    pub metadata: Metadata,
    pub actions: Vec<SafetyAction>,
}

impl SafetyAlert {
    pub fn from_draft(draft: AlertDraft) -> Self {
        Self {
            id: Uuid::new_v4(),
            alert_type: draft.alert_type,
            severity: draft.severity,
            category: draft.category,
            title: draft.title,
            message: draft.message,
            timestamp: Utc::now(),
            acknowledged: false,
            risk_level: draft.risk_level,
            source: draft.source,
            metadata: draft.metadata,
            actions: draft.actions,
        }
    }
}

/// Which configured limit a violation refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationType {
    Drawdown,
    SuccessRate,
    ConsecutiveLosses,
    ApiLatency,
    Concentration,
    ApiSuccessRate,
    MemoryUsage,
    PatternAccuracy,
    FalsePositiveRate,
    Slippage,
}

/// A single threshold breach found during evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Violation {
    pub violation_type: ViolationType,
    pub severity: AlertSeverity,
    pub message: String,
    pub current_value: Decimal,
    pub threshold_value: Decimal,
    pub category: AlertCategory,
}
