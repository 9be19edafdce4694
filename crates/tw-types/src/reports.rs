//! Reports returned by external collaborators.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::positions::ExecutionPosition;

/// Aggregate execution statistics (percentages in 0–100).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecutionStats {
    pub current_drawdown: Decimal,
    pub max_drawdown: Decimal,
    pub success_rate: Decimal,
    pub average_slippage: Decimal,
    pub total_pnl: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSystemHealth {
    pub api_connection: bool,
}

impl Default for ExecutionSystemHealth {
    fn default() -> Self {
        Self {
            api_connection: true,
        }
    }
}

/// Execution/portfolio snapshot from the execution service.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub stats: ExecutionStats,
    pub active_positions: Vec<ExecutionPosition>,
    /// Recent trades ordered oldest → newest.
    pub recent_executions: Vec<ExecutionPosition>,
    pub system_health: ExecutionSystemHealth,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PatternStats {
    pub average_confidence: Decimal,
    pub consecutive_errors: u32,
    pub total_patterns_detected: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternMonitoringReport {
    pub status: String,
    pub stats: PatternStats,
}

impl Default for PatternMonitoringReport {
    fn default() -> Self {
        Self {
            status: "idle".to_string(),
            stats: PatternStats::default(),
        }
    }
}

/// Overall status reported by the health service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Critical,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemHealthReport {
    pub overall: HealthStatus,
    pub memory_usage_pct: Option<Decimal>,
    pub checked_at: DateTime<Utc>,
    pub issues: Vec<String>,
}

impl SystemHealthReport {
    pub fn healthy() -> Self {
        Self {
            overall: HealthStatus::Healthy,
            memory_usage_pct: None,
            checked_at: Utc::now(),
            issues: Vec::new(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.overall == HealthStatus::Healthy
    }
}
