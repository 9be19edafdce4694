//! Safety system configuration.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::config_error;
use crate::errors::{ConfigError, SafetyResult};
use crate::safety::SafetyThresholds;

/// Environment variable naming a JSON configuration file.
pub const CONFIG_PATH_ENV: &str = "TRIPWIRE_CONFIG";

/// Scheduling intervals (milliseconds).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Base tick of the operation coordinator.
    pub base_tick_ms: u64,
    /// Pause between two operations that become ready on the same tick.
    pub inter_operation_delay_ms: u64,
    pub risk_check_interval_ms: u64,
    pub position_check_interval_ms: u64,
    pub health_check_interval_ms: u64,
    pub alert_cleanup_interval_ms: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            base_tick_ms: 5_000,
            inter_operation_delay_ms: 1_000,
            risk_check_interval_ms: 30_000,
            position_check_interval_ms: 10_000,
            health_check_interval_ms: 60_000,
            alert_cleanup_interval_ms: 3_600_000,
        }
    }
}

impl MonitoringConfig {
    pub fn base_tick(&self) -> Duration {
        Duration::from_millis(self.base_tick_ms)
    }

    pub fn inter_operation_delay(&self) -> Duration {
        Duration::from_millis(self.inter_operation_delay_ms)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("base_tick_ms", self.base_tick_ms),
            ("risk_check_interval_ms", self.risk_check_interval_ms),
            ("position_check_interval_ms", self.position_check_interval_ms),
            ("health_check_interval_ms", self.health_check_interval_ms),
            ("alert_cleanup_interval_ms", self.alert_cleanup_interval_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(ConfigError::InvalidInterval {
                    name: name.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// Alert retention and automatic mitigation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    /// Execute actions bound to alerts as soon as the alert is raised.
    pub auto_action_enabled: bool,
    /// Acknowledged alerts older than this are reaped.
    pub retention_hours: u32,
    /// Capacity of the recent-actions log.
    pub max_recent_actions: usize,
    /// Fraction of each position shed by a `reduce_positions` action.
    pub reduce_fraction: Decimal,
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            auto_action_enabled: false,
            retention_hours: 24,
            max_recent_actions: 100,
            reduce_fraction: Decimal::new(5, 1),
        }
    }
}

/// Top-level configuration of the safety monitor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub thresholds: SafetyThresholds,
    pub monitoring: MonitoringConfig,
    pub alerts: AlertConfig,
    /// Capital added to total P&L to value the portfolio.
    pub base_capital: Decimal,
    /// Overall risk score at which an emergency-condition alert is raised.
    pub emergency_risk_score: Decimal,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            thresholds: SafetyThresholds::default(),
            monitoring: MonitoringConfig::default(),
            alerts: AlertConfig::default(),
            base_capital: Decimal::from(10_000),
            emergency_risk_score: Decimal::from(80),
        }
    }
}

impl SafetyConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.thresholds.validate()?;
        self.monitoring.validate()?;

        let fraction = self.alerts.reduce_fraction;
        if fraction <= Decimal::ZERO || fraction > Decimal::ONE {
            return Err(config_error!(
                "alerts.reduce_fraction",
                "must be within (0, 1], got {fraction}"
            ));
        }
        if self.alerts.max_recent_actions == 0 {
            return Err(config_error!(
                "alerts.max_recent_actions",
                "must be at least 1"
            ));
        }
        if self.base_capital <= Decimal::ZERO {
            return Err(config_error!(
                "base_capital",
                "must be positive, got {}",
                self.base_capital
            ));
        }
        let score = self.emergency_risk_score;
        if score <= Decimal::ZERO || score > Decimal::ONE_HUNDRED {
            return Err(config_error!(
                "emergency_risk_score",
                "must be within (0, 100], got {score}"
            ));
        }
        Ok(())
    }

    /// Load and validate a JSON configuration file. Missing fields take their
    /// defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> SafetyResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: SafetyConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from the file named by `TRIPWIRE_CONFIG`, or defaults when unset.
    pub fn from_env() -> SafetyResult<Self> {
        match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) => Self::from_json_file(path),
            Err(_) => Ok(Self::default()),
        }
    }
}
