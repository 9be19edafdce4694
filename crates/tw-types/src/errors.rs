use rust_decimal::Decimal;
use thiserror::Error;

/// Main error type for the Tripwire system
#[derive(Error, Debug)]
pub enum SafetyError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    #[error("Position error: {0}")]
    Position(#[from] PositionError),

    #[error("Safety monitoring is already active")]
    MonitoringAlreadyActive,

    #[error("Safety monitoring is not active")]
    MonitoringNotActive,

    #[error("Operation not registered: {0}")]
    OperationNotFound(String),

    #[error("Operation already running: {0}")]
    OperationBusy(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Configuration and threshold validation errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid threshold {name} = {value}: {reason}")]
    InvalidThreshold {
        name: String,
        value: Decimal,
        reason: String,
    },

    #[error("Invalid interval: {name} must be greater than zero")]
    InvalidInterval { name: String },

    #[error("Invalid value for {name}: {reason}")]
    InvalidValue { name: String, reason: String },
}

/// Errors surfaced by external collaborators (execution, pattern detection,
/// health checks, exchange connectivity).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ServiceError {
    #[error("{service} is unavailable")]
    Unavailable { service: String },

    #[error("No price available for {symbol}")]
    PriceUnavailable { symbol: String },

    #[error("Order rejected: {reason}")]
    OrderRejected { reason: String },

    #[error("{operation} timed out")]
    Timeout { operation: String },

    #[error("Collaborator internal error: {message}")]
    Internal { message: String },
}

/// Position lifecycle errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PositionError {
    #[error("Position not found: {id}")]
    NotFound { id: String },

    #[error("Invalid status transition for {id}: {from} -> {to}")]
    InvalidTransition { id: String, from: String, to: String },
}

/// Result type alias for Tripwire operations
pub type SafetyResult<T> = Result<T, SafetyError>;

/// Result type alias for collaborator calls
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($name:expr, $($arg:tt)*) => {
        $crate::errors::ConfigError::InvalidValue {
            name: $name.to_string(),
            reason: format!($($arg)*),
        }
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::errors::SafetyError::Internal(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_error_display() {
        let error = ConfigError::InvalidThreshold {
            name: "max_drawdown_pct".into(),
            value: dec!(-5),
            reason: "must be positive".into(),
        };

        let text = error.to_string();
        assert!(text.contains("max_drawdown_pct"));
        assert!(text.contains("-5"));
        assert!(text.contains("must be positive"));
    }

    #[test]
    fn test_error_conversion() {
        let service_error = ServiceError::Unavailable {
            service: "execution".into(),
        };
        let err: SafetyError = service_error.into();

        match err {
            SafetyError::Service(ServiceError::Unavailable { service }) => {
                assert_eq!(service, "execution")
            }
            _ => panic!("Expected Service error"),
        }
    }

    #[test]
    fn test_macros() {
        let config_err = config_error!("reduce_fraction", "must be in (0, 1], got {}", 2);
        assert!(config_err.to_string().contains("reduce_fraction"));

        let internal_err = internal_error!("lost {} updates", 3);
        assert!(matches!(internal_err, SafetyError::Internal(ref m) if m == "lost 3 updates"));
    }
}
