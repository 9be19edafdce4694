//! Contracts for the collaborators the safety system consumes.
//!
//! Implementations may talk to real execution / exchange infrastructure or
//! run fully in-process (see `tw_live::paper`).

use async_trait::async_trait;
use rust_decimal::Decimal;

use crate::errors::ServiceResult;
use crate::orders::{OrderAck, OrderRequest};
use crate::positions::ExecutionPosition;
use crate::reports::{ExecutionReport, PatternMonitoringReport, SystemHealthReport};

/// Execution / portfolio service.
#[async_trait]
pub trait ExecutionService: Send + Sync {
    /// Current execution statistics, positions and recent trades.
    async fn get_execution_report(&self) -> ServiceResult<ExecutionReport>;

    /// Positions that are not yet closed.
    async fn get_active_positions(&self) -> ServiceResult<Vec<ExecutionPosition>>;

    /// Stop opening new positions.
    async fn stop_execution(&self) -> ServiceResult<()>;

    /// Flatten every open position. Returns how many were closed.
    async fn emergency_close_all(&self) -> ServiceResult<usize>;

    /// Shrink every open position by `fraction` (0–1]. Returns how many
    /// positions were reduced.
    async fn reduce_exposure(&self, fraction: Decimal) -> ServiceResult<usize>;
}

/// Pattern-detection engine status.
#[async_trait]
pub trait PatternMonitoringService: Send + Sync {
    async fn get_monitoring_report(&self) -> ServiceResult<PatternMonitoringReport>;
}

/// Process / host health checks.
#[async_trait]
pub trait HealthService: Send + Sync {
    async fn perform_system_health_check(&self) -> ServiceResult<SystemHealthReport>;
}

/// Exchange connectivity used for pricing and exit orders.
#[async_trait]
pub trait ExchangeGateway: Send + Sync {
    async fn place_order(&self, order: OrderRequest) -> ServiceResult<OrderAck>;

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> ServiceResult<()>;

    /// Latest traded price for `symbol`.
    async fn get_ticker_price(&self, symbol: &str) -> ServiceResult<Decimal>;
}
