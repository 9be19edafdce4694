//! In-crate collaborator stubs for unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tw_types::{
    ExecutionPosition, ExecutionReport, ExecutionService, PatternMonitoringReport,
    PatternMonitoringService, ServiceError, ServiceResult, Side,
};

pub fn position(symbol: &str, quantity: Decimal, price: Decimal) -> ExecutionPosition {
    ExecutionPosition::new(
        format!("{symbol}-{quantity}"),
        symbol,
        Side::Buy,
        quantity,
        price,
    )
}

pub fn trade(pnl: Decimal) -> ExecutionPosition {
    let mut pos = ExecutionPosition::new("trade", "BTCUSDT", Side::Buy, Decimal::ONE, Decimal::ONE);
    pos.unrealized_pnl = pnl;
    pos
}

#[derive(Default)]
pub struct StubExecution {
    report: Mutex<ExecutionReport>,
    fail_reports: AtomicBool,
    fail_actions: AtomicBool,
    pub stop_calls: AtomicUsize,
    pub close_calls: AtomicUsize,
    pub reduce_calls: AtomicUsize,
}

impl StubExecution {
    pub fn with_report(report: ExecutionReport) -> Self {
        Self {
            report: Mutex::new(report),
            ..Default::default()
        }
    }

    pub fn fail_reports(&self, fail: bool) {
        self.fail_reports.store(fail, Ordering::SeqCst);
    }

    pub fn fail_actions(&self, fail: bool) {
        self.fail_actions.store(fail, Ordering::SeqCst);
    }

    fn check_actions(&self) -> ServiceResult<()> {
        if self.fail_actions.load(Ordering::SeqCst) {
            return Err(ServiceError::Unavailable {
                service: "execution".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ExecutionService for StubExecution {
    async fn get_execution_report(&self) -> ServiceResult<ExecutionReport> {
        if self.fail_reports.load(Ordering::SeqCst) {
            return Err(ServiceError::Unavailable {
                service: "execution".into(),
            });
        }
        Ok(self.report.lock().clone())
    }

    async fn get_active_positions(&self) -> ServiceResult<Vec<ExecutionPosition>> {
        Ok(self.report.lock().active_positions.clone())
    }

    async fn stop_execution(&self) -> ServiceResult<()> {
        self.check_actions()?;
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn emergency_close_all(&self) -> ServiceResult<usize> {
        self.check_actions()?;
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        let mut report = self.report.lock();
        let closed = report.active_positions.len();
        report.active_positions.clear();
        Ok(closed)
    }

    async fn reduce_exposure(&self, _fraction: Decimal) -> ServiceResult<usize> {
        self.check_actions()?;
        self.reduce_calls.fetch_add(1, Ordering::SeqCst);
        // Pretend the first position could not be reduced.
        Ok(self.report.lock().active_positions.len().saturating_sub(1))
    }
}

pub struct StubPatterns {
    report: PatternMonitoringReport,
}

impl StubPatterns {
    pub fn new(report: PatternMonitoringReport) -> Self {
        Self { report }
    }
}

#[async_trait]
impl PatternMonitoringService for StubPatterns {
    async fn get_monitoring_report(&self) -> ServiceResult<PatternMonitoringReport> {
        Ok(self.report.clone())
    }
}
