//! Paper (in-process) collaborators for sandbox runs.
//!
//! Nothing here talks to an exchange. Prices, reports and health are set by the
//! caller, and every service can be told to fail so recovery paths can be
//! exercised.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use tw_types::{
    ExchangeGateway, ExecutionPosition, ExecutionReport, ExecutionService, ExecutionStats,
    ExecutionSystemHealth, ExitReason, HealthService, OrderAck, OrderRequest, OrderStatus,
    PatternMonitoringReport, PatternMonitoringService, ServiceError, ServiceResult,
    SystemHealthReport,
};

use crate::book::PositionBook;

fn unavailable(service: &str) -> ServiceError {
    ServiceError::Unavailable {
        service: service.to_string(),
    }
}

/// Simulated exchange: fills every market order at the last set price.
#[derive(Debug, Default)]
pub struct PaperExchange {
    prices: RwLock<HashMap<String, Decimal>>,
    failing_symbols: RwLock<HashSet<String>>,
    reject_orders: AtomicBool,
    orders: Mutex<Vec<(String, OrderRequest)>>,
    canceled: Mutex<Vec<String>>,
    next_order_id: AtomicU64,
}

impl PaperExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_price(&self, symbol: impl Into<String>, price: Decimal) {
        self.prices.write().insert(symbol.into(), price);
    }

    /// Make price lookups for `symbol` fail (or succeed again).
    pub fn fail_symbol(&self, symbol: impl Into<String>, fail: bool) {
        let symbol = symbol.into();
        let mut failing = self.failing_symbols.write();
        if fail {
            failing.insert(symbol);
        } else {
            failing.remove(&symbol);
        }
    }

    pub fn reject_orders(&self, reject: bool) {
        self.reject_orders.store(reject, Ordering::SeqCst);
    }

    /// Orders accepted so far, with their assigned ids.
    pub fn orders(&self) -> Vec<(String, OrderRequest)> {
        self.orders.lock().clone()
    }

    pub fn canceled_orders(&self) -> Vec<String> {
        self.canceled.lock().clone()
    }

    fn price(&self, symbol: &str) -> ServiceResult<Decimal> {
        if self.failing_symbols.read().contains(symbol) {
            return Err(unavailable("exchange"));
        }
        self.prices
            .read()
            .get(symbol)
            .copied()
            .ok_or_else(|| ServiceError::PriceUnavailable {
                symbol: symbol.to_string(),
            })
    }
}

#[async_trait]
impl ExchangeGateway for PaperExchange {
    async fn place_order(&self, order: OrderRequest) -> ServiceResult<OrderAck> {
        if self.reject_orders.load(Ordering::SeqCst) {
            warn!(symbol = %order.symbol, "paper exchange rejecting order");
            return Err(ServiceError::OrderRejected {
                reason: "paper exchange configured to reject".to_string(),
            });
        }
        if order.quantity <= Decimal::ZERO {
            return Err(ServiceError::OrderRejected {
                reason: format!("invalid quantity {}", order.quantity),
            });
        }

        let fill_price = self.price(&order.symbol)?;
        let order_id = format!("paper-{}", self.next_order_id.fetch_add(1, Ordering::SeqCst) + 1);

        info!(
            order_id = %order_id,
            symbol = %order.symbol,
            side = %order.side,
            quantity = %order.quantity,
            price = %fill_price,
            reduce_only = order.reduce_only,
            "paper order filled"
        );

        let ack = OrderAck {
            order_id: order_id.clone(),
            client_order_id: order.client_order_id,
            symbol: order.symbol.clone(),
            status: OrderStatus::Filled,
            fill_price: Some(fill_price),
        };
        self.orders.lock().push((order_id, order));
        Ok(ack)
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> ServiceResult<()> {
        let known = self
            .orders
            .lock()
            .iter()
            .any(|(id, order)| id == order_id && order.symbol == symbol);
        if !known {
            return Err(ServiceError::OrderRejected {
                reason: format!("unknown order {order_id} for {symbol}"),
            });
        }
        self.canceled.lock().push(order_id.to_string());
        Ok(())
    }

    async fn get_ticker_price(&self, symbol: &str) -> ServiceResult<Decimal> {
        self.price(symbol)
    }
}

/// Execution service backed by the shared [`PositionBook`].
pub struct PaperExecutionService {
    book: Arc<PositionBook>,
    stats: RwLock<ExecutionStats>,
    recorded: RwLock<Vec<(DateTime<Utc>, ExecutionPosition)>>,
    api_connection: AtomicBool,
    failing: AtomicBool,
    stopped: AtomicBool,
}

impl PaperExecutionService {
    pub fn new(book: Arc<PositionBook>) -> Self {
        Self {
            book,
            stats: RwLock::new(ExecutionStats::default()),
            recorded: RwLock::new(Vec::new()),
            api_connection: AtomicBool::new(true),
            failing: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn book(&self) -> &Arc<PositionBook> {
        &self.book
    }

    pub fn set_stats(&self, stats: ExecutionStats) {
        *self.stats.write() = stats;
    }

    /// Append a finished trade to the recent-executions feed. Trades without
    /// an exit are timed at the moment they are recorded.
    pub fn record_execution(&self, trade: ExecutionPosition) {
        let at = trade.exit.as_ref().map_or_else(Utc::now, |exit| exit.closed_at);
        self.recorded.write().push((at, trade));
    }

    /// Closed book positions merged with recorded trades, oldest first.
    fn recent_executions(&self) -> Vec<ExecutionPosition> {
        let mut timed: Vec<(DateTime<Utc>, ExecutionPosition)> = self
            .book
            .history()
            .into_iter()
            .map(|p| (p.exit.as_ref().map_or(p.entry_time, |exit| exit.closed_at), p))
            .collect();
        timed.extend(self.recorded.read().iter().cloned());
        timed.sort_by_key(|(at, _)| *at);
        timed.into_iter().map(|(_, p)| p).collect()
    }

    pub fn set_api_connection(&self, connected: bool) {
        self.api_connection.store(connected, Ordering::SeqCst);
    }

    pub fn fail_requests(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn check(&self) -> ServiceResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(unavailable("execution"));
        }
        Ok(())
    }
}

#[async_trait]
impl ExecutionService for PaperExecutionService {
    async fn get_execution_report(&self) -> ServiceResult<ExecutionReport> {
        self.check()?;
        Ok(ExecutionReport {
            stats: self.stats.read().clone(),
            active_positions: self.book.active_positions(),
            recent_executions: self.recent_executions(),
            system_health: ExecutionSystemHealth {
                api_connection: self.api_connection.load(Ordering::SeqCst),
            },
        })
    }

    async fn get_active_positions(&self) -> ServiceResult<Vec<ExecutionPosition>> {
        self.check()?;
        Ok(self.book.active_positions())
    }

    async fn stop_execution(&self) -> ServiceResult<()> {
        self.check()?;
        self.stopped.store(true, Ordering::SeqCst);
        info!("paper execution stopped");
        Ok(())
    }

    async fn emergency_close_all(&self) -> ServiceResult<usize> {
        self.check()?;
        let closed = self.book.close_all(ExitReason::Emergency).len();
        info!(closed, "paper execution flattened all positions");
        Ok(closed)
    }

    async fn reduce_exposure(&self, fraction: Decimal) -> ServiceResult<usize> {
        self.check()?;
        Ok(self.book.reduce_all(fraction))
    }
}

/// Pattern monitor returning a caller-set report.
#[derive(Debug, Default)]
pub struct StaticPatternMonitor {
    report: RwLock<PatternMonitoringReport>,
    failing: AtomicBool,
}

impl StaticPatternMonitor {
    pub fn new(report: PatternMonitoringReport) -> Self {
        Self {
            report: RwLock::new(report),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_report(&self, report: PatternMonitoringReport) {
        *self.report.write() = report;
    }

    pub fn fail_requests(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl PatternMonitoringService for StaticPatternMonitor {
    async fn get_monitoring_report(&self) -> ServiceResult<PatternMonitoringReport> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(unavailable("pattern_monitoring"));
        }
        Ok(self.report.read().clone())
    }
}

/// Health service returning a caller-set report, stamped at check time.
#[derive(Debug)]
pub struct StaticHealthService {
    report: RwLock<SystemHealthReport>,
    failing: AtomicBool,
}

impl Default for StaticHealthService {
    fn default() -> Self {
        Self::new(SystemHealthReport::healthy())
    }
}

impl StaticHealthService {
    pub fn new(report: SystemHealthReport) -> Self {
        Self {
            report: RwLock::new(report),
            failing: AtomicBool::new(false),
        }
    }

    pub fn set_report(&self, report: SystemHealthReport) {
        *self.report.write() = report;
    }

    pub fn fail_requests(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl HealthService for StaticHealthService {
    async fn perform_system_health_check(&self) -> ServiceResult<SystemHealthReport> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(unavailable("health"));
        }
        let mut report = self.report.read().clone();
        report.checked_at = Utc::now();
        Ok(report)
    }
}
