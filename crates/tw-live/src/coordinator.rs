//! Single-task scheduler for the periodic safety operations.
//!
//! One loop ticks at a fixed base rate. On each tick every operation whose
//! interval has elapsed runs, shortest interval first, one after another with
//! a short pause between them. No operation ever overlaps itself.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use tw_types::{internal_error, MonitoringConfig, SafetyError, SafetyResult};

/// Work performed by a scheduled operation.
#[async_trait]
pub trait OperationHandler: Send + Sync {
    async fn run(&self) -> SafetyResult<()>;
}

/// Closure adapter for [`OperationHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> OperationHandler for FnHandler<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = SafetyResult<()>> + Send,
{
    async fn run(&self) -> SafetyResult<()> {
        (self.0)().await
    }
}

pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn OperationHandler>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = SafetyResult<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

#[derive(Debug, Default)]
struct RunRecord {
    last_started: Option<Instant>,
    last_executed_at: Option<DateTime<Utc>>,
    executions: u64,
    failures: u64,
    last_error: Option<String>,
}

/// A periodic job registered with the coordinator.
pub struct ScheduledOperation {
    id: String,
    name: String,
    interval: Duration,
    handler: Arc<dyn OperationHandler>,
    is_running: AtomicBool,
    record: Mutex<RunRecord>,
}

impl ScheduledOperation {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        interval: Duration,
        handler: Arc<dyn OperationHandler>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            interval,
            handler,
            is_running: AtomicBool::new(false),
            record: Mutex::new(RunRecord::default()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    fn is_ready(&self, now: Instant) -> bool {
        if self.is_running() {
            return false;
        }
        match self.record.lock().last_started {
            Some(started) => now.saturating_duration_since(started) >= self.interval,
            None => true,
        }
    }

    pub fn status(&self) -> OperationStatus {
        let record = self.record.lock();
        OperationStatus {
            id: self.id.clone(),
            name: self.name.clone(),
            interval_ms: self.interval.as_millis() as u64,
            last_executed_at: record.last_executed_at,
            is_running: self.is_running(),
            executions: record.executions,
            failures: record.failures,
            last_error: record.last_error.clone(),
        }
    }
}

/// Read-only view of a scheduled operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationStatus {
    pub id: String,
    pub name: String,
    pub interval_ms: u64,
    pub last_executed_at: Option<DateTime<Utc>>,
    pub is_running: bool,
    pub executions: u64,
    pub failures: u64,
    pub last_error: Option<String>,
}

struct RunningGuard<'a>(&'a AtomicBool);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Run `op` once unless it is already running.
async fn execute(op: Arc<ScheduledOperation>) -> SafetyResult<()> {
    if op.is_running.swap(true, Ordering::SeqCst) {
        debug!(operation = %op.id, "operation still running, skipping");
        return Err(SafetyError::OperationBusy(op.id.clone()));
    }
    let _guard = RunningGuard(&op.is_running);

    {
        let mut record = op.record.lock();
        record.last_started = Some(Instant::now());
        record.last_executed_at = Some(Utc::now());
    }

    let started = Instant::now();
    let handler = op.handler.clone();
    // Spawned so a panicking handler cannot take the scheduler down.
    let outcome = match tokio::spawn(async move { handler.run().await }).await {
        Ok(result) => result,
        Err(join_error) => Err(internal_error!("operation panicked: {join_error}")),
    };
    let elapsed_ms = started.elapsed().as_millis() as u64;

    let mut record = op.record.lock();
    record.executions += 1;
    match &outcome {
        Ok(()) => {
            record.last_error = None;
            debug!(operation = %op.id, elapsed_ms, "operation completed");
        }
        Err(e) => {
            record.failures += 1;
            record.last_error = Some(e.to_string());
            error!(operation = %op.id, name = %op.name, error = %e, elapsed_ms, "operation failed");
        }
    }
    outcome
}

/// Timing of the coordinator loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorConfig {
    pub base_tick: Duration,
    pub inter_operation_delay: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::from(&MonitoringConfig::default())
    }
}

impl From<&MonitoringConfig> for CoordinatorConfig {
    fn from(config: &MonitoringConfig) -> Self {
        Self {
            base_tick: config.base_tick(),
            inter_operation_delay: config.inter_operation_delay(),
        }
    }
}

type OperationMap = Arc<Mutex<BTreeMap<String, Arc<ScheduledOperation>>>>;

struct RunningLoop {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct OperationCoordinator {
    config: CoordinatorConfig,
    operations: OperationMap,
    running: Mutex<Option<RunningLoop>>,
}

impl OperationCoordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config,
            operations: Arc::new(Mutex::new(BTreeMap::new())),
            running: Mutex::new(None),
        }
    }

    pub fn config(&self) -> CoordinatorConfig {
        self.config
    }

    /// Add an operation. An existing registration with the same id is replaced.
    pub fn register(&self, operation: ScheduledOperation) {
        info!(
            operation = %operation.id,
            interval_ms = operation.interval.as_millis() as u64,
            "operation registered"
        );
        if let Some(previous) = self
            .operations
            .lock()
            .insert(operation.id.clone(), Arc::new(operation))
        {
            debug!(operation = %previous.id, "replaced existing registration");
        }
    }

    /// Start the tick loop. Must be called from within a Tokio runtime.
    pub fn start(&self) {
        let mut running = self.running.lock();
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            warn!("coordinator already running, ignoring start");
            return;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run_loop(self.operations.clone(), self.config, stop_rx));
        *running = Some(RunningLoop { stop_tx, handle });

        info!(
            base_tick_ms = self.config.base_tick.as_millis() as u64,
            operations = self.operations.lock().len(),
            "coordinator started"
        );
    }

    /// Stop ticking and drop every registration. An operation already in
    /// flight runs to completion; await the returned handle to wait for it.
    pub fn stop(&self) -> Option<JoinHandle<()>> {
        let running = self.running.lock().take();
        self.operations.lock().clear();

        let running = running?;
        let _ = running.stop_tx.send(true);
        info!("coordinator stopped");
        Some(running.handle)
    }

    pub fn is_active(&self) -> bool {
        self.running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Run one registered operation immediately through the same guard the
    /// loop uses.
    pub async fn run_now(&self, id: &str) -> SafetyResult<()> {
        let op = self
            .operations
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| SafetyError::OperationNotFound(id.to_string()))?;
        execute(op).await
    }

    pub fn operation_statuses(&self) -> Vec<OperationStatus> {
        let mut statuses: Vec<OperationStatus> = self
            .operations
            .lock()
            .values()
            .map(|op| op.status())
            .collect();
        statuses.sort_by_key(|s| s.interval_ms);
        statuses
    }
}

impl Default for OperationCoordinator {
    fn default() -> Self {
        Self::new(CoordinatorConfig::default())
    }
}

async fn run_loop(operations: OperationMap, config: CoordinatorConfig, mut stop_rx: watch::Receiver<bool>) {
    let mut ticker = interval(config.base_tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
                continue;
            }
        }
        if *stop_rx.borrow() {
            break;
        }

        run_tick(&operations, config, &stop_rx).await;
    }

    debug!("coordinator loop exited");
}

async fn run_tick(operations: &OperationMap, config: CoordinatorConfig, stop_rx: &watch::Receiver<bool>) {
    let now = Instant::now();
    let mut ready: Vec<Arc<ScheduledOperation>> = operations
        .lock()
        .values()
        .filter(|op| op.is_ready(now))
        .cloned()
        .collect();
    if ready.is_empty() {
        return;
    }
    ready.sort_by_key(|op| op.interval);
    debug!(ready = ready.len(), "coordinator tick");

    for (i, op) in ready.into_iter().enumerate() {
        if i > 0 {
            sleep(config.inter_operation_delay).await;
        }
        if *stop_rx.borrow() {
            debug!("stop requested, skipping remaining operations");
            break;
        }
        // Failures are recorded and logged inside `execute`.
        let _ = execute(op).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio_test::assert_ok;

    fn fast_config() -> CoordinatorConfig {
        CoordinatorConfig {
            base_tick: Duration::from_secs(5),
            inter_operation_delay: Duration::from_secs(1),
        }
    }

    /// Handler that counts runs and the highest observed concurrency.
    struct Probe {
        runs: AtomicUsize,
        active: AtomicUsize,
        max_active: AtomicUsize,
        work: Duration,
    }

    impl Probe {
        fn new(work: Duration) -> Arc<Self> {
            Arc::new(Self {
                runs: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                max_active: AtomicUsize::new(0),
                work,
            })
        }

        fn runs(&self) -> usize {
            self.runs.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl OperationHandler for Probe {
        async fn run(&self) -> SafetyResult<()> {
            let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now_active, Ordering::SeqCst);
            sleep(self.work).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Panicky;

    #[async_trait]
    impl OperationHandler for Panicky {
        async fn run(&self) -> SafetyResult<()> {
            panic!("handler bug")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_operations_run_on_their_intervals_without_overlap() {
        let coordinator = OperationCoordinator::new(fast_config());
        let fast = Probe::new(Duration::from_millis(200));
        let slow = Probe::new(Duration::from_millis(200));
        coordinator.register(ScheduledOperation::new("fast", "Fast", Duration::from_secs(5), fast.clone()));
        coordinator.register(ScheduledOperation::new("slow", "Slow", Duration::from_secs(10), slow.clone()));

        coordinator.start();
        sleep(Duration::from_millis(10_500)).await;

        assert!(fast.runs() >= 2, "fast ran {} times", fast.runs());
        assert!(slow.runs() >= 1, "slow ran {} times", slow.runs());
        assert_eq!(fast.max_active.load(Ordering::SeqCst), 1);
        assert_eq!(slow.max_active.load(Ordering::SeqCst), 1);

        let handle = coordinator.stop().unwrap();
        assert_ok!(handle.await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_operations_run_shortest_interval_first() {
        let coordinator = OperationCoordinator::new(fast_config());
        let order = Arc::new(Mutex::new(Vec::new()));

        for (id, secs) in [("hourly", 3600), ("minutely", 60), ("every_ten", 10)] {
            let order = order.clone();
            coordinator.register(ScheduledOperation::new(
                id,
                id,
                Duration::from_secs(secs),
                handler_fn(move || {
                    let order = order.clone();
                    async move {
                        order.lock().push(id);
                        Ok::<(), SafetyError>(())
                    }
                }),
            ));
        }

        coordinator.start();
        sleep(Duration::from_millis(3_500)).await;

        assert_eq!(*order.lock(), vec!["every_ten", "minutely", "hourly"]);
        coordinator.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_operation_does_not_block_others() {
        let coordinator = OperationCoordinator::new(fast_config());
        let healthy = Probe::new(Duration::ZERO);
        coordinator.register(ScheduledOperation::new(
            "broken",
            "Broken",
            Duration::from_secs(5),
            handler_fn(|| async { Err::<(), _>(internal_error!("collaborator offline")) }),
        ));
        coordinator.register(ScheduledOperation::new(
            "panicky",
            "Panicky",
            Duration::from_secs(5),
            Arc::new(Panicky),
        ));
        coordinator.register(ScheduledOperation::new("healthy", "Healthy", Duration::from_secs(10), healthy.clone()));

        coordinator.start();
        sleep(Duration::from_millis(10_500)).await;

        assert!(healthy.runs() >= 1);
        let statuses = coordinator.operation_statuses();
        let broken = statuses.iter().find(|s| s.id == "broken").unwrap();
        assert!(broken.failures >= 2);
        assert!(broken.last_error.as_deref().unwrap().contains("collaborator offline"));
        let panicky = statuses.iter().find(|s| s.id == "panicky").unwrap();
        assert!(panicky.failures >= 1);
        assert!(!panicky.is_running);

        coordinator.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_start_is_a_no_op() {
        let coordinator = OperationCoordinator::new(fast_config());
        let probe = Probe::new(Duration::ZERO);
        coordinator.register(ScheduledOperation::new("only", "Only", Duration::from_secs(5), probe.clone()));

        coordinator.start();
        coordinator.start();
        sleep(Duration::from_millis(10_500)).await;

        // Ticks at 0s, 5s and 10s from a single loop.
        assert_eq!(probe.runs(), 3);
        coordinator.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_clears_registrations() {
        let coordinator = OperationCoordinator::new(fast_config());
        let probe = Probe::new(Duration::ZERO);
        coordinator.register(ScheduledOperation::new("only", "Only", Duration::from_secs(5), probe.clone()));

        coordinator.start();
        sleep(Duration::from_millis(100)).await;
        assert!(coordinator.is_active());

        let handle = coordinator.stop().unwrap();
        assert_ok!(handle.await);
        assert!(!coordinator.is_active());
        assert!(coordinator.operation_statuses().is_empty());

        let runs = probe.runs();
        sleep(Duration::from_secs(30)).await;
        assert_eq!(probe.runs(), runs);
        assert!(coordinator.stop().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_lets_in_flight_operation_finish() {
        let coordinator = OperationCoordinator::new(fast_config());
        let busy = Probe::new(Duration::from_secs(3));
        let next = Probe::new(Duration::ZERO);
        coordinator.register(ScheduledOperation::new("busy", "Busy", Duration::from_secs(5), busy.clone()));
        coordinator.register(ScheduledOperation::new("next", "Next", Duration::from_secs(10), next.clone()));

        coordinator.start();
        sleep(Duration::from_secs(1)).await;
        assert_eq!(busy.active.load(Ordering::SeqCst), 1);
        assert_eq!(busy.runs(), 0);

        let handle = coordinator.stop().unwrap();
        assert_ok!(handle.await);

        // The running handler completed; the one queued behind it never started.
        assert_eq!(busy.runs(), 1);
        assert_eq!(busy.active.load(Ordering::SeqCst), 0);
        assert_eq!(next.runs(), 0);

        sleep(Duration::from_secs(30)).await;
        assert_eq!(busy.runs(), 1);
        assert_eq!(next.runs(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_now_guards() {
        let coordinator = Arc::new(OperationCoordinator::new(fast_config()));
        let probe = Probe::new(Duration::from_secs(1));
        coordinator.register(ScheduledOperation::new("slow", "Slow", Duration::from_secs(60), probe.clone()));

        assert!(matches!(
            coordinator.run_now("missing").await,
            Err(SafetyError::OperationNotFound(_))
        ));

        let background = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.run_now("slow").await })
        };
        sleep(Duration::from_millis(10)).await;

        assert!(matches!(
            coordinator.run_now("slow").await,
            Err(SafetyError::OperationBusy(_))
        ));
        assert_ok!(background.await.unwrap());
        assert_eq!(probe.runs(), 1);
        assert_eq!(coordinator.operation_statuses()[0].executions, 1);
    }
}
