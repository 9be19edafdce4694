//! Alert store, subscriber fan-out and automatic action execution.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use tw_types::{
    ActionResult, AlertConfig, AlertDraft, AlertSeverity, ExecutionService, SafetyAction,
    SafetyAlert,
};

use crate::actions::ActionExecutor;

/// Anything that accepts new alerts.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn raise(&self, draft: AlertDraft) -> SafetyAlert;
}

/// Retention and auto-action settings. Replaced as a whole, never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertPolicy {
    pub auto_action_enabled: bool,
    pub retention: Duration,
    pub max_recent_actions: usize,
    pub reduce_fraction: Decimal,
}

impl AlertPolicy {
    pub fn from_config(config: &AlertConfig) -> Self {
        Self {
            auto_action_enabled: config.auto_action_enabled,
            retention: Duration::hours(i64::from(config.retention_hours)),
            max_recent_actions: config.max_recent_actions.max(1),
            reduce_fraction: config.reduce_fraction,
        }
    }
}

impl Default for AlertPolicy {
    fn default() -> Self {
        Self::from_config(&AlertConfig::default())
    }
}

/// Counters kept by the alert manager.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertStats {
    pub alerts_generated: u64,
    pub alerts_acknowledged: u64,
    pub alerts_reaped: u64,
    pub actions_executed: u64,
    pub actions_failed: u64,
}

#[derive(Default)]
struct AlertState {
    alerts: Vec<SafetyAlert>,
    recent_actions: VecDeque<SafetyAction>,
    stats: AlertStats,
    subscribers: Vec<Sender<SafetyAlert>>,
}

/// Materializes alerts, runs their bound actions and keeps the history.
pub struct AlertManager {
    policy: RwLock<Arc<AlertPolicy>>,
    executor: ActionExecutor,
    state: Mutex<AlertState>,
}

impl AlertManager {
    pub fn new(policy: AlertPolicy, execution: Arc<dyn ExecutionService>) -> Self {
        Self {
            policy: RwLock::new(Arc::new(policy)),
            executor: ActionExecutor::new(execution),
            state: Mutex::new(AlertState::default()),
        }
    }

    pub fn policy(&self) -> Arc<AlertPolicy> {
        self.policy.read().clone()
    }

    pub fn set_policy(&self, policy: AlertPolicy) {
        *self.policy.write() = Arc::new(policy);
    }

    pub fn executor(&self) -> &ActionExecutor {
        &self.executor
    }

    /// Store a new alert and, when auto-actions are enabled, execute the
    /// actions bound to it. Returns the stored alert.
    pub async fn add_alert(&self, draft: AlertDraft) -> SafetyAlert {
        let policy = self.policy();
        self.add_alert_under(draft, &policy).await
    }

    /// [`AlertManager::add_alert`] under a caller-held policy snapshot rather
    /// than the current one.
    pub async fn add_alert_under(&self, draft: AlertDraft, policy: &AlertPolicy) -> SafetyAlert {
        let mut alert = SafetyAlert::from_draft(draft);

        match alert.severity {
            AlertSeverity::Critical => warn!(alert_id = %alert.id, title = %alert.title, %alert.message, "SAFETY CRITICAL"),
            AlertSeverity::High => warn!(alert_id = %alert.id, title = %alert.title, %alert.message, "SAFETY HIGH"),
            _ => info!(alert_id = %alert.id, title = %alert.title, %alert.message, "safety alert"),
        }

        {
            let mut state = self.state.lock();
            state.alerts.push(alert.clone());
            state.stats.alerts_generated += 1;
        }

        if policy.auto_action_enabled && !alert.actions.is_empty() {
            let pending = std::mem::take(&mut alert.actions);
            alert.actions = self.run_actions(pending, policy).await;

            let mut state = self.state.lock();
            if let Some(stored) = state.alerts.iter_mut().find(|a| a.id == alert.id) {
                stored.actions = alert.actions.clone();
            }
        }

        self.publish(&alert);
        alert
    }

    /// Execute actions directly, independent of the auto-action switch.
    pub async fn execute_actions(&self, actions: Vec<SafetyAction>) -> Vec<SafetyAction> {
        let policy = self.policy();
        self.run_actions(actions, &policy).await
    }

    async fn run_actions(&self, actions: Vec<SafetyAction>, policy: &AlertPolicy) -> Vec<SafetyAction> {
        let mut executed = Vec::with_capacity(actions.len());
        for action in actions {
            let already_done = action.executed;
            let action = self.executor.execute(action, policy.reduce_fraction).await;
            if !already_done {
                self.record_action(&action, policy.max_recent_actions);
            }
            executed.push(action);
        }
        executed
    }

    fn record_action(&self, action: &SafetyAction, capacity: usize) {
        let mut state = self.state.lock();
        state.stats.actions_executed += 1;
        if action.result == Some(ActionResult::Failed) {
            state.stats.actions_failed += 1;
        }
        state.recent_actions.push_back(action.clone());
        while state.recent_actions.len() > capacity {
            state.recent_actions.pop_front();
        }
    }

    fn publish(&self, alert: &SafetyAlert) {
        let mut state = self.state.lock();
        state.subscribers.retain(|tx| match tx.try_send(alert.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(alert_id = %alert.id, "alert subscriber is full, dropping alert");
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    /// Receive a copy of every future alert on a bounded channel.
    pub fn subscribe(&self, capacity: usize) -> Receiver<SafetyAlert> {
        let (tx, rx) = bounded(capacity.max(1));
        self.state.lock().subscribers.push(tx);
        rx
    }

    /// Mark an alert acknowledged. Missing ids return `false`; acknowledging
    /// twice is a successful no-op.
    pub fn acknowledge_alert(&self, id: Uuid) -> bool {
        let mut state = self.state.lock();
        let Some(alert) = state.alerts.iter_mut().find(|a| a.id == id) else {
            return false;
        };
        if alert.acknowledged {
            return true;
        }
        alert.acknowledged = true;
        state.stats.alerts_acknowledged += 1;
        info!(alert_id = %id, "alert acknowledged");
        true
    }

    /// Drop acknowledged alerts older than the retention window. Returns the
    /// number removed.
    pub fn cleanup_old_alerts(&self) -> usize {
        let cutoff = Utc::now() - self.policy().retention;
        let mut state = self.state.lock();
        let before = state.alerts.len();
        state
            .alerts
            .retain(|a| !a.acknowledged || a.timestamp >= cutoff);
        let removed = before - state.alerts.len();
        state.stats.alerts_reaped += removed as u64;
        if removed > 0 {
            info!(removed, "old alerts cleaned up");
        }
        removed
    }

    /// Drop every acknowledged alert regardless of age.
    pub fn clear_acknowledged(&self) -> usize {
        let mut state = self.state.lock();
        let before = state.alerts.len();
        state.alerts.retain(|a| !a.acknowledged);
        before - state.alerts.len()
    }

    pub fn alert(&self, id: Uuid) -> Option<SafetyAlert> {
        self.state.lock().alerts.iter().find(|a| a.id == id).cloned()
    }

    pub fn alerts(&self) -> Vec<SafetyAlert> {
        self.state.lock().alerts.clone()
    }

    /// Alerts still waiting for acknowledgement.
    pub fn active_alerts(&self) -> Vec<SafetyAlert> {
        self.state
            .lock()
            .alerts
            .iter()
            .filter(|a| !a.acknowledged)
            .cloned()
            .collect()
    }

    pub fn recent_actions(&self) -> Vec<SafetyAction> {
        self.state.lock().recent_actions.iter().cloned().collect()
    }

    pub fn stats(&self) -> AlertStats {
        self.state.lock().stats.clone()
    }
}

#[async_trait]
impl AlertSink for AlertManager {
    async fn raise(&self, draft: AlertDraft) -> SafetyAlert {
        self.add_alert(draft).await
    }
}

/// Raises alerts into a manager under one fixed policy snapshot.
pub struct PolicyBoundSink<'a> {
    manager: &'a AlertManager,
    policy: &'a AlertPolicy,
}

impl<'a> PolicyBoundSink<'a> {
    pub fn new(manager: &'a AlertManager, policy: &'a AlertPolicy) -> Self {
        Self { manager, policy }
    }
}

#[async_trait]
impl AlertSink for PolicyBoundSink<'_> {
    async fn raise(&self, draft: AlertDraft) -> SafetyAlert {
        self.manager.add_alert_under(draft, self.policy).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StubExecution;
    use std::sync::atomic::Ordering;
    use tw_types::{ActionType, AlertCategory, AlertType};

    fn draft(severity: AlertSeverity) -> AlertDraft {
        AlertDraft::new(
            AlertType::RiskThreshold,
            severity,
            AlertCategory::Portfolio,
            "Drawdown limit exceeded",
            "drawdown 20% exceeds 15% limit",
        )
        .with_source("test")
    }

    fn new_manager(auto: bool) -> (AlertManager, Arc<StubExecution>) {
        let execution = Arc::new(StubExecution::default());
        let policy = AlertPolicy {
            auto_action_enabled: auto,
            max_recent_actions: 2,
            ..Default::default()
        };
        (AlertManager::new(policy, execution.clone()), execution)
    }

    #[tokio::test]
    async fn add_alert_stamps_and_stores() {
        let (manager, _) = new_manager(false);
        let alert = manager.add_alert(draft(AlertSeverity::High)).await;

        assert!(!alert.acknowledged);
        assert_eq!(manager.alerts().len(), 1);
        assert_eq!(manager.active_alerts()[0].id, alert.id);
        assert_eq!(manager.stats().alerts_generated, 1);
    }

    #[tokio::test]
    async fn bound_actions_skipped_when_auto_disabled() {
        let (manager, execution) = new_manager(false);
        let alert = manager
            .add_alert(draft(AlertSeverity::Critical).with_action(SafetyAction::new(ActionType::HaltTrading, "halt")))
            .await;

        assert!(!alert.actions[0].executed);
        assert_eq!(execution.stop_calls.load(Ordering::SeqCst), 0);
        assert!(manager.recent_actions().is_empty());
    }

    #[tokio::test]
    async fn bound_actions_run_when_auto_enabled() {
        let (manager, execution) = new_manager(true);
        let alert = manager
            .add_alert(
                draft(AlertSeverity::Critical)
                    .with_action(SafetyAction::new(ActionType::HaltTrading, "halt"))
                    .with_action(SafetyAction::new(ActionType::NotifyAdmin, "page")),
            )
            .await;

        assert!(alert.actions.iter().all(|a| a.executed && a.succeeded()));
        assert_eq!(execution.stop_calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.alert(alert.id).unwrap().actions, alert.actions);
        assert_eq!(manager.stats().actions_executed, 2);
    }

    #[tokio::test]
    async fn bound_sink_uses_its_own_policy() {
        let (manager, execution) = new_manager(false);
        let snapshot = AlertPolicy {
            auto_action_enabled: true,
            ..manager.policy().as_ref().clone()
        };
        let sink = PolicyBoundSink::new(&manager, &snapshot);

        let alert = sink
            .raise(draft(AlertSeverity::Critical).with_action(SafetyAction::new(ActionType::HaltTrading, "halt")))
            .await;

        assert!(alert.actions[0].executed);
        assert_eq!(execution.stop_calls.load(Ordering::SeqCst), 1);
        assert!(!manager.policy().auto_action_enabled);
    }

    #[tokio::test]
    async fn recent_actions_log_is_bounded() {
        let (manager, _) = new_manager(true);
        let actions = (0..3)
            .map(|i| SafetyAction::new(ActionType::NotifyAdmin, format!("page {i}")))
            .collect();
        manager.execute_actions(actions).await;

        let recent = manager.recent_actions();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].description, "page 1");
        assert_eq!(recent[1].description, "page 2");
    }

    #[tokio::test]
    async fn acknowledge_is_idempotent() {
        let (manager, _) = new_manager(false);
        let alert = manager.add_alert(draft(AlertSeverity::Medium)).await;

        assert!(manager.acknowledge_alert(alert.id));
        assert!(manager.acknowledge_alert(alert.id));
        assert!(manager.alert(alert.id).unwrap().acknowledged);
        assert_eq!(manager.stats().alerts_acknowledged, 1);
        assert!(manager.active_alerts().is_empty());

        assert!(!manager.acknowledge_alert(Uuid::new_v4()));
    }

    #[tokio::test]
    async fn cleanup_keeps_unacknowledged_alerts() {
        let (manager, _) = new_manager(false);
        let old_acked = manager.add_alert(draft(AlertSeverity::Low)).await;
        let old_open = manager.add_alert(draft(AlertSeverity::Low)).await;
        let fresh_acked = manager.add_alert(draft(AlertSeverity::Low)).await;
        manager.acknowledge_alert(old_acked.id);
        manager.acknowledge_alert(fresh_acked.id);

        {
            let mut state = manager.state.lock();
            for alert in state.alerts.iter_mut() {
                if alert.id != fresh_acked.id {
                    alert.timestamp = Utc::now() - Duration::hours(48);
                }
            }
        }

        assert_eq!(manager.cleanup_old_alerts(), 1);
        let remaining: Vec<Uuid> = manager.alerts().iter().map(|a| a.id).collect();
        assert!(remaining.contains(&old_open.id));
        assert!(remaining.contains(&fresh_acked.id));
        assert!(!remaining.contains(&old_acked.id));
        assert_eq!(manager.stats().alerts_reaped, 1);
    }

    #[tokio::test]
    async fn subscribers_receive_alerts_and_dropped_ones_are_pruned() {
        let (manager, _) = new_manager(false);

        // No subscribers at all is fine.
        manager.add_alert(draft(AlertSeverity::Low)).await;

        let rx = manager.subscribe(4);
        let dropped = manager.subscribe(4);
        drop(dropped);

        let alert = manager.add_alert(draft(AlertSeverity::High)).await;
        assert_eq!(rx.try_recv().unwrap().id, alert.id);
        assert_eq!(manager.state.lock().subscribers.len(), 1);
    }

    #[tokio::test]
    async fn full_subscriber_does_not_block() {
        let (manager, _) = new_manager(false);
        let rx = manager.subscribe(1);

        manager.add_alert(draft(AlertSeverity::Low)).await;
        manager.add_alert(draft(AlertSeverity::Low)).await;

        assert_eq!(rx.len(), 1);
        assert_eq!(manager.alerts().len(), 2);
    }

    #[tokio::test]
    async fn clear_acknowledged_removes_regardless_of_age() {
        let (manager, _) = new_manager(false);
        let a = manager.add_alert(draft(AlertSeverity::Low)).await;
        manager.add_alert(draft(AlertSeverity::Low)).await;
        manager.acknowledge_alert(a.id);

        assert_eq!(manager.clear_acknowledged(), 1);
        assert_eq!(manager.alerts().len(), 1);
    }

    #[test]
    fn policy_from_config() {
        let policy = AlertPolicy::from_config(&AlertConfig {
            retention_hours: 6,
            ..Default::default()
        });
        assert_eq!(policy.retention, Duration::hours(6));
        assert!(!policy.auto_action_enabled);
        tokio_test::block_on(async {
            let manager = AlertManager::new(policy.clone(), Arc::new(StubExecution::default()));
            assert_eq!(*manager.policy(), policy);
        });
    }
}
