//! Alert lifecycle management
//!
//! State machine: firing -> {acknowledged, escalated} -> resolved, with
//! resolved terminal. Transitions for a given alert are serialized through
//! a per-alert-id async lock over a write-through cache of the store;
//! illegal transitions are no-ops that log at warn and return the current
//! state. Every applied transition lands in the history table.

use pulse_common::time::now_millis;
use pulse_common::{
    AlertState, AlertStatus, AlertTransition, AlertTrigger, Error, Result,
};
use pulse_store::{AlertStore, TenantAlertStats};
use chrono::Duration;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lifecycle timing configuration
#[derive(Debug, Clone)]
pub struct LifecycleConfig {
    pub escalation_timeout: Duration,
    pub max_escalation_level: u32,
    pub reminder_interval: Duration,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            escalation_timeout: Duration::minutes(30),
            max_escalation_level: 3,
            reminder_interval: Duration::hours(1),
        }
    }
}

/// Manages alert state, escalation and notification bookkeeping
pub struct LifecycleManager {
    store: Arc<AlertStore>,
    config: LifecycleConfig,
    cache: Mutex<HashMap<Uuid, AlertState>>,
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl LifecycleManager {
    pub fn new(store: Arc<AlertStore>, config: LifecycleConfig) -> Self {
        Self {
            store,
            config,
            cache: Mutex::new(HashMap::new()),
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    /// Register a dispatched trigger as a firing alert
    pub async fn register(&self, trigger: &AlertTrigger) -> Result<AlertState> {
        let lock = self.lock_for(trigger.alert_id).await;
        let _guard = lock.lock().await;

        let state = AlertState::new(trigger);
        self.store.put_state(&state).await?;
        self.cache.lock().await.insert(state.alert_id, state.clone());
        info!(
            "registered alert {} for rule {} (severity {})",
            state.alert_id,
            state.rule_id,
            state.severity.as_str()
        );
        Ok(state)
    }

    /// Acknowledge a firing or escalated alert
    pub async fn acknowledge(&self, alert_id: Uuid, actor: &str) -> Result<AlertState> {
        let lock = self.lock_for(alert_id).await;
        let _guard = lock.lock().await;
        let mut state = self.load(alert_id).await?;

        if !state.status.can_transition_to(AlertStatus::Acknowledged) {
            warn!(
                "ignoring acknowledge of alert {} in state {}",
                alert_id,
                state.status.as_str()
            );
            return Ok(state);
        }

        let now = now_millis();
        let from = state.status;
        state.status = AlertStatus::Acknowledged;
        state.acknowledged_at = Some(now);
        state.acknowledged_by = Some(actor.to_string());
        self.apply(&mut state, from, Some(actor), None).await?;
        Ok(state)
    }

    /// Resolve an alert. Idempotent: resolving a resolved alert is a
    /// no-op returning the terminal state.
    pub async fn resolve(
        &self,
        alert_id: Uuid,
        actor: &str,
        reason: Option<&str>,
    ) -> Result<AlertState> {
        let lock = self.lock_for(alert_id).await;
        let _guard = lock.lock().await;
        let mut state = self.load(alert_id).await?;

        if state.status == AlertStatus::Resolved {
            debug!("alert {} already resolved", alert_id);
            return Ok(state);
        }

        let now = now_millis();
        let from = state.status;
        state.status = AlertStatus::Resolved;
        state.resolved_at = Some(now);
        state.resolved_by = Some(actor.to_string());
        self.apply(&mut state, from, Some(actor), reason).await?;
        Ok(state)
    }

    /// Escalate an alert one level. A no-op at `max_escalation_level` or
    /// once the alert left the active states.
    pub async fn escalate(&self, alert_id: Uuid, reason: Option<&str>) -> Result<AlertState> {
        let lock = self.lock_for(alert_id).await;
        let _guard = lock.lock().await;
        let mut state = self.load(alert_id).await?;

        let active = matches!(state.status, AlertStatus::Firing | AlertStatus::Escalated);
        if !active {
            warn!(
                "ignoring escalation of alert {} in state {}",
                alert_id,
                state.status.as_str()
            );
            return Ok(state);
        }
        if state.escalation_level >= self.config.max_escalation_level {
            warn!(
                "alert {} already at max escalation level {}",
                alert_id, state.escalation_level
            );
            return Ok(state);
        }

        let now = now_millis();
        let from = state.status;
        state.status = AlertStatus::Escalated;
        state.escalation_level += 1;
        state.escalated_at = Some(now);
        self.apply(&mut state, from, None, reason).await?;
        info!(
            "alert {} escalated to level {}",
            alert_id, state.escalation_level
        );
        Ok(state)
    }

    /// Record a delivered notification
    pub async fn record_notification(&self, alert_id: Uuid) -> Result<AlertState> {
        let lock = self.lock_for(alert_id).await;
        let _guard = lock.lock().await;
        let mut state = self.load(alert_id).await?;
        state.notification_count += 1;
        state.last_notified_at = Some(now_millis());
        self.store.put_state(&state).await?;
        self.cache.lock().await.insert(alert_id, state.clone());
        Ok(state)
    }

    /// Escalate every active alert older than the escalation timeout.
    /// Returns the ids that were escalated.
    pub async fn check_escalations(&self) -> Result<Vec<Uuid>> {
        let cutoff = now_millis() - self.config.escalation_timeout;
        let candidates = self
            .store
            .escalation_candidates(cutoff, self.config.max_escalation_level)
            .await?;
        let mut escalated = Vec::new();
        for candidate in candidates {
            match self
                .escalate(candidate.alert_id, Some("escalation timeout elapsed"))
                .await
            {
                Ok(state) if state.status == AlertStatus::Escalated => {
                    escalated.push(candidate.alert_id)
                }
                Ok(_) => {}
                Err(e) => warn!("failed to escalate alert {}: {}", candidate.alert_id, e),
            }
        }
        Ok(escalated)
    }

    /// Active alerts due for a reminder notification
    pub async fn check_reminders(&self) -> Result<Vec<AlertState>> {
        let cutoff = now_millis() - self.config.reminder_interval;
        self.store.reminder_candidates(cutoff).await
    }

    /// Full transition history for an alert
    pub async fn history(&self, alert_id: Uuid) -> Result<Vec<AlertTransition>> {
        self.store.transitions_for(alert_id).await
    }

    pub async fn get(&self, alert_id: Uuid) -> Result<AlertState> {
        let lock = self.lock_for(alert_id).await;
        let _guard = lock.lock().await;
        self.load(alert_id).await
    }

    /// Per-tenant counts plus MTTR/MTFR
    pub async fn stats(&self, tenant_id: &str) -> Result<TenantAlertStats> {
        self.store.tenant_stats(tenant_id).await
    }

    async fn lock_for(&self, alert_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(alert_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Read through the cache; on miss fall back to the store
    async fn load(&self, alert_id: Uuid) -> Result<AlertState> {
        if let Some(state) = self.cache.lock().await.get(&alert_id) {
            return Ok(state.clone());
        }
        let state = self
            .store
            .get_state(alert_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("alert {}", alert_id)))?;
        self.cache.lock().await.insert(alert_id, state.clone());
        Ok(state)
    }

    /// Persist a mutated state and append its transition record
    async fn apply(
        &self,
        state: &mut AlertState,
        from: AlertStatus,
        actor: Option<&str>,
        reason: Option<&str>,
    ) -> Result<()> {
        self.store.put_state(state).await?;
        self.store
            .append_transition(&AlertTransition {
                alert_id: state.alert_id,
                from,
                to: state.status,
                at: now_millis(),
                actor: actor.map(|a| a.to_string()),
                reason: reason.map(|r| r.to_string()),
            })
            .await?;
        self.cache.lock().await.insert(state.alert_id, state.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_common::{
        MetricContext, Routing, Severity, ThresholdOp, TriggerDetails,
    };
    use pulse_store::{ConnectionPool, PoolConfig};

    async fn manager(config: LifecycleConfig) -> (tempfile::TempDir, LifecycleManager) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lifecycle.db");
        let pool = Arc::new(ConnectionPool::new(PoolConfig::new(
            path.to_string_lossy().to_string(),
        )));
        pool.with_conn(|conn| pulse_store::bootstrap(conn))
            .await
            .unwrap();
        (dir, LifecycleManager::new(Arc::new(AlertStore::new(pool)), config))
    }

    fn trigger_at(triggered_at: chrono::DateTime<chrono::Utc>) -> AlertTrigger {
        AlertTrigger {
            alert_id: Uuid::new_v4(),
            rule_id: "r-1".into(),
            tenant_id: "acme".into(),
            triggered_at,
            severity: Severity::Warning,
            status: AlertStatus::Firing,
            trigger_type: "threshold".into(),
            title: "cpu high".into(),
            description: String::new(),
            metric_context: MetricContext {
                metric_key: "system.cpu.usage".into(),
                value: 85.0,
                timestamp: triggered_at,
                dimensions: Default::default(),
            },
            trigger_details: TriggerDetails::Threshold {
                op: ThresholdOp::Gt,
                threshold: 80.0,
                observed: 85.0,
            },
            routing: Routing {
                channels: vec![],
                dedup_key: None,
            },
        }
    }

    #[tokio::test]
    async fn happy_path_firing_ack_resolve() {
        let (_dir, manager) = manager(LifecycleConfig::default()).await;
        let trigger = trigger_at(now_millis());
        let state = manager.register(&trigger).await.unwrap();
        assert_eq!(state.status, AlertStatus::Firing);

        let acked = manager.acknowledge(trigger.alert_id, "oncall").await.unwrap();
        assert_eq!(acked.status, AlertStatus::Acknowledged);
        assert_eq!(acked.acknowledged_by.as_deref(), Some("oncall"));

        let resolved = manager
            .resolve(trigger.alert_id, "oncall", Some("load subsided"))
            .await
            .unwrap();
        assert_eq!(resolved.status, AlertStatus::Resolved);

        let history = manager.history(trigger.alert_id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].from, AlertStatus::Firing);
        assert_eq!(history[0].to, AlertStatus::Acknowledged);
        assert_eq!(history[1].to, AlertStatus::Resolved);
    }

    #[tokio::test]
    async fn resolve_is_idempotent_and_terminal() {
        let (_dir, manager) = manager(LifecycleConfig::default()).await;
        let trigger = trigger_at(now_millis());
        manager.register(&trigger).await.unwrap();

        let first = manager.resolve(trigger.alert_id, "a", None).await.unwrap();
        let second = manager.resolve(trigger.alert_id, "b", None).await.unwrap();
        assert_eq!(first, second);
        // The second resolve left no trace in history.
        assert_eq!(manager.history(trigger.alert_id).await.unwrap().len(), 1);

        // Terminal state ignores further transitions.
        let acked = manager.acknowledge(trigger.alert_id, "c").await.unwrap();
        assert_eq!(acked.status, AlertStatus::Resolved);
        let escalated = manager.escalate(trigger.alert_id, None).await.unwrap();
        assert_eq!(escalated.status, AlertStatus::Resolved);
    }

    #[tokio::test]
    async fn escalation_timer_walks_levels_until_max() {
        let config = LifecycleConfig {
            escalation_timeout: Duration::minutes(30),
            max_escalation_level: 3,
            reminder_interval: Duration::hours(1),
        };
        let (_dir, manager) = manager(config).await;

        // Triggered 31 minutes ago: past the escalation timeout.
        let trigger = trigger_at(now_millis() - Duration::minutes(31));
        manager.register(&trigger).await.unwrap();

        let escalated = manager.check_escalations().await.unwrap();
        assert_eq!(escalated, vec![trigger.alert_id]);
        let state = manager.get(trigger.alert_id).await.unwrap();
        assert_eq!(state.status, AlertStatus::Escalated);
        assert_eq!(state.escalation_level, 1);

        manager.check_escalations().await.unwrap();
        manager.check_escalations().await.unwrap();
        let state = manager.get(trigger.alert_id).await.unwrap();
        assert_eq!(state.escalation_level, 3);

        // A fourth sweep is a no-op.
        let fourth = manager.check_escalations().await.unwrap();
        assert!(fourth.is_empty());
        let state = manager.get(trigger.alert_id).await.unwrap();
        assert_eq!(state.escalation_level, 3);
    }

    #[tokio::test]
    async fn acknowledged_alerts_do_not_escalate() {
        let config = LifecycleConfig {
            escalation_timeout: Duration::minutes(30),
            ..LifecycleConfig::default()
        };
        let (_dir, manager) = manager(config).await;
        let trigger = trigger_at(now_millis() - Duration::hours(1));
        manager.register(&trigger).await.unwrap();
        manager.acknowledge(trigger.alert_id, "oncall").await.unwrap();

        assert!(manager.check_escalations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn escalated_alerts_can_be_acknowledged() {
        let (_dir, manager) = manager(LifecycleConfig::default()).await;
        let trigger = trigger_at(now_millis());
        manager.register(&trigger).await.unwrap();
        manager.escalate(trigger.alert_id, None).await.unwrap();

        let acked = manager.acknowledge(trigger.alert_id, "oncall").await.unwrap();
        assert_eq!(acked.status, AlertStatus::Acknowledged);
    }

    #[tokio::test]
    async fn reminders_cover_never_notified_and_stale_alerts() {
        let config = LifecycleConfig {
            reminder_interval: Duration::minutes(10),
            ..LifecycleConfig::default()
        };
        let (_dir, manager) = manager(config).await;

        let never_notified = trigger_at(now_millis());
        manager.register(&never_notified).await.unwrap();

        let recently_notified = trigger_at(now_millis());
        manager.register(&recently_notified).await.unwrap();
        manager
            .record_notification(recently_notified.alert_id)
            .await
            .unwrap();

        let due = manager.check_reminders().await.unwrap();
        let due_ids: Vec<_> = due.iter().map(|s| s.alert_id).collect();
        assert!(due_ids.contains(&never_notified.alert_id));
        assert!(!due_ids.contains(&recently_notified.alert_id));
    }

    #[tokio::test]
    async fn notification_counter_is_monotonic() {
        let (_dir, manager) = manager(LifecycleConfig::default()).await;
        let trigger = trigger_at(now_millis());
        manager.register(&trigger).await.unwrap();

        manager.record_notification(trigger.alert_id).await.unwrap();
        let state = manager.record_notification(trigger.alert_id).await.unwrap();
        assert_eq!(state.notification_count, 2);
        assert!(state.last_notified_at.is_some());
    }

    #[tokio::test]
    async fn stats_aggregate_by_status_and_severity() {
        let (_dir, manager) = manager(LifecycleConfig::default()).await;
        let a = trigger_at(now_millis() - Duration::minutes(20));
        manager.register(&a).await.unwrap();
        manager.resolve(a.alert_id, "oncall", None).await.unwrap();

        let b = trigger_at(now_millis());
        manager.register(&b).await.unwrap();

        let stats = manager.stats("acme").await.unwrap();
        assert_eq!(stats.by_status.get("resolved"), Some(&1));
        assert_eq!(stats.by_status.get("firing"), Some(&1));
        assert_eq!(stats.by_severity.get("warning"), Some(&2));
        // Resolved roughly twenty minutes after triggering.
        let mttr = stats.mttr_ms.unwrap();
        assert!(mttr > 19.0 * 60_000.0 && mttr < 21.0 * 60_000.0);
    }
}
