//! Alert filtering: mute-window suppression, rate limiting and dedup
//!
//! Checks run in order and short-circuit on the first denial:
//! suppression (in-memory), per-tenant rolling rate limit, then
//! deduplication against the persisted record with TTL.

use pulse_common::time::now_millis;
use pulse_common::{
    AlertRule, AlertTrigger, DedupRecord, DimensionValue, MuteWindow, Result,
};
use pulse_store::AlertStore;
use chrono::{DateTime, Duration, Timelike, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Filter configuration
#[derive(Debug, Clone)]
pub struct FilterConfig {
    /// Dedup TTL when the rule does not configure one
    pub default_dedup_window_ms: u64,
    pub rate_limit_per_minute: u64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            default_dedup_window_ms: 300_000,
            rate_limit_per_minute: 60,
        }
    }
}

/// Why a candidate alert was not dispatched
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterVerdict {
    /// The alert proceeds to lifecycle registration and dispatch
    Dispatch,
    /// Inside a configured mute window
    Muted,
    /// The tenant exceeded its rolling per-minute budget
    RateLimited,
    /// A live dedup record coalesced the repeat; carries the new count
    Duplicate { count: u64 },
}

/// Decides whether a candidate alert proceeds
pub struct AlertFilter {
    store: Arc<AlertStore>,
    config: FilterConfig,
    /// Write-through cache of live dedup records
    cache: RwLock<HashMap<String, DedupRecord>>,
}

impl AlertFilter {
    pub fn new(store: Arc<AlertStore>, config: FilterConfig) -> Self {
        Self {
            store,
            config,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Run the three checks in order for a candidate alert
    pub async fn check(&self, trigger: &AlertTrigger, rule: &AlertRule) -> Result<FilterVerdict> {
        self.check_at(trigger, rule, now_millis()).await
    }

    /// Same as [`check`](Self::check) with an explicit clock, used by the
    /// suppression tests.
    pub async fn check_at(
        &self,
        trigger: &AlertTrigger,
        rule: &AlertRule,
        now: DateTime<Utc>,
    ) -> Result<FilterVerdict> {
        // 1. Mute-window suppression.
        if let Some(suppression) = &rule.suppression {
            if is_muted_at(&suppression.mute_windows, now) {
                debug!("alert {} suppressed by mute window", trigger.alert_id);
                return Ok(FilterVerdict::Muted);
            }
        }

        // 2. Rolling per-tenant rate limit over the last minute.
        let recent = self
            .store
            .count_dedup_since(&trigger.tenant_id, now - Duration::seconds(60))
            .await?;
        if recent >= self.config.rate_limit_per_minute {
            info!(
                "tenant {} rate limited ({} alerts in the last minute)",
                trigger.tenant_id, recent
            );
            return Ok(FilterVerdict::RateLimited);
        }

        // 3. Deduplication.
        let dedup_key = dedup_key_for(trigger, rule);

        let cached_live = {
            let cache = self.cache.read().await;
            cache
                .get(&dedup_key)
                .map(|record| record.expires_at > now)
                .unwrap_or(false)
        };
        if cached_live {
            let count = self.store.increment_dedup(&dedup_key).await?;
            let mut cache = self.cache.write().await;
            if let Some(record) = cache.get_mut(&dedup_key) {
                record.count = count;
            }
            return Ok(FilterVerdict::Duplicate { count });
        }

        if let Some(live) = self.store.get_dedup(&dedup_key, now).await? {
            let count = self.store.increment_dedup(&dedup_key).await?;
            let mut updated = live;
            updated.count = count;
            self.cache.write().await.insert(dedup_key, updated);
            return Ok(FilterVerdict::Duplicate { count });
        }

        let window_ms = rule
            .suppression
            .as_ref()
            .and_then(|s| s.dedup_window_ms)
            .unwrap_or(self.config.default_dedup_window_ms);
        let record = DedupRecord {
            dedup_key: dedup_key.clone(),
            tenant_id: trigger.tenant_id.clone(),
            first_alert_id: trigger.alert_id,
            first_triggered_at: trigger.triggered_at,
            expires_at: now + Duration::milliseconds(window_ms as i64),
            count: 1,
        };
        self.store.insert_dedup(&record).await?;
        self.cache.write().await.insert(dedup_key, record);
        Ok(FilterVerdict::Dispatch)
    }

    /// Delete expired dedup records and trim the in-memory cache
    pub async fn cleanup(&self) -> Result<usize> {
        let now = now_millis();
        let removed = self.store.cleanup_dedup(now).await?;
        let mut cache = self.cache.write().await;
        cache.retain(|_, record| record.expires_at > now);
        Ok(removed)
    }
}

/// The alert's logical identity: the configured key, or a derivation from
/// tenant, metric, trigger type, severity and sorted dimensions.
pub fn dedup_key_for(trigger: &AlertTrigger, rule: &AlertRule) -> String {
    if let Some(key) = &rule.routing.dedup_key {
        return format!("{}|{}", trigger.tenant_id, key);
    }
    let mut parts = vec![
        trigger.tenant_id.clone(),
        trigger.metric_context.metric_key.clone(),
        trigger.trigger_type.clone(),
        trigger.severity.as_str().to_string(),
    ];
    // BTreeMap iteration is already sorted by key.
    for (key, value) in &trigger.metric_context.dimensions {
        let rendered = match value {
            DimensionValue::String(s) => s.clone(),
            DimensionValue::Bool(b) => b.to_string(),
            DimensionValue::Number(n) => n.to_string(),
        };
        parts.push(format!("{}={}", key, rendered));
    }
    parts.join("|")
}

/// Whether `now` falls inside any mute window, using a lexical HH:MM
/// compare. `start > end` denotes a window crossing midnight.
pub fn is_muted_at(windows: &[MuteWindow], now: DateTime<Utc>) -> bool {
    let time = format!("{:02}:{:02}", now.hour(), now.minute());
    let weekday = chrono::Datelike::weekday(&now).num_days_from_sunday() as u8;

    for window in windows {
        if let Some(days) = &window.days {
            if !days.contains(&weekday) {
                continue;
            }
        }
        let inside = if window.start_hhmm <= window.end_hhmm {
            time.as_str() >= window.start_hhmm.as_str()
                && time.as_str() < window.end_hhmm.as_str()
        } else {
            // Cross-midnight window.
            time.as_str() >= window.start_hhmm.as_str()
                || time.as_str() < window.end_hhmm.as_str()
        };
        if inside {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_common::time::parse_timestamp;
    use pulse_common::{
        AlertStatus, ChannelRef, ChannelType, MetricContext, Routing, RuleCondition, Severity,
        Suppression, ThresholdOp, TriggerDetails,
    };
    use pulse_store::{ConnectionPool, PoolConfig};
    use uuid::Uuid;

    async fn test_filter(rate_limit: u64) -> (tempfile::TempDir, AlertFilter) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("filter.db");
        let pool = Arc::new(ConnectionPool::new(PoolConfig::new(
            path.to_string_lossy().to_string(),
        )));
        pool.with_conn(|conn| pulse_store::bootstrap(conn))
            .await
            .unwrap();
        let filter = AlertFilter::new(
            Arc::new(AlertStore::new(pool)),
            FilterConfig {
                default_dedup_window_ms: 300_000,
                rate_limit_per_minute: rate_limit,
            },
        );
        (dir, filter)
    }

    fn rule_with_suppression(suppression: Option<Suppression>) -> AlertRule {
        AlertRule {
            rule_id: "r-1".into(),
            tenant_id: "acme".into(),
            name: "cpu high".into(),
            description: String::new(),
            enabled: true,
            metric_key: "system.cpu.usage".into(),
            dimension_filters: None,
            condition: RuleCondition::Threshold {
                op: ThresholdOp::Gt,
                value: 80.0,
                duration_ms: None,
            },
            severity: Severity::Warning,
            routing: Routing {
                channels: vec![ChannelRef {
                    channel_type: ChannelType::Webhook,
                    destination: "https://hooks.example.com/a".into(),
                }],
                dedup_key: None,
            },
            suppression,
        }
    }

    fn trigger(now: DateTime<Utc>) -> AlertTrigger {
        AlertTrigger {
            alert_id: Uuid::new_v4(),
            rule_id: "r-1".into(),
            tenant_id: "acme".into(),
            triggered_at: now,
            severity: Severity::Warning,
            status: AlertStatus::Firing,
            trigger_type: "threshold".into(),
            title: "cpu high".into(),
            description: String::new(),
            metric_context: MetricContext {
                metric_key: "system.cpu.usage".into(),
                value: 85.0,
                timestamp: now,
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

    #[test]
    fn cross_midnight_window_covers_both_sides() {
        let windows = vec![MuteWindow {
            start_hhmm: "22:00".into(),
            end_hhmm: "06:00".into(),
            days: None,
        }];
        let late = parse_timestamp("2025-01-01T23:30:00.000Z").unwrap();
        let early = parse_timestamp("2025-01-02T05:59:00.000Z").unwrap();
        let morning = parse_timestamp("2025-01-02T07:00:00.000Z").unwrap();
        assert!(is_muted_at(&windows, late));
        assert!(is_muted_at(&windows, early));
        assert!(!is_muted_at(&windows, morning));
    }

    #[test]
    fn day_restricted_window_skips_other_days() {
        // 2025-01-01 is a Wednesday (weekday 3).
        let windows = vec![MuteWindow {
            start_hhmm: "00:00".into(),
            end_hhmm: "23:59".into(),
            days: Some(vec![0, 6]),
        }];
        let wednesday = parse_timestamp("2025-01-01T12:00:00.000Z").unwrap();
        assert!(!is_muted_at(&windows, wednesday));

        let sunday = parse_timestamp("2025-01-05T12:00:00.000Z").unwrap();
        assert!(is_muted_at(&windows, sunday));
    }

    #[tokio::test]
    async fn first_alert_dispatches_second_coalesces() {
        let (_dir, filter) = test_filter(60).await;
        let rule = rule_with_suppression(None);
        let now = now_millis();

        let first = filter.check_at(&trigger(now), &rule, now).await.unwrap();
        assert_eq!(first, FilterVerdict::Dispatch);

        let second = filter.check_at(&trigger(now), &rule, now).await.unwrap();
        assert_eq!(second, FilterVerdict::Duplicate { count: 2 });

        let third = filter.check_at(&trigger(now), &rule, now).await.unwrap();
        assert_eq!(third, FilterVerdict::Duplicate { count: 3 });
    }

    #[tokio::test]
    async fn dedup_window_expiry_allows_a_fresh_dispatch() {
        let (_dir, filter) = test_filter(60).await;
        let rule = rule_with_suppression(Some(Suppression {
            mute_windows: vec![],
            dedup_window_ms: Some(1_000),
        }));
        let now = now_millis();

        assert_eq!(
            filter.check_at(&trigger(now), &rule, now).await.unwrap(),
            FilterVerdict::Dispatch
        );
        let later = now + Duration::seconds(2);
        assert_eq!(
            filter.check_at(&trigger(later), &rule, later).await.unwrap(),
            FilterVerdict::Dispatch
        );
    }

    #[tokio::test]
    async fn muted_window_short_circuits_before_dedup() {
        let (_dir, filter) = test_filter(60).await;
        let rule = rule_with_suppression(Some(Suppression {
            mute_windows: vec![MuteWindow {
                start_hhmm: "00:00".into(),
                end_hhmm: "23:59".into(),
                days: None,
            }],
            dedup_window_ms: None,
        }));
        let now = parse_timestamp("2025-01-01T12:00:00.000Z").unwrap();
        assert_eq!(
            filter.check_at(&trigger(now), &rule, now).await.unwrap(),
            FilterVerdict::Muted
        );
    }

    #[tokio::test]
    async fn rate_limit_denies_after_budget() {
        let (_dir, filter) = test_filter(2).await;
        let rule = rule_with_suppression(None);
        let now = now_millis();

        // Two distinct alerts fill the budget (distinct dedup keys via
        // differing severity).
        let mut a = trigger(now);
        a.severity = Severity::Info;
        let mut b = trigger(now);
        b.severity = Severity::Error;
        assert_eq!(filter.check_at(&a, &rule, now).await.unwrap(), FilterVerdict::Dispatch);
        assert_eq!(filter.check_at(&b, &rule, now).await.unwrap(), FilterVerdict::Dispatch);

        let c = trigger(now);
        assert_eq!(
            filter.check_at(&c, &rule, now).await.unwrap(),
            FilterVerdict::RateLimited
        );
    }

    #[tokio::test]
    async fn cleanup_drops_expired_records() {
        let (_dir, filter) = test_filter(60).await;
        let rule = rule_with_suppression(Some(Suppression {
            mute_windows: vec![],
            dedup_window_ms: Some(1),
        }));
        let now = now_millis();
        filter.check_at(&trigger(now), &rule, now).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let removed = filter.cleanup().await.unwrap();
        assert_eq!(removed, 1);
        assert!(filter.cache.read().await.is_empty());
    }
}
