//! Alert rules, triggers, lifecycle state and evaluation context

use crate::forecast::{AnomalyPoint, AnomalySeverity, Prediction};
use crate::metric::{Dimensions, MetricPoint, TimeSeries};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Alert severity levels
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

/// Comparison operator for threshold conditions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThresholdOp {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = ">=")]
    Gte,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Lte,
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = "!=")]
    Ne,
}

impl ThresholdOp {
    pub fn compare(&self, current: f64, threshold: f64) -> bool {
        match self {
            ThresholdOp::Gt => current > threshold,
            ThresholdOp::Gte => current >= threshold,
            ThresholdOp::Lt => current < threshold,
            ThresholdOp::Lte => current <= threshold,
            ThresholdOp::Eq => (current - threshold).abs() < f64::EPSILON,
            ThresholdOp::Ne => (current - threshold).abs() >= f64::EPSILON,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ThresholdOp::Gt => ">",
            ThresholdOp::Gte => ">=",
            ThresholdOp::Lt => "<",
            ThresholdOp::Lte => "<=",
            ThresholdOp::Eq => "=",
            ThresholdOp::Ne => "!=",
        }
    }
}

/// Tagged condition variants a rule can evaluate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleCondition {
    Threshold {
        op: ThresholdOp,
        value: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },
    Anomaly {
        min_severity: AnomalySeverity,
    },
    Forecast {
        horizon_hours: u32,
        threshold: f64,
    },
    RateOfChange {
        max_rate: f64,
        unit: String,
    },
    MissingData {
        expected_interval_ms: u64,
    },
}

impl RuleCondition {
    /// The trigger type string reported on matched alerts
    pub fn kind(&self) -> &'static str {
        match self {
            RuleCondition::Threshold { .. } => "threshold",
            RuleCondition::Anomaly { .. } => "anomaly",
            RuleCondition::Forecast { .. } => "forecast",
            RuleCondition::RateOfChange { .. } => "rate_of_change",
            RuleCondition::MissingData { .. } => "missing_data",
        }
    }
}

/// Notification channel kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    Webhook,
    Email,
    Chat,
    Pager,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::Webhook => "webhook",
            ChannelType::Email => "email",
            ChannelType::Chat => "chat",
            ChannelType::Pager => "pager",
        }
    }
}

/// One routing target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRef {
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    pub destination: String,
}

/// Where matched alerts go and how repeats coalesce
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Routing {
    pub channels: Vec<ChannelRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_key: Option<String>,
}

/// Recurring time-of-day interval during which alerts are suppressed.
///
/// `start_hhmm > end_hhmm` denotes a window crossing midnight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MuteWindow {
    pub start_hhmm: String,
    pub end_hhmm: String,
    /// Weekday restriction, 0 = Sunday through 6 = Saturday
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub days: Option<Vec<u8>>,
}

/// Rule-level suppression settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suppression {
    #[serde(default)]
    pub mute_windows: Vec<MuteWindow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_window_ms: Option<u64>,
}

/// A configured alert rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub rule_id: String,
    pub tenant_id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub enabled: bool,
    pub metric_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimension_filters: Option<Dimensions>,
    pub condition: RuleCondition,
    pub severity: Severity,
    pub routing: Routing,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suppression: Option<Suppression>,
}

/// Details of what a condition observed when it matched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerDetails {
    Threshold {
        op: ThresholdOp,
        threshold: f64,
        observed: f64,
    },
    Anomaly {
        anomaly: AnomalyPoint,
    },
    Forecast {
        prediction: Prediction,
        threshold: f64,
        horizon_hours: u32,
    },
    RateOfChange {
        previous: f64,
        current: f64,
        rate: f64,
        max_rate: f64,
    },
    MissingData {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_seen_at: Option<DateTime<Utc>>,
        expected_interval_ms: u64,
    },
}

/// The metric snapshot an alert fired on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricContext {
    pub metric_key: String,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub dimensions: Dimensions,
}

/// Lifecycle status of an alert
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    Firing,
    Acknowledged,
    Resolved,
    Escalated,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Firing => "firing",
            AlertStatus::Acknowledged => "acknowledged",
            AlertStatus::Resolved => "resolved",
            AlertStatus::Escalated => "escalated",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "firing" => Some(AlertStatus::Firing),
            "acknowledged" => Some(AlertStatus::Acknowledged),
            "resolved" => Some(AlertStatus::Resolved),
            "escalated" => Some(AlertStatus::Escalated),
            _ => None,
        }
    }

    /// Whether the state machine allows `self -> to`
    pub fn can_transition_to(&self, to: AlertStatus) -> bool {
        use AlertStatus::*;
        match (self, to) {
            (Firing, Acknowledged) | (Firing, Escalated) | (Firing, Resolved) => true,
            (Acknowledged, Resolved) => true,
            (Escalated, Acknowledged) | (Escalated, Resolved) => true,
            _ => false,
        }
    }
}

/// Candidate alert produced by a matched rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertTrigger {
    pub alert_id: Uuid,
    pub rule_id: String,
    pub tenant_id: String,
    pub triggered_at: DateTime<Utc>,
    pub severity: Severity,
    pub status: AlertStatus,
    pub trigger_type: String,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub metric_context: MetricContext,
    pub trigger_details: TriggerDetails,
    pub routing: Routing,
}

/// Mutable lifecycle state tracked per alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertState {
    pub alert_id: Uuid,
    pub tenant_id: String,
    pub rule_id: String,
    pub severity: Severity,
    pub status: AlertStatus,
    pub triggered_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalated_at: Option<DateTime<Utc>>,
    pub escalation_level: u32,
    pub notification_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_notified_at: Option<DateTime<Utc>>,
}

impl AlertState {
    /// Initial state for a freshly registered trigger
    pub fn new(trigger: &AlertTrigger) -> Self {
        AlertState {
            alert_id: trigger.alert_id,
            tenant_id: trigger.tenant_id.clone(),
            rule_id: trigger.rule_id.clone(),
            severity: trigger.severity,
            status: AlertStatus::Firing,
            triggered_at: trigger.triggered_at,
            acknowledged_at: None,
            acknowledged_by: None,
            resolved_at: None,
            resolved_by: None,
            escalated_at: None,
            escalation_level: 0,
            notification_count: 0,
            last_notified_at: None,
        }
    }
}

/// One recorded state transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertTransition {
    pub alert_id: Uuid,
    pub from: AlertStatus,
    pub to: AlertStatus,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Coalescing record for repeated alerts sharing a dedup key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupRecord {
    pub dedup_key: String,
    pub tenant_id: String,
    pub first_alert_id: Uuid,
    pub first_triggered_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub count: u64,
}

/// The bundle a rule is evaluated against
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationContext {
    pub metric: MetricPoint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series: Option<TimeSeries>,
    #[serde(default)]
    pub forecasts: Vec<Prediction>,
    #[serde(default)]
    pub anomalies: Vec<AnomalyPoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_value: Option<f64>,
}

/// Outcome of evaluating one rule against one context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleEvaluation {
    pub rule_id: String,
    pub matched: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<AlertTrigger>,
    pub reason: String,
    pub evaluated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threshold_ops_compare() {
        assert!(ThresholdOp::Gt.compare(85.0, 80.0));
        assert!(!ThresholdOp::Gt.compare(80.0, 80.0));
        assert!(ThresholdOp::Gte.compare(80.0, 80.0));
        assert!(ThresholdOp::Lt.compare(1.0, 2.0));
        assert!(ThresholdOp::Eq.compare(3.0, 3.0));
        assert!(ThresholdOp::Ne.compare(3.0, 4.0));
    }

    #[test]
    fn condition_tags_round_trip() {
        let raw = r#"{"type":"threshold","op":">","value":80.0}"#;
        let cond: RuleCondition = serde_json::from_str(raw).unwrap();
        assert_eq!(cond.kind(), "threshold");
        match cond {
            RuleCondition::Threshold { op, value, duration_ms } => {
                assert_eq!(op, ThresholdOp::Gt);
                assert_eq!(value, 80.0);
                assert_eq!(duration_ms, None);
            }
            other => panic!("unexpected condition: {:?}", other),
        }

        let raw = r#"{"type":"anomaly","min_severity":"high"}"#;
        let cond: RuleCondition = serde_json::from_str(raw).unwrap();
        assert_eq!(cond.kind(), "anomaly");
    }

    #[test]
    fn status_graph_is_monotonic() {
        use AlertStatus::*;
        assert!(Firing.can_transition_to(Acknowledged));
        assert!(Firing.can_transition_to(Escalated));
        assert!(Firing.can_transition_to(Resolved));
        assert!(Escalated.can_transition_to(Acknowledged));
        assert!(Acknowledged.can_transition_to(Resolved));
        // Resolved is terminal
        assert!(!Resolved.can_transition_to(Firing));
        assert!(!Resolved.can_transition_to(Acknowledged));
        assert!(!Resolved.can_transition_to(Escalated));
        // No backward edges
        assert!(!Acknowledged.can_transition_to(Firing));
        assert!(!Escalated.can_transition_to(Firing));
    }

    #[test]
    fn severity_ordering() {
        assert!(Severity::Info < Severity::Warning);
        assert!(Severity::Warning < Severity::Error);
        assert!(Severity::Error < Severity::Critical);
    }
}
