//! Rule loading, indexing and evaluation
//!
//! Rules are evaluated against an [`EvaluationContext`] bundling the
//! current point, recent series, forecasts and anomalies. Evaluation never
//! propagates errors to the caller: a failing rule reports
//! `matched = false` with the error in its reason.

use pulse_common::time::now_millis;
use pulse_common::{
    AlertRule, AlertStatus, AlertTrigger, EvaluationContext, MetricContext, Result,
    RuleCondition, RuleEvaluation, TriggerDetails,
};
use pulse_store::AlertStore;
use chrono::Duration;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Concurrent registry and evaluator for alert rules
pub struct RulesEngine {
    rules: RwLock<HashMap<String, Arc<AlertRule>>>,
}

impl RulesEngine {
    pub fn new() -> Self {
        Self {
            rules: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register_rule(&self, rule: AlertRule) {
        let mut rules = self.rules.write().await;
        if rules.insert(rule.rule_id.clone(), Arc::new(rule.clone())).is_some() {
            debug!("replaced rule '{}'", rule.rule_id);
        }
    }

    pub async fn unregister_rule(&self, rule_id: &str) -> bool {
        self.rules.write().await.remove(rule_id).is_some()
    }

    pub async fn get_rule(&self, rule_id: &str) -> Option<Arc<AlertRule>> {
        self.rules.read().await.get(rule_id).cloned()
    }

    /// All rules, optionally restricted to one tenant
    pub async fn list_rules(&self, tenant_id: Option<&str>) -> Vec<Arc<AlertRule>> {
        let rules = self.rules.read().await;
        let mut listed: Vec<_> = rules
            .values()
            .filter(|r| tenant_id.map(|t| r.tenant_id == t).unwrap_or(true))
            .cloned()
            .collect();
        listed.sort_by(|a, b| a.rule_id.cmp(&b.rule_id));
        listed
    }

    /// Replace the in-memory set with the persisted rules
    pub async fn load_from_store(&self, store: &AlertStore) -> Result<usize> {
        let loaded = store.load_rules(None).await?;
        let count = loaded.len();
        let mut rules = self.rules.write().await;
        rules.clear();
        for rule in loaded {
            rules.insert(rule.rule_id.clone(), Arc::new(rule));
        }
        info!("loaded {} alert rule(s) from store", count);
        Ok(count)
    }

    /// Evaluate every applicable rule against the context. Exceptions are
    /// trapped per rule; this method itself never fails.
    pub async fn evaluate(&self, context: &EvaluationContext) -> Vec<RuleEvaluation> {
        let rules = self.rules.read().await;
        let mut results = Vec::new();
        for rule in rules.values() {
            if !applies(rule, context) {
                continue;
            }
            results.push(evaluate_rule(rule, context));
        }
        results.sort_by(|a, b| a.rule_id.cmp(&b.rule_id));
        results
    }
}

impl Default for RulesEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// A rule applies when enabled, tenant and metric key match, and every
/// dimension filter equals the context's dimension.
fn applies(rule: &AlertRule, context: &EvaluationContext) -> bool {
    if !rule.enabled {
        return false;
    }
    if rule.tenant_id != context.metric.tenant_id || rule.metric_key != context.metric.metric_key {
        return false;
    }
    if let Some(filters) = &rule.dimension_filters {
        for (key, expected) in filters {
            if context.metric.dimensions.get(key) != Some(expected) {
                return false;
            }
        }
    }
    true
}

fn evaluate_rule(rule: &AlertRule, context: &EvaluationContext) -> RuleEvaluation {
    let evaluated_at = now_millis();
    match evaluate_condition(rule, context) {
        Ok(Some((details, reason))) => RuleEvaluation {
            rule_id: rule.rule_id.clone(),
            matched: true,
            trigger: Some(build_trigger(rule, context, details)),
            reason,
            evaluated_at,
        },
        Ok(None) => RuleEvaluation {
            rule_id: rule.rule_id.clone(),
            matched: false,
            trigger: None,
            reason: "condition not met".to_string(),
            evaluated_at,
        },
        Err(e) => {
            warn!("rule '{}' failed to evaluate: {}", rule.rule_id, e);
            RuleEvaluation {
                rule_id: rule.rule_id.clone(),
                matched: false,
                trigger: None,
                reason: format!("Evaluation error: {}", e),
                evaluated_at,
            }
        }
    }
}

type ConditionOutcome = Option<(TriggerDetails, String)>;

fn evaluate_condition(
    rule: &AlertRule,
    context: &EvaluationContext,
) -> Result<ConditionOutcome> {
    match &rule.condition {
        RuleCondition::Threshold { op, value, duration_ms } => {
            let current = context.metric.value;
            if !op.compare(current, *value) {
                return Ok(None);
            }
            // With a duration, every recent point must stay in breach.
            if let (Some(duration_ms), Some(series)) = (duration_ms, &context.series) {
                let window_start =
                    context.metric.timestamp - Duration::milliseconds(*duration_ms as i64);
                let sustained = series
                    .points
                    .iter()
                    .filter(|p| p.timestamp >= window_start)
                    .all(|p| op.compare(p.value, *value));
                if !sustained {
                    return Ok(None);
                }
            }
            Ok(Some((
                TriggerDetails::Threshold {
                    op: *op,
                    threshold: *value,
                    observed: current,
                },
                format!("value {:.2} {} {:.2}", current, op.as_str(), value),
            )))
        }
        RuleCondition::Anomaly { min_severity } => {
            let hit = context
                .anomalies
                .iter()
                .find(|a| a.severity >= *min_severity);
            Ok(hit.map(|anomaly| {
                (
                    TriggerDetails::Anomaly {
                        anomaly: anomaly.clone(),
                    },
                    format!(
                        "{} anomaly (score {:.3}) at {}",
                        anomaly.severity.as_str(),
                        anomaly.score,
                        anomaly.timestamp
                    ),
                )
            }))
        }
        RuleCondition::Forecast { horizon_hours, threshold } => {
            let cutoff = context.metric.timestamp + Duration::hours(*horizon_hours as i64);
            let breach = context
                .forecasts
                .iter()
                .find(|p| p.timestamp <= cutoff && p.value > *threshold);
            Ok(breach.map(|prediction| {
                (
                    TriggerDetails::Forecast {
                        prediction: prediction.clone(),
                        threshold: *threshold,
                        horizon_hours: *horizon_hours,
                    },
                    format!(
                        "forecast {:.2} exceeds {:.2} within {}h",
                        prediction.value, threshold, horizon_hours
                    ),
                )
            }))
        }
        RuleCondition::RateOfChange { max_rate, .. } => {
            let previous = match context.previous_value {
                Some(previous) => previous,
                None => return Ok(None),
            };
            let current = context.metric.value;
            let rate = (current - previous).abs();
            if rate <= *max_rate {
                return Ok(None);
            }
            Ok(Some((
                TriggerDetails::RateOfChange {
                    previous,
                    current,
                    rate,
                    max_rate: *max_rate,
                },
                format!("change {:.2} exceeds max rate {:.2}", rate, max_rate),
            )))
        }
        RuleCondition::MissingData { expected_interval_ms } => {
            let now = now_millis();
            let silent = match context.last_seen_at {
                Some(last_seen) => {
                    (now - last_seen).num_milliseconds() > *expected_interval_ms as i64
                }
                // Nothing ever seen: staleness is unbounded.
                None => true,
            };
            if !silent {
                return Ok(None);
            }
            Ok(Some((
                TriggerDetails::MissingData {
                    last_seen_at: context.last_seen_at,
                    expected_interval_ms: *expected_interval_ms,
                },
                match context.last_seen_at {
                    Some(last_seen) => format!("no data since {}", last_seen),
                    None => "no data has ever been seen".to_string(),
                },
            )))
        }
    }
}

fn build_trigger(
    rule: &AlertRule,
    context: &EvaluationContext,
    details: TriggerDetails,
) -> AlertTrigger {
    AlertTrigger {
        alert_id: Uuid::new_v4(),
        rule_id: rule.rule_id.clone(),
        tenant_id: rule.tenant_id.clone(),
        triggered_at: now_millis(),
        severity: rule.severity,
        status: AlertStatus::Firing,
        trigger_type: rule.condition.kind().to_string(),
        title: rule.name.clone(),
        description: rule.description.clone(),
        metric_context: MetricContext {
            metric_key: context.metric.metric_key.clone(),
            value: context.metric.value,
            timestamp: context.metric.timestamp,
            dimensions: context.metric.dimensions.clone(),
        },
        trigger_details: details,
        routing: rule.routing.clone(),
    }
}
