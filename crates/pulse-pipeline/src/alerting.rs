//! The alert path: evaluate -> filter -> register -> dispatch
//!
//! Wired as its own unit so the HTTP surface, the scheduler and the tests
//! drive the same flow with an injected dispatcher.

use pulse_alerts::{
    AlertFilter, DispatchOutcome, FilterVerdict, LifecycleManager, NotificationDispatcher,
    RulesEngine,
};
use pulse_common::{EvaluationContext, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What happened to one matched rule
#[derive(Debug)]
pub struct ProcessedAlert {
    pub rule_id: String,
    pub verdict: FilterVerdict,
    /// Present when the alert was registered with the lifecycle manager
    pub alert_id: Option<Uuid>,
    pub dispatch: Vec<DispatchOutcome>,
}

/// Evaluates contexts and walks surviving candidates through filtering,
/// lifecycle registration and fan-out.
pub struct AlertPipeline {
    rules: Arc<RulesEngine>,
    filter: Arc<AlertFilter>,
    dispatcher: Arc<NotificationDispatcher>,
    lifecycle: Arc<LifecycleManager>,
}

impl AlertPipeline {
    pub fn new(
        rules: Arc<RulesEngine>,
        filter: Arc<AlertFilter>,
        dispatcher: Arc<NotificationDispatcher>,
        lifecycle: Arc<LifecycleManager>,
    ) -> Self {
        Self {
            rules,
            filter,
            dispatcher,
            lifecycle,
        }
    }

    pub fn filter(&self) -> &AlertFilter {
        &self.filter
    }

    pub fn lifecycle(&self) -> &Arc<LifecycleManager> {
        &self.lifecycle
    }

    /// Evaluate every applicable rule and process the matches. Errors on
    /// one candidate never block the others.
    pub async fn process(&self, context: &EvaluationContext) -> Vec<ProcessedAlert> {
        let evaluations = self.rules.evaluate(context).await;
        let mut processed = Vec::new();

        for evaluation in evaluations {
            if !evaluation.matched {
                debug!("rule {} did not match: {}", evaluation.rule_id, evaluation.reason);
                continue;
            }
            let Some(trigger) = evaluation.trigger else {
                continue;
            };
            let Some(rule) = self.rules.get_rule(&evaluation.rule_id).await else {
                warn!("matched rule {} disappeared before filtering", evaluation.rule_id);
                continue;
            };

            match self.process_candidate(&trigger, &rule).await {
                Ok(outcome) => processed.push(outcome),
                Err(e) => {
                    warn!(
                        "failed to process candidate for rule {}: {}",
                        evaluation.rule_id, e
                    );
                }
            }
        }
        processed
    }

    async fn process_candidate(
        &self,
        trigger: &pulse_common::AlertTrigger,
        rule: &pulse_common::AlertRule,
    ) -> Result<ProcessedAlert> {
        let verdict = self.filter.check(trigger, rule).await?;
        if verdict != FilterVerdict::Dispatch {
            debug!(
                "candidate for rule {} suppressed: {:?}",
                trigger.rule_id, verdict
            );
            return Ok(ProcessedAlert {
                rule_id: trigger.rule_id.clone(),
                verdict,
                alert_id: None,
                dispatch: Vec::new(),
            });
        }

        self.lifecycle.register(trigger).await?;
        let dispatch = self.dispatcher.dispatch(trigger).await;
        if dispatch.iter().any(|d| d.result.success) {
            self.lifecycle.record_notification(trigger.alert_id).await?;
        }
        info!(
            "alert {} dispatched to {} channel(s)",
            trigger.alert_id,
            dispatch.len()
        );

        Ok(ProcessedAlert {
            rule_id: trigger.rule_id.clone(),
            verdict: FilterVerdict::Dispatch,
            alert_id: Some(trigger.alert_id),
            dispatch,
        })
    }
}
