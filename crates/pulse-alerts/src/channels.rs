//! Notification channels: webhook, email, chat and pager
//!
//! Every channel formats the alert into its wire shape and reports
//! `{success, retryable, error}`; the dispatcher owns the retry policy.

use async_trait::async_trait;
use pulse_common::time::format_timestamp;
use pulse_common::{AlertStatus, AlertTrigger, ChannelType, Severity};
use reqwest::Client;
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Outcome of one channel send attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendResult {
    pub success: bool,
    pub retryable: bool,
    pub error: Option<String>,
}

impl SendResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            retryable: false,
            error: None,
        }
    }

    pub fn failed(retryable: bool, error: impl Into<String>) -> Self {
        Self {
            success: false,
            retryable,
            error: Some(error.into()),
        }
    }
}

/// Per-channel behavior settings
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub enabled: bool,
    pub timeout: Duration,
    pub max_retries: u32,
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            timeout: Duration::from_secs(10),
            max_retries: 3,
        }
    }
}

/// A notification transport
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn channel_type(&self) -> ChannelType;

    /// Send the alert to `destination`. `attempt` is 1-based.
    async fn send(&self, alert: &AlertTrigger, destination: &str, attempt: u32) -> SendResult;
}

/// Severity to chat attachment color
fn chat_color(severity: Severity) -> &'static str {
    match severity {
        Severity::Info => "#2196F3",
        Severity::Warning => "#FF9800",
        Severity::Error => "#F44336",
        Severity::Critical => "#9C27B0",
    }
}

async fn post_json(
    client: &Client,
    url: &str,
    timeout: Duration,
    payload: &serde_json::Value,
) -> SendResult {
    let response = match client.post(url).timeout(timeout).json(payload).send().await {
        Ok(response) => response,
        Err(e) => {
            let retryable = !e.is_builder();
            return SendResult::failed(retryable, format!("request failed: {}", e));
        }
    };
    let status = response.status();
    if status.is_success() {
        SendResult::ok()
    } else {
        let retryable = status.is_server_error() || status.as_u16() == 429 || status.as_u16() == 408;
        SendResult::failed(retryable, format!("endpoint returned {}", status))
    }
}

/// Generic webhook channel posting the full alert shape
pub struct WebhookChannel {
    client: Client,
    settings: ChannelSettings,
}

impl WebhookChannel {
    pub fn new(client: Client, settings: ChannelSettings) -> Self {
        Self { client, settings }
    }

    fn payload(alert: &AlertTrigger) -> serde_json::Value {
        json!({
            "event_type": "alert",
            "alert_id": alert.alert_id,
            "rule_id": alert.rule_id,
            "tenant_id": alert.tenant_id,
            "severity": alert.severity.as_str(),
            "status": alert.status.as_str(),
            "title": alert.title,
            "description": alert.description,
            "triggered_at": format_timestamp(alert.triggered_at),
            "metric": alert.metric_context,
            "trigger": alert.trigger_details,
        })
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Webhook
    }

    async fn send(&self, alert: &AlertTrigger, destination: &str, attempt: u32) -> SendResult {
        debug!(
            "webhook send for alert {} to {} (attempt {})",
            alert.alert_id, destination, attempt
        );
        post_json(
            &self.client,
            destination,
            self.settings.timeout,
            &Self::payload(alert),
        )
        .await
    }
}

/// Chat webhook channel with colored attachments
pub struct ChatChannel {
    client: Client,
    settings: ChannelSettings,
}

impl ChatChannel {
    pub fn new(client: Client, settings: ChannelSettings) -> Self {
        Self { client, settings }
    }

    fn payload(alert: &AlertTrigger) -> serde_json::Value {
        json!({
            "attachments": [{
                "color": chat_color(alert.severity),
                "title": alert.title,
                "text": alert.description,
                "fields": [
                    {"title": "Metric", "value": alert.metric_context.metric_key, "short": true},
                    {"title": "Value", "value": format!("{:.2}", alert.metric_context.value), "short": true},
                    {"title": "Severity", "value": alert.severity.as_str(), "short": true},
                    {"title": "Status", "value": alert.status.as_str(), "short": true},
                ],
                "ts": alert.triggered_at.timestamp(),
            }]
        })
    }
}

#[async_trait]
impl NotificationChannel for ChatChannel {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Chat
    }

    async fn send(&self, alert: &AlertTrigger, destination: &str, attempt: u32) -> SendResult {
        debug!(
            "chat send for alert {} (attempt {})",
            alert.alert_id, attempt
        );
        post_json(
            &self.client,
            destination,
            self.settings.timeout,
            &Self::payload(alert),
        )
        .await
    }
}

/// Pager events channel; the destination is the routing key
pub struct PagerChannel {
    client: Client,
    settings: ChannelSettings,
    events_url: String,
}

impl PagerChannel {
    pub fn new(client: Client, settings: ChannelSettings) -> Self {
        Self {
            client,
            settings,
            events_url: "https://events.pagerduty.com/v2/enqueue".to_string(),
        }
    }

    pub fn with_events_url(mut self, events_url: impl Into<String>) -> Self {
        self.events_url = events_url.into();
        self
    }

    fn pager_severity(severity: Severity) -> &'static str {
        match severity {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }

    fn payload(alert: &AlertTrigger, routing_key: &str) -> serde_json::Value {
        let event_action = if alert.status == AlertStatus::Resolved {
            "resolve"
        } else {
            "trigger"
        };
        json!({
            "routing_key": routing_key,
            "event_action": event_action,
            "dedup_key": alert.alert_id,
            "payload": {
                "summary": format!("[{}] {}", alert.severity.as_str(), alert.title),
                "source": alert.metric_context.metric_key,
                "severity": Self::pager_severity(alert.severity),
                "timestamp": format_timestamp(alert.triggered_at),
                "custom_details": {
                    "tenant_id": alert.tenant_id,
                    "rule_id": alert.rule_id,
                    "value": alert.metric_context.value,
                    "dimensions": alert.metric_context.dimensions,
                },
            },
        })
    }
}

#[async_trait]
impl NotificationChannel for PagerChannel {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Pager
    }

    async fn send(&self, alert: &AlertTrigger, destination: &str, attempt: u32) -> SendResult {
        debug!(
            "pager send for alert {} (attempt {})",
            alert.alert_id, attempt
        );
        post_json(
            &self.client,
            &self.events_url,
            self.settings.timeout,
            &Self::payload(alert, destination),
        )
        .await
    }
}

/// Email channel. Renders a subject/body pair and hands it to the
/// configured relay endpoint; without a relay it logs the rendered mail
/// and reports success.
pub struct EmailChannel {
    client: Client,
    settings: ChannelSettings,
    relay_url: Option<String>,
}

impl EmailChannel {
    pub fn new(client: Client, settings: ChannelSettings) -> Self {
        Self {
            client,
            settings,
            relay_url: None,
        }
    }

    pub fn with_relay_url(mut self, relay_url: impl Into<String>) -> Self {
        self.relay_url = Some(relay_url.into());
        self
    }

    fn render(alert: &AlertTrigger) -> (String, String) {
        let subject = format!(
            "[{}] {} ({})",
            alert.severity.as_str().to_uppercase(),
            alert.title,
            alert.metric_context.metric_key
        );
        let body = format!(
            "Alert {alert_id} is {status}.\n\n\
             Rule: {rule_id}\n\
             Metric: {metric} = {value:.2}\n\
             Triggered at: {triggered_at}\n\n\
             {description}\n",
            alert_id = alert.alert_id,
            status = alert.status.as_str(),
            rule_id = alert.rule_id,
            metric = alert.metric_context.metric_key,
            value = alert.metric_context.value,
            triggered_at = format_timestamp(alert.triggered_at),
            description = alert.description,
        );
        (subject, body)
    }
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn channel_type(&self) -> ChannelType {
        ChannelType::Email
    }

    async fn send(&self, alert: &AlertTrigger, destination: &str, attempt: u32) -> SendResult {
        let (subject, body) = Self::render(alert);
        match &self.relay_url {
            Some(relay_url) => {
                debug!(
                    "email send for alert {} to {} (attempt {})",
                    alert.alert_id, destination, attempt
                );
                post_json(
                    &self.client,
                    relay_url,
                    self.settings.timeout,
                    &json!({
                        "to": destination,
                        "subject": subject,
                        "body": body,
                    }),
                )
                .await
            }
            None => {
                warn!("email relay not configured, logging instead");
                info!("[EMAIL to {}] {}", destination, subject);
                SendResult::ok()
            }
        }
    }
}
