//! Fan-out dispatch with per-channel retry
//!
//! The dispatcher walks `alert.routing.channels`, sends to each through
//! the registered channel implementation, and retries failed attempts with
//! exponential backoff while the channel reports the failure retryable.
//! Results come back as a vector parallel to the routing list; dispatch
//! itself never fails.

use crate::channels::{
    ChannelSettings, ChatChannel, EmailChannel, NotificationChannel, PagerChannel, SendResult,
    WebhookChannel,
};
use pulse_common::config::AlertingConfig;
use pulse_common::{AlertTrigger, ChannelType};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Result of dispatching to one routing target
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub channel_type: ChannelType,
    pub destination: String,
    pub attempts: u32,
    pub result: SendResult,
}

/// Fan-out dispatcher over registered channels
pub struct NotificationDispatcher {
    channels: HashMap<ChannelType, Arc<dyn NotificationChannel>>,
    settings: HashMap<ChannelType, ChannelSettings>,
    retry_base_delay: Duration,
}

impl NotificationDispatcher {
    /// Dispatcher with the four built-in channels
    pub fn new(config: &AlertingConfig) -> Self {
        let client = reqwest::Client::new();
        let settings = ChannelSettings {
            enabled: true,
            timeout: Duration::from_millis(config.channel_timeout_ms),
            max_retries: config.channel_max_retries,
        };
        let mut dispatcher = Self::empty();
        dispatcher.register(Arc::new(WebhookChannel::new(client.clone(), settings.clone())), settings.clone());
        dispatcher.register(Arc::new(EmailChannel::new(client.clone(), settings.clone())), settings.clone());
        dispatcher.register(Arc::new(ChatChannel::new(client.clone(), settings.clone())), settings.clone());
        dispatcher.register(Arc::new(PagerChannel::new(client, settings.clone())), settings);
        dispatcher
    }

    /// Dispatcher with no channels registered
    pub fn empty() -> Self {
        Self {
            channels: HashMap::new(),
            settings: HashMap::new(),
            retry_base_delay: Duration::from_millis(200),
        }
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    /// Register or replace a channel implementation
    pub fn register(&mut self, channel: Arc<dyn NotificationChannel>, settings: ChannelSettings) {
        let channel_type = channel.channel_type();
        self.settings.insert(channel_type, settings);
        self.channels.insert(channel_type, channel);
    }

    /// Send the alert to every routing target. The returned vector is
    /// parallel to `alert.routing.channels`.
    pub async fn dispatch(&self, alert: &AlertTrigger) -> Vec<DispatchOutcome> {
        let mut outcomes = Vec::with_capacity(alert.routing.channels.len());
        for target in &alert.routing.channels {
            outcomes.push(
                self.dispatch_one(alert, target.channel_type, &target.destination)
                    .await,
            );
        }
        outcomes
    }

    async fn dispatch_one(
        &self,
        alert: &AlertTrigger,
        channel_type: ChannelType,
        destination: &str,
    ) -> DispatchOutcome {
        let channel = match self.channels.get(&channel_type) {
            Some(channel) => channel,
            None => {
                warn!("no channel registered for type {}", channel_type.as_str());
                return DispatchOutcome {
                    channel_type,
                    destination: destination.to_string(),
                    attempts: 0,
                    result: SendResult::failed(
                        false,
                        format!("no channel registered for '{}'", channel_type.as_str()),
                    ),
                };
            }
        };

        let settings = self
            .settings
            .get(&channel_type)
            .cloned()
            .unwrap_or_default();
        if !settings.enabled {
            debug!("channel {} disabled, skipping", channel_type.as_str());
            return DispatchOutcome {
                channel_type,
                destination: destination.to_string(),
                attempts: 0,
                result: SendResult::failed(false, "channel disabled"),
            };
        }

        let mut attempt = 1u32;
        let mut result = channel.send(alert, destination, attempt).await;
        while !result.success && result.retryable && attempt <= settings.max_retries {
            let delay = self.retry_base_delay * 2u32.saturating_pow(attempt - 1);
            debug!(
                "retrying {} send for alert {} in {:?} (attempt {})",
                channel_type.as_str(),
                alert.alert_id,
                delay,
                attempt + 1
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
            result = channel.send(alert, destination, attempt).await;
        }

        if !result.success {
            warn!(
                "dispatch to {} failed after {} attempt(s): {}",
                channel_type.as_str(),
                attempt,
                result.error.as_deref().unwrap_or("unknown error")
            );
        }

        DispatchOutcome {
            channel_type,
            destination: destination.to_string(),
            attempts: attempt,
            result,
        }
    }
}
