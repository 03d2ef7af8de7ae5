//! Notification channels and outbound transports
//!
//! The registry owns channel bookkeeping (rate limiting, `last_used`,
//! `message_count`); the transport only moves bytes.

use crate::domain::{AlertEvent, ChannelType, NotificationChannel};
use crate::error::{OpsError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, error, info};

/// Channels by id
#[derive(Debug, Clone, Default)]
pub struct ChannelRegistry {
    channels: BTreeMap<String, NotificationChannel>,
}

impl ChannelRegistry {
    pub fn new(channels: Vec<NotificationChannel>) -> Self {
        Self {
            channels: channels.into_iter().map(|c| (c.id.clone(), c)).collect(),
        }
    }

    pub fn get(&self, id: &str) -> Option<&NotificationChannel> {
        self.channels.get(id)
    }

    pub fn list(&self) -> Vec<NotificationChannel> {
        self.channels.values().cloned().collect()
    }

    /// Carry `last_used`/`message_count` over from a previous run
    pub fn restore_usage(&mut self, previous: &[NotificationChannel]) {
        for old in previous {
            if let Some(channel) = self.channels.get_mut(&old.id) {
                channel.last_used = old.last_used;
                channel.message_count = old.message_count;
            }
        }
    }

    /// The channel if it exists, is enabled and is outside its rate-limit window
    pub fn check_at(&self, id: &str, now: DateTime<Utc>) -> Result<&NotificationChannel> {
        let channel = self
            .channels
            .get(id)
            .ok_or_else(|| OpsError::UnknownChannel(id.to_string()))?;
        if !channel.enabled {
            return Err(OpsError::ChannelDisabled(id.to_string()));
        }
        if channel.is_rate_limited_at(now) {
            return Err(OpsError::RateLimited(format!(
                "channel {} allows {} messages per minute",
                id, channel.rate_limit
            )));
        }
        Ok(channel)
    }

    /// Stamp a successful delivery
    pub fn mark_used_at(&mut self, id: &str, now: DateTime<Utc>) {
        if let Some(channel) = self.channels.get_mut(id) {
            channel.last_used = Some(now);
            channel.message_count += 1;
        }
    }
}

/// Outbound delivery seam
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationTransport: Send + Sync {
    /// Deliver `message` through a channel's transport
    async fn send(&self, channel: &NotificationChannel, message: &str, alert: &AlertEvent)
        -> Result<Value>;

    /// POST `{alert, timestamp}` to a webhook URL
    async fn post_webhook(&self, url: &str, alert: &AlertEvent, timestamp: DateTime<Utc>)
        -> Result<Value>;
}

#[derive(Serialize)]
struct SlackMessage<'a> {
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    channel: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<&'a str>,
}

#[derive(Serialize)]
struct WebhookPayload<'a> {
    alert: &'a AlertEvent,
    timestamp: DateTime<Utc>,
}

/// Slack-style and generic webhook delivery over reqwest
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    async fn post_json<T: Serialize + ?Sized>(&self, url: &str, body: &T) -> Result<Value> {
        let resp = self.client.post(url).json(body).send().await?;
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            error!("Webhook {} failed: {} - {}", url, status, text);
            return Err(OpsError::Delivery(format!("HTTP {}: {}", status, text)));
        }
        if let Some(marker) = embedded_error(&text) {
            error!("Webhook {} answered {} with an error: {}", url, status, marker);
            return Err(OpsError::Delivery(marker));
        }

        debug!("Webhook {} delivered ({})", url, status);
        Ok(json!({ "status": status.as_u16(), "body": text }))
    }
}

/// Error reported inside a 2xx body (`{"ok": false}`, `{"error": ...}` or a bare error string)
fn embedded_error(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("ok") {
        return None;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(obj)) => {
            if let Some(err) = obj.get("error").filter(|e| !e.is_null()) {
                return Some(match err {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                });
            }
            if obj.get("ok") == Some(&Value::Bool(false)) {
                return Some("ok=false".to_string());
            }
            None
        }
        Ok(_) => None,
        Err(_) => {
            let lower = trimmed.to_ascii_lowercase();
            if lower.contains("error") || lower.starts_with("invalid_") || lower.starts_with("no_") {
                Some(trimmed.to_string())
            } else {
                None
            }
        }
    }
}

#[async_trait]
impl NotificationTransport for HttpTransport {
    async fn send(
        &self,
        channel: &NotificationChannel,
        message: &str,
        alert: &AlertEvent,
    ) -> Result<Value> {
        let url = channel
            .setting("webhook_url")
            .or_else(|| channel.setting("url"))
            .filter(|u| !u.is_empty())
            .ok_or_else(|| {
                OpsError::Delivery(format!("channel {} has no webhook_url", channel.id))
            })?;

        match channel.channel_type {
            ChannelType::Slack => {
                let body = SlackMessage {
                    text: message,
                    channel: channel.setting("channel"),
                    username: channel.setting("username"),
                };
                let response = self.post_json(url, &body).await?;
                info!("Slack notification sent via {}", channel.id);
                Ok(response)
            }
            // Email, SMS and PagerDuty go through an HTTP gateway
            ChannelType::Webhook | ChannelType::Email | ChannelType::Sms | ChannelType::Pagerduty => {
                let body = json!({
                    "alert": alert,
                    "message": message,
                    "timestamp": Utc::now(),
                });
                let response = self.post_json(url, &body).await?;
                info!("{} notification sent via {}", channel.channel_type, channel.id);
                Ok(response)
            }
        }
    }

    async fn post_webhook(
        &self,
        url: &str,
        alert: &AlertEvent,
        timestamp: DateTime<Utc>,
    ) -> Result<Value> {
        self.post_json(url, &WebhookPayload { alert, timestamp }).await
    }
}
