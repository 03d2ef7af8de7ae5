use super::event::Severity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Comparison operator applied after aggregation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operator {
    Gt,
    Lt,
    Eq,
    Ne,
    Gte,
    Lte,
}

impl Operator {
    pub fn compare(&self, actual: f64, threshold: f64) -> bool {
        match self {
            Operator::Gt => actual > threshold,
            Operator::Lt => actual < threshold,
            Operator::Eq => (actual - threshold).abs() < f64::EPSILON,
            Operator::Ne => (actual - threshold).abs() >= f64::EPSILON,
            Operator::Gte => actual >= threshold,
            Operator::Lte => actual <= threshold,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            Operator::Gt => ">",
            Operator::Lt => "<",
            Operator::Eq => "==",
            Operator::Ne => "!=",
            Operator::Gte => ">=",
            Operator::Lte => "<=",
        }
    }
}

/// Reducer applied to the sample window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    Avg,
    Min,
    Max,
    Sum,
    Count,
}

impl Aggregation {
    /// Reduce a non-empty window; None for an empty one
    pub fn reduce(&self, values: &[f64]) -> Option<f64> {
        if values.is_empty() {
            return None;
        }
        let v = match self {
            Aggregation::Avg => values.iter().sum::<f64>() / values.len() as f64,
            Aggregation::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            Aggregation::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Aggregation::Sum => values.iter().sum(),
            Aggregation::Count => values.len() as f64,
        };
        Some(v)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertCondition {
    pub metric: String,
    pub operator: Operator,
    pub value: f64,
    /// Seconds of trailing history
    pub duration: u64,
    pub aggregation: Aggregation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Notification,
    Webhook,
    Command,
    Escalation,
    Automation,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Notification => "notification",
            ActionType::Webhook => "webhook",
            ActionType::Command => "command",
            ActionType::Escalation => "escalation",
            ActionType::Automation => "automation",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    30
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertAction {
    #[serde(rename = "type")]
    pub action_type: ActionType,
    /// Channel id, URL or command line depending on the type
    pub target: String,
    #[serde(default)]
    pub template: Option<String>,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Seconds before a retry
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
}

impl AlertAction {
    pub fn new(action_type: ActionType, target: &str) -> Self {
        Self {
            action_type,
            target: target.to_string(),
            template: None,
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
        }
    }

    pub fn with_template(mut self, template: &str) -> Self {
        self.template = Some(template.to_string());
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay: u64) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Pending,
    Success,
    Failed,
    Retrying,
}

/// Outcome of one action for one alert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertActionResult {
    /// Index into the rule's action list, or into the level's list for escalations
    pub action_index: usize,
    pub action_type: ActionType,
    pub target: String,
    pub status: ActionStatus,
    pub timestamp: DateTime<Utc>,
    /// Attempts made so far, the first one included
    pub attempts: u32,
    pub error: Option<String>,
    pub response: Option<serde_json::Value>,
    /// Escalation level the action belongs to, None for rule actions
    #[serde(default)]
    pub escalation_level: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationLevel {
    pub level: u32,
    /// Seconds after the previous level before this one fires on its own
    pub delay: u64,
    #[serde(default)]
    pub actions: Vec<AlertAction>,
    #[serde(default)]
    pub recipients: Vec<String>,
    #[serde(default)]
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationPolicy {
    pub levels: Vec<EscalationLevel>,
    pub max_level: u32,
    #[serde(default)]
    pub auto_reset: bool,
    /// Seconds at max level before an auto reset
    #[serde(default)]
    pub reset_after: u64,
}

impl EscalationPolicy {
    pub fn level(&self, level: u32) -> Option<&EscalationLevel> {
        self.levels.iter().find(|l| l.level == level)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub severity: Severity,
    pub conditions: Vec<AlertCondition>,
    #[serde(default)]
    pub actions: Vec<AlertAction>,
    #[serde(default)]
    pub escalation_policy: Option<EscalationPolicy>,
    /// Seconds between two firings
    #[serde(default = "default_cooldown_period")]
    pub cooldown_period: u64,
    #[serde(default)]
    pub trigger_count: u32,
    #[serde(default = "default_max_triggers")]
    pub max_triggers: u32,
    #[serde(default)]
    pub last_triggered: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

fn default_cooldown_period() -> u64 {
    300
}

fn default_max_triggers() -> u32 {
    10
}

impl AlertRule {
    pub fn new(id: &str, name: &str, severity: Severity) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            description: String::new(),
            enabled: true,
            severity,
            conditions: Vec::new(),
            actions: Vec::new(),
            escalation_policy: None,
            cooldown_period: default_cooldown_period(),
            trigger_count: 0,
            max_triggers: default_max_triggers(),
            last_triggered: None,
        }
    }

    pub fn with_condition(mut self, condition: AlertCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_action(mut self, action: AlertAction) -> Self {
        self.actions.push(action);
        self
    }

    pub fn with_escalation(mut self, policy: EscalationPolicy) -> Self {
        self.escalation_policy = Some(policy);
        self
    }

    pub fn with_cooldown(mut self, seconds: u64) -> Self {
        self.cooldown_period = seconds;
        self
    }

    pub fn with_max_triggers(mut self, max: u32) -> Self {
        self.max_triggers = max;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Active,
    Acknowledged,
    Resolved,
    Escalated,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Active => "active",
            AlertStatus::Acknowledged => "acknowledged",
            AlertStatus::Resolved => "resolved",
            AlertStatus::Escalated => "escalated",
        }
    }

    /// Still waiting on an operator
    pub fn is_open(&self) -> bool {
        matches!(self, AlertStatus::Active | AlertStatus::Escalated)
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEvent {
    pub id: String,
    pub rule_id: String,
    pub rule_name: String,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub status: AlertStatus,
    pub message: String,
    #[serde(default)]
    pub data: serde_json::Map<String, serde_json::Value>,
    pub acknowledged_by: Option<String>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub escalation_level: u32,
    #[serde(default)]
    pub last_escalated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub actions: Vec<AlertActionResult>,
}

impl AlertEvent {
    pub fn new(rule: &AlertRule, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            rule_id: rule.id.clone(),
            rule_name: rule.name.clone(),
            timestamp: now,
            severity: rule.severity,
            status: AlertStatus::Active,
            message: String::new(),
            data: serde_json::Map::new(),
            acknowledged_by: None,
            acknowledged_at: None,
            resolved_by: None,
            resolved_at: None,
            escalation_level: 0,
            last_escalated_at: None,
            actions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelType {
    Slack,
    Email,
    Webhook,
    Sms,
    Pagerduty,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::Slack => "slack",
            ChannelType::Email => "email",
            ChannelType::Webhook => "webhook",
            ChannelType::Sms => "sms",
            ChannelType::Pagerduty => "pagerduty",
        }
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationChannel {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    /// Transport settings, e.g. {"webhook_url": ..., "channel": ..., "username": ...}
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Messages per minute, 0 disables limiting
    pub rate_limit: u32,
    #[serde(default)]
    pub last_used: Option<DateTime<Utc>>,
    #[serde(default)]
    pub message_count: u64,
}

impl NotificationChannel {
    pub fn new(id: &str, channel_type: ChannelType, rate_limit: u32) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            channel_type,
            config: serde_json::Value::Null,
            enabled: true,
            rate_limit,
            last_used: None,
            message_count: 0,
        }
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    /// Less than 60/rate_limit seconds since the last message
    pub fn is_rate_limited_at(&self, now: DateTime<Utc>) -> bool {
        if self.rate_limit == 0 {
            return false;
        }
        match self.last_used {
            Some(last) => {
                let min_interval_ms = 60_000 / self.rate_limit as i64;
                now.signed_duration_since(last).num_milliseconds() < min_interval_ms
            }
            None => false,
        }
    }

    /// Config string value by key
    pub fn setting(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(|v| v.as_str())
    }
}
