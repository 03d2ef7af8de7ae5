//! Alert/Escalation Engine
//!
//! Single-owner loop over the rule set: evaluate eligible rules against the
//! metric store, fire alerts, run their actions in declared order, schedule
//! retries as detached delay tasks that report back to the loop, and walk
//! unresolved alerts up their escalation policy from the cleanup pass.
//! Nothing here is shared; other tasks talk to the engine through
//! [`AlertEngineHandle`] and read it through the published state.

use super::channels::{ChannelRegistry, NotificationTransport};
use super::conditions::{evaluate_rule, ConditionMatch};
use super::template::{render, render_shell};
use crate::config::{merge_json, AlertEngineConfig, ConfigStore, Validate};
use crate::coordination::shutdown::ShutdownSignal;
use crate::domain::{
    span, ActionStatus, ActionType, AlertAction, AlertActionResult, AlertEvent, AlertRule,
    AlertStatus, BoundedLog, NotificationChannel,
};
use crate::error::{OpsError, Result};
use crate::metrics::MetricStore;
use crate::persistence::{EventLog, StateFile};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Message used when a rule carries no template of its own
pub const DEFAULT_MESSAGE_TEMPLATE: &str =
    "[{severity}] {rule_name}: {aggregation}({metric}) = {value} {operator} {threshold} over {duration}s";

/// Resolver recorded for alerts closed by the timeout sweep
pub const TIMEOUT_RESOLVER: &str = "timeout";
/// Resolver recorded for alerts closed by an escalation auto reset
pub const AUTO_RESET_RESOLVER: &str = "auto-reset";

/// Running counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertStats {
    pub total_alerts: u64,
    pub actions_succeeded: u64,
    pub actions_failed: u64,
    pub escalations: u64,
    pub acknowledged: u64,
    pub resolved: u64,
    pub timed_out: u64,
}

/// Full engine state, persisted after every cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertEngineState {
    pub rules: Vec<AlertRule>,
    pub channels: Vec<NotificationChannel>,
    pub active: BoundedLog<AlertEvent>,
    pub history: BoundedLog<AlertEvent>,
    pub stats: AlertStats,
    pub last_evaluation: Option<DateTime<Utc>>,
    pub last_cleanup: Option<DateTime<Utc>>,
    /// Evaluation cadence in effect when the state was taken
    #[serde(default)]
    pub evaluation_interval_secs: u64,
}

impl Default for AlertEngineState {
    fn default() -> Self {
        let config = AlertEngineConfig::default();
        Self {
            rules: Vec::new(),
            channels: Vec::new(),
            active: BoundedLog::new(config.max_active_alerts),
            history: BoundedLog::new(config.max_history),
            stats: AlertStats::default(),
            last_evaluation: None,
            last_cleanup: None,
            evaluation_interval_secs: config.evaluation_interval_secs,
        }
    }
}

/// A retry whose delay has elapsed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryDue {
    pub alert_id: String,
    pub action_index: usize,
    pub escalation_level: Option<u32>,
    /// 1-based attempt number this retry represents
    pub attempt: u32,
}

/// What a cleanup pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub timed_out: usize,
    pub escalated: usize,
    pub auto_reset: usize,
    pub archived: usize,
}

/// Operator commands processed by the engine loop
#[derive(Debug)]
pub enum AlertCommand {
    Acknowledge {
        alert_id: String,
        by: String,
        reply: oneshot::Sender<Result<AlertEvent>>,
    },
    Resolve {
        alert_id: String,
        by: String,
        reply: oneshot::Sender<Result<AlertEvent>>,
    },
    UpdateConfig {
        patch: Value,
        reply: oneshot::Sender<Result<AlertEngineConfig>>,
    },
}

/// Receiving end of the command channel; outlives individual engine runs
pub type AlertInbox = Arc<Mutex<mpsc::Receiver<AlertCommand>>>;

/// Cloneable sender for operator commands
#[derive(Debug, Clone)]
pub struct AlertEngineHandle {
    tx: mpsc::Sender<AlertCommand>,
}

/// Create a command channel for the engine
pub fn command_channel(buffer: usize) -> (AlertEngineHandle, AlertInbox) {
    let (tx, rx) = mpsc::channel(buffer);
    (AlertEngineHandle { tx }, Arc::new(Mutex::new(rx)))
}

impl AlertEngineHandle {
    async fn request<T, F>(&self, build: F) -> Result<T>
    where
        F: FnOnce(oneshot::Sender<Result<T>>) -> AlertCommand,
    {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| OpsError::Internal("alert engine is not running".to_string()))?;
        rx.await.map_err(|_| OpsError::Cancelled)?
    }

    pub async fn acknowledge(&self, alert_id: &str, by: &str) -> Result<AlertEvent> {
        let (alert_id, by) = (alert_id.to_string(), by.to_string());
        self.request(|reply| AlertCommand::Acknowledge { alert_id, by, reply })
            .await
    }

    pub async fn resolve(&self, alert_id: &str, by: &str) -> Result<AlertEvent> {
        let (alert_id, by) = (alert_id.to_string(), by.to_string());
        self.request(|reply| AlertCommand::Resolve { alert_id, by, reply })
            .await
    }

    /// Merge `patch` into the running engine's configuration
    pub async fn update_config(&self, patch: Value) -> Result<AlertEngineConfig> {
        self.request(|reply| AlertCommand::UpdateConfig { patch, reply })
            .await
    }
}

pub struct AlertEngine {
    config: AlertEngineConfig,
    config_store: Option<ConfigStore<AlertEngineConfig>>,
    rules: Vec<AlertRule>,
    channels: ChannelRegistry,
    active: BoundedLog<AlertEvent>,
    history: BoundedLog<AlertEvent>,
    stats: AlertStats,
    last_evaluation: Option<DateTime<Utc>>,
    last_cleanup: Option<DateTime<Utc>>,
    store: Arc<dyn MetricStore>,
    transport: Arc<dyn NotificationTransport>,
    state_file: Option<StateFile<AlertEngineState>>,
    audit: EventLog,
    published: Option<Arc<watch::Sender<AlertEngineState>>>,
    retry_tx: mpsc::UnboundedSender<RetryDue>,
    retry_rx: Option<mpsc::UnboundedReceiver<RetryDue>>,
}

impl AlertEngine {
    pub fn new(
        config: AlertEngineConfig,
        store: Arc<dyn MetricStore>,
        transport: Arc<dyn NotificationTransport>,
    ) -> Self {
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();
        Self {
            rules: config.rules.clone(),
            channels: ChannelRegistry::new(config.channels.clone()),
            active: BoundedLog::new(config.max_active_alerts),
            history: BoundedLog::new(config.max_history),
            stats: AlertStats::default(),
            last_evaluation: None,
            last_cleanup: None,
            config,
            config_store: None,
            store,
            transport,
            state_file: None,
            audit: EventLog::disabled(),
            published: None,
            retry_tx,
            retry_rx: Some(retry_rx),
        }
    }

    pub fn with_state_file(mut self, file: StateFile<AlertEngineState>) -> Self {
        self.state_file = Some(file);
        self
    }

    pub fn with_audit_log(mut self, audit: EventLog) -> Self {
        self.audit = audit;
        self
    }

    /// Persist runtime config updates through `store`; its document replaces
    /// the configuration passed to [`AlertEngine::new`]
    pub fn with_config_store(mut self, store: ConfigStore<AlertEngineConfig>) -> Self {
        let config = store.get().clone();
        self.config_store = Some(store);
        self.apply_config(config);
        self
    }

    /// Publish the state to `tx` after every cycle
    pub fn with_publisher(mut self, tx: Arc<watch::Sender<AlertEngineState>>) -> Self {
        self.published = Some(tx);
        self
    }

    /// Reload counters, channel usage and open alerts from the last snapshot.
    /// Rule and channel definitions always come from the configuration.
    pub async fn restore(&mut self) {
        let Some(file) = &self.state_file else {
            return;
        };
        let Some(previous) = file.load_or_none().await else {
            return;
        };

        for rule in &mut self.rules {
            if let Some(old) = previous.rules.iter().find(|r| r.id == rule.id) {
                rule.trigger_count = old.trigger_count;
                rule.last_triggered = old.last_triggered;
            }
        }
        self.channels.restore_usage(&previous.channels);
        for alert in previous.history.to_vec() {
            self.history.push(alert);
        }
        for alert in previous.active.to_vec() {
            self.insert_active(alert);
        }
        self.stats = previous.stats;
        self.last_evaluation = previous.last_evaluation;
        self.last_cleanup = previous.last_cleanup;

        info!(
            "Restored alert state: {} active, {} in history",
            self.active.len(),
            self.history.len()
        );
    }

    pub fn config(&self) -> &AlertEngineConfig {
        &self.config
    }

    /// Merge a patch into the configuration and apply it to the running engine
    pub async fn update_config(
        &mut self,
        patch: Value,
        now: DateTime<Utc>,
    ) -> Result<AlertEngineConfig> {
        let next = match &mut self.config_store {
            Some(store) => store.update(patch.clone()).await?.clone(),
            None => {
                let mut merged = serde_json::to_value(&self.config)?;
                merge_json(&mut merged, patch.clone());
                let next: AlertEngineConfig = serde_json::from_value(merged)
                    .map_err(|e| OpsError::InvalidConfig(e.to_string()))?;
                next.validate()
                    .map_err(|errors| OpsError::InvalidConfig(errors.join("; ")))?;
                next
            }
        };

        self.apply_config(next.clone());
        info!(
            "Alert configuration updated: {} rules, {} channels",
            self.rules.len(),
            self.channels.list().len()
        );
        self.audit.append(&json!({
            "timestamp": now,
            "kind": "config_change",
            "patch": patch,
        }));
        Ok(next)
    }

    /// Swap in a configuration, keeping trigger counters and channel usage
    /// for ids that survive. Delivery timeouts apply on the next start.
    fn apply_config(&mut self, config: AlertEngineConfig) {
        let mut rules = config.rules.clone();
        for rule in &mut rules {
            if let Some(old) = self.rules.iter().find(|r| r.id == rule.id) {
                rule.trigger_count = old.trigger_count;
                rule.last_triggered = old.last_triggered;
            }
        }
        self.rules = rules;

        let previous = self.channels.list();
        self.channels = ChannelRegistry::new(config.channels.clone());
        self.channels.restore_usage(&previous);

        for demoted in self.active.set_capacity(config.max_active_alerts) {
            self.history.push(demoted);
        }
        self.history.set_capacity(config.max_history);
        self.config = config;
    }

    pub fn rules(&self) -> &[AlertRule] {
        &self.rules
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    pub fn stats(&self) -> &AlertStats {
        &self.stats
    }

    pub fn active_alerts(&self) -> Vec<AlertEvent> {
        self.active.to_vec()
    }

    pub fn history(&self) -> Vec<AlertEvent> {
        self.history.to_vec()
    }

    pub fn alert(&self, id: &str) -> Option<&AlertEvent> {
        self.active
            .iter()
            .chain(self.history.iter())
            .find(|a| a.id == id)
    }

    pub fn state(&self) -> AlertEngineState {
        AlertEngineState {
            rules: self.rules.clone(),
            channels: self.channels.list(),
            active: self.active.clone(),
            history: self.history.clone(),
            stats: self.stats.clone(),
            last_evaluation: self.last_evaluation,
            last_cleanup: self.last_cleanup,
            evaluation_interval_secs: self.config.evaluation_interval_secs,
        }
    }

    /// Take the retry receiver when driving the engine by hand
    pub fn take_retry_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<RetryDue>> {
        self.retry_rx.take()
    }

    /// Write the state file and publish; failures are logged only
    pub async fn persist(&self) {
        let state = self.state();
        if let Some(file) = &self.state_file {
            if let Err(e) = file.save(&state).await {
                error!("Failed to persist alert state: {}", e);
            }
        }
        if let Some(tx) = &self.published {
            tx.send_replace(state);
        }
    }

    /// One evaluation pass; returns the ids of alerts fired
    pub async fn evaluate_at(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let mut fired = Vec::new();

        for index in 0..self.rules.len() {
            let rule = self.rules[index].clone();
            let Some(matches) = evaluate_rule(self.store.as_ref(), &rule, now).await else {
                continue;
            };
            fired.push(self.fire(index, &matches, now).await);
        }

        self.last_evaluation = Some(now);
        if !fired.is_empty() {
            debug!("Evaluation fired {} alert(s)", fired.len());
        }
        fired
    }

    async fn fire(&mut self, rule_index: usize, matches: &[ConditionMatch], now: DateTime<Utc>) -> String {
        let rule = self.rules[rule_index].clone();

        let mut alert = AlertEvent::new(&rule, now);
        alert.data = alert_data(&alert, &rule, matches);
        alert.message = render(DEFAULT_MESSAGE_TEMPLATE, &alert.data);

        warn!(
            alert_id = %alert.id,
            rule_id = %rule.id,
            severity = %rule.severity,
            "Alert fired: {}",
            alert.message
        );
        self.audit.append(&json!({
            "timestamp": now,
            "kind": "alert_fired",
            "alert_id": alert.id,
            "rule_id": rule.id,
            "severity": rule.severity,
            "message": alert.message,
            "data": alert.data,
        }));

        for (index, action) in rule.actions.iter().enumerate() {
            let result = if action.action_type == ActionType::Escalation {
                self.run_escalation_action(&mut alert, &rule, index, action, now)
                    .await
            } else {
                self.run_action(&mut alert, index, action, None, 1, now).await
            };
            alert.actions.push(result);
        }

        let stored = &mut self.rules[rule_index];
        stored.trigger_count += 1;
        stored.last_triggered = Some(now);
        self.stats.total_alerts += 1;

        let id = alert.id.clone();
        self.insert_active(alert);
        id
    }

    fn insert_active(&mut self, alert: AlertEvent) {
        for demoted in self.active.push(alert) {
            warn!(
                "Active alert cap ({}) reached, moving {} to history",
                self.active.capacity(),
                demoted.id
            );
            self.history.push(demoted);
        }
    }

    fn replace_active(&mut self, alert: AlertEvent) {
        if let Some(slot) = self.active.iter_mut().find(|a| a.id == alert.id) {
            *slot = alert;
        }
    }

    /// Run one non-escalation action and build its result
    async fn run_action(
        &mut self,
        alert: &mut AlertEvent,
        index: usize,
        action: &AlertAction,
        escalation_level: Option<u32>,
        attempt: u32,
        now: DateTime<Utc>,
    ) -> AlertActionResult {
        let outcome = self.dispatch(alert, action, now).await;

        let mut result = AlertActionResult {
            action_index: index,
            action_type: action.action_type,
            target: action.target.clone(),
            status: ActionStatus::Pending,
            timestamp: now,
            attempts: attempt,
            error: None,
            response: None,
            escalation_level,
        };

        match outcome {
            Ok(response) => {
                result.status = ActionStatus::Success;
                result.response = Some(response);
                self.stats.actions_succeeded += 1;
                info!(
                    "Action {} -> {} succeeded for alert {} (attempt {})",
                    action.action_type, action.target, alert.id, attempt
                );
            }
            Err(e) => {
                result.error = Some(e.to_string());
                let retries_used = attempt.saturating_sub(1);
                if is_retryable(&e) && retries_used < action.max_retries {
                    result.status = ActionStatus::Retrying;
                    warn!(
                        "Action {} -> {} failed for alert {} (attempt {}), retrying in {}s: {}",
                        action.action_type, action.target, alert.id, attempt, action.retry_delay, e
                    );
                    self.schedule_retry(
                        RetryDue {
                            alert_id: alert.id.clone(),
                            action_index: index,
                            escalation_level,
                            attempt: attempt + 1,
                        },
                        action.retry_delay,
                    );
                } else {
                    result.status = ActionStatus::Failed;
                    self.stats.actions_failed += 1;
                    error!(
                        "Action {} -> {} failed for alert {} after {} attempt(s): {}",
                        action.action_type, action.target, alert.id, attempt, e
                    );
                }
            }
        }

        self.audit.append(&json!({
            "timestamp": now,
            "kind": "action",
            "alert_id": alert.id,
            "result": result,
        }));
        result
    }

    fn schedule_retry(&self, due: RetryDue, delay_secs: u64) {
        let tx = self.retry_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(delay_secs)).await;
            // Engine gone means nobody is left to retry for
            let _ = tx.send(due);
        });
    }

    async fn dispatch(
        &mut self,
        alert: &AlertEvent,
        action: &AlertAction,
        now: DateTime<Utc>,
    ) -> Result<Value> {
        if !self.config.features.allows(action.action_type) {
            return Err(OpsError::FeatureDisabled(action.action_type.to_string()));
        }

        match action.action_type {
            ActionType::Notification => {
                let channel = self.channels.check_at(&action.target, now)?.clone();
                let message = match &action.template {
                    Some(template) => render(template, &alert.data),
                    None => alert.message.clone(),
                };
                let response = self.transport.send(&channel, &message, alert).await?;
                self.channels.mark_used_at(&channel.id, now);
                Ok(response)
            }
            ActionType::Webhook => self.transport.post_webhook(&action.target, alert, now).await,
            ActionType::Command => {
                let line = render_shell(&action.target, &alert.data);
                let args = vec!["-c".to_string(), line];
                run_process("sh", &args, self.delivery_timeout()).await
            }
            ActionType::Automation => {
                let argv = self.config.automations.get(&action.target).ok_or_else(|| {
                    OpsError::Validation(format!("unknown automation '{}'", action.target))
                })?;
                let (program, args) = argv.split_first().ok_or_else(|| {
                    OpsError::Validation(format!("automation '{}' is empty", action.target))
                })?;
                let args: Vec<String> = args.iter().map(|a| render(a, &alert.data)).collect();
                run_process(program, &args, self.delivery_timeout()).await
            }
            ActionType::Escalation => Err(OpsError::Internal(
                "escalation actions are not dispatched".to_string(),
            )),
        }
    }

    fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.config.delivery_timeout_secs)
    }

    /// Escalation as a rule action
    async fn run_escalation_action(
        &mut self,
        alert: &mut AlertEvent,
        rule: &AlertRule,
        index: usize,
        action: &AlertAction,
        now: DateTime<Utc>,
    ) -> AlertActionResult {
        let mut result = AlertActionResult {
            action_index: index,
            action_type: ActionType::Escalation,
            target: action.target.clone(),
            status: ActionStatus::Success,
            timestamp: now,
            attempts: 1,
            error: None,
            response: None,
            escalation_level: None,
        };

        match self.escalate(alert, rule, now).await {
            Ok(Some(level)) => result.response = Some(json!({ "level": level })),
            Ok(None) => {
                result.response = Some(json!({ "level": alert.escalation_level, "capped": true }))
            }
            Err(e) => {
                result.status = ActionStatus::Failed;
                result.error = Some(e.to_string());
                self.stats.actions_failed += 1;
                warn!("Escalation for alert {} failed: {}", alert.id, e);
            }
        }
        result
    }

    /// Move `alert` one level up its rule's policy and run that level's
    /// actions. Returns the new level, or None when already at the top.
    async fn escalate(
        &mut self,
        alert: &mut AlertEvent,
        rule: &AlertRule,
        now: DateTime<Utc>,
    ) -> Result<Option<u32>> {
        if !self.config.features.escalation {
            return Err(OpsError::FeatureDisabled("escalation".to_string()));
        }
        let policy = rule.escalation_policy.as_ref().ok_or_else(|| {
            OpsError::Validation(format!("rule {} has no escalation policy", rule.id))
        })?;

        let next = alert.escalation_level + 1;
        if next > policy.max_level {
            debug!("Alert {} already at max escalation level {}", alert.id, policy.max_level);
            return Ok(None);
        }
        let level = policy.level(next).cloned().ok_or_else(|| {
            OpsError::Validation(format!("rule {} has no escalation level {}", rule.id, next))
        })?;

        alert.escalation_level = next;
        alert.status = AlertStatus::Escalated;
        alert.last_escalated_at = Some(now);
        alert
            .data
            .insert("escalation_level".to_string(), json!(next));
        alert
            .data
            .insert("recipients".to_string(), json!(level.recipients.join(", ")));
        self.stats.escalations += 1;

        warn!("Alert {} escalated to level {}", alert.id, next);
        self.audit.append(&json!({
            "timestamp": now,
            "kind": "escalated",
            "alert_id": alert.id,
            "rule_id": rule.id,
            "level": next,
            "recipients": level.recipients,
        }));

        for (index, action) in level_actions(&level.actions, &level.channels)
            .into_iter()
            .enumerate()
        {
            let result = if action.action_type == ActionType::Escalation {
                AlertActionResult {
                    action_index: index,
                    action_type: ActionType::Escalation,
                    target: action.target.clone(),
                    status: ActionStatus::Failed,
                    timestamp: now,
                    attempts: 1,
                    error: Some("escalation inside an escalation level is ignored".to_string()),
                    response: None,
                    escalation_level: Some(next),
                }
            } else {
                self.run_action(alert, index, &action, Some(next), 1, now)
                    .await
            };
            alert.actions.push(result);
        }

        Ok(Some(next))
    }

    pub async fn acknowledge_at(&mut self, alert_id: &str, by: &str, now: DateTime<Utc>) -> Result<AlertEvent> {
        let alert = self
            .active
            .iter_mut()
            .find(|a| a.id == alert_id)
            .ok_or_else(|| OpsError::UnknownAlert(alert_id.to_string()))?;

        match alert.status {
            AlertStatus::Resolved => {
                return Err(OpsError::InvalidStateTransition {
                    from: AlertStatus::Resolved.to_string(),
                    to: AlertStatus::Acknowledged.to_string(),
                })
            }
            AlertStatus::Acknowledged => return Ok(alert.clone()),
            AlertStatus::Active | AlertStatus::Escalated => {}
        }

        alert.status = AlertStatus::Acknowledged;
        alert.acknowledged_by = Some(by.to_string());
        alert.acknowledged_at = Some(now);
        self.stats.acknowledged += 1;

        info!("Alert {} acknowledged by {}", alert.id, by);
        self.audit.append(&json!({
            "timestamp": now,
            "kind": "acknowledged",
            "alert_id": alert.id,
            "by": by,
        }));
        Ok(alert.clone())
    }

    pub async fn resolve_at(&mut self, alert_id: &str, by: &str, now: DateTime<Utc>) -> Result<AlertEvent> {
        let Some(alert) = self.active.iter_mut().find(|a| a.id == alert_id) else {
            return self
                .history
                .iter()
                .find(|a| a.id == alert_id)
                .cloned()
                .ok_or_else(|| OpsError::UnknownAlert(alert_id.to_string()));
        };
        if alert.status == AlertStatus::Resolved {
            return Ok(alert.clone());
        }

        resolve(alert, by, now);
        self.stats.resolved += 1;

        info!("Alert {} resolved by {}", alert.id, by);
        self.audit.append(&json!({
            "timestamp": now,
            "kind": "resolved",
            "alert_id": alert.id,
            "by": by,
        }));
        Ok(alert.clone())
    }

    /// Timeout sweep, time-delayed escalation, auto reset and archiving
    pub async fn cleanup_at(&mut self, now: DateTime<Utc>) -> CleanupReport {
        let mut report = CleanupReport::default();
        let timeout = span::secs_i64(self.config.alert_timeout_secs);

        for alert in self.active.iter_mut() {
            if alert.status != AlertStatus::Resolved
                && now.signed_duration_since(alert.timestamp).num_seconds() >= timeout
            {
                resolve(alert, TIMEOUT_RESOLVER, now);
                report.timed_out += 1;
                self.stats.timed_out += 1;
                self.stats.resolved += 1;
                warn!("Alert {} timed out and was resolved", alert.id);
                self.audit.append(&json!({
                    "timestamp": now,
                    "kind": "timeout",
                    "alert_id": alert.id,
                }));
            }
        }

        if self.config.features.escalation {
            let open: Vec<String> = self
                .active
                .iter()
                .filter(|a| a.status.is_open())
                .map(|a| a.id.clone())
                .collect();

            for alert_id in open {
                match self.advance_escalation(&alert_id, now).await {
                    EscalationStep::Escalated => report.escalated += 1,
                    EscalationStep::AutoReset => report.auto_reset += 1,
                    EscalationStep::Nothing => {}
                }
            }
        }

        for alert in self.active.drain_where(|a| a.status == AlertStatus::Resolved) {
            self.history.push(alert);
            report.archived += 1;
        }

        self.last_cleanup = Some(now);
        if report != CleanupReport::default() {
            info!(
                "Cleanup: {} timed out, {} escalated, {} auto reset, {} archived",
                report.timed_out, report.escalated, report.auto_reset, report.archived
            );
        }
        report
    }

    async fn advance_escalation(&mut self, alert_id: &str, now: DateTime<Utc>) -> EscalationStep {
        let Some(mut alert) = self.active.iter().find(|a| a.id == alert_id).cloned() else {
            return EscalationStep::Nothing;
        };
        let Some(rule) = self.rules.iter().find(|r| r.id == alert.rule_id).cloned() else {
            return EscalationStep::Nothing;
        };
        let Some(policy) = rule.escalation_policy.clone() else {
            return EscalationStep::Nothing;
        };

        let since = alert.last_escalated_at.unwrap_or(alert.timestamp);
        let elapsed = now.signed_duration_since(since).num_seconds();

        if alert.escalation_level >= policy.max_level {
            if policy.auto_reset && elapsed >= span::secs_i64(policy.reset_after) {
                resolve(&mut alert, AUTO_RESET_RESOLVER, now);
                self.stats.resolved += 1;
                info!("Alert {} auto reset at level {}", alert.id, alert.escalation_level);
                self.audit.append(&json!({
                    "timestamp": now,
                    "kind": "auto_reset",
                    "alert_id": alert.id,
                    "level": alert.escalation_level,
                }));
                self.replace_active(alert);
                return EscalationStep::AutoReset;
            }
            return EscalationStep::Nothing;
        }

        let due = policy
            .level(alert.escalation_level + 1)
            .map(|level| elapsed >= span::secs_i64(level.delay))
            .unwrap_or(false);
        if !due {
            return EscalationStep::Nothing;
        }

        let step = match self.escalate(&mut alert, &rule, now).await {
            Ok(Some(_)) => EscalationStep::Escalated,
            Ok(None) => EscalationStep::Nothing,
            Err(e) => {
                warn!("Timed escalation for alert {} failed: {}", alert.id, e);
                EscalationStep::Nothing
            }
        };
        self.replace_active(alert);
        step
    }

    /// Re-run an action whose retry delay elapsed
    pub async fn handle_retry_at(&mut self, due: RetryDue, now: DateTime<Utc>) {
        let Some(mut alert) = self.active.iter().find(|a| a.id == due.alert_id).cloned() else {
            debug!("Dropping retry for archived alert {}", due.alert_id);
            return;
        };
        if alert.status == AlertStatus::Resolved {
            debug!("Dropping retry for resolved alert {}", alert.id);
            return;
        }
        let action = self
            .rules
            .iter()
            .find(|r| r.id == alert.rule_id)
            .and_then(|rule| action_for(rule, due.escalation_level, due.action_index));
        let Some(action) = action else {
            warn!("Retry target for alert {} no longer exists", alert.id);
            return;
        };

        let result = self
            .run_action(
                &mut alert,
                due.action_index,
                &action,
                due.escalation_level,
                due.attempt,
                now,
            )
            .await;

        let slot = alert.actions.iter_mut().rev().find(|r| {
            r.action_index == due.action_index && r.escalation_level == due.escalation_level
        });
        match slot {
            Some(slot) => *slot = result,
            None => alert.actions.push(result),
        }
        self.replace_active(alert);
    }

    /// Returns true when the configuration changed
    async fn handle_command(&mut self, command: AlertCommand, now: DateTime<Utc>) -> bool {
        match command {
            AlertCommand::Acknowledge { alert_id, by, reply } => {
                let _ = reply.send(self.acknowledge_at(&alert_id, &by, now).await);
                false
            }
            AlertCommand::Resolve { alert_id, by, reply } => {
                let _ = reply.send(self.resolve_at(&alert_id, &by, now).await);
                false
            }
            AlertCommand::UpdateConfig { patch, reply } => {
                let result = self.update_config(patch, now).await;
                let changed = result.is_ok();
                let _ = reply.send(result);
                changed
            }
        }
    }

    fn intervals(&self) -> (tokio::time::Interval, tokio::time::Interval) {
        let evaluation_period = Duration::from_secs(self.config.evaluation_interval_secs);
        let mut evaluation = tokio::time::interval(evaluation_period);
        evaluation.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let cleanup_period = Duration::from_secs(self.config.cleanup_interval_secs);
        let mut cleanup =
            tokio::time::interval_at(tokio::time::Instant::now() + cleanup_period, cleanup_period);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);
        (evaluation, cleanup)
    }

    /// Drive the engine until `shutdown` fires
    pub async fn run(mut self, inbox: AlertInbox, mut shutdown: ShutdownSignal) -> Result<()> {
        let mut retries = self
            .retry_rx
            .take()
            .ok_or_else(|| OpsError::Internal("alert engine retry receiver already taken".to_string()))?;
        let mut commands = inbox.lock_owned().await;

        let (mut evaluation, mut cleanup) = self.intervals();

        info!(
            "Alert engine started: {} rules, {} channels, evaluation every {}s",
            self.rules.len(),
            self.channels.list().len(),
            self.config.evaluation_interval_secs
        );

        loop {
            tokio::select! {
                reason = shutdown.wait() => {
                    info!("Alert engine stopping ({})", reason);
                    break;
                }
                _ = evaluation.tick() => {
                    self.evaluate_at(Utc::now()).await;
                    self.persist().await;
                }
                _ = cleanup.tick() => {
                    self.cleanup_at(Utc::now()).await;
                    self.persist().await;
                }
                Some(due) = retries.recv() => {
                    self.handle_retry_at(due, Utc::now()).await;
                    self.persist().await;
                }
                Some(command) = commands.recv() => {
                    if self.handle_command(command, Utc::now()).await {
                        let (e, c) = self.intervals();
                        evaluation = e;
                        cleanup = c;
                    }
                    self.persist().await;
                }
            }
        }

        self.persist().await;
        info!("Alert engine stopped");
        Ok(())
    }
}

enum EscalationStep {
    Escalated,
    AutoReset,
    Nothing,
}

fn resolve(alert: &mut AlertEvent, by: &str, now: DateTime<Utc>) {
    alert.status = AlertStatus::Resolved;
    alert.resolved_by = Some(by.to_string());
    alert.resolved_at = Some(now);
}

fn is_retryable(error: &OpsError) -> bool {
    !matches!(
        error,
        OpsError::FeatureDisabled(_) | OpsError::Validation(_) | OpsError::Internal(_)
    )
}

/// A level's own actions followed by one notification per level channel
fn level_actions(actions: &[AlertAction], channels: &[String]) -> Vec<AlertAction> {
    actions
        .iter()
        .cloned()
        .chain(
            channels
                .iter()
                .map(|c| AlertAction::new(ActionType::Notification, c)),
        )
        .collect()
}

fn action_for(rule: &AlertRule, level: Option<u32>, index: usize) -> Option<AlertAction> {
    match level {
        None => rule.actions.get(index).cloned(),
        Some(n) => {
            let level = rule.escalation_policy.as_ref()?.level(n)?;
            level_actions(&level.actions, &level.channels)
                .into_iter()
                .nth(index)
        }
    }
}

/// Placeholder data for a fired alert; the first condition is flattened
fn alert_data(alert: &AlertEvent, rule: &AlertRule, matches: &[ConditionMatch]) -> Map<String, Value> {
    let mut data = Map::new();
    data.insert("alert_id".to_string(), json!(alert.id));
    data.insert("rule_id".to_string(), json!(rule.id));
    data.insert("rule_name".to_string(), json!(rule.name));
    data.insert("severity".to_string(), json!(rule.severity.as_str().to_uppercase()));
    data.insert("timestamp".to_string(), json!(alert.timestamp.to_rfc3339()));

    if let Some(first) = matches.first() {
        data.insert("metric".to_string(), json!(first.metric));
        data.insert("value".to_string(), json!(first.observed));
        data.insert("threshold".to_string(), json!(first.threshold));
        data.insert("operator".to_string(), json!(first.operator.symbol()));
        data.insert("aggregation".to_string(), json!(first.aggregation));
        data.insert("duration".to_string(), json!(first.duration));
        data.insert("samples".to_string(), json!(first.samples));
    }
    data.insert(
        "conditions".to_string(),
        serde_json::to_value(matches).unwrap_or(Value::Null),
    );
    data
}

async fn run_process(program: &str, args: &[String], timeout: Duration) -> Result<Value> {
    let mut command = tokio::process::Command::new(program);
    command.args(args).kill_on_drop(true);

    let output = tokio::time::timeout(timeout, command.output())
        .await
        .map_err(|_| OpsError::Delivery(format!("{} timed out after {:?}", program, timeout)))??;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stdout: String = stdout.chars().take(4096).collect();
    if output.status.success() {
        Ok(json!({ "exit_code": output.status.code(), "stdout": stdout }))
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(OpsError::Delivery(format!(
            "{} exited with {:?}: {}",
            program,
            output.status.code(),
            stderr.trim()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerting::channels::MockNotificationTransport;
    use crate::config::AlertFeatures;
    use crate::domain::{
        Aggregation, AlertCondition, ChannelType, EscalationLevel, EscalationPolicy, Operator,
        Severity,
    };
    use crate::metrics::InMemoryMetricStore;
    use chrono::Duration as ChronoDuration;

    fn cpu_rule(id: &str) -> AlertRule {
        AlertRule::new(id, "High CPU usage", Severity::Warning)
            .with_condition(AlertCondition {
                metric: "cpu_usage".to_string(),
                operator: Operator::Gt,
                value: 80.0,
                duration: 300,
                aggregation: Aggregation::Avg,
            })
            .with_cooldown(300)
            .with_max_triggers(10)
    }

    fn config(rules: Vec<AlertRule>) -> AlertEngineConfig {
        AlertEngineConfig {
            rules,
            channels: vec![NotificationChannel::new("ops-slack", ChannelType::Slack, 10)],
            features: AlertFeatures {
                commands: true,
                ..AlertFeatures::default()
            },
            ..AlertEngineConfig::default()
        }
    }

    async fn hot_store(now: DateTime<Utc>) -> Arc<InMemoryMetricStore> {
        let store = Arc::new(InMemoryMetricStore::with_defaults());
        // 300s of samples averaging 85
        for i in 0..=30 {
            let value = if i % 2 == 0 { 80.0 } else { 90.0 };
            let value = if i == 30 { 85.0 } else { value };
            store
                .record_at("cpu_usage", value, now - ChronoDuration::seconds(300 - i * 10))
                .await;
        }
        store
    }

    fn ok_transport(times: usize) -> Arc<MockNotificationTransport> {
        let mut transport = MockNotificationTransport::new();
        transport
            .expect_send()
            .times(times)
            .returning(|_, _, _| Ok(json!({"status": 200})));
        Arc::new(transport)
    }

    #[tokio::test]
    async fn test_fires_once_then_respects_cooldown() {
        let now = Utc::now();
        let store = hot_store(now).await;
        let rule = cpu_rule("high-cpu")
            .with_action(AlertAction::new(ActionType::Notification, "ops-slack"));
        let mut engine = AlertEngine::new(config(vec![rule]), store.clone(), ok_transport(1));

        let fired = engine.evaluate_at(now).await;
        assert_eq!(fired.len(), 1);

        let alerts = engine.active_alerts();
        assert_eq!(alerts.len(), 1);
        let alert = &alerts[0];
        assert_eq!(alert.status, AlertStatus::Active);
        assert_eq!(alert.actions.len(), 1);
        assert_eq!(alert.actions[0].status, ActionStatus::Success);
        assert!(alert.message.contains("cpu_usage"));
        assert_eq!(engine.rules()[0].trigger_count, 1);

        for i in 1..=29 {
            store
                .record_at("cpu_usage", 95.0, now + ChronoDuration::seconds(i * 10))
                .await;
        }
        assert!(engine
            .evaluate_at(now + ChronoDuration::seconds(299))
            .await
            .is_empty());
        assert_eq!(engine.active_alerts().len(), 1);
        assert_eq!(engine.stats().total_alerts, 1);
    }

    #[tokio::test]
    async fn test_trigger_cap_holds() {
        let now = Utc::now();
        let store = hot_store(now).await;
        let rule = cpu_rule("capped").with_cooldown(0).with_max_triggers(3);
        let mut engine = AlertEngine::new(config(vec![rule]), store, ok_transport(0));

        for i in 0..5 {
            engine.evaluate_at(now + ChronoDuration::milliseconds(i)).await;
        }
        assert_eq!(engine.stats().total_alerts, 3);
        assert_eq!(engine.rules()[0].trigger_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_notification_retries() {
        let now = Utc::now();
        let store = hot_store(now).await;
        let notify = AlertAction::new(ActionType::Notification, "ops-slack").with_retries(2, 30);
        let rules = vec![
            cpu_rule("first").with_action(notify.clone()),
            cpu_rule("second").with_action(notify),
        ];
        let mut engine = AlertEngine::new(config(rules), store, ok_transport(2));
        let mut retries = engine.take_retry_receiver().unwrap();

        engine.evaluate_at(now).await;
        let second = engine
            .active_alerts()
            .into_iter()
            .find(|a| a.rule_id == "second")
            .unwrap();
        assert_eq!(second.actions[0].status, ActionStatus::Retrying);
        assert!(second.actions[0].error.as_ref().unwrap().contains("Rate limited"));

        let due = retries.recv().await.unwrap();
        assert_eq!(due.attempt, 2);
        engine
            .handle_retry_at(due, now + ChronoDuration::seconds(30))
            .await;

        let second = engine.alert(&second.id).unwrap();
        assert_eq!(second.actions.len(), 1);
        assert_eq!(second.actions[0].status, ActionStatus::Success);
        assert_eq!(second.actions[0].attempts, 2);
        assert_eq!(engine.channels().get("ops-slack").unwrap().message_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_exhaust_to_failed() {
        let now = Utc::now();
        let store = hot_store(now).await;
        let mut transport = MockNotificationTransport::new();
        transport
            .expect_post_webhook()
            .times(2)
            .returning(|_, _, _| Err(OpsError::Delivery("HTTP 500".to_string())));
        let rule = cpu_rule("hook").with_action(
            AlertAction::new(ActionType::Webhook, "http://127.0.0.1:9/hook").with_retries(1, 5),
        );
        let mut engine = AlertEngine::new(config(vec![rule]), store, Arc::new(transport));
        let mut retries = engine.take_retry_receiver().unwrap();

        engine.evaluate_at(now).await;
        let due = retries.recv().await.unwrap();
        engine.handle_retry_at(due, now + ChronoDuration::seconds(5)).await;

        let alert = &engine.active_alerts()[0];
        assert_eq!(alert.actions[0].status, ActionStatus::Failed);
        assert_eq!(alert.actions[0].attempts, 2);
        assert_eq!(engine.stats().actions_failed, 1);
        assert!(retries.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disabled_feature_fails_without_retry() {
        let now = Utc::now();
        let store = hot_store(now).await;
        let rule = cpu_rule("cmd").with_action(AlertAction::new(ActionType::Command, "true"));
        let mut cfg = config(vec![rule]);
        cfg.features.commands = false;
        let mut engine = AlertEngine::new(cfg, store, ok_transport(0));

        engine.evaluate_at(now).await;
        let result = &engine.active_alerts()[0].actions[0];
        assert_eq!(result.status, ActionStatus::Failed);
        assert!(result.error.as_ref().unwrap().contains("Feature disabled"));
    }

    #[tokio::test]
    async fn test_command_action_substitutes_data() {
        let now = Utc::now();
        let store = hot_store(now).await;
        let rule = cpu_rule("cmd")
            .with_action(AlertAction::new(ActionType::Command, "echo {metric} {rule_id}"));
        let mut engine = AlertEngine::new(config(vec![rule]), store, ok_transport(0));

        engine.evaluate_at(now).await;
        let result = &engine.active_alerts()[0].actions[0];
        assert_eq!(result.status, ActionStatus::Success);
        let stdout = result.response.as_ref().unwrap()["stdout"].as_str().unwrap();
        assert_eq!(stdout.trim(), "cpu_usage cmd");
    }

    fn escalating_rule() -> AlertRule {
        let level = |n: u32, delay: u64| EscalationLevel {
            level: n,
            delay,
            actions: vec![AlertAction::new(ActionType::Webhook, "http://oncall.local/page")],
            recipients: vec![format!("tier-{}", n)],
            channels: Vec::new(),
        };
        cpu_rule("escalating")
            .with_action(AlertAction::new(ActionType::Escalation, "oncall"))
            .with_escalation(EscalationPolicy {
                levels: vec![level(1, 0), level(2, 600)],
                max_level: 2,
                auto_reset: true,
                reset_after: 3_600,
            })
    }

    #[tokio::test]
    async fn test_escalation_is_monotonic_and_capped() {
        let now = Utc::now();
        let store = hot_store(now).await;
        let mut transport = MockNotificationTransport::new();
        transport
            .expect_post_webhook()
            .returning(|_, _, _| Ok(json!({"status": 200})));
        let mut engine =
            AlertEngine::new(config(vec![escalating_rule()]), store, Arc::new(transport));

        engine.evaluate_at(now).await;
        let alert = engine.active_alerts()[0].clone();
        assert_eq!(alert.status, AlertStatus::Escalated);
        assert_eq!(alert.escalation_level, 1);
        assert_eq!(alert.actions.len(), 2);

        // Level 2 delay not reached yet
        engine.cleanup_at(now + ChronoDuration::seconds(599)).await;
        assert_eq!(engine.alert(&alert.id).unwrap().escalation_level, 1);

        let report = engine.cleanup_at(now + ChronoDuration::seconds(600)).await;
        assert_eq!(report.escalated, 1);
        assert_eq!(engine.alert(&alert.id).unwrap().escalation_level, 2);

        let mut last = 2;
        for minutes in [20, 30, 40] {
            engine
                .cleanup_at(now + ChronoDuration::minutes(minutes))
                .await;
            let level = engine.alert(&alert.id).unwrap().escalation_level;
            assert!(level >= last && level <= 2);
            last = level;
        }
        assert_eq!(engine.stats().escalations, 2);

        // An hour at the top level resets it
        let report = engine
            .cleanup_at(now + ChronoDuration::seconds(600 + 3_600))
            .await;
        assert_eq!(report.auto_reset, 1);
        assert_eq!(report.archived, 1);
        let archived = engine.history();
        assert_eq!(archived[0].resolved_by.as_deref(), Some(AUTO_RESET_RESOLVER));
    }

    #[tokio::test]
    async fn test_acknowledged_alert_does_not_escalate() {
        let now = Utc::now();
        let store = hot_store(now).await;
        let mut transport = MockNotificationTransport::new();
        transport
            .expect_post_webhook()
            .returning(|_, _, _| Ok(json!({"status": 200})));
        let mut engine =
            AlertEngine::new(config(vec![escalating_rule()]), store, Arc::new(transport));

        let id = engine.evaluate_at(now).await.remove(0);
        engine.acknowledge_at(&id, "alice", now).await.unwrap();
        engine.cleanup_at(now + ChronoDuration::seconds(900)).await;

        let alert = engine.alert(&id).unwrap();
        assert_eq!(alert.status, AlertStatus::Acknowledged);
        assert_eq!(alert.escalation_level, 1);
        assert_eq!(alert.acknowledged_by.as_deref(), Some("alice"));
    }

    #[tokio::test]
    async fn test_resolve_then_cleanup_archives() {
        let now = Utc::now();
        let store = hot_store(now).await;
        let mut engine = AlertEngine::new(config(vec![cpu_rule("r")]), store, ok_transport(0));

        let id = engine.evaluate_at(now).await.remove(0);
        let resolved = engine.resolve_at(&id, "bob", now).await.unwrap();
        assert_eq!(resolved.status, AlertStatus::Resolved);
        assert!(matches!(
            engine.acknowledge_at(&id, "bob", now).await,
            Err(OpsError::InvalidStateTransition { .. })
        ));

        let report = engine.cleanup_at(now).await;
        assert_eq!(report.archived, 1);
        assert!(engine.active_alerts().is_empty());
        assert_eq!(engine.history()[0].id, id);

        assert!(matches!(
            engine.resolve_at("missing", "bob", now).await,
            Err(OpsError::UnknownAlert(_))
        ));
    }

    #[tokio::test]
    async fn test_stale_alert_times_out() {
        let now = Utc::now();
        let store = hot_store(now).await;
        let mut cfg = config(vec![cpu_rule("r")]);
        cfg.alert_timeout_secs = 3_600;
        let mut engine = AlertEngine::new(cfg, store, ok_transport(0));

        engine.evaluate_at(now).await;
        assert_eq!(engine.cleanup_at(now + ChronoDuration::seconds(3_599)).await.timed_out, 0);

        let report = engine.cleanup_at(now + ChronoDuration::seconds(3_600)).await;
        assert_eq!(report.timed_out, 1);
        assert_eq!(report.archived, 1);
        assert_eq!(engine.history()[0].resolved_by.as_deref(), Some(TIMEOUT_RESOLVER));
    }

    #[tokio::test]
    async fn test_update_config_keeps_counters_for_surviving_rules() {
        let now = Utc::now();
        let store = hot_store(now).await;
        let rules = vec![cpu_rule("a"), cpu_rule("b")];
        let mut engine = AlertEngine::new(config(rules), store, ok_transport(0));
        assert_eq!(engine.evaluate_at(now).await.len(), 2);

        let updated = engine
            .update_config(
                json!({
                    "max_active_alerts": 1,
                    "rules": [cpu_rule("a"), cpu_rule("c")],
                }),
                now,
            )
            .await
            .unwrap();
        assert_eq!(updated.max_active_alerts, 1);

        let ids: Vec<&str> = engine.rules().iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(engine.rules()[0].trigger_count, 1);
        assert_eq!(engine.rules()[1].trigger_count, 0);
        assert_eq!(engine.active_alerts().len(), 1);
        assert_eq!(engine.history().len(), 1);

        let fired = engine.evaluate_at(now).await;
        assert_eq!(fired.len(), 1);
        assert_eq!(engine.alert(&fired[0]).unwrap().rule_id, "c");

        let err = engine
            .update_config(json!({"evaluation_interval_secs": 0}), now)
            .await
            .unwrap_err();
        assert!(matches!(err, OpsError::InvalidConfig(_)));
        assert_eq!(engine.config().max_active_alerts, 1);
    }

    #[tokio::test]
    async fn test_out_of_range_window_fails_closed() {
        let now = Utc::now();
        let store = hot_store(now).await;
        let mut rule = cpu_rule("r");
        rule.conditions[0].duration = 10_000_000_000_000;
        let mut engine = AlertEngine::new(config(vec![rule]), store, ok_transport(0));

        assert!(engine.evaluate_at(now).await.is_empty());
        assert!(engine.active_alerts().is_empty());
    }

    #[tokio::test]
    async fn test_unbounded_timeout_never_expires() {
        let now = Utc::now();
        let store = hot_store(now).await;
        let mut rule = cpu_rule("r");
        rule.cooldown_period = u64::MAX;
        let mut cfg = config(vec![rule]);
        cfg.alert_timeout_secs = u64::MAX;
        let mut engine = AlertEngine::new(cfg, store, ok_transport(0));

        assert_eq!(engine.evaluate_at(now).await.len(), 1);
        let report = engine.cleanup_at(now).await;
        assert_eq!(report.timed_out, 0);
        assert_eq!(report.archived, 0);
        assert_eq!(engine.active_alerts().len(), 1);
        assert!(engine
            .evaluate_at(now + ChronoDuration::seconds(86_400))
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_active_cap_demotes_oldest() {
        let now = Utc::now();
        let store = hot_store(now).await;
        let rules = vec![cpu_rule("a"), cpu_rule("b"), cpu_rule("c")];
        let mut cfg = config(rules);
        cfg.max_active_alerts = 2;
        let mut engine = AlertEngine::new(cfg, store, ok_transport(0));

        engine.evaluate_at(now).await;
        let active: Vec<String> = engine.active_alerts().into_iter().map(|a| a.rule_id).collect();
        assert_eq!(active, vec!["b", "c"]);
        assert_eq!(engine.history()[0].rule_id, "a");
    }

    #[tokio::test]
    async fn test_restore_carries_counters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alerts.json");
        let now = Utc::now();
        let store = hot_store(now).await;

        let mut engine = AlertEngine::new(config(vec![cpu_rule("r")]), store.clone(), ok_transport(0))
            .with_state_file(StateFile::new(&path));
        engine.evaluate_at(now).await;
        engine.persist().await;

        let mut restarted = AlertEngine::new(config(vec![cpu_rule("r")]), store, ok_transport(0))
            .with_state_file(StateFile::new(&path));
        restarted.restore().await;
        assert_eq!(restarted.rules()[0].trigger_count, 1);
        assert_eq!(restarted.active_alerts().len(), 1);
        assert_eq!(restarted.stats().total_alerts, 1);

        // Still cooling down after the restart
        assert!(restarted
            .evaluate_at(now + ChronoDuration::seconds(10))
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_handle_commands_through_loop() {
        let now = Utc::now();
        let store = hot_store(now).await;
        let mut engine = AlertEngine::new(config(vec![cpu_rule("r")]), store, ok_transport(0));
        let id = engine.evaluate_at(now).await.remove(0);

        let (handle, inbox) = command_channel(8);
        let shutdown = crate::coordination::shutdown::ShutdownHandle::new();
        let task = tokio::spawn(engine.run(inbox, shutdown.token()));

        let acked = handle.acknowledge(&id, "carol").await.unwrap();
        assert_eq!(acked.status, AlertStatus::Acknowledged);
        let resolved = handle.resolve(&id, "carol").await.unwrap();
        assert_eq!(resolved.resolved_by.as_deref(), Some("carol"));

        shutdown.trigger(crate::coordination::shutdown::ShutdownReason::Requested);
        task.await.unwrap().unwrap();
    }
}
