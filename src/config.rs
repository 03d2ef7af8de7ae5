use crate::domain::span::MAX_SPAN_SECS;
use crate::domain::{
    ActionType, AlertAction, AlertCondition, AlertRule, Aggregation, ChannelType, ComponentKind,
    NotificationChannel, Operator, Severity, CATALOGUE,
};
use crate::error::{OpsError, Result};
use config::{Config, ConfigError, Environment, File};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Process-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Directory holding config documents, state files and audit logs
    pub data_dir: PathBuf,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted console logs
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info,patchops=debug".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> std::result::Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> std::result::Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("data_dir", "data")?
            .set_default("logging.level", "info,patchops=debug")?
            .set_default("logging.json", false)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Environment-specific overrides (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("PATCHOPS_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // PATCHOPS__DATA_DIR, PATCHOPS__LOGGING__LEVEL, ...
            .add_source(
                Environment::with_prefix("PATCHOPS")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    pub fn orchestrator_config_path(&self) -> PathBuf {
        self.data_dir.join("orchestrator-config.json")
    }

    pub fn alert_config_path(&self) -> PathBuf {
        self.data_dir.join("alert-config.json")
    }

    pub fn orchestrator_state_path(&self) -> PathBuf {
        self.data_dir.join("state").join("orchestrator.json")
    }

    pub fn alert_state_path(&self) -> PathBuf {
        self.data_dir.join("state").join("alerts.json")
    }

    pub fn orchestrator_log_path(&self) -> PathBuf {
        self.data_dir.join("logs").join("orchestrator-events.jsonl")
    }

    pub fn alert_log_path(&self) -> PathBuf {
        self.data_dir.join("logs").join("alert-events.jsonl")
    }
}

/// Per-component settings in the orchestrator document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentSettings {
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub auto_restart: bool,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    /// argv for externally run components
    #[serde(default)]
    pub command: Option<Vec<String>>,
    /// HTTP endpoint answering 2xx when the component is healthy
    #[serde(default)]
    pub health_url: Option<String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

fn default_max_restarts() -> u32 {
    3
}

impl ComponentSettings {
    fn for_kind(kind: ComponentKind) -> Self {
        Self {
            // External components need a command before they can run
            enabled: kind.is_in_process(),
            auto_restart: true,
            max_restarts: default_max_restarts(),
            command: None,
            health_url: None,
            working_dir: None,
        }
    }
}

/// Backoff-with-cooldown restart settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestartConfig {
    /// Window in which a component's `max_restarts` applies (default: 300s)
    pub window_secs: u64,
    /// Wait before the first restart in a window (default: 1s)
    pub base_backoff_ms: u64,
    /// Upper bound on the doubling backoff (default: 60s)
    pub max_backoff_ms: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            window_secs: 300,
            base_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregatorSettings {
    pub sample_interval_secs: u64,
    pub retention_secs: u64,
    pub max_samples_per_metric: usize,
    /// A sampler silent for this long reports unhealthy
    pub stale_after_secs: u64,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            sample_interval_secs: 10,
            retention_secs: 86_400,
            max_samples_per_metric: 10_000,
            stale_after_secs: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DashboardSettings {
    pub bind: String,
}

impl Default for DashboardSettings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8787".to_string(),
        }
    }
}

/// Orchestrator configuration document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub health_check_interval_secs: u64,
    pub monitoring_interval_secs: u64,
    /// Delay between two starts in the startup sequence
    pub start_delay_ms: u64,
    /// Delay between two stops in the shutdown sequence
    pub stop_delay_ms: u64,
    /// Pause between stop and start during a restart
    pub restart_settle_ms: u64,
    /// Upper bound on a single adapter call
    pub adapter_timeout_ms: u64,
    pub max_events: usize,
    /// Let the monitoring loop restart failed auto-restart components
    pub auto_recovery: bool,
    pub restart: RestartConfig,
    pub aggregator: AggregatorSettings,
    pub dashboard: DashboardSettings,
    pub components: BTreeMap<String, ComponentSettings>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: 30,
            monitoring_interval_secs: 60,
            start_delay_ms: 2_000,
            stop_delay_ms: 1_000,
            restart_settle_ms: 5_000,
            adapter_timeout_ms: 30_000,
            max_events: 1_000,
            auto_recovery: true,
            restart: RestartConfig::default(),
            aggregator: AggregatorSettings::default(),
            dashboard: DashboardSettings::default(),
            components: CATALOGUE
                .iter()
                .map(|spec| (spec.id.to_string(), ComponentSettings::for_kind(spec.kind)))
                .collect(),
        }
    }
}

impl OrchestratorConfig {
    /// Settings for a component, falling back to the kind's defaults
    pub fn component(&self, id: &str, kind: ComponentKind) -> ComponentSettings {
        self.components
            .get(id)
            .cloned()
            .unwrap_or_else(|| ComponentSettings::for_kind(kind))
    }
}

/// Document types that can reject bad values before they are persisted
pub trait Validate {
    fn validate(&self) -> std::result::Result<(), Vec<String>>;
}

/// Reject second counts past [`MAX_SPAN_SECS`]
fn check_span(errors: &mut Vec<String>, field: &str, secs: u64) {
    if secs > MAX_SPAN_SECS {
        errors.push(format!(
            "{} ({}s) exceeds the maximum of {}s",
            field, secs, MAX_SPAN_SECS
        ));
    }
}

impl Validate for OrchestratorConfig {
    fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.health_check_interval_secs == 0 {
            errors.push("health_check_interval_secs must be positive".to_string());
        }
        if self.monitoring_interval_secs == 0 {
            errors.push("monitoring_interval_secs must be positive".to_string());
        }
        if self.max_events == 0 {
            errors.push("max_events must be positive".to_string());
        }
        check_span(&mut errors, "health_check_interval_secs", self.health_check_interval_secs);
        check_span(&mut errors, "monitoring_interval_secs", self.monitoring_interval_secs);
        check_span(&mut errors, "restart.window_secs", self.restart.window_secs);
        check_span(&mut errors, "aggregator.retention_secs", self.aggregator.retention_secs);
        check_span(&mut errors, "aggregator.stale_after_secs", self.aggregator.stale_after_secs);
        if self.restart.base_backoff_ms > self.restart.max_backoff_ms {
            errors.push("restart.base_backoff_ms exceeds restart.max_backoff_ms".to_string());
        }
        for id in self.components.keys() {
            if !CATALOGUE.iter().any(|spec| spec.id == id) {
                errors.push(format!("unknown component '{}'", id));
            }
        }
        for (id, settings) in &self.components {
            if let Some(command) = &settings.command {
                if command.is_empty() {
                    errors.push(format!("component '{}' has an empty command", id));
                }
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Feature switches for the alert engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertFeatures {
    pub notifications: bool,
    pub webhooks: bool,
    pub commands: bool,
    pub escalation: bool,
    pub automation: bool,
}

impl Default for AlertFeatures {
    fn default() -> Self {
        Self {
            notifications: true,
            webhooks: true,
            commands: false,
            escalation: true,
            automation: false,
        }
    }
}

impl AlertFeatures {
    pub fn allows(&self, action: ActionType) -> bool {
        match action {
            ActionType::Notification => self.notifications,
            ActionType::Webhook => self.webhooks,
            ActionType::Command => self.commands,
            ActionType::Escalation => self.escalation,
            ActionType::Automation => self.automation,
        }
    }
}

/// Alert engine configuration document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertEngineConfig {
    pub features: AlertFeatures,
    pub evaluation_interval_secs: u64,
    pub cleanup_interval_secs: u64,
    /// Active alerts older than this are force-resolved
    pub alert_timeout_secs: u64,
    pub max_active_alerts: usize,
    pub max_history: usize,
    /// Timeout on outbound webhook calls and commands
    pub delivery_timeout_secs: u64,
    pub rules: Vec<AlertRule>,
    pub channels: Vec<NotificationChannel>,
    /// Named argv lists runnable by automation actions
    pub automations: BTreeMap<String, Vec<String>>,
}

impl Default for AlertEngineConfig {
    fn default() -> Self {
        Self {
            features: AlertFeatures::default(),
            evaluation_interval_secs: 30,
            cleanup_interval_secs: 300,
            alert_timeout_secs: 86_400,
            max_active_alerts: 100,
            max_history: 1_000,
            delivery_timeout_secs: 10,
            rules: default_rules(),
            channels: vec![{
                let mut channel = NotificationChannel::new("ops-slack", ChannelType::Slack, 10)
                    .with_config(serde_json::json!({
                        "webhook_url": "",
                        "channel": "#ops-alerts",
                        "username": "patchops",
                    }));
                // Needs a webhook URL first
                channel.enabled = false;
                channel
            }],
            automations: BTreeMap::new(),
        }
    }
}

/// Stock rules, shipped disabled until a channel is configured
fn default_rules() -> Vec<AlertRule> {
    let cpu = AlertRule::new("high-cpu", "High CPU usage", Severity::Warning)
        .with_condition(AlertCondition {
            metric: crate::metrics::CPU_USAGE.to_string(),
            operator: Operator::Gt,
            value: 80.0,
            duration: 300,
            aggregation: Aggregation::Avg,
        })
        .with_action(
            AlertAction::new(ActionType::Notification, "ops-slack")
                .with_template("{rule_name}: {metric} averaged {value} over {duration}s"),
        );

    let memory = AlertRule::new("high-memory", "High memory usage", Severity::Error)
        .with_condition(AlertCondition {
            metric: crate::metrics::MEMORY_USAGE.to_string(),
            operator: Operator::Gt,
            value: 90.0,
            duration: 300,
            aggregation: Aggregation::Avg,
        })
        .with_action(AlertAction::new(ActionType::Notification, "ops-slack"));

    [cpu, memory]
        .into_iter()
        .map(|mut rule| {
            rule.enabled = false;
            rule
        })
        .collect()
}

impl Validate for AlertEngineConfig {
    fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.evaluation_interval_secs == 0 {
            errors.push("evaluation_interval_secs must be positive".to_string());
        }
        if self.cleanup_interval_secs == 0 {
            errors.push("cleanup_interval_secs must be positive".to_string());
        }
        if self.max_active_alerts == 0 || self.max_history == 0 {
            errors.push("max_active_alerts and max_history must be positive".to_string());
        }
        check_span(&mut errors, "evaluation_interval_secs", self.evaluation_interval_secs);
        check_span(&mut errors, "cleanup_interval_secs", self.cleanup_interval_secs);
        check_span(&mut errors, "alert_timeout_secs", self.alert_timeout_secs);
        check_span(&mut errors, "delivery_timeout_secs", self.delivery_timeout_secs);

        let mut seen = std::collections::HashSet::new();
        for rule in &self.rules {
            if !seen.insert(rule.id.as_str()) {
                errors.push(format!("duplicate rule id '{}'", rule.id));
            }
            if rule.conditions.is_empty() {
                errors.push(format!("rule '{}' has no conditions", rule.id));
            }
            let prefix = format!("rule '{}'", rule.id);
            check_span(&mut errors, &format!("{} cooldown_period", prefix), rule.cooldown_period);
            for condition in &rule.conditions {
                check_span(
                    &mut errors,
                    &format!("{} condition on {} duration", prefix, condition.metric),
                    condition.duration,
                );
            }
            for action in &rule.actions {
                check_span(&mut errors, &format!("{} action retry_delay", prefix), action.retry_delay);
            }
            if let Some(policy) = &rule.escalation_policy {
                check_span(&mut errors, &format!("{} reset_after", prefix), policy.reset_after);
                for level in &policy.levels {
                    check_span(
                        &mut errors,
                        &format!("{} escalation level {} delay", prefix, level.level),
                        level.delay,
                    );
                    for action in &level.actions {
                        check_span(
                            &mut errors,
                            &format!("{} level {} retry_delay", prefix, level.level),
                            action.retry_delay,
                        );
                    }
                }
                for level in 1..=policy.max_level {
                    if policy.level(level).is_none() {
                        errors.push(format!(
                            "rule '{}' escalation policy is missing level {}",
                            rule.id, level
                        ));
                    }
                }
            }
        }

        let mut seen = std::collections::HashSet::new();
        for channel in &self.channels {
            if !seen.insert(channel.id.as_str()) {
                errors.push(format!("duplicate channel id '{}'", channel.id));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Recursively merge `patch` into `base`; objects merge, everything else replaces
pub fn merge_json(base: &mut serde_json::Value, patch: serde_json::Value) {
    match (base, patch) {
        (serde_json::Value::Object(base), serde_json::Value::Object(patch)) => {
            for (key, value) in patch {
                match base.get_mut(&key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, patch) => *base = patch,
    }
}

/// A persisted engine configuration document
#[derive(Debug, Clone)]
pub struct ConfigStore<T> {
    path: PathBuf,
    current: T,
}

impl<T> ConfigStore<T>
where
    T: Serialize + DeserializeOwned + Default + Validate + Clone,
{
    /// Load the document, falling back to (and persisting) the defaults when
    /// it is absent, malformed or invalid
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();

        let loaded = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<T>(&bytes) {
                Ok(doc) => match doc.validate() {
                    Ok(()) => Some(doc),
                    Err(errors) => {
                        warn!(
                            "Invalid configuration in {}: {}; using defaults",
                            path.display(),
                            errors.join("; ")
                        );
                        None
                    }
                },
                Err(e) => {
                    warn!(
                        "Malformed configuration in {}: {}; using defaults",
                        path.display(),
                        e
                    );
                    None
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No configuration at {}, writing defaults", path.display());
                None
            }
            Err(e) => return Err(e.into()),
        };

        let store = match loaded {
            Some(current) => Self { path, current },
            None => {
                let store = Self {
                    path,
                    current: T::default(),
                };
                store.persist().await?;
                store
            }
        };

        Ok(store)
    }

    pub fn get(&self) -> &T {
        &self.current
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Merge a JSON patch into the document, validate, and persist it
    pub async fn update(&mut self, patch: serde_json::Value) -> Result<&T> {
        let mut merged = serde_json::to_value(&self.current)?;
        merge_json(&mut merged, patch);

        let next: T = serde_json::from_value(merged)
            .map_err(|e| OpsError::InvalidConfig(e.to_string()))?;
        next.validate()
            .map_err(|errors| OpsError::InvalidConfig(errors.join("; ")))?;

        self.current = next;
        self.persist().await?;
        info!("Configuration updated at {}", self.path.display());
        Ok(&self.current)
    }

    async fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let body = serde_json::to_vec_pretty(&self.current)?;
        tokio::fs::write(&self.path, body).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_app_config_file_over_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("default.toml"),
            "data_dir = \"/var/lib/patchops\"\n\n[logging]\njson = true\n",
        )
        .unwrap();

        let app = AppConfig::load_from(dir.path()).unwrap();
        assert_eq!(app.data_dir, PathBuf::from("/var/lib/patchops"));
        assert!(app.logging.json);
        assert_eq!(app.logging.level, "info,patchops=debug");
        assert_eq!(
            app.orchestrator_state_path(),
            PathBuf::from("/var/lib/patchops/state/orchestrator.json")
        );
    }

    #[test]
    fn test_merge_json() {
        let mut base = serde_json::json!({"a": 1, "nested": {"x": 1, "y": 2}, "list": [1, 2]});
        merge_json(
            &mut base,
            serde_json::json!({"nested": {"y": 3, "z": 4}, "list": [9], "b": true}),
        );
        assert_eq!(
            base,
            serde_json::json!({"a": 1, "nested": {"x": 1, "y": 3, "z": 4}, "list": [9], "b": true})
        );
    }

    #[test]
    fn test_default_documents_validate() {
        assert!(OrchestratorConfig::default().validate().is_ok());
        assert!(AlertEngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_default_component_enablement() {
        let config = OrchestratorConfig::default();
        assert!(config.components["metrics-aggregator"].enabled);
        assert!(config.components["status-dashboard"].enabled);
        assert!(config.components["alert-engine"].enabled);
        assert!(!config.components["metrics-relay"].enabled);
    }

    #[test]
    fn test_unknown_component_rejected() {
        let mut config = OrchestratorConfig::default();
        config.components.insert(
            "webserver".to_string(),
            ComponentSettings::for_kind(ComponentKind::Relay),
        );
        let errors = config.validate().unwrap_err();
        assert!(errors[0].contains("webserver"));
    }

    #[test]
    fn test_out_of_range_spans_rejected() {
        let mut config = AlertEngineConfig::default();
        config.alert_timeout_secs = u64::MAX;
        let mut rule = AlertRule::new("r", "R", Severity::Warning)
            .with_condition(AlertCondition {
                metric: "cpu_usage".to_string(),
                operator: Operator::Gt,
                value: 80.0,
                duration: 10_000_000_000_000,
                aggregation: Aggregation::Avg,
            })
            .with_cooldown(u64::MAX);
        rule.escalation_policy = Some(crate::domain::EscalationPolicy {
            levels: Vec::new(),
            max_level: 0,
            auto_reset: true,
            reset_after: MAX_SPAN_SECS + 1,
        });
        config.rules = vec![rule];

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().any(|e| e.contains("alert_timeout_secs")));
        assert!(errors.iter().any(|e| e.contains("cpu_usage duration")));
        assert!(errors.iter().any(|e| e.contains("cooldown_period")));
        assert!(errors.iter().any(|e| e.contains("reset_after")));

        let mut orchestrator = OrchestratorConfig::default();
        orchestrator.restart.window_secs = u64::MAX;
        let errors = orchestrator.validate().unwrap_err();
        assert!(errors[0].contains("restart.window_secs"));

        orchestrator.restart.window_secs = MAX_SPAN_SECS;
        assert!(orchestrator.validate().is_ok());
    }

    #[tokio::test]
    async fn test_store_defaults_persisted_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orchestrator-config.json");

        let store = ConfigStore::<OrchestratorConfig>::load(&path).await.unwrap();
        assert_eq!(store.get(), &OrchestratorConfig::default());
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_store_recovers_from_malformed_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alert-config.json");
        tokio::fs::write(&path, b"{ broken").await.unwrap();

        let store = ConfigStore::<AlertEngineConfig>::load(&path).await.unwrap();
        assert_eq!(store.get().evaluation_interval_secs, 30);

        let body = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(serde_json::from_str::<AlertEngineConfig>(&body).is_ok());
    }

    #[tokio::test]
    async fn test_store_update_merges_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orchestrator-config.json");
        let mut store = ConfigStore::<OrchestratorConfig>::load(&path).await.unwrap();

        store
            .update(serde_json::json!({
                "health_check_interval_secs": 5,
                "components": {"metrics-relay": {"enabled": true, "command": ["relay", "--port", "9000"]}}
            }))
            .await
            .unwrap();

        let reloaded = ConfigStore::<OrchestratorConfig>::load(&path).await.unwrap();
        assert_eq!(reloaded.get().health_check_interval_secs, 5);
        assert_eq!(reloaded.get().monitoring_interval_secs, 60);
        let relay = &reloaded.get().components["metrics-relay"];
        assert!(relay.enabled);
        assert_eq!(relay.command.as_ref().unwrap()[0], "relay");
    }

    #[tokio::test]
    async fn test_store_update_rejects_invalid_patch() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orchestrator-config.json");
        let mut store = ConfigStore::<OrchestratorConfig>::load(&path).await.unwrap();

        let err = store
            .update(serde_json::json!({"health_check_interval_secs": 0}))
            .await
            .unwrap_err();
        assert!(matches!(err, OpsError::InvalidConfig(_)));
        assert_eq!(store.get().health_check_interval_secs, 30);
    }
}
