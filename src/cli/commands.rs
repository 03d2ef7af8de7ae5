//! Offline views over the persisted state, config document management and
//! operator actions against a running dashboard.

use super::output::{format_uptime, or_dash, print_items, print_json, OutputMode};
use super::ConfigTarget;
use crate::alerting::AlertEngineState;
use crate::config::{AlertEngineConfig, AppConfig, ConfigStore, OrchestratorConfig, Validate};
use crate::coordination::OrchestratorState;
use crate::domain::{AlertEvent, Component, OrchestratorEvent};
use crate::persistence::StateFile;
use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tabled::Tabled;

#[derive(Debug, Serialize, Tabled)]
pub struct ComponentRow {
    pub id: String,
    pub status: String,
    pub health: String,
    pub enabled: bool,
    pub uptime: String,
    pub restarts: u32,
    pub errors: u32,
    pub last_error: String,
}

impl From<&Component> for ComponentRow {
    fn from(c: &Component) -> Self {
        Self {
            id: c.id.clone(),
            status: c.status.to_string(),
            health: c.health.to_string(),
            enabled: c.enabled,
            uptime: format_uptime(c.uptime_seconds),
            restarts: c.restart_count,
            errors: c.error_count,
            last_error: or_dash(c.last_error.as_ref()),
        }
    }
}

#[derive(Debug, Serialize, Tabled)]
pub struct EventRow {
    pub time: String,
    pub severity: String,
    #[tabled(rename = "type")]
    pub event_type: String,
    pub component: String,
    pub message: String,
}

impl From<&OrchestratorEvent> for EventRow {
    fn from(e: &OrchestratorEvent) -> Self {
        Self {
            time: e.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            severity: e.severity.to_string(),
            event_type: e.event_type.to_string(),
            component: or_dash(e.component_id.as_ref()),
            message: e.message.clone(),
        }
    }
}

#[derive(Debug, Serialize, Tabled)]
pub struct AlertRow {
    pub id: String,
    pub rule: String,
    pub severity: String,
    pub status: String,
    pub level: u32,
    pub fired: String,
    pub message: String,
}

impl From<&AlertEvent> for AlertRow {
    fn from(a: &AlertEvent) -> Self {
        Self {
            id: a.id.clone(),
            rule: a.rule_id.clone(),
            severity: a.severity.to_string(),
            status: a.status.to_string(),
            level: a.escalation_level,
            fired: a.timestamp.format("%Y-%m-%d %H:%M:%S").to_string(),
            message: a.message.clone(),
        }
    }
}

async fn load_state<T: Serialize + DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    StateFile::<T>::new(path)
        .load()
        .await
        .with_context(|| format!("reading {}", path.display()))
}

pub async fn show_status(app: &AppConfig, mode: OutputMode) -> Result<()> {
    let path = app.orchestrator_state_path();
    let Some(state) = load_state::<OrchestratorState>(&path).await? else {
        println!("No orchestrator state at {}", path.display());
        return Ok(());
    };

    if mode == OutputMode::Json {
        return print_json(&state);
    }

    let rows: Vec<ComponentRow> = state.components.iter().map(ComponentRow::from).collect();
    print_items(&rows, mode)?;
    let health = &state.system_health;
    println!(
        "\nSystem health: {} (score {}) | healthy {} / degraded {} / unhealthy {} / critical {} / unknown {}",
        health.overall,
        health.score,
        health.healthy,
        health.degraded,
        health.unhealthy,
        health.critical,
        health.unknown
    );
    println!(
        "Orchestrator {} | last cycle {}",
        if state.running { "running" } else { "stopped" },
        or_dash(state.last_cycle_at.map(|t| t.format("%Y-%m-%d %H:%M:%S")))
    );
    Ok(())
}

pub async fn show_events(app: &AppConfig, limit: usize, mode: OutputMode) -> Result<()> {
    let path = app.orchestrator_state_path();
    let Some(state) = load_state::<OrchestratorState>(&path).await? else {
        println!("No orchestrator state at {}", path.display());
        return Ok(());
    };

    let events: Vec<OrchestratorEvent> = state.events.iter().rev().take(limit).cloned().collect();
    match mode {
        OutputMode::Json => print_json(&events),
        OutputMode::Table => {
            let rows: Vec<EventRow> = events.iter().map(EventRow::from).collect();
            print_items(&rows, mode)
        }
    }
}

pub async fn show_alerts(app: &AppConfig, history: bool, mode: OutputMode) -> Result<()> {
    let path = app.alert_state_path();
    let Some(state) = load_state::<AlertEngineState>(&path).await? else {
        println!("No alert state at {}", path.display());
        return Ok(());
    };

    let alerts: Vec<AlertEvent> = if history {
        state.history.iter().rev().cloned().collect()
    } else {
        state.active.to_vec()
    };
    match mode {
        OutputMode::Json => print_json(&alerts),
        OutputMode::Table => {
            let rows: Vec<AlertRow> = alerts.iter().map(AlertRow::from).collect();
            print_items(&rows, mode)?;
            let stats = &state.stats;
            println!(
                "\nFired {} | actions ok {} / failed {} | escalations {} | acknowledged {} | resolved {} | timed out {}",
                stats.total_alerts,
                stats.actions_succeeded,
                stats.actions_failed,
                stats.escalations,
                stats.acknowledged,
                stats.resolved,
                stats.timed_out
            );
            Ok(())
        }
    }
}

async fn config_document<T>(path: &Path, set: Option<String>, validate: bool) -> Result<()>
where
    T: Serialize + DeserializeOwned + Default + Validate + Clone,
{
    if validate {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let document: T = serde_json::from_str(&raw)
            .with_context(|| format!("parsing {}", path.display()))?;
        if let Err(errors) = document.validate() {
            for error in &errors {
                println!("✗ {}", error);
            }
            bail!("{} has {} problem(s)", path.display(), errors.len());
        }
        println!("✓ {} is valid", path.display());
        return Ok(());
    }

    let mut store = ConfigStore::<T>::load(path).await?;
    if let Some(patch) = set {
        let patch: serde_json::Value =
            serde_json::from_str(&patch).context("--set expects a JSON object")?;
        store.update(patch).await?;
        println!("Updated {}", path.display());
    }
    print_json(store.get())
}

pub async fn config(
    app: &AppConfig,
    target: ConfigTarget,
    set: Option<String>,
    validate: bool,
    live: bool,
) -> Result<()> {
    if live {
        let patch = set.as_deref().unwrap_or("{}");
        let patch: serde_json::Value =
            serde_json::from_str(patch).context("--set expects a JSON object")?;
        let path = match target {
            ConfigTarget::Orchestrator => "/config",
            ConfigTarget::Alerts => "/alerts/config",
        };
        return dashboard_post(app, path, patch).await;
    }

    match target {
        ConfigTarget::Orchestrator => {
            config_document::<OrchestratorConfig>(&app.orchestrator_config_path(), set, validate)
                .await
        }
        ConfigTarget::Alerts => {
            config_document::<AlertEngineConfig>(&app.alert_config_path(), set, validate).await
        }
    }
}

/// POST to the running dashboard and print the answer
async fn dashboard_post(app: &AppConfig, path: &str, body: serde_json::Value) -> Result<()> {
    let store = ConfigStore::<OrchestratorConfig>::load(app.orchestrator_config_path()).await?;
    let url = format!("http://{}{}", store.get().dashboard.bind, path);

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()?;
    let response = client
        .post(&url)
        .json(&body)
        .send()
        .await
        .with_context(|| format!("is the dashboard running? POST {}", url))?;

    let status = response.status();
    let body: serde_json::Value = response.json().await.unwrap_or(serde_json::Value::Null);
    if !status.is_success() {
        bail!(
            "{} {}",
            status,
            body.get("error").and_then(|e| e.as_str()).unwrap_or("request failed")
        );
    }
    print_json(&body)
}

pub async fn acknowledge(app: &AppConfig, id: &str, by: &str) -> Result<()> {
    dashboard_post(
        app,
        &format!("/alerts/{}/acknowledge", id),
        serde_json::json!({ "by": by }),
    )
    .await
}

pub async fn resolve(app: &AppConfig, id: &str, by: &str) -> Result<()> {
    dashboard_post(
        app,
        &format!("/alerts/{}/resolve", id),
        serde_json::json!({ "by": by }),
    )
    .await
}

pub async fn restart(app: &AppConfig, id: &str) -> Result<()> {
    dashboard_post(
        app,
        &format!("/components/{}/restart", id),
        serde_json::Value::Null,
    )
    .await
}
