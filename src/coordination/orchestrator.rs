//! Component Orchestrator
//!
//! Owns the component table and drives every component through its adapter:
//! ordered startup with dependency gating, the declared shutdown sequence,
//! the health loop, the monitoring loop (uptime, recovery, persistence) and
//! backoff-limited restarts. The orchestrator is the only writer of its
//! state; other tasks send [`OrchestratorCommand`]s and read the published
//! [`OrchestratorState`].

use super::restart::{RestartDecision, RestartPolicy};
use super::shutdown::ShutdownSignal;
use crate::adapters::AdapterRegistry;
use crate::config::{merge_json, ConfigStore, OrchestratorConfig, Validate};
use crate::domain::{
    default_components, BoundedLog, Component, ComponentStatus, EventType, HealthBucket,
    OrchestratorEvent, Severity, SystemHealth, SHUTDOWN_SEQUENCE, STARTUP_SEQUENCE,
};
use crate::error::{OpsError, Result};
use crate::persistence::{EventLog, StateFile};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Full orchestrator state, persisted after every cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrchestratorState {
    pub running: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub components: Vec<Component>,
    pub system_health: SystemHealth,
    pub events: BoundedLog<OrchestratorEvent>,
}

impl Default for OrchestratorState {
    fn default() -> Self {
        Self {
            running: false,
            started_at: None,
            last_cycle_at: None,
            components: default_components(),
            system_health: SystemHealth::default(),
            events: BoundedLog::new(OrchestratorConfig::default().max_events),
        }
    }
}

impl OrchestratorState {
    pub fn component(&self, id: &str) -> Option<&Component> {
        self.components.iter().find(|c| c.id == id)
    }
}

/// Requests processed by the orchestrator loop between ticks
#[derive(Debug)]
pub enum OrchestratorCommand {
    Start {
        id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Restart {
        id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    UpdateConfig {
        patch: serde_json::Value,
        reply: oneshot::Sender<Result<OrchestratorConfig>>,
    },
}

/// Cloneable sender for orchestrator commands
#[derive(Debug, Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::Sender<OrchestratorCommand>,
}

impl OrchestratorHandle {
    async fn request<T, F>(&self, build: F) -> Result<T>
    where
        F: FnOnce(oneshot::Sender<Result<T>>) -> OrchestratorCommand,
    {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| OpsError::Internal("orchestrator is not running".to_string()))?;
        rx.await.map_err(|_| OpsError::Cancelled)?
    }

    pub async fn start(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.request(|reply| OrchestratorCommand::Start { id, reply }).await
    }

    pub async fn stop(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.request(|reply| OrchestratorCommand::Stop { id, reply }).await
    }

    pub async fn restart(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        self.request(|reply| OrchestratorCommand::Restart { id, reply })
            .await
    }

    pub async fn update_config(&self, patch: serde_json::Value) -> Result<OrchestratorConfig> {
        self.request(|reply| OrchestratorCommand::UpdateConfig { patch, reply })
            .await
    }
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    config_store: Option<ConfigStore<OrchestratorConfig>>,
    state: OrchestratorState,
    adapters: AdapterRegistry,
    restarts: RestartPolicy,
    state_file: Option<StateFile<OrchestratorState>>,
    event_log: EventLog,
    published: watch::Sender<OrchestratorState>,
    handle: OrchestratorHandle,
    commands: Option<mpsc::Receiver<OrchestratorCommand>>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        let (tx, rx) = mpsc::channel(32);
        let state = OrchestratorState {
            events: BoundedLog::new(config.max_events),
            ..OrchestratorState::default()
        };
        let (published, _) = watch::channel(state.clone());

        let mut orchestrator = Self {
            restarts: RestartPolicy::new(config.restart.clone()),
            config,
            config_store: None,
            state,
            adapters: AdapterRegistry::new(),
            state_file: None,
            event_log: EventLog::disabled(),
            published,
            handle: OrchestratorHandle { tx },
            commands: Some(rx),
        };
        orchestrator.apply_component_settings();
        orchestrator
    }

    pub fn with_state_file(mut self, file: StateFile<OrchestratorState>) -> Self {
        self.state_file = Some(file);
        self
    }

    pub fn with_event_log(mut self, log: EventLog) -> Self {
        self.event_log = log;
        self
    }

    /// Persist runtime config updates through `store`
    pub fn with_config_store(mut self, store: ConfigStore<OrchestratorConfig>) -> Self {
        self.config = store.get().clone();
        self.restarts.set_config(self.config.restart.clone());
        self.state.events.set_capacity(self.config.max_events);
        self.config_store = Some(store);
        self.apply_component_settings();
        self
    }

    pub fn install_adapters(&mut self, adapters: AdapterRegistry) {
        info!("Installed {} component adapters", adapters.len());
        self.adapters = adapters;
    }

    pub fn handle(&self) -> OrchestratorHandle {
        self.handle.clone()
    }

    /// Receiver that sees the state after every cycle
    pub fn subscribe(&self) -> watch::Receiver<OrchestratorState> {
        self.published.subscribe()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn state(&self) -> &OrchestratorState {
        &self.state
    }

    pub fn component(&self, id: &str) -> Option<&Component> {
        self.state.component(id)
    }

    pub fn system_health(&self) -> &SystemHealth {
        &self.state.system_health
    }

    fn component_mut(&mut self, id: &str) -> Result<&mut Component> {
        self.state
            .components
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| OpsError::UnknownComponent(id.to_string()))
    }

    fn apply_component_settings(&mut self) {
        for component in &mut self.state.components {
            let settings = self.config.component(&component.id, component.kind);
            component.enabled = settings.enabled;
            component.auto_restart = settings.auto_restart;
            component.max_restarts = settings.max_restarts;
        }
    }

    /// Record an event in the bounded list and the audit log
    fn emit(&mut self, event: OrchestratorEvent) {
        let component = event.component_id.as_deref().unwrap_or("-");
        match event.severity {
            Severity::Info => info!(component = %component, "[{}] {}", event.event_type, event.message),
            Severity::Warning => warn!(component = %component, "[{}] {}", event.event_type, event.message),
            Severity::Error | Severity::Critical => {
                error!(component = %component, "[{}] {}", event.event_type, event.message)
            }
        }
        self.event_log.append(&event);
        self.state.events.push(event);
    }

    fn transition(&mut self, id: &str, to: ComponentStatus) -> Result<()> {
        let component = self.component_mut(id)?;
        let from = component.status;
        if !from.can_transition_to(to) {
            return Err(OpsError::InvalidStateTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        component.status = to;
        if from != to {
            debug!("Component {} state: {} -> {}", id, from, to);
        }
        Ok(())
    }

    /// Mark a component failed and log a component_error event
    fn fail(&mut self, id: &str, reason: &str) {
        if let Ok(component) = self.component_mut(id) {
            component.record_error(reason);
        }
        self.emit(OrchestratorEvent::new(
            EventType::ComponentError,
            Some(id),
            Severity::Error,
            reason,
        ));
    }

    fn adapter_timeout(&self) -> Duration {
        Duration::from_millis(self.config.adapter_timeout_ms)
    }

    /// Reload the last snapshot. Status and health are advisory until the
    /// component is started or probed again.
    pub async fn restore(&mut self) {
        let Some(file) = &self.state_file else {
            return;
        };
        let Some(previous) = file.load_or_none().await else {
            return;
        };

        for component in &mut self.state.components {
            if let Some(old) = previous.component(&component.id) {
                component.restart_count = old.restart_count;
                component.error_count = old.error_count;
                component.last_error = old.last_error.clone();
                component.last_heartbeat = old.last_heartbeat;
                component.status = if component.enabled {
                    ComponentStatus::Unknown
                } else {
                    ComponentStatus::Stopped
                };
                component.health = HealthBucket::Unknown;
            }
        }
        for event in previous.events.to_vec() {
            self.state.events.push(event);
        }

        info!(
            "Restored orchestrator snapshot ({} events); component status is advisory",
            self.state.events.len()
        );
    }

    /// Start one component after checking its dependencies
    pub async fn start_component(&mut self, id: &str) -> Result<()> {
        let component = self
            .component(id)
            .cloned()
            .ok_or_else(|| OpsError::UnknownComponent(id.to_string()))?;

        if component.status == ComponentStatus::Running {
            debug!("Component {} already running", id);
            return Ok(());
        }
        self.transition(id, ComponentStatus::Starting)?;

        for dependency in &component.dependencies {
            let dep = self.component(dependency);
            if !dep.map(|d| d.is_operational()).unwrap_or(false) {
                let (status, health) = dep
                    .map(|d| (d.status.to_string(), d.health.to_string()))
                    .unwrap_or_else(|| ("missing".to_string(), "unknown".to_string()));
                let reason = format!("dependency {} is not running and healthy", dependency);

                self.component_mut(id)?.record_error(&reason);
                self.emit(
                    OrchestratorEvent::new(
                        EventType::DependencyFailed,
                        Some(id),
                        Severity::Error,
                        format!("Cannot start {}: {}", id, reason),
                    )
                    .with_data(json!({
                        "dependency": dependency,
                        "status": status,
                        "health": health,
                    })),
                );
                return Err(OpsError::DependencyFailed {
                    component: id.to_string(),
                    dependency: dependency.clone(),
                });
            }
        }
        if !component.dependencies.is_empty() {
            self.emit(
                OrchestratorEvent::new(
                    EventType::DependencyResolved,
                    Some(id),
                    Severity::Info,
                    format!("Dependencies of {} are running and healthy", id),
                )
                .with_data(json!({ "dependencies": component.dependencies })),
            );
        }

        let timeout = self.adapter_timeout();
        let Some(adapter) = self.adapters.get_mut(id) else {
            let reason = "no adapter registered";
            self.fail(id, reason);
            return Err(OpsError::component(id, reason));
        };
        let outcome = tokio::time::timeout(timeout, adapter.start()).await;

        let failure = match outcome {
            Ok(Ok(true)) => None,
            Ok(Ok(false)) => Some("adapter reported an unhealthy start".to_string()),
            Ok(Err(e)) => Some(format!("start failed: {}", e)),
            Err(_) => Some(format!("start timed out after {:?}", timeout)),
        };
        if let Some(reason) = failure {
            self.fail(id, &reason);
            return Err(OpsError::component(id, reason));
        }

        let now = Utc::now();
        self.transition(id, ComponentStatus::Running)?;
        self.component_mut(id)?.mark_running(now);
        self.emit(OrchestratorEvent::new(
            EventType::ComponentStart,
            Some(id),
            Severity::Info,
            format!("{} started", component.name),
        ));
        Ok(())
    }

    /// Stop one component through its adapter
    pub async fn stop_component(&mut self, id: &str) -> Result<()> {
        let component = self
            .component(id)
            .cloned()
            .ok_or_else(|| OpsError::UnknownComponent(id.to_string()))?;

        if component.status == ComponentStatus::Stopped {
            debug!("Component {} already stopped", id);
            return Ok(());
        }

        let timeout = self.adapter_timeout();
        let failure = match self.adapters.get_mut(id) {
            Some(adapter) => match tokio::time::timeout(timeout, adapter.stop()).await {
                Ok(Ok(true)) => None,
                Ok(Ok(false)) => Some("adapter reported an unclean stop".to_string()),
                Ok(Err(e)) => Some(format!("stop failed: {}", e)),
                Err(_) => Some(format!("stop timed out after {:?}", timeout)),
            },
            None => None,
        };
        if let Some(reason) = failure {
            self.fail(id, &reason);
            return Err(OpsError::component(id, reason));
        }

        self.transition(id, ComponentStatus::Stopped)?;
        self.component_mut(id)?.mark_stopped();
        self.emit(OrchestratorEvent::new(
            EventType::ComponentStop,
            Some(id),
            Severity::Info,
            format!("{} stopped", component.name),
        ));
        Ok(())
    }

    /// Start every enabled component in the declared startup sequence
    pub async fn start_all(&mut self) {
        let now = Utc::now();
        self.state.running = true;
        self.state.started_at = Some(now);
        self.emit(OrchestratorEvent::new(
            EventType::OrchestratorStart,
            None,
            Severity::Info,
            "Orchestrator starting components",
        ));

        let sequence: Vec<&str> = STARTUP_SEQUENCE
            .iter()
            .copied()
            .filter(|id| self.component(id).map(|c| c.enabled).unwrap_or(false))
            .collect();
        let delay = Duration::from_millis(self.config.start_delay_ms);

        for (i, id) in sequence.iter().enumerate() {
            if i > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Err(e) = self.start_component(id).await {
                warn!("Component {} failed to start: {}", id, e);
            }
        }

        self.compute_health_at(Utc::now());
        let running = self
            .state
            .components
            .iter()
            .filter(|c| c.status == ComponentStatus::Running)
            .count();
        info!(
            "Startup complete: {}/{} enabled components running, health {} ({})",
            running,
            sequence.len(),
            self.state.system_health.overall,
            self.state.system_health.score
        );
        self.persist().await;
    }

    /// Stop everything that is not already stopped, in the declared shutdown sequence
    pub async fn stop_all(&mut self) {
        self.emit(OrchestratorEvent::new(
            EventType::OrchestratorStop,
            None,
            Severity::Info,
            "Orchestrator stopping components",
        ));

        let sequence: Vec<&str> = SHUTDOWN_SEQUENCE
            .iter()
            .copied()
            .filter(|id| {
                self.component(id)
                    .map(|c| c.status != ComponentStatus::Stopped)
                    .unwrap_or(false)
            })
            .collect();
        let delay = Duration::from_millis(self.config.stop_delay_ms);

        for (i, id) in sequence.iter().enumerate() {
            if i > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            if let Err(e) = self.stop_component(id).await {
                warn!("Component {} failed to stop: {}", id, e);
            }
        }

        self.state.running = false;
        self.compute_health_at(Utc::now());
        info!("Shutdown complete");
        self.persist().await;
    }

    /// Probe every running component and recompute system health
    pub async fn health_pass_at(&mut self, now: DateTime<Utc>) {
        let running: Vec<String> = self
            .state
            .components
            .iter()
            .filter(|c| c.status == ComponentStatus::Running)
            .map(|c| c.id.clone())
            .collect();
        let timeout = self.adapter_timeout();

        for id in running {
            let healthy = match self.adapters.get_mut(&id) {
                Some(adapter) => tokio::time::timeout(timeout, adapter.is_healthy())
                    .await
                    .unwrap_or(false),
                None => false,
            };

            let Ok(component) = self.component_mut(&id) else {
                continue;
            };
            let from = component.health;
            let to = if healthy {
                component.last_heartbeat = Some(now);
                HealthBucket::Healthy
            } else {
                match from {
                    HealthBucket::Healthy | HealthBucket::Unknown => HealthBucket::Degraded,
                    HealthBucket::Degraded | HealthBucket::Unhealthy => HealthBucket::Unhealthy,
                    HealthBucket::Critical => HealthBucket::Critical,
                }
            };
            component.health = to;
            component.refresh_uptime(now);

            if from != to {
                let severity = match to {
                    HealthBucket::Healthy | HealthBucket::Unknown => Severity::Info,
                    HealthBucket::Degraded => Severity::Warning,
                    HealthBucket::Unhealthy => Severity::Error,
                    HealthBucket::Critical => Severity::Critical,
                };
                self.emit(
                    OrchestratorEvent::new(
                        EventType::ComponentHealthChange,
                        Some(&id),
                        severity,
                        format!("{} health {} -> {}", id, from, to),
                    )
                    .at(now)
                    .with_data(json!({ "from": from, "to": to })),
                );
            }
        }

        self.compute_health_at(now);
        self.state.last_cycle_at = Some(now);
    }

    /// Recompute the system-wide health summary
    pub fn compute_health_at(&mut self, now: DateTime<Utc>) -> &SystemHealth {
        self.state.system_health = SystemHealth::compute(&self.state.components, now);
        &self.state.system_health
    }

    /// Uptime refresh and recovery; the persisting half of the cycle
    pub async fn monitoring_pass_at(&mut self, now: DateTime<Utc>) {
        for component in &mut self.state.components {
            if component.status == ComponentStatus::Running {
                component.refresh_uptime(now);
            }
        }
        if self.config.auto_recovery {
            self.recovery_pass_at(now).await;
        }
        self.compute_health_at(now);
        self.state.last_cycle_at = Some(now);
    }

    /// Restart auto-restart components that failed or went unhealthy.
    /// Components whose dependencies are down are left for a later pass.
    pub async fn recovery_pass_at(&mut self, now: DateTime<Utc>) -> Vec<String> {
        let candidates: Vec<String> = self
            .state
            .components
            .iter()
            .filter(|c| c.enabled && c.auto_restart)
            .filter(|c| {
                c.status == ComponentStatus::Error
                    || (c.status == ComponentStatus::Running
                        && matches!(c.health, HealthBucket::Unhealthy | HealthBucket::Critical))
            })
            .filter(|c| {
                c.dependencies.iter().all(|d| {
                    self.state
                        .component(d)
                        .map(|dep| dep.is_operational())
                        .unwrap_or(false)
                })
            })
            .map(|c| c.id.clone())
            .collect();

        let mut restarted = Vec::new();
        for id in candidates {
            match self.restart_component_at(&id, now).await {
                Ok(()) => restarted.push(id),
                Err(e) => warn!("Recovery of {} failed: {}", id, e),
            }
        }
        restarted
    }

    pub async fn restart_component(&mut self, id: &str) -> Result<()> {
        self.restart_component_at(id, Utc::now()).await
    }

    /// Stop, settle, start; limited by the restart policy
    pub async fn restart_component_at(&mut self, id: &str, now: DateTime<Utc>) -> Result<()> {
        let component = self
            .component(id)
            .cloned()
            .ok_or_else(|| OpsError::UnknownComponent(id.to_string()))?;

        let backoff = match self.restarts.decide_at(id, component.max_restarts, now) {
            RestartDecision::Exhausted { attempts } => {
                let reason = format!(
                    "{} restarts in the last {}s (max {})",
                    attempts, self.config.restart.window_secs, component.max_restarts
                );
                self.emit(
                    OrchestratorEvent::new(
                        EventType::ComponentError,
                        Some(id),
                        Severity::Error,
                        format!("Restart of {} refused: {}", id, reason),
                    )
                    .with_data(json!({ "attempts": attempts })),
                );
                return Err(OpsError::RestartRefused {
                    component: id.to_string(),
                    reason,
                });
            }
            RestartDecision::Proceed { backoff, .. } => backoff,
        };

        if !backoff.is_zero() {
            tokio::time::sleep(backoff).await;
        }
        if component.status != ComponentStatus::Stopped {
            if let Err(e) = self.stop_component(id).await {
                warn!("Stop before restart of {} failed, starting anyway: {}", id, e);
            }
        }
        let settle = Duration::from_millis(self.config.restart_settle_ms);
        if !settle.is_zero() {
            tokio::time::sleep(settle).await;
        }

        self.component_mut(id)?.restart_count += 1;
        let result = self.start_component(id).await;
        self.compute_health_at(Utc::now());
        result
    }

    /// Merge a patch into the configuration and apply it
    pub async fn update_config(&mut self, patch: serde_json::Value) -> Result<OrchestratorConfig> {
        let next = match &mut self.config_store {
            Some(store) => store.update(patch.clone()).await?.clone(),
            None => {
                let mut merged = serde_json::to_value(&self.config)?;
                merge_json(&mut merged, patch.clone());
                let next: OrchestratorConfig = serde_json::from_value(merged)
                    .map_err(|e| OpsError::InvalidConfig(e.to_string()))?;
                next.validate()
                    .map_err(|errors| OpsError::InvalidConfig(errors.join("; ")))?;
                next
            }
        };

        self.config = next.clone();
        self.restarts.set_config(next.restart.clone());
        for dropped in self.state.events.set_capacity(next.max_events) {
            debug!("Dropped event {} after capacity change", dropped.id);
        }
        self.apply_component_settings();

        self.emit(
            OrchestratorEvent::new(
                EventType::ConfigChange,
                None,
                Severity::Info,
                "Orchestrator configuration updated; adapter settings apply on next run",
            )
            .with_data(patch),
        );
        Ok(next)
    }

    /// Write the state file and publish; write failures are logged only
    pub async fn persist(&self) {
        if let Some(file) = &self.state_file {
            if let Err(e) = file.save(&self.state).await {
                error!("Failed to persist orchestrator state: {}", e);
            }
        }
        self.published.send_replace(self.state.clone());
    }

    /// Returns true when the configuration changed
    async fn handle_command(&mut self, command: OrchestratorCommand) -> bool {
        match command {
            OrchestratorCommand::Start { id, reply } => {
                let result = self.start_component(&id).await;
                self.compute_health_at(Utc::now());
                let _ = reply.send(result);
                false
            }
            OrchestratorCommand::Stop { id, reply } => {
                let result = self.stop_component(&id).await;
                self.compute_health_at(Utc::now());
                let _ = reply.send(result);
                false
            }
            OrchestratorCommand::Restart { id, reply } => {
                let _ = reply.send(self.restart_component(&id).await);
                false
            }
            OrchestratorCommand::UpdateConfig { patch, reply } => {
                let result = self.update_config(patch).await;
                let changed = result.is_ok();
                let _ = reply.send(result);
                changed
            }
        }
    }

    fn intervals(&self) -> (tokio::time::Interval, tokio::time::Interval) {
        let health_period = Duration::from_secs(self.config.health_check_interval_secs);
        let monitoring_period = Duration::from_secs(self.config.monitoring_interval_secs);
        let mut health = tokio::time::interval_at(Instant::now() + health_period, health_period);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut monitoring =
            tokio::time::interval_at(Instant::now() + monitoring_period, monitoring_period);
        monitoring.set_missed_tick_behavior(MissedTickBehavior::Delay);
        (health, monitoring)
    }

    /// Restore, start everything, loop until `shutdown`, then stop everything
    pub async fn run(mut self, mut shutdown: ShutdownSignal) -> Result<OrchestratorState> {
        let mut commands = self
            .commands
            .take()
            .ok_or_else(|| OpsError::Internal("orchestrator already running".to_string()))?;

        self.restore().await;
        self.start_all().await;

        let (mut health, mut monitoring) = self.intervals();
        info!(
            "Orchestrator running: health every {}s, monitoring every {}s",
            self.config.health_check_interval_secs, self.config.monitoring_interval_secs
        );

        loop {
            tokio::select! {
                reason = shutdown.wait() => {
                    info!("Orchestrator stopping ({})", reason);
                    break;
                }
                _ = health.tick() => {
                    self.health_pass_at(Utc::now()).await;
                    self.persist().await;
                }
                _ = monitoring.tick() => {
                    self.monitoring_pass_at(Utc::now()).await;
                    self.persist().await;
                }
                Some(command) = commands.recv() => {
                    if self.handle_command(command).await {
                        let (h, m) = self.intervals();
                        health = h;
                        monitoring = m;
                    }
                    self.persist().await;
                }
            }
        }

        self.stop_all().await;
        Ok(self.state)
    }
}
