use async_trait::async_trait;
use chrono::Utc;
use patchops::adapters::{AdapterRegistry, ComponentAdapter};
use patchops::config::OrchestratorConfig;
use patchops::coordination::{Orchestrator, OrchestratorState, ShutdownHandle, ShutdownReason};
use patchops::domain::{
    ComponentStatus, EventType, HealthBucket, ALERT_ENGINE, METRICS_AGGREGATOR, SHUTDOWN_SEQUENCE,
    SNAPSHOT_DAEMON, STARTUP_SEQUENCE, STATUS_DASHBOARD,
};
use patchops::error::{OpsError, Result};
use patchops::persistence::StateFile;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

type CallLog = Arc<Mutex<Vec<String>>>;

struct Probe {
    healthy: Arc<AtomicBool>,
    start_ok: Arc<AtomicBool>,
}

struct FakeAdapter {
    id: String,
    healthy: Arc<AtomicBool>,
    start_ok: Arc<AtomicBool>,
    calls: CallLog,
}

#[async_trait]
impl ComponentAdapter for FakeAdapter {
    async fn start(&mut self) -> Result<bool> {
        self.calls.lock().unwrap().push(format!("start {}", self.id));
        Ok(self.start_ok.load(Ordering::SeqCst))
    }

    async fn stop(&mut self) -> Result<bool> {
        self.calls.lock().unwrap().push(format!("stop {}", self.id));
        Ok(true)
    }

    async fn is_healthy(&mut self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}

fn fast_config(enable_all: bool) -> OrchestratorConfig {
    let mut config = OrchestratorConfig {
        start_delay_ms: 0,
        stop_delay_ms: 0,
        restart_settle_ms: 0,
        ..OrchestratorConfig::default()
    };
    config.restart.base_backoff_ms = 0;
    config.restart.max_backoff_ms = 0;
    if enable_all {
        for settings in config.components.values_mut() {
            settings.enabled = true;
        }
    }
    config
}

fn with_fakes(config: OrchestratorConfig) -> (Orchestrator, HashMap<String, Probe>, CallLog) {
    let calls: CallLog = Arc::new(Mutex::new(Vec::new()));
    let mut probes = HashMap::new();
    let mut registry = AdapterRegistry::new();

    for id in STARTUP_SEQUENCE {
        let healthy = Arc::new(AtomicBool::new(true));
        let start_ok = Arc::new(AtomicBool::new(true));
        registry.insert(
            id,
            Box::new(FakeAdapter {
                id: id.to_string(),
                healthy: healthy.clone(),
                start_ok: start_ok.clone(),
                calls: calls.clone(),
            }),
        );
        probes.insert(id.to_string(), Probe { healthy, start_ok });
    }

    let mut orchestrator = Orchestrator::new(config);
    orchestrator.install_adapters(registry);
    (orchestrator, probes, calls)
}

async fn wait_until<F>(rx: &mut watch::Receiver<OrchestratorState>, mut ready: F)
where
    F: FnMut(&OrchestratorState) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let done = ready(&rx.borrow_and_update());
            if done {
                return;
            }
            rx.changed().await.unwrap();
        }
    })
    .await
    .expect("orchestrator did not reach the expected state");
}

#[tokio::test]
async fn startup_and_shutdown_follow_declared_sequences() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state").join("orchestrator.json");
    let (orchestrator, _probes, calls) = with_fakes(fast_config(true));
    let orchestrator = orchestrator.with_state_file(StateFile::new(&state_path));

    let mut rx = orchestrator.subscribe();
    let shutdown = ShutdownHandle::new();
    let run = tokio::spawn(orchestrator.run(shutdown.token()));

    wait_until(&mut rx, |s| {
        s.running
            && s.components
                .iter()
                .all(|c| c.status == ComponentStatus::Running)
    })
    .await;
    shutdown.trigger(ShutdownReason::Requested);
    let final_state = run.await.unwrap().unwrap();

    let expected: Vec<String> = STARTUP_SEQUENCE
        .iter()
        .map(|id| format!("start {}", id))
        .chain(SHUTDOWN_SEQUENCE.iter().map(|id| format!("stop {}", id)))
        .collect();
    assert_eq!(*calls.lock().unwrap(), expected);

    assert!(!final_state.running);
    let persisted: OrchestratorState = StateFile::new(&state_path).load().await.unwrap().unwrap();
    assert!(!persisted.running);
    assert!(persisted
        .events
        .iter()
        .any(|e| e.event_type == EventType::OrchestratorStop));
}

#[tokio::test]
async fn failed_dependency_blocks_dependents() {
    let (mut orchestrator, probes, calls) = with_fakes(fast_config(true));
    probes[METRICS_AGGREGATOR]
        .start_ok
        .store(false, Ordering::SeqCst);

    orchestrator.start_all().await;

    let started: Vec<String> = calls.lock().unwrap().clone();
    assert_eq!(
        started,
        vec![
            format!("start {}", METRICS_AGGREGATOR),
            format!("start {}", SNAPSHOT_DAEMON)
        ]
    );

    let dashboard = orchestrator.component(STATUS_DASHBOARD).unwrap();
    assert_eq!(dashboard.status, ComponentStatus::Error);
    assert_eq!(dashboard.health, HealthBucket::Critical);
    assert!(dashboard
        .last_error
        .as_deref()
        .unwrap()
        .contains(METRICS_AGGREGATOR));

    assert!(orchestrator.state().events.iter().any(|e| {
        e.event_type == EventType::DependencyFailed
            && e.component_id.as_deref() == Some(ALERT_ENGINE)
    }));
    assert_eq!(
        orchestrator.component(SNAPSHOT_DAEMON).unwrap().status,
        ComponentStatus::Running
    );
    assert_eq!(orchestrator.system_health().overall, HealthBucket::Critical);
}

#[tokio::test]
async fn health_precedence_and_score() {
    let (mut orchestrator, probes, _calls) = with_fakes(fast_config(false));
    orchestrator.start_all().await;
    assert_eq!(orchestrator.system_health().score, 100);

    probes[STATUS_DASHBOARD]
        .healthy
        .store(false, Ordering::SeqCst);
    orchestrator.health_pass_at(Utc::now()).await;

    let health = orchestrator.system_health();
    assert_eq!(health.overall, HealthBucket::Degraded);
    assert_eq!(health.total, 3);
    assert_eq!(health.healthy, 2);
    assert_eq!(health.score, 67);

    orchestrator.health_pass_at(Utc::now()).await;
    assert_eq!(orchestrator.system_health().overall, HealthBucket::Unhealthy);

    probes[STATUS_DASHBOARD]
        .healthy
        .store(true, Ordering::SeqCst);
    orchestrator.health_pass_at(Utc::now()).await;
    assert_eq!(orchestrator.system_health().overall, HealthBucket::Healthy);
}

#[tokio::test]
async fn commands_are_served_by_the_running_loop() {
    let (orchestrator, _probes, calls) = with_fakes(fast_config(false));
    let handle = orchestrator.handle();
    let mut rx = orchestrator.subscribe();
    let shutdown = ShutdownHandle::new();
    let run = tokio::spawn(orchestrator.run(shutdown.token()));

    wait_until(&mut rx, |s| s.running).await;

    handle.restart(METRICS_AGGREGATOR).await.unwrap();
    let err = handle.restart("no-such-component").await.unwrap_err();
    assert!(matches!(err, OpsError::UnknownComponent(_)));

    let config = handle
        .update_config(serde_json::json!({ "auto_recovery": false }))
        .await
        .unwrap();
    assert!(!config.auto_recovery);

    wait_until(&mut rx, |s| {
        s.component(METRICS_AGGREGATOR)
            .map(|c| c.restart_count == 1 && c.status == ComponentStatus::Running)
            .unwrap_or(false)
    })
    .await;

    shutdown.trigger(ShutdownReason::Requested);
    run.await.unwrap().unwrap();

    let calls = calls.lock().unwrap();
    let aggregator_starts = calls
        .iter()
        .filter(|c| *c == &format!("start {}", METRICS_AGGREGATOR))
        .count();
    assert_eq!(aggregator_starts, 2);
    assert!(handle.restart(METRICS_AGGREGATOR).await.is_err());
}
