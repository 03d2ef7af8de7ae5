//! Status dashboard HTTP server
//!
//! Read-only views over the published orchestrator and alert state plus the
//! operator actions (component start/stop/restart, alert acknowledge/resolve,
//! config patches). Actions are forwarded to the owning engine loops; nothing
//! here mutates state directly.

use super::ComponentAdapter;
use crate::alerting::{AlertEngineHandle, AlertEngineState};
use crate::coordination::shutdown::{ShutdownHandle, ShutdownReason};
use crate::coordination::{OrchestratorHandle, OrchestratorState};
use crate::domain::HealthBucket;
use crate::error::{OpsError, Result};
use crate::metrics::InMemoryMetricStore;
use async_trait::async_trait;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared state for the dashboard handlers
pub struct DashboardState {
    pub started_at: DateTime<Utc>,
    pub orchestrator: OrchestratorHandle,
    pub orchestrator_state: watch::Receiver<OrchestratorState>,
    pub alerts: AlertEngineHandle,
    pub alert_state: watch::Receiver<AlertEngineState>,
    pub metrics: Arc<InMemoryMetricStore>,
}

/// Build the dashboard router
pub fn router(state: Arc<DashboardState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/healthz", get(liveness_handler))
        .route("/readyz", get(readiness_handler))
        .route("/metrics", get(metrics_handler))
        .route("/status", get(status_handler))
        .route("/events", get(events_handler))
        .route("/components/:id", get(component_handler))
        .route("/components/:id/:action", post(component_action_handler))
        .route("/alerts", get(alerts_handler))
        .route("/alerts/config", post(alert_config_handler))
        .route("/alerts/:id/acknowledge", post(acknowledge_handler))
        .route("/alerts/:id/resolve", post(resolve_handler))
        .route("/config", post(config_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

fn error_response(err: OpsError) -> Response {
    let status = match &err {
        OpsError::UnknownComponent(_) | OpsError::UnknownAlert(_) => StatusCode::NOT_FOUND,
        OpsError::InvalidConfig(_)
        | OpsError::Validation(_)
        | OpsError::InvalidStateTransition { .. } => StatusCode::BAD_REQUEST,
        OpsError::Internal(_) | OpsError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(json!({ "error": err.to_string() }))).into_response()
}

/// System health; 503 once anything is unhealthy or critical
async fn health_handler(State(state): State<Arc<DashboardState>>) -> impl IntoResponse {
    let health = state.orchestrator_state.borrow().system_health.clone();
    let status_code = match health.overall {
        HealthBucket::Healthy | HealthBucket::Degraded | HealthBucket::Unknown => StatusCode::OK,
        HealthBucket::Unhealthy | HealthBucket::Critical => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status_code, Json(health))
}

async fn liveness_handler() -> impl IntoResponse {
    StatusCode::OK
}

/// Ready while the orchestrator is running its loops
async fn readiness_handler(State(state): State<Arc<DashboardState>>) -> impl IntoResponse {
    if state.orchestrator_state.borrow().running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn status_handler(State(state): State<Arc<DashboardState>>) -> impl IntoResponse {
    let snapshot = state.orchestrator_state.borrow().clone();
    Json(json!({
        "running": snapshot.running,
        "started_at": snapshot.started_at,
        "last_cycle_at": snapshot.last_cycle_at,
        "system_health": snapshot.system_health,
        "components": snapshot.components,
    }))
}

async fn events_handler(State(state): State<Arc<DashboardState>>) -> impl IntoResponse {
    let events = state.orchestrator_state.borrow().events.to_vec();
    Json(events)
}

async fn component_handler(
    State(state): State<Arc<DashboardState>>,
    Path(id): Path<String>,
) -> Response {
    let component = state.orchestrator_state.borrow().component(&id).cloned();
    match component {
        Some(component) => Json(component).into_response(),
        None => error_response(OpsError::UnknownComponent(id)),
    }
}

/// Accept a start/stop/restart and run it in the background. The dashboard
/// itself is a component, so the request must not wait on the orchestrator.
async fn component_action_handler(
    State(state): State<Arc<DashboardState>>,
    Path((id, action)): Path<(String, String)>,
) -> Response {
    if state.orchestrator_state.borrow().component(&id).is_none() {
        return error_response(OpsError::UnknownComponent(id));
    }
    if !matches!(action.as_str(), "start" | "stop" | "restart") {
        return error_response(OpsError::Validation(format!("unknown action {}", action)));
    }

    let orchestrator = state.orchestrator.clone();
    let target = id.clone();
    let requested = action.clone();
    tokio::spawn(async move {
        let result = match requested.as_str() {
            "start" => orchestrator.start(&target).await,
            "stop" => orchestrator.stop(&target).await,
            _ => orchestrator.restart(&target).await,
        };
        match result {
            Ok(()) => info!("Dashboard {} of {} completed", requested, target),
            Err(e) => warn!("Dashboard {} of {} failed: {}", requested, target, e),
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(json!({ "component": id, "action": action, "accepted": true })),
    )
        .into_response()
}

async fn alerts_handler(State(state): State<Arc<DashboardState>>) -> impl IntoResponse {
    let snapshot = state.alert_state.borrow().clone();
    Json(json!({
        "active": snapshot.active.to_vec(),
        "history": snapshot.history.to_vec(),
        "stats": snapshot.stats,
        "last_evaluation": snapshot.last_evaluation,
        "last_cleanup": snapshot.last_cleanup,
    }))
}

#[derive(Debug, Default, Deserialize)]
struct OperatorBody {
    by: Option<String>,
}

fn operator(body: Option<Json<OperatorBody>>) -> String {
    body.and_then(|Json(b)| b.by)
        .unwrap_or_else(|| "dashboard".to_string())
}

async fn acknowledge_handler(
    State(state): State<Arc<DashboardState>>,
    Path(id): Path<String>,
    body: Option<Json<OperatorBody>>,
) -> Response {
    match state.alerts.acknowledge(&id, &operator(body)).await {
        Ok(alert) => Json(alert).into_response(),
        Err(e) => error_response(e),
    }
}

async fn resolve_handler(
    State(state): State<Arc<DashboardState>>,
    Path(id): Path<String>,
    body: Option<Json<OperatorBody>>,
) -> Response {
    match state.alerts.resolve(&id, &operator(body)).await {
        Ok(alert) => Json(alert).into_response(),
        Err(e) => error_response(e),
    }
}

async fn config_handler(
    State(state): State<Arc<DashboardState>>,
    Json(patch): Json<serde_json::Value>,
) -> Response {
    match state.orchestrator.update_config(patch).await {
        Ok(config) => Json(config).into_response(),
        Err(e) => error_response(e),
    }
}

async fn alert_config_handler(
    State(state): State<Arc<DashboardState>>,
    Json(patch): Json<serde_json::Value>,
) -> Response {
    match state.alerts.update_config(patch).await {
        Ok(config) => Json(config).into_response(),
        Err(e) => error_response(e),
    }
}

/// Prometheus text exposition
async fn metrics_handler(State(state): State<Arc<DashboardState>>) -> impl IntoResponse {
    let orchestrator = state.orchestrator_state.borrow().clone();
    let alerts = state.alert_state.borrow().clone();
    let health = &orchestrator.system_health;
    let uptime = (Utc::now() - state.started_at).num_seconds().max(0);

    let up = match health.overall {
        HealthBucket::Healthy => 1,
        HealthBucket::Degraded | HealthBucket::Unknown => 0,
        HealthBucket::Unhealthy | HealthBucket::Critical => -1,
    };

    let mut body = format!(
        r#"# HELP patchops_up Health status (1=healthy, 0=degraded, -1=unhealthy or critical)
# TYPE patchops_up gauge
patchops_up {}

# HELP patchops_uptime_seconds Dashboard uptime in seconds
# TYPE patchops_uptime_seconds counter
patchops_uptime_seconds {}

# HELP patchops_health_score Share of enabled components that are healthy
# TYPE patchops_health_score gauge
patchops_health_score {}

# HELP patchops_alerts_active Alerts currently open
# TYPE patchops_alerts_active gauge
patchops_alerts_active {}

# HELP patchops_alerts_total Alerts fired
# TYPE patchops_alerts_total counter
patchops_alerts_total {}

# HELP patchops_alert_actions_failed_total Alert actions that failed
# TYPE patchops_alert_actions_failed_total counter
patchops_alert_actions_failed_total {}

# HELP patchops_component_restarts_total Restarts per component
# TYPE patchops_component_restarts_total counter
"#,
        up,
        uptime,
        health.score,
        alerts.active.len(),
        alerts.stats.total_alerts,
        alerts.stats.actions_failed,
    );
    for component in &orchestrator.components {
        body.push_str(&format!(
            "patchops_component_restarts_total{{component=\"{}\"}} {}\n",
            component.id, component.restart_count
        ));
    }
    for name in state.metrics.metric_names().await {
        if let Some(sample) = state.metrics.latest(&name).await {
            body.push_str(&format!(
                "patchops_host_metric{{name=\"{}\"}} {}\n",
                name, sample.value
            ));
        }
    }

    (
        StatusCode::OK,
        [(
            axum::http::header::CONTENT_TYPE,
            "text/plain; charset=utf-8",
        )],
        body,
    )
}

/// Serves [`router`] as a supervised component
pub struct DashboardAdapter {
    bind: String,
    state: Arc<DashboardState>,
    client: reqwest::Client,
    local_addr: Option<SocketAddr>,
    task: Option<JoinHandle<()>>,
    shutdown: Option<ShutdownHandle>,
}

impl DashboardAdapter {
    pub fn new(bind: &str, state: DashboardState) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            bind: bind.to_string(),
            state: Arc::new(state),
            client,
            local_addr: None,
            task: None,
            shutdown: None,
        }
    }

    /// Address actually bound, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn running(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }
}

#[async_trait]
impl ComponentAdapter for DashboardAdapter {
    async fn start(&mut self) -> Result<bool> {
        if self.running() {
            return Ok(true);
        }

        let listener = tokio::net::TcpListener::bind(&self.bind).await?;
        let addr = listener.local_addr()?;
        let app = router(self.state.clone());
        let shutdown = ShutdownHandle::new();
        let mut token = shutdown.token();

        let task = tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    token.wait().await;
                })
                .await;
            if let Err(e) = served {
                error!("Dashboard server error: {}", e);
            }
        });

        info!("Status dashboard listening on {}", addr);
        self.local_addr = Some(addr);
        self.task = Some(task);
        self.shutdown = Some(shutdown);
        Ok(true)
    }

    async fn stop(&mut self) -> Result<bool> {
        if let Some(shutdown) = self.shutdown.take() {
            shutdown.trigger(ShutdownReason::Requested);
        }
        self.local_addr = None;
        let Some(mut task) = self.task.take() else {
            return Ok(true);
        };
        match tokio::time::timeout(STOP_TIMEOUT, &mut task).await {
            Ok(_) => Ok(true),
            Err(_) => {
                warn!("Dashboard did not drain in {:?}, aborting", STOP_TIMEOUT);
                task.abort();
                Ok(false)
            }
        }
    }

    async fn is_healthy(&mut self) -> bool {
        if !self.running() {
            return false;
        }
        let Some(addr) = self.local_addr else {
            return false;
        };
        match self.client.get(format!("http://{}/healthz", addr)).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerting::{command_channel, AlertCommand};
    use crate::config::OrchestratorConfig;
    use crate::coordination::{Orchestrator, ShutdownHandle};
    use crate::domain::{ComponentStatus, SystemHealth, METRICS_AGGREGATOR};
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn dashboard_state(
        orchestrator: &Orchestrator,
        snapshot: OrchestratorState,
        alerts: AlertEngineHandle,
    ) -> (DashboardState, watch::Sender<OrchestratorState>) {
        let (tx, rx) = watch::channel(snapshot);
        let (_alert_tx, alert_rx) = watch::channel(AlertEngineState::default());
        let state = DashboardState {
            started_at: Utc::now(),
            orchestrator: orchestrator.handle(),
            orchestrator_state: rx,
            alerts,
            alert_state: alert_rx,
            metrics: Arc::new(InMemoryMetricStore::with_defaults()),
        };
        (state, tx)
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health_reflects_system_health() {
        let orchestrator = Orchestrator::new(OrchestratorConfig::default());
        let (alerts, _inbox) = command_channel(4);
        let (state, tx) = dashboard_state(&orchestrator, OrchestratorState::default(), alerts);
        let app = router(Arc::new(state));

        let response = app
            .clone()
            .oneshot(Request::get("/healthz").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let mut critical = OrchestratorState::default();
        critical.system_health =
            SystemHealth::from_buckets(&[HealthBucket::Critical], 0, 1, Utc::now());
        tx.send_replace(critical);

        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = body_json(response).await;
        assert_eq!(body["overall"], "critical");
    }

    #[tokio::test]
    async fn test_component_lookup_and_unknown_action() {
        let orchestrator = Orchestrator::new(OrchestratorConfig::default());
        let (alerts, _inbox) = command_channel(4);
        let (state, _tx) = dashboard_state(&orchestrator, OrchestratorState::default(), alerts);
        let app = router(Arc::new(state));

        let response = app
            .clone()
            .oneshot(
                Request::get(format!("/components/{}", METRICS_AGGREGATOR))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "stopped");

        let response = app
            .clone()
            .oneshot(Request::get("/components/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(
                Request::post(format!("/components/{}/explode", METRICS_AGGREGATOR))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_acknowledge_forwards_to_engine() {
        let orchestrator = Orchestrator::new(OrchestratorConfig::default());
        let (alerts, inbox) = command_channel(4);
        let (state, _tx) = dashboard_state(&orchestrator, OrchestratorState::default(), alerts);
        let app = router(Arc::new(state));

        tokio::spawn(async move {
            let mut rx = inbox.lock().await;
            while let Some(command) = rx.recv().await {
                if let AlertCommand::Acknowledge { alert_id, by, reply } = command {
                    assert_eq!(by, "oncall");
                    let _ = reply.send(Err(OpsError::UnknownAlert(alert_id)));
                }
            }
        });

        let response = app
            .oneshot(
                Request::post("/alerts/a-1/acknowledge")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"by":"oncall"}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_alert_config_patch_goes_through_engine() {
        let orchestrator = Orchestrator::new(OrchestratorConfig::default());
        let (alerts, inbox) = command_channel(4);
        let (state, _tx) = dashboard_state(&orchestrator, OrchestratorState::default(), alerts);
        let app = router(Arc::new(state));

        tokio::spawn(async move {
            let mut rx = inbox.lock().await;
            while let Some(command) = rx.recv().await {
                if let AlertCommand::UpdateConfig { patch, reply } = command {
                    let result = match patch["evaluation_interval_secs"].as_u64() {
                        Some(0) => Err(OpsError::InvalidConfig(
                            "evaluation_interval_secs must be positive".to_string(),
                        )),
                        Some(secs) => Ok(crate::config::AlertEngineConfig {
                            evaluation_interval_secs: secs,
                            ..Default::default()
                        }),
                        None => Ok(Default::default()),
                    };
                    let _ = reply.send(result);
                }
            }
        });

        let response = app
            .clone()
            .oneshot(
                Request::post("/alerts/config")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"evaluation_interval_secs": 5}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["evaluation_interval_secs"], 5);

        let response = app
            .oneshot(
                Request::post("/alerts/config")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"evaluation_interval_secs": 0}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_config_patch_goes_through_orchestrator() {
        let mut config = OrchestratorConfig::default();
        config.start_delay_ms = 0;
        config.stop_delay_ms = 0;
        for settings in config.components.values_mut() {
            settings.enabled = false;
        }
        let orchestrator = Orchestrator::new(config);
        let (alerts, _inbox) = command_channel(4);
        let (state, _tx) = dashboard_state(&orchestrator, OrchestratorState::default(), alerts);
        let app = router(Arc::new(state));

        let shutdown = ShutdownHandle::new();
        let run = tokio::spawn(orchestrator.run(shutdown.token()));

        let response = app
            .clone()
            .oneshot(
                Request::post("/config")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"health_check_interval_secs": 15}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["health_check_interval_secs"], 15);

        let response = app
            .oneshot(
                Request::post("/config")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"max_events": 0}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        shutdown.trigger(ShutdownReason::Requested);
        let final_state = run.await.unwrap().unwrap();
        assert!(final_state
            .components
            .iter()
            .all(|c| c.status == ComponentStatus::Stopped));
    }

    #[tokio::test]
    async fn test_adapter_serves_and_stops() {
        let orchestrator = Orchestrator::new(OrchestratorConfig::default());
        let (alerts, _inbox) = command_channel(4);
        let (state, _tx) = dashboard_state(&orchestrator, OrchestratorState::default(), alerts);
        let mut adapter = DashboardAdapter::new("127.0.0.1:0", state);

        assert!(adapter.start().await.unwrap());
        assert!(adapter.local_addr().is_some());
        assert!(adapter.is_healthy().await);

        assert!(adapter.stop().await.unwrap());
        assert!(!adapter.is_healthy().await);
    }
}
