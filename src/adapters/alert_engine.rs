//! Hosts the alert engine loop as a supervised component.
//!
//! The command inbox, audit log and published state live in [`AlertRuntime`]
//! and survive restarts; each start builds a fresh engine from the latest
//! configuration and the last persisted snapshot.

use super::ComponentAdapter;
use crate::alerting::{
    command_channel, AlertEngine, AlertEngineHandle, AlertEngineState, AlertInbox, HttpTransport,
};
use crate::config::{AlertEngineConfig, ConfigStore};
use crate::coordination::shutdown::{ShutdownHandle, ShutdownReason};
use crate::domain::span;
use crate::error::Result;
use crate::metrics::InMemoryMetricStore;
use crate::persistence::{EventLog, StateFile};
use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Long-lived plumbing shared by successive engine runs
#[derive(Clone)]
pub struct AlertRuntime {
    pub config: AlertEngineConfig,
    /// Reloaded on every start when set
    pub config_path: Option<PathBuf>,
    pub state_path: Option<PathBuf>,
    pub audit: EventLog,
    pub handle: AlertEngineHandle,
    pub inbox: AlertInbox,
    pub published: Arc<watch::Sender<AlertEngineState>>,
}

impl AlertRuntime {
    pub fn new(config: AlertEngineConfig) -> Self {
        let (handle, inbox) = command_channel(32);
        let (published, _) = watch::channel(AlertEngineState::default());
        Self {
            config,
            config_path: None,
            state_path: None,
            audit: EventLog::disabled(),
            handle,
            inbox,
            published: Arc::new(published),
        }
    }

    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn with_state_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_path = Some(path.into());
        self
    }

    pub fn with_audit_log(mut self, audit: EventLog) -> Self {
        self.audit = audit;
        self
    }

    pub fn subscribe(&self) -> watch::Receiver<AlertEngineState> {
        self.published.subscribe()
    }

    /// Latest configuration, plus the store runtime updates go through
    async fn current_config(&self) -> (AlertEngineConfig, Option<ConfigStore<AlertEngineConfig>>) {
        match &self.config_path {
            Some(path) => match ConfigStore::<AlertEngineConfig>::load(path).await {
                Ok(store) => (store.get().clone(), Some(store)),
                Err(e) => {
                    warn!("Reloading alert config failed, keeping previous: {}", e);
                    (self.config.clone(), None)
                }
            },
            None => (self.config.clone(), None),
        }
    }
}

pub struct AlertEngineAdapter {
    runtime: AlertRuntime,
    metrics: Arc<InMemoryMetricStore>,
    evaluation_interval_secs: u64,
    task: Option<JoinHandle<Result<()>>>,
    shutdown: Option<ShutdownHandle>,
}

impl AlertEngineAdapter {
    pub fn new(runtime: AlertRuntime, metrics: Arc<InMemoryMetricStore>) -> Self {
        let evaluation_interval_secs = runtime.config.evaluation_interval_secs;
        Self {
            runtime,
            metrics,
            evaluation_interval_secs,
            task: None,
            shutdown: None,
        }
    }

    fn running(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }
}

#[async_trait]
impl ComponentAdapter for AlertEngineAdapter {
    async fn start(&mut self) -> Result<bool> {
        if self.running() {
            return Ok(true);
        }

        let (config, store) = self.runtime.current_config().await;
        self.runtime.config = config.clone();
        self.evaluation_interval_secs = config.evaluation_interval_secs;

        let transport = HttpTransport::new(Duration::from_secs(config.delivery_timeout_secs))?;
        let mut engine = AlertEngine::new(config, self.metrics.clone(), Arc::new(transport))
            .with_audit_log(self.runtime.audit.clone())
            .with_publisher(self.runtime.published.clone());
        if let Some(store) = store {
            engine = engine.with_config_store(store);
        }
        if let Some(path) = &self.runtime.state_path {
            engine = engine.with_state_file(StateFile::new(path.clone()));
        }
        engine.restore().await;
        engine.persist().await;

        let shutdown = ShutdownHandle::new();
        let task = tokio::spawn(engine.run(self.runtime.inbox.clone(), shutdown.token()));
        self.task = Some(task);
        self.shutdown = Some(shutdown);
        info!("Alert engine task started");
        Ok(true)
    }

    async fn stop(&mut self) -> Result<bool> {
        if let Some(shutdown) = self.shutdown.take() {
            shutdown.trigger(ShutdownReason::Requested);
        }
        let Some(mut task) = self.task.take() else {
            return Ok(true);
        };
        match tokio::time::timeout(STOP_TIMEOUT, &mut task).await {
            Ok(Ok(Ok(()))) => Ok(true),
            Ok(Ok(Err(e))) => {
                error!("Alert engine exited with error: {}", e);
                Ok(false)
            }
            Ok(Err(e)) => {
                error!("Alert engine task panicked: {}", e);
                Ok(false)
            }
            Err(_) => {
                warn!("Alert engine did not stop in {:?}, aborting", STOP_TIMEOUT);
                task.abort();
                Ok(false)
            }
        }
    }

    /// Alive and evaluating on schedule
    async fn is_healthy(&mut self) -> bool {
        if !self.running() {
            return false;
        }
        let published = self.runtime.published.borrow();
        let interval = match published.evaluation_interval_secs {
            0 => self.evaluation_interval_secs,
            secs => secs,
        };
        let allowance = span::secs_i64(interval.saturating_mul(3));
        match published.last_evaluation {
            Some(at) => (Utc::now() - at).num_seconds() <= allowance,
            None => true,
        }
    }
}
