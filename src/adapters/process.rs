//! Adapter for components that run outside this process
//!
//! With a `command` the adapter spawns and owns the child; with a
//! `health_url` it probes the component over HTTP. A component with only a
//! `health_url` is managed elsewhere and merely watched.

use super::ComponentAdapter;
use crate::config::ComponentSettings;
use crate::error::{OpsError, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const STARTUP_PROBES: u32 = 5;
const STARTUP_PROBE_INTERVAL: Duration = Duration::from_secs(1);
const STOP_GRACE: Duration = Duration::from_secs(10);

pub struct ProcessAdapter {
    id: String,
    settings: ComponentSettings,
    client: reqwest::Client,
    child: Option<Child>,
}

impl ProcessAdapter {
    pub fn new(id: &str, settings: ComponentSettings) -> Self {
        let client = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            id: id.to_string(),
            settings,
            client,
            child: None,
        }
    }

    fn spawn(&self, argv: &[String]) -> Result<Child> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| OpsError::component(&self.id, "empty command"))?;

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.settings.working_dir {
            command.current_dir(dir);
        }

        let child = command
            .spawn()
            .map_err(|e| OpsError::component(&self.id, format!("spawn {}: {}", program, e)))?;
        info!(
            "Spawned {} (pid {})",
            self.id,
            child.id().map(|p| p.to_string()).unwrap_or_else(|| "-".into())
        );
        Ok(child)
    }

    async fn probe(&self, url: &str) -> bool {
        match self.client.get(url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Health probe for {} failed: {}", self.id, e);
                false
            }
        }
    }

    /// False once the owned child has exited
    fn child_alive(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                warn!("{} exited with {}", self.id, status);
                self.child = None;
                false
            }
            Err(e) => {
                warn!("Cannot poll {}: {}", self.id, e);
                false
            }
        }
    }
}

#[async_trait]
impl ComponentAdapter for ProcessAdapter {
    async fn start(&mut self) -> Result<bool> {
        let command = self.settings.command.clone();
        let health_url = self.settings.health_url.clone();

        if command.is_none() && health_url.is_none() {
            return Err(OpsError::component(
                &self.id,
                "neither command nor health_url configured",
            ));
        }

        if let Some(argv) = command {
            if !self.child_alive() {
                self.child = Some(self.spawn(&argv)?);
            }
        }

        match health_url {
            Some(url) => {
                for attempt in 1..=STARTUP_PROBES {
                    if self.probe(&url).await {
                        return Ok(true);
                    }
                    if self.settings.command.is_some() && !self.child_alive() {
                        return Ok(false);
                    }
                    debug!("{} not answering yet (probe {})", self.id, attempt);
                    tokio::time::sleep(STARTUP_PROBE_INTERVAL).await;
                }
                Ok(false)
            }
            None => Ok(self.child_alive()),
        }
    }

    async fn stop(&mut self) -> Result<bool> {
        let Some(mut child) = self.child.take() else {
            return Ok(true);
        };

        if let Err(e) = child.start_kill() {
            // Already gone
            debug!("Kill {}: {}", self.id, e);
        }
        match tokio::time::timeout(STOP_GRACE, child.wait()).await {
            Ok(Ok(status)) => {
                info!("{} stopped ({})", self.id, status);
                Ok(true)
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Ok(false),
        }
    }

    async fn is_healthy(&mut self) -> bool {
        if self.settings.command.is_some() && !self.child_alive() {
            return false;
        }
        match self.settings.health_url.clone() {
            Some(url) => self.probe(&url).await,
            None => self.child.is_some(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(command: Option<Vec<&str>>) -> ComponentSettings {
        ComponentSettings {
            enabled: true,
            auto_restart: true,
            max_restarts: 3,
            command: command.map(|argv| argv.into_iter().map(String::from).collect()),
            health_url: None,
            working_dir: None,
        }
    }

    #[tokio::test]
    async fn test_unconfigured_component_fails_to_start() {
        let mut adapter = ProcessAdapter::new("metrics-relay", settings(None));
        assert!(adapter.start().await.is_err());
        assert!(!adapter.is_healthy().await);
        assert!(adapter.stop().await.unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawned_child_lifecycle() {
        let mut adapter = ProcessAdapter::new("snapshot-daemon", settings(Some(vec!["sleep", "30"])));
        assert!(adapter.start().await.unwrap());
        assert!(adapter.is_healthy().await);

        assert!(adapter.stop().await.unwrap());
        assert!(!adapter.is_healthy().await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exited_child_is_unhealthy() {
        let mut adapter = ProcessAdapter::new("loop-auditor", settings(Some(vec!["true"])));
        adapter.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!adapter.is_healthy().await);
    }

    #[tokio::test]
    async fn test_missing_binary_is_an_error() {
        let mut adapter = ProcessAdapter::new(
            "metrics-relay",
            settings(Some(vec!["/nonexistent/patchops-relay"])),
        );
        let err = adapter.start().await.unwrap_err();
        assert!(err.to_string().contains("spawn"));
    }
}
