//! In-process metrics aggregator: samples the host on a fixed interval into
//! the shared metric store.

use super::ComponentAdapter;
use crate::config::AggregatorSettings;
use crate::coordination::shutdown::{ShutdownHandle, ShutdownReason};
use crate::domain::span;
use crate::error::Result;
use crate::metrics::{InMemoryMetricStore, SystemSampler};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

pub struct AggregatorAdapter {
    store: Arc<InMemoryMetricStore>,
    settings: AggregatorSettings,
    /// Unix seconds of the last completed sample
    last_sample: Arc<AtomicI64>,
    task: Option<JoinHandle<()>>,
    shutdown: Option<ShutdownHandle>,
}

impl AggregatorAdapter {
    pub fn new(store: Arc<InMemoryMetricStore>, settings: AggregatorSettings) -> Self {
        Self {
            store,
            settings,
            last_sample: Arc::new(AtomicI64::new(0)),
            task: None,
            shutdown: None,
        }
    }

    fn running(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }
}

#[async_trait]
impl ComponentAdapter for AggregatorAdapter {
    async fn start(&mut self) -> Result<bool> {
        if self.running() {
            return Ok(true);
        }

        let shutdown = ShutdownHandle::new();
        let mut token = shutdown.token();
        let sampler = SystemSampler::new(self.store.clone());
        let last_sample = self.last_sample.clone();
        let period = Duration::from_secs(self.settings.sample_interval_secs.max(1));

        // Counts as fresh until the first sample lands
        last_sample.store(Utc::now().timestamp(), Ordering::SeqCst);

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.wait() => break,
                    _ = interval.tick() => {
                        let now = Utc::now();
                        let reading = sampler.sample(now).await;
                        debug!(?reading, "host sample");
                        last_sample.store(now.timestamp(), Ordering::SeqCst);
                    }
                }
            }
            debug!("Aggregator sampling loop stopped");
        });

        info!(
            "Aggregator sampling every {}s",
            self.settings.sample_interval_secs
        );
        self.task = Some(task);
        self.shutdown = Some(shutdown);
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
            Ok(_) => Ok(true),
            Err(_) => {
                warn!("Aggregator did not stop in {:?}, aborting", STOP_TIMEOUT);
                task.abort();
                Ok(false)
            }
        }
    }

    async fn is_healthy(&mut self) -> bool {
        if !self.running() {
            return false;
        }
        let age = Utc::now().timestamp() - self.last_sample.load(Ordering::SeqCst);
        age <= span::secs_i64(self.settings.stale_after_secs)
    }
}
