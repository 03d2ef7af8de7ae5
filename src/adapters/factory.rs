//! Adapter factory
//!
//! Maps a catalogue entry to its concrete adapter. In-process kinds get the
//! shared runtime pieces; everything else is driven as an external process.

use super::{
    AggregatorAdapter, AlertEngineAdapter, AlertRuntime, ComponentAdapter, DashboardAdapter,
    ProcessAdapter,
};
use super::dashboard::DashboardState;
use crate::config::OrchestratorConfig;
use crate::coordination::{OrchestratorHandle, OrchestratorState};
use crate::domain::{ComponentKind, ComponentSpec};
use crate::metrics::InMemoryMetricStore;
use chrono::Utc;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Everything an adapter may need from the rest of the process
#[derive(Clone)]
pub struct AdapterContext {
    pub config: OrchestratorConfig,
    pub metrics: Arc<InMemoryMetricStore>,
    pub orchestrator: OrchestratorHandle,
    pub orchestrator_state: watch::Receiver<OrchestratorState>,
    pub alerts: AlertRuntime,
}

/// Create the adapter for a component
pub fn build_adapter(spec: &ComponentSpec, ctx: &AdapterContext) -> Box<dyn ComponentAdapter> {
    debug!("Building {} adapter for {}", spec.kind, spec.id);
    match spec.kind {
        ComponentKind::Aggregator => Box::new(AggregatorAdapter::new(
            ctx.metrics.clone(),
            ctx.config.aggregator.clone(),
        )),
        ComponentKind::Dashboard => Box::new(DashboardAdapter::new(
            &ctx.config.dashboard.bind,
            DashboardState {
                started_at: Utc::now(),
                orchestrator: ctx.orchestrator.clone(),
                orchestrator_state: ctx.orchestrator_state.clone(),
                alerts: ctx.alerts.handle.clone(),
                alert_state: ctx.alerts.subscribe(),
                metrics: ctx.metrics.clone(),
            },
        )),
        ComponentKind::AlertEngine => Box::new(AlertEngineAdapter::new(
            ctx.alerts.clone(),
            ctx.metrics.clone(),
        )),
        ComponentKind::Relay
        | ComponentKind::Heartbeat
        | ComponentKind::LoopAuditor
        | ComponentKind::Snapshot => Box::new(ProcessAdapter::new(
            spec.id,
            ctx.config.component(spec.id, spec.kind),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::AdapterRegistry;
    use crate::config::AlertEngineConfig;
    use crate::coordination::Orchestrator;
    use crate::domain::{CATALOGUE, METRICS_RELAY};

    #[tokio::test]
    async fn test_registry_covers_catalogue() {
        let orchestrator = Orchestrator::new(OrchestratorConfig::default());
        let ctx = AdapterContext {
            config: OrchestratorConfig::default(),
            metrics: Arc::new(InMemoryMetricStore::with_defaults()),
            orchestrator: orchestrator.handle(),
            orchestrator_state: orchestrator.subscribe(),
            alerts: AlertRuntime::new(AlertEngineConfig::default()),
        };

        let mut registry = AdapterRegistry::from_catalogue(&ctx);
        assert_eq!(registry.len(), CATALOGUE.len());
        for spec in CATALOGUE.iter() {
            assert!(registry.contains(spec.id));
        }

        // Unconfigured external components refuse to start
        let relay = registry.get_mut(METRICS_RELAY).unwrap();
        assert!(relay.start().await.is_err());
    }
}
