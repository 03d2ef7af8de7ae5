pub mod adapters;
pub mod alerting;
pub mod cli;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod persistence;

pub use adapters::{AdapterContext, AdapterRegistry, ComponentAdapter};
pub use alerting::{AlertEngine, AlertEngineHandle, AlertEngineState, NotificationTransport};
pub use config::{AlertEngineConfig, AppConfig, ConfigStore, OrchestratorConfig};
pub use coordination::{
    Orchestrator, OrchestratorHandle, OrchestratorState, ShutdownHandle, ShutdownSignal,
};
pub use error::{OpsError, Result};
pub use metrics::{InMemoryMetricStore, MetricStore};
