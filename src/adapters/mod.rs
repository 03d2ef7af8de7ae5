//! Component adapters
//!
//! One adapter per component kind, selected at compile time by
//! [`factory::build_adapter`]. The orchestrator owns the live instances in an
//! [`AdapterRegistry`] keyed by component id and drives them only through
//! [`ComponentAdapter`].

pub mod aggregator;
pub mod alert_engine;
pub mod dashboard;
pub mod factory;
pub mod process;

use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;

pub use aggregator::AggregatorAdapter;
pub use alert_engine::{AlertEngineAdapter, AlertRuntime};
pub use dashboard::DashboardAdapter;
pub use factory::{build_adapter, AdapterContext};
pub use process::ProcessAdapter;

/// Start/stop/health contract every supervised component implements
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ComponentAdapter: Send + Sync {
    /// Bring the component up; `Ok(true)` when it came up healthy
    async fn start(&mut self) -> Result<bool>;

    /// Take the component down; `Ok(true)` when it stopped cleanly
    async fn stop(&mut self) -> Result<bool>;

    /// Self-reported health
    async fn is_healthy(&mut self) -> bool;
}

/// Live adapter instances by component id
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Box<dyn ComponentAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build one adapter per catalogue entry
    pub fn from_catalogue(ctx: &AdapterContext) -> Self {
        let mut registry = Self::new();
        for spec in crate::domain::CATALOGUE.iter() {
            registry.insert(spec.id, build_adapter(spec, ctx));
        }
        registry
    }

    pub fn insert(&mut self, id: &str, adapter: Box<dyn ComponentAdapter>) {
        self.adapters.insert(id.to_string(), adapter);
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Box<dyn ComponentAdapter>> {
        self.adapters.get_mut(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.adapters.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<&String> = self.adapters.keys().collect();
        ids.sort();
        f.debug_struct("AdapterRegistry").field("ids", &ids).finish()
    }
}
