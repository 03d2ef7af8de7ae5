//! Host sampler feeding the metric store.
//!
//! Reads `/proc/loadavg` and `/proc/meminfo`. Hosts without procfs simply
//! produce no samples.

use super::store::InMemoryMetricStore;
use chrono::{DateTime, Utc};
use tracing::{debug, warn};

pub const CPU_USAGE: &str = "cpu_usage";
pub const MEMORY_USAGE: &str = "memory_usage";
pub const LOAD_AVERAGE: &str = "load_average";

/// One round of host readings
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostReading {
    pub cpu_usage: Option<f64>,
    pub memory_usage: Option<f64>,
    pub load_average: Option<f64>,
}

/// First field of /proc/loadavg
pub fn parse_loadavg(raw: &str) -> Option<f64> {
    raw.split_whitespace().next()?.parse().ok()
}

/// Used-memory percentage from /proc/meminfo
pub fn parse_meminfo(raw: &str) -> Option<f64> {
    let field = |name: &str| -> Option<f64> {
        raw.lines()
            .find(|l| l.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse()
            .ok()
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:")?;
    if total <= 0.0 {
        return None;
    }
    Some(((total - available) / total * 100.0).clamp(0.0, 100.0))
}

/// Load average normalised by core count, as a percentage capped at 100
pub fn cpu_percent(load: f64, cores: usize) -> f64 {
    if cores == 0 {
        return 0.0;
    }
    (load / cores as f64 * 100.0).clamp(0.0, 100.0)
}

pub struct SystemSampler {
    store: std::sync::Arc<InMemoryMetricStore>,
    cores: usize,
}

impl SystemSampler {
    pub fn new(store: std::sync::Arc<InMemoryMetricStore>) -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self { store, cores }
    }

    /// Read the host counters
    pub async fn read(&self) -> HostReading {
        let load = match tokio::fs::read_to_string("/proc/loadavg").await {
            Ok(raw) => parse_loadavg(&raw),
            Err(e) => {
                debug!("loadavg unavailable: {}", e);
                None
            }
        };
        let memory = match tokio::fs::read_to_string("/proc/meminfo").await {
            Ok(raw) => parse_meminfo(&raw),
            Err(e) => {
                debug!("meminfo unavailable: {}", e);
                None
            }
        };

        HostReading {
            cpu_usage: load.map(|l| cpu_percent(l, self.cores)),
            memory_usage: memory,
            load_average: load,
        }
    }

    /// Sample once and record into the store
    pub async fn sample(&self, now: DateTime<Utc>) -> HostReading {
        let reading = self.read().await;
        if reading == HostReading::default() {
            warn!("host sampler produced no readings");
        }
        if let Some(v) = reading.cpu_usage {
            self.store.record_at(CPU_USAGE, v, now).await;
        }
        if let Some(v) = reading.memory_usage {
            self.store.record_at(MEMORY_USAGE, v, now).await;
        }
        if let Some(v) = reading.load_average {
            self.store.record_at(LOAD_AVERAGE, v, now).await;
        }
        reading
    }
}
