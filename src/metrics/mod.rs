//! Metric substrate shared by the aggregator and the alert engine

pub mod sampler;
pub mod store;

pub use sampler::{HostReading, SystemSampler, CPU_USAGE, LOAD_AVERAGE, MEMORY_USAGE};
pub use store::{InMemoryMetricStore, MetricSample, MetricStore, RetentionConfig};
