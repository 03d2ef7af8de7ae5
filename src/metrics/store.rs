//! Metric store shared by the aggregator (writer) and the alert engine (reader).

use crate::domain::span;
use crate::error::{OpsError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use tokio::sync::RwLock;
use tracing::debug;

/// One timestamped observation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Read contract consumed by the alert engine
#[async_trait]
pub trait MetricStore: Send + Sync {
    /// Samples for `metric` in the trailing `duration_secs` ending at `now`, oldest first.
    /// An empty list is a valid answer.
    async fn samples(
        &self,
        metric: &str,
        duration_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<Vec<MetricSample>>;
}

/// Retention limits for the in-memory store
#[derive(Debug, Clone)]
pub struct RetentionConfig {
    /// Samples older than this are dropped (default: 24h)
    pub max_age_secs: u64,
    /// Hard cap per metric (default: 10_000)
    pub max_samples_per_metric: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_age_secs: 86_400,
            max_samples_per_metric: 10_000,
        }
    }
}

/// Time-bounded in-memory metric series
pub struct InMemoryMetricStore {
    retention: RetentionConfig,
    series: RwLock<HashMap<String, VecDeque<MetricSample>>>,
}

impl InMemoryMetricStore {
    pub fn new(retention: RetentionConfig) -> Self {
        Self {
            retention,
            series: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(RetentionConfig::default())
    }

    /// Record a sample at the current time
    pub async fn record(&self, metric: &str, value: f64) {
        self.record_at(metric, value, Utc::now()).await;
    }

    /// Record a sample with an explicit timestamp
    pub async fn record_at(&self, metric: &str, value: f64, timestamp: DateTime<Utc>) {
        let mut series = self.series.write().await;
        let samples = series.entry(metric.to_string()).or_default();

        // Keep the series ordered even when producers are slightly out of order
        let pos = samples
            .iter()
            .rposition(|s| s.timestamp <= timestamp)
            .map(|p| p + 1)
            .unwrap_or(0);
        samples.insert(pos, MetricSample { timestamp, value });

        if let Some(cutoff) = span::before(timestamp, self.retention.max_age_secs) {
            while samples.front().map(|s| s.timestamp < cutoff).unwrap_or(false) {
                samples.pop_front();
            }
        }
        while samples.len() > self.retention.max_samples_per_metric {
            samples.pop_front();
        }
    }

    /// Names of every metric with at least one sample
    pub async fn metric_names(&self) -> Vec<String> {
        let series = self.series.read().await;
        let mut names: Vec<String> = series
            .iter()
            .filter(|(_, s)| !s.is_empty())
            .map(|(k, _)| k.clone())
            .collect();
        names.sort();
        names
    }

    /// Most recent sample for a metric
    pub async fn latest(&self, metric: &str) -> Option<MetricSample> {
        let series = self.series.read().await;
        series.get(metric).and_then(|s| s.back().copied())
    }

    pub async fn len(&self, metric: &str) -> usize {
        let series = self.series.read().await;
        series.get(metric).map(|s| s.len()).unwrap_or(0)
    }
}

#[async_trait]
impl MetricStore for InMemoryMetricStore {
    async fn samples(
        &self,
        metric: &str,
        duration_secs: u64,
        now: DateTime<Utc>,
    ) -> Result<Vec<MetricSample>> {
        let window_start = span::before(now, duration_secs).ok_or_else(|| {
            OpsError::Validation(format!("window of {}s is out of range", duration_secs))
        })?;
        let series = self.series.read().await;
        let samples: Vec<MetricSample> = series
            .get(metric)
            .map(|s| {
                s.iter()
                    .filter(|x| x.timestamp >= window_start && x.timestamp <= now)
                    .copied()
                    .collect()
            })
            .unwrap_or_default();
        debug!(metric, duration_secs, count = samples.len(), "metric window read");
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn test_window_read() {
        let store = InMemoryMetricStore::with_defaults();
        let now = Utc::now();
        for i in 0..10 {
            store
                .record_at("cpu_usage", i as f64, now - Duration::seconds(100 - i * 10))
                .await;
        }

        let window = store.samples("cpu_usage", 35, now).await.unwrap();
        let values: Vec<f64> = window.iter().map(|s| s.value).collect();
        assert_eq!(values, vec![7.0, 8.0, 9.0]);
    }

    #[tokio::test]
    async fn test_unknown_metric_is_empty() {
        let store = InMemoryMetricStore::with_defaults();
        let window = store.samples("nope", 300, Utc::now()).await.unwrap();
        assert!(window.is_empty());
    }

    #[tokio::test]
    async fn test_out_of_order_insert_stays_sorted() {
        let store = InMemoryMetricStore::with_defaults();
        let now = Utc::now();
        store.record_at("m", 2.0, now).await;
        store.record_at("m", 1.0, now - Duration::seconds(5)).await;

        let window = store.samples("m", 60, now).await.unwrap();
        assert_eq!(window[0].value, 1.0);
        assert_eq!(window[1].value, 2.0);
    }

    #[tokio::test]
    async fn test_out_of_range_window_is_an_error() {
        let store = InMemoryMetricStore::with_defaults();
        let now = Utc::now();
        store.record_at("m", 1.0, now).await;

        let err = store.samples("m", 10_000_000_000_000, now).await.unwrap_err();
        assert!(matches!(err, OpsError::Validation(_)));
        assert!(store.samples("m", u64::MAX, now).await.is_err());
    }

    #[tokio::test]
    async fn test_retention_limits() {
        let store = InMemoryMetricStore::new(RetentionConfig {
            max_age_secs: 60,
            max_samples_per_metric: 3,
        });
        let now = Utc::now();
        store.record_at("m", 0.0, now - Duration::seconds(120)).await;
        for i in 1..=4 {
            store.record_at("m", i as f64, now).await;
        }

        assert_eq!(store.len("m").await, 3);
        assert_eq!(store.latest("m").await.unwrap().value, 4.0);
        assert_eq!(store.metric_names().await, vec!["m".to_string()]);
    }
}
