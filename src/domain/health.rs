use super::component::{Component, HealthBucket};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// System-wide health derived from the component table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemHealth {
    pub overall: HealthBucket,
    pub score: u8,
    pub total: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub unhealthy: usize,
    pub critical: usize,
    pub unknown: usize,
    pub dependencies_resolved: usize,
    pub dependencies_failed: usize,
    pub computed_at: DateTime<Utc>,
}

impl Default for SystemHealth {
    fn default() -> Self {
        Self::from_buckets(&[], 0, 0, Utc::now())
    }
}

impl SystemHealth {
    /// Compute health over the enabled components
    pub fn compute(components: &[Component], now: DateTime<Utc>) -> Self {
        let enabled: Vec<&Component> = components.iter().filter(|c| c.enabled).collect();
        let buckets: Vec<HealthBucket> = enabled.iter().map(|c| c.health).collect();

        let mut resolved = 0;
        let mut failed = 0;
        for component in &enabled {
            for dep in &component.dependencies {
                let ok = components
                    .iter()
                    .find(|c| &c.id == dep)
                    .map(|c| c.is_operational())
                    .unwrap_or(false);
                if ok {
                    resolved += 1;
                } else {
                    failed += 1;
                }
            }
        }

        Self::from_buckets(&buckets, resolved, failed, now)
    }

    pub fn from_buckets(
        buckets: &[HealthBucket],
        dependencies_resolved: usize,
        dependencies_failed: usize,
        now: DateTime<Utc>,
    ) -> Self {
        let count = |b: HealthBucket| buckets.iter().filter(|x| **x == b).count();
        let healthy = count(HealthBucket::Healthy);
        let degraded = count(HealthBucket::Degraded);
        let unhealthy = count(HealthBucket::Unhealthy);
        let critical = count(HealthBucket::Critical);
        let unknown = count(HealthBucket::Unknown);
        let total = buckets.len();

        Self {
            overall: overall_bucket(buckets),
            score: health_score(healthy, total),
            total,
            healthy,
            degraded,
            unhealthy,
            critical,
            unknown,
            dependencies_resolved,
            dependencies_failed,
            computed_at: now,
        }
    }
}

/// Worst bucket wins; all-healthy is healthy; anything else is unknown
pub fn overall_bucket(buckets: &[HealthBucket]) -> HealthBucket {
    let any = |b: HealthBucket| buckets.iter().any(|x| *x == b);

    if any(HealthBucket::Critical) {
        HealthBucket::Critical
    } else if any(HealthBucket::Unhealthy) {
        HealthBucket::Unhealthy
    } else if any(HealthBucket::Degraded) {
        HealthBucket::Degraded
    } else if !buckets.is_empty() && buckets.iter().all(|b| *b == HealthBucket::Healthy) {
        HealthBucket::Healthy
    } else {
        HealthBucket::Unknown
    }
}

/// round(100 * healthy / total), 0 for an empty table
pub fn health_score(healthy: usize, total: usize) -> u8 {
    if total == 0 {
        return 0;
    }
    ((healthy as f64 / total as f64) * 100.0).round() as u8
}
