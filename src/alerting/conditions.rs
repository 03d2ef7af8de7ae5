//! Rule eligibility and condition evaluation
//!
//! Conditions fail closed: a missing metric, an empty window or a store
//! error all count as "not met".

use crate::domain::{span, AlertCondition, AlertRule, Aggregation, Operator};
use crate::metrics::MetricStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, warn};

/// A condition that held, with the value it was judged on
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConditionMatch {
    pub metric: String,
    pub operator: Operator,
    pub aggregation: Aggregation,
    pub threshold: f64,
    pub observed: f64,
    pub duration: u64,
    pub samples: usize,
}

/// Cooldown elapsed and trigger budget left
pub fn is_eligible_at(rule: &AlertRule, now: DateTime<Utc>) -> bool {
    if rule.trigger_count >= rule.max_triggers {
        return false;
    }
    match rule.last_triggered {
        Some(last) => {
            let elapsed = now.signed_duration_since(last).num_seconds();
            elapsed >= span::secs_i64(rule.cooldown_period)
        }
        None => true,
    }
}

/// Evaluate one condition against the trailing window ending at `now`
pub async fn evaluate_condition(
    store: &dyn MetricStore,
    condition: &AlertCondition,
    now: DateTime<Utc>,
) -> Option<ConditionMatch> {
    let samples = match store.samples(&condition.metric, condition.duration, now).await {
        Ok(samples) => samples,
        Err(e) => {
            warn!("Metric read for {} failed: {}", condition.metric, e);
            return None;
        }
    };

    let values: Vec<f64> = samples.iter().map(|s| s.value).collect();
    let observed = condition.aggregation.reduce(&values)?;
    if !observed.is_finite() {
        return None;
    }

    if condition.operator.compare(observed, condition.value) {
        Some(ConditionMatch {
            metric: condition.metric.clone(),
            operator: condition.operator,
            aggregation: condition.aggregation,
            threshold: condition.value,
            observed,
            duration: condition.duration,
            samples: values.len(),
        })
    } else {
        None
    }
}

/// All conditions of an eligible rule; Some only when every one holds
pub async fn evaluate_rule(
    store: &dyn MetricStore,
    rule: &AlertRule,
    now: DateTime<Utc>,
) -> Option<Vec<ConditionMatch>> {
    if !rule.enabled || rule.conditions.is_empty() || !is_eligible_at(rule, now) {
        return None;
    }

    let mut matches = Vec::with_capacity(rule.conditions.len());
    for condition in &rule.conditions {
        match evaluate_condition(store, condition, now).await {
            Some(m) => matches.push(m),
            None => {
                debug!("Rule {} condition on {} not met", rule.id, condition.metric);
                return None;
            }
        }
    }
    Some(matches)
}
