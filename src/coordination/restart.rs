//! Restart Policy
//!
//! Backoff-with-cooldown accounting for component restarts. Each component
//! gets at most `max_restarts` attempts inside a sliding window; the n-th
//! attempt in the window waits `min(base * 2^(n-1), max)` before it runs.

use crate::config::RestartConfig;
use crate::domain::span;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{info, warn};

/// Outcome of asking the policy for a restart
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Go ahead after waiting `backoff`
    Proceed { attempt: u32, backoff: Duration },
    /// Window budget spent
    Exhausted { attempts: u32 },
}

/// Per-component restart history
#[derive(Debug, Clone, Default)]
pub struct RestartPolicy {
    config: RestartConfig,
    attempts: HashMap<String, Vec<DateTime<Utc>>>,
}

impl RestartPolicy {
    pub fn new(config: RestartConfig) -> Self {
        Self {
            config,
            attempts: HashMap::new(),
        }
    }

    fn window_start(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        span::before(now, self.config.window_secs).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Attempts recorded for `id` inside the current window
    pub fn attempts_in_window(&self, id: &str, now: DateTime<Utc>) -> usize {
        let window_start = self.window_start(now);
        self.attempts
            .get(id)
            .map(|ts| ts.iter().filter(|t| **t > window_start).count())
            .unwrap_or(0)
    }

    /// Wait before the given 1-based attempt
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let ms = self
            .config
            .base_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.config.max_backoff_ms);
        Duration::from_millis(ms)
    }

    /// Record an attempt for `id` if the window still has budget
    pub fn decide_at(&mut self, id: &str, max_restarts: u32, now: DateTime<Utc>) -> RestartDecision {
        let window_start = self.window_start(now);
        let timestamps = self.attempts.entry(id.to_string()).or_default();
        timestamps.retain(|t| *t > window_start);

        let recent = timestamps.len() as u32;
        if recent >= max_restarts {
            warn!(
                "Component {} exhausted restart attempts ({} in {}s)",
                id, recent, self.config.window_secs
            );
            return RestartDecision::Exhausted { attempts: recent };
        }

        timestamps.push(now);
        let attempt = recent + 1;
        let backoff = self.backoff_for(attempt);
        info!(
            "Restart attempt #{} for component {} (backoff {:?})",
            attempt, id, backoff
        );
        RestartDecision::Proceed { attempt, backoff }
    }

    /// Swap in new settings, keeping recorded attempts
    pub fn set_config(&mut self, config: RestartConfig) {
        self.config = config;
    }
}
