use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The seven supervised service types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComponentKind {
    Dashboard,
    Relay,
    Heartbeat,
    Aggregator,
    AlertEngine,
    LoopAuditor,
    Snapshot,
}

impl ComponentKind {
    pub const ALL: [ComponentKind; 7] = [
        ComponentKind::Dashboard,
        ComponentKind::Relay,
        ComponentKind::Heartbeat,
        ComponentKind::Aggregator,
        ComponentKind::AlertEngine,
        ComponentKind::LoopAuditor,
        ComponentKind::Snapshot,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::Dashboard => "dashboard",
            ComponentKind::Relay => "relay",
            ComponentKind::Heartbeat => "heartbeat",
            ComponentKind::Aggregator => "aggregator",
            ComponentKind::AlertEngine => "alert-engine",
            ComponentKind::LoopAuditor => "loop-auditor",
            ComponentKind::Snapshot => "snapshot",
        }
    }

    /// Kinds that run inside this process rather than as a child process
    pub fn is_in_process(&self) -> bool {
        matches!(
            self,
            ComponentKind::Dashboard | ComponentKind::Aggregator | ComponentKind::AlertEngine
        )
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ComponentKind {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        ComponentKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == raw.trim().to_ascii_lowercase())
            .ok_or_else(|| format!("unknown component type '{}'", raw))
    }
}

/// Lifecycle status of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Starting,
    Running,
    Stopped,
    Error,
    Unknown,
}

impl ComponentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentStatus::Starting => "starting",
            ComponentStatus::Running => "running",
            ComponentStatus::Stopped => "stopped",
            ComponentStatus::Error => "error",
            ComponentStatus::Unknown => "unknown",
        }
    }

    /// Check if this status can transition to another status
    pub fn can_transition_to(&self, target: ComponentStatus) -> bool {
        use ComponentStatus::*;

        match (self, target) {
            // Reloaded snapshots are advisory, anything goes
            (Unknown, _) => true,

            (Stopped, Starting) => true,
            (Stopped, Error) => true, // dependency gate fails before start

            (Starting, Running) => true,
            (Starting, Error) => true,
            (Starting, Stopped) => true,

            (Running, Stopped) => true,
            (Running, Error) => true,

            (Error, Starting) => true,
            (Error, Stopped) => true,

            // Same-state writes are no-ops
            (a, b) if *a == b => true,

            _ => false,
        }
    }
}

impl fmt::Display for ComponentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Health bucket reported for a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthBucket {
    Healthy,
    Degraded,
    Unhealthy,
    Critical,
    Unknown,
}

impl HealthBucket {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthBucket::Healthy => "healthy",
            HealthBucket::Degraded => "degraded",
            HealthBucket::Unhealthy => "unhealthy",
            HealthBucket::Critical => "critical",
            HealthBucket::Unknown => "unknown",
        }
    }
}

impl fmt::Display for HealthBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Static declaration of one supervised component
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComponentSpec {
    pub id: &'static str,
    pub name: &'static str,
    pub kind: ComponentKind,
    pub dependencies: &'static [&'static str],
}

pub const STATUS_DASHBOARD: &str = "status-dashboard";
pub const METRICS_RELAY: &str = "metrics-relay";
pub const HEARTBEAT_VISUALIZER: &str = "heartbeat-visualizer";
pub const METRICS_AGGREGATOR: &str = "metrics-aggregator";
pub const ALERT_ENGINE: &str = "alert-engine";
pub const LOOP_AUDITOR: &str = "loop-auditor";
pub const SNAPSHOT_DAEMON: &str = "snapshot-daemon";

/// Every component the orchestrator supervises
pub const CATALOGUE: [ComponentSpec; 7] = [
    ComponentSpec {
        id: METRICS_AGGREGATOR,
        name: "Metrics Aggregator",
        kind: ComponentKind::Aggregator,
        dependencies: &[],
    },
    ComponentSpec {
        id: STATUS_DASHBOARD,
        name: "Status Dashboard",
        kind: ComponentKind::Dashboard,
        dependencies: &[METRICS_AGGREGATOR],
    },
    ComponentSpec {
        id: METRICS_RELAY,
        name: "Metrics Relay",
        kind: ComponentKind::Relay,
        dependencies: &[METRICS_AGGREGATOR],
    },
    ComponentSpec {
        id: HEARTBEAT_VISUALIZER,
        name: "Heartbeat Visualizer",
        kind: ComponentKind::Heartbeat,
        dependencies: &[STATUS_DASHBOARD],
    },
    ComponentSpec {
        id: ALERT_ENGINE,
        name: "Alert Engine",
        kind: ComponentKind::AlertEngine,
        dependencies: &[METRICS_AGGREGATOR, STATUS_DASHBOARD],
    },
    ComponentSpec {
        id: LOOP_AUDITOR,
        name: "Loop Auditor",
        kind: ComponentKind::LoopAuditor,
        dependencies: &[METRICS_AGGREGATOR],
    },
    ComponentSpec {
        id: SNAPSHOT_DAEMON,
        name: "Snapshot Daemon",
        kind: ComponentKind::Snapshot,
        dependencies: &[],
    },
];

/// Declared startup sequence
pub const STARTUP_SEQUENCE: [&str; 7] = [
    METRICS_AGGREGATOR,
    STATUS_DASHBOARD,
    METRICS_RELAY,
    HEARTBEAT_VISUALIZER,
    ALERT_ENGINE,
    LOOP_AUDITOR,
    SNAPSHOT_DAEMON,
];

/// Declared shutdown sequence, independent of the startup one
pub const SHUTDOWN_SEQUENCE: [&str; 7] = [
    SNAPSHOT_DAEMON,
    LOOP_AUDITOR,
    ALERT_ENGINE,
    HEARTBEAT_VISUALIZER,
    METRICS_RELAY,
    STATUS_DASHBOARD,
    METRICS_AGGREGATOR,
];

/// A supervised component and its runtime bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ComponentKind,
    pub status: ComponentStatus,
    pub health: HealthBucket,
    pub enabled: bool,
    pub uptime_seconds: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub dependencies: Vec<String>,
    pub start_order: Option<usize>,
    pub stop_order: Option<usize>,
    pub auto_restart: bool,
    pub restart_count: u32,
    pub max_restarts: u32,
    pub error_count: u32,
    pub last_error: Option<String>,
}

impl Component {
    /// Build the runtime record for a catalogue entry
    pub fn from_spec(spec: &ComponentSpec) -> Self {
        Self {
            id: spec.id.to_string(),
            name: spec.name.to_string(),
            kind: spec.kind,
            status: ComponentStatus::Stopped,
            health: HealthBucket::Unknown,
            enabled: true,
            uptime_seconds: 0,
            started_at: None,
            last_heartbeat: None,
            dependencies: spec.dependencies.iter().map(|d| d.to_string()).collect(),
            start_order: STARTUP_SEQUENCE.iter().position(|id| *id == spec.id),
            stop_order: SHUTDOWN_SEQUENCE.iter().position(|id| *id == spec.id),
            auto_restart: true,
            restart_count: 0,
            max_restarts: 3,
            error_count: 0,
            last_error: None,
        }
    }

    /// Running and reporting healthy, the bar a dependency has to clear
    pub fn is_operational(&self) -> bool {
        self.status == ComponentStatus::Running && self.health == HealthBucket::Healthy
    }

    /// Record a failure and move to error/critical
    pub fn record_error(&mut self, error: &str) {
        self.status = ComponentStatus::Error;
        self.health = HealthBucket::Critical;
        self.error_count += 1;
        self.last_error = Some(error.to_string());
    }

    pub fn mark_running(&mut self, now: DateTime<Utc>) {
        self.status = ComponentStatus::Running;
        self.health = HealthBucket::Healthy;
        self.started_at = Some(now);
        self.last_heartbeat = Some(now);
        self.uptime_seconds = 0;
        self.error_count = 0;
    }

    pub fn mark_stopped(&mut self) {
        self.status = ComponentStatus::Stopped;
        self.health = HealthBucket::Unknown;
        self.uptime_seconds = 0;
        self.started_at = None;
    }

    /// Recompute uptime, counted from the last successful start.
    /// `last_heartbeat` moves on every healthy probe, so it is not the origin.
    pub fn refresh_uptime(&mut self, now: DateTime<Utc>) {
        self.uptime_seconds = self
            .started_at
            .map(|t| now.signed_duration_since(t).num_seconds().max(0) as u64)
            .unwrap_or(0);
    }
}

/// Build the full component table in catalogue order
pub fn default_components() -> Vec<Component> {
    CATALOGUE.iter().map(Component::from_spec).collect()
}
