//! Rule-based alerting and escalation
//!
//! - Condition evaluation over the metric store (fails closed)
//! - Rate-limited notification channels and HTTP transports
//! - Placeholder templating for messages and commands
//! - The engine loop: firing, retries, escalation, cleanup

pub mod channels;
pub mod conditions;
pub mod engine;
pub mod template;

pub use channels::{ChannelRegistry, HttpTransport, NotificationTransport};
pub use conditions::{evaluate_condition, evaluate_rule, is_eligible_at, ConditionMatch};
pub use engine::{
    command_channel, AlertCommand, AlertEngine, AlertEngineHandle, AlertEngineState, AlertInbox,
    AlertStats, CleanupReport, RetryDue,
};
