//! Coordination layer
//!
//! - The component orchestrator: ordered startup/shutdown, health and recovery loops
//! - Backoff-limited restart accounting
//! - Graceful shutdown handling

pub mod orchestrator;
pub mod restart;
pub mod shutdown;

pub use orchestrator::{Orchestrator, OrchestratorCommand, OrchestratorHandle, OrchestratorState};
pub use restart::{RestartDecision, RestartPolicy};
pub use shutdown::{install_signal_handlers, ShutdownHandle, ShutdownReason, ShutdownSignal};
