//! Persistence Layer
//!
//! - Full-document state snapshots, overwritten every cycle
//! - Append-only JSON-lines audit logs

pub mod event_log;
pub mod state_file;

pub use event_log::EventLog;
pub use state_file::StateFile;
