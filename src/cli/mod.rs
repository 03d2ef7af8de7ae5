//! patchops CLI
//!
//! Commands:
//! - `patchops run` - Run the orchestrator and every enabled component
//! - `patchops status` / `events` / `alerts` - Read the persisted state
//! - `patchops config` - View, update or validate a configuration document
//! - `patchops ack` / `resolve` / `restart` - Operator actions via the running dashboard

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Self-monitoring operations control plane
#[derive(Parser, Debug)]
#[command(name = "patchops")]
#[command(author, version, about = "Self-monitoring operations control plane", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Directory holding config documents, state and audit logs
    #[arg(long, global = true, env = "PATCHOPS_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// JSON output (and JSON log lines for `run`)
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the orchestrator until SIGINT/SIGTERM
    Run,

    /// Show the last persisted component table and system health
    Status,

    /// Show recent orchestrator events
    Events {
        /// Number of most recent events to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show persisted alerts
    Alerts {
        /// Show resolved history instead of open alerts
        #[arg(long)]
        history: bool,
    },

    /// View or update a configuration document
    Config {
        target: ConfigTarget,

        /// JSON patch deep-merged into the document
        #[arg(long)]
        set: Option<String>,

        /// Only check the stored document
        #[arg(long, conflicts_with = "set")]
        validate: bool,

        /// Send the patch to the running engine through the dashboard
        #[arg(long, requires = "set")]
        live: bool,
    },

    /// Acknowledge an alert
    Ack {
        id: String,
        #[arg(long, default_value = "cli")]
        by: String,
    },

    /// Resolve an alert
    Resolve {
        id: String,
        #[arg(long, default_value = "cli")]
        by: String,
    },

    /// Restart a component
    Restart { id: String },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigTarget {
    Orchestrator,
    Alerts,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config_set() {
        let cli = Cli::try_parse_from([
            "patchops",
            "config",
            "alerts",
            "--set",
            r#"{"features":{"commands":true}}"#,
        ])
        .unwrap();
        match cli.command {
            Commands::Config {
                target,
                set,
                validate,
                live,
            } => {
                assert_eq!(target, ConfigTarget::Alerts);
                assert!(set.unwrap().contains("commands"));
                assert!(!validate);
                assert!(!live);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_set_and_validate_conflict() {
        assert!(Cli::try_parse_from([
            "patchops",
            "config",
            "orchestrator",
            "--set",
            "{}",
            "--validate"
        ])
        .is_err());
    }

    #[test]
    fn test_live_requires_a_patch() {
        assert!(Cli::try_parse_from(["patchops", "config", "alerts", "--live"]).is_err());
        let cli = Cli::try_parse_from([
            "patchops",
            "config",
            "alerts",
            "--set",
            r#"{"evaluation_interval_secs":5}"#,
            "--live",
        ])
        .unwrap();
        assert!(matches!(cli.command, Commands::Config { live: true, .. }));
    }

    #[test]
    fn test_global_flags() {
        let cli =
            Cli::try_parse_from(["patchops", "status", "--json", "--data-dir", "/tmp/ops"]).unwrap();
        assert!(cli.json);
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/ops")));
    }
}
