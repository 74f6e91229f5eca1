//! CLI argument parsing for the idsync binary.
//!
//! CLI flags override all other config sources.

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};

/// idsync
///
/// Recurring identity-content synchronization: imports, rebuilds,
/// exports and archiving driven by a job scheduler.
#[derive(Parser, Debug)]
#[command(name = "idsync")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file (overrides default ~/.config/idsync/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Set log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Override database path
    #[arg(long, global = true)]
    pub db_path: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the heartbeat until Ctrl-C or SIGTERM
    Start,

    /// Create a job from a job definition
    Submit {
        /// Job definition id
        jobdef: String,

        /// Schedule time (RFC 3339, default now)
        #[arg(long, value_parser = parse_instant)]
        at: Option<DateTime<Utc>>,

        /// Job property override, repeatable
        #[arg(short, long = "property", value_name = "NAME=VALUE", value_parser = parse_property)]
        properties: Vec<(String, String)>,

        /// Run the job in this process and wait for its outcome
        #[arg(short, long)]
        wait: bool,
    },

    /// List jobs
    Jobs {
        /// Include finished jobs
        #[arg(short, long)]
        all: bool,
    },

    /// Show when a job definition's recurrences fire
    Preview {
        /// Job definition id
        jobdef: String,

        /// Window start (RFC 3339)
        #[arg(long, value_parser = parse_instant)]
        from: DateTime<Utc>,

        /// Window end (RFC 3339)
        #[arg(long, value_parser = parse_instant)]
        to: DateTime<Utc>,
    },

    /// Count what reconciling a content kind would do, without writing
    Reconcile {
        /// Content kind (USER, ORGANIZATION, GROUP, MEMBERSHIP)
        kind: String,
    },
}

fn parse_instant(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| format!("expected an RFC 3339 timestamp: {e}"))
}

fn parse_property(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((name, v)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), v.to_string()))
        }
        _ => Err(format!("expected NAME=VALUE, got '{value}'")),
    }
}
