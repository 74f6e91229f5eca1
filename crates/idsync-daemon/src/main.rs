//! idsync daemon
//!
//! Runs recurring identity-content jobs: imports from sources, rebuilds of
//! validity-driven enabled flags, exports and archiving.
//!
//! # Usage
//!
//! ```bash
//! idsync start
//! idsync submit <JOBDEF> [--at TIME] [-p NAME=VALUE]... [--wait]
//! idsync jobs [--all]
//! idsync preview <JOBDEF> --from TIME --to TIME
//! idsync reconcile <KIND>
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded in order (later sources override earlier):
//! 1. Built-in defaults
//! 2. Config file (~/.config/idsync/config.toml)
//! 3. Environment variables (IDSYNC_*)
//! 4. CLI flags

use anyhow::Result;
use clap::Parser;

use idsync_daemon::{
    handle_jobs, handle_preview, handle_reconcile, handle_submit, start_daemon, Cli, Commands,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.config.as_deref();
    let db_path = cli.db_path.as_deref();
    let log_level = cli.log_level.as_deref();

    match cli.command {
        Commands::Start => {
            start_daemon(config, db_path, log_level).await?;
        }
        Commands::Submit {
            jobdef,
            at,
            properties,
            wait,
        } => {
            handle_submit(config, db_path, log_level, &jobdef, at, properties, wait).await?;
        }
        Commands::Jobs { all } => {
            handle_jobs(config, db_path, log_level, all)?;
        }
        Commands::Preview { jobdef, from, to } => {
            handle_preview(config, log_level, &jobdef, from, to)?;
        }
        Commands::Reconcile { kind } => {
            handle_reconcile(config, db_path, log_level, &kind)?;
        }
    }

    Ok(())
}
