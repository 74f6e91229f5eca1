//! idsync daemon library
//!
//! Exposes CLI parsing and command implementations so the binary stays
//! thin and end-to-end tests can assemble a coordinator the same way the
//! daemon does.

pub mod cli;
pub mod commands;

pub use cli::{Cli, Commands};
pub use commands::{
    build_coordinator, describe_job, handle_jobs, handle_preview, handle_reconcile,
    handle_submit, list_jobs, load_settings, open_storage, preview_schedule, reconcile_plan,
    start_daemon, submit_job,
};
