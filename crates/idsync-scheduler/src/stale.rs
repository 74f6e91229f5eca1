//! Hooks for RUNNING jobs that are past their limit time but not owned by
//! this coordinator, typically left behind by a crashed process.

use chrono::{DateTime, Utc};
use tracing::warn;

use idsync_types::Job;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StaleAction {
    /// Leave the row as it is
    Keep,
    /// Move the row to ABORT
    Abort,
}

pub trait StaleJobHook: Send + Sync {
    fn on_stale(&self, job: &Job, now: DateTime<Utc>) -> StaleAction;
}

/// Default hook: report and keep.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStaleJobs;

impl StaleJobHook for LogStaleJobs {
    fn on_stale(&self, job: &Job, now: DateTime<Utc>) -> StaleAction {
        warn!(
            job_id = %job.id,
            jobdef = %job.jobdef_id,
            limit_time = %job.limit_time,
            %now,
            "Stale RUNNING job is not owned by this instance"
        );
        StaleAction::Keep
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AbortStaleJobs;

impl StaleJobHook for AbortStaleJobs {
    fn on_stale(&self, job: &Job, _now: DateTime<Utc>) -> StaleAction {
        warn!(job_id = %job.id, jobdef = %job.jobdef_id, "Aborting stale RUNNING job");
        StaleAction::Abort
    }
}
