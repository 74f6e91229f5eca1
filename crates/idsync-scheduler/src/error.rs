//! Error types for the scheduler crate.
//!
//! - [`ScheduleError`]: malformed recurrence definitions and windows
//! - [`CoordinatorError`]: job creation, planning and claiming
//! - [`JobError`]: failures raised by job bodies
//! - [`SchedulerError`]: heartbeat lifecycle

use chrono::{DateTime, Utc};
use thiserror::Error;

use idsync_reconcile::ReconcileError;
use idsync_types::{JobId, StoreError};

/// Errors raised while resolving recurrence definitions.
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// The `kind` tag names no known rule
    #[error("Unknown recurrence kind: {0}")]
    UnknownKind(String),

    /// The payload is structurally invalid
    #[error("Invalid recurrence {id}: {reason}")]
    InvalidPayload { id: u64, reason: String },

    #[error("Invalid window: {begin} is after {end}")]
    InvalidWindow {
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    /// Invalid timezone string
    #[error("Invalid timezone: {0}")]
    InvalidTimezone(String),
}

/// Errors raised by the job coordinator.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("Job definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("Job definition disabled: {0}")]
    DefinitionDisabled(String),

    #[error("Job not found: {0}")]
    JobNotFound(JobId),

    /// Store failures propagate unchanged
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

/// Errors raised by job bodies.
#[derive(Debug, Error)]
pub enum JobError {
    /// The job observed its cancellation token
    #[error("Job aborted")]
    Aborted,

    /// The job's target or properties are unusable
    #[error("Invalid job: {0}")]
    Invalid(String),

    #[error("Source error: {0}")]
    Source(String),

    #[error("Sink error: {0}")]
    Sink(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),
}

impl JobError {
    /// Whether this error is, or wraps, an interruption.
    pub fn is_aborted(&self) -> bool {
        match self {
            JobError::Aborted => true,
            JobError::Io(e) => e.kind() == std::io::ErrorKind::Interrupted,
            _ => false,
        }
    }
}

/// Errors that can occur during heartbeat lifecycle operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Heartbeat is already running
    #[error("Heartbeat is already running")]
    AlreadyRunning,

    /// Heartbeat is not running
    #[error("Heartbeat is not running")]
    NotRunning,

    /// The ticker task ended abnormally
    #[error("Heartbeat task failed: {0}")]
    Task(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = ScheduleError::UnknownKind("HOURLY".to_string());
        assert!(err.to_string().contains("Unknown recurrence kind"));

        let err = CoordinatorError::DefinitionDisabled("nightly".to_string());
        assert!(err.to_string().contains("disabled"));

        let err = SchedulerError::AlreadyRunning;
        assert!(err.to_string().contains("already running"));
    }

    #[test]
    fn test_store_errors_pass_through() {
        let err = CoordinatorError::from(StoreError::LockTimeout("job 4".to_string()));
        assert_eq!(err.to_string(), "Lock not acquired: job 4");
        assert!(matches!(err, CoordinatorError::Store(StoreError::LockTimeout(_))));
    }

    #[test]
    fn test_abort_detection() {
        assert!(JobError::Aborted.is_aborted());
        let interrupted = std::io::Error::new(std::io::ErrorKind::Interrupted, "signal");
        assert!(JobError::from(interrupted).is_aborted());
        assert!(!JobError::Invalid("x".to_string()).is_aborted());
    }
}
