//! Per-job execution context and outcome.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use idsync_types::{Clock, Job, JobRecord, JobStatus};

use crate::error::JobError;

/// What a job body sees while it runs: its job row, a cancellation token,
/// the clock, and buffers for messages and per-content records.
///
/// Buffered output is written to the job row once, at finalization.
pub struct JobContext {
    job: Job,
    token: CancellationToken,
    clock: Arc<dyn Clock>,
    chunk_size: usize,
    messages: Vec<String>,
    records: Vec<JobRecord>,
}

impl JobContext {
    pub fn new(job: Job, token: CancellationToken, clock: Arc<dyn Clock>, chunk_size: usize) -> Self {
        Self {
            job,
            token,
            clock,
            chunk_size: chunk_size.max(1),
            messages: Vec::new(),
            records: Vec::new(),
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.job.property(name)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Safe point: fail with `JobError::Aborted` once the job was interrupted.
    pub fn checkpoint(&self) -> Result<(), JobError> {
        if self.token.is_cancelled() {
            return Err(JobError::Aborted);
        }
        Ok(())
    }

    pub fn message(&mut self, message: impl Into<String>) {
        self.messages.push(message.into());
    }

    pub fn record(&mut self, record: JobRecord) {
        self.records.push(record);
    }

    pub fn extend_records(&mut self, records: impl IntoIterator<Item = JobRecord>) {
        self.records.extend(records);
    }

    pub fn records(&self) -> &[JobRecord] {
        &self.records
    }

    pub fn into_report(self) -> JobReport {
        JobReport {
            messages: self.messages,
            records: self.records,
        }
    }
}

/// Output a job body accumulated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobReport {
    pub messages: Vec<String>,
    pub records: Vec<JobRecord>,
}

impl JobReport {
    pub fn has_failures(&self) -> bool {
        self.records.iter().any(JobRecord::is_failure)
    }
}

/// How a job body ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Returned normally; may still carry failure records
    Completed(JobReport),
    /// Returned an error other than an interruption
    Failed { report: JobReport, error: String },
    /// Observed its cancellation token
    Aborted(JobReport),
}

impl JobOutcome {
    pub fn from_result(report: JobReport, result: Result<(), JobError>) -> Self {
        match result {
            Ok(()) => JobOutcome::Completed(report),
            Err(e) if e.is_aborted() => JobOutcome::Aborted(report),
            Err(e) => JobOutcome::Failed {
                report,
                error: e.to_string(),
            },
        }
    }

    /// Failure without any output, e.g. for a job that never ran.
    pub fn failed(error: impl Into<String>) -> Self {
        JobOutcome::Failed {
            report: JobReport::default(),
            error: error.into(),
        }
    }

    /// Terminal status this outcome maps to.
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Completed(report) if report.has_failures() => JobStatus::Failure,
            JobOutcome::Completed(_) => JobStatus::Success,
            JobOutcome::Failed { .. } => JobStatus::Failure,
            JobOutcome::Aborted(_) => JobStatus::Abort,
        }
    }

    /// The report plus a closing message for abnormal endings.
    pub fn into_parts(self) -> (JobReport, Option<String>) {
        match self {
            JobOutcome::Completed(report) => (report, None),
            JobOutcome::Failed { report, error } => (report, Some(error)),
            JobOutcome::Aborted(report) => (report, Some("Job aborted".to_string())),
        }
    }
}
