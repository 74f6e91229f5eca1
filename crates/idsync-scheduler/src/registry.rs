//! Registry of jobs running inside this coordinator instance.
//!
//! A job is registered when its thread is launched and removed when it is
//! finalized. Each entry holds the cancellation token handed to the job
//! body, which is how `interrupt` and the deadline watchdog reach it.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use idsync_types::{JobId, JobKind};

/// Snapshot of a job owned by this instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningJob {
    pub job_id: JobId,
    pub jobdef_id: String,
    pub kind: JobKind,
    pub started_at: DateTime<Utc>,
    pub limit_time: DateTime<Utc>,
}

struct Entry {
    job: RunningJob,
    token: CancellationToken,
}

/// Thread-safe map of running jobs and their cancellation tokens.
///
/// # Example
///
/// ```
/// use chrono::Utc;
/// use idsync_scheduler::{JobRegistry, RunningJob};
/// use idsync_types::{JobId, JobKind};
/// use tokio_util::sync::CancellationToken;
///
/// let registry = JobRegistry::new();
/// let token = CancellationToken::new();
/// registry.record_start(
///     RunningJob {
///         job_id: JobId(1),
///         jobdef_id: "import-users".to_string(),
///         kind: JobKind::Import,
///         started_at: Utc::now(),
///         limit_time: Utc::now(),
///     },
///     token.clone(),
/// );
/// assert!(registry.is_running(JobId(1)));
///
/// assert!(registry.cancel(JobId(1)));
/// assert!(token.is_cancelled());
///
/// registry.record_complete(JobId(1));
/// assert!(!registry.is_running(JobId(1)));
/// ```
pub struct JobRegistry {
    jobs: RwLock<HashMap<JobId, Entry>>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<JobId, Entry>> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<JobId, Entry>> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record that a job's thread has been launched.
    pub fn record_start(&self, job: RunningJob, token: CancellationToken) {
        self.write().insert(job.job_id, Entry { job, token });
    }

    /// Remove a finished job, returning its snapshot if it was registered.
    pub fn record_complete(&self, id: JobId) -> Option<RunningJob> {
        self.write().remove(&id).map(|entry| entry.job)
    }

    pub fn is_running(&self, id: JobId) -> bool {
        self.read().contains_key(&id)
    }

    /// Trip a job's cancellation token.
    ///
    /// Returns `false` if the job is not registered or was already cancelled.
    pub fn cancel(&self, id: JobId) -> bool {
        match self.read().get(&id) {
            Some(entry) if !entry.token.is_cancelled() => {
                entry.token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Cancel every registered job. Returns how many tokens were tripped.
    pub fn cancel_all(&self) -> usize {
        self.read()
            .values()
            .filter(|entry| !entry.token.is_cancelled())
            .map(|entry| entry.token.cancel())
            .count()
    }

    /// Ids of owned jobs whose limit time has passed.
    pub fn overdue(&self, now: DateTime<Utc>) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self
            .read()
            .values()
            .filter(|entry| now > entry.job.limit_time)
            .map(|entry| entry.job.job_id)
            .collect();
        ids.sort();
        ids
    }

    /// Snapshots of all running jobs, ordered by id.
    pub fn running(&self) -> Vec<RunningJob> {
        let mut jobs: Vec<RunningJob> = self.read().values().map(|e| e.job.clone()).collect();
        jobs.sort_by_key(|job| job.job_id);
        jobs
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}
