//! Transactional store seams.
//!
//! The coordinator, reconciliation engine and job bodies talk to persistence
//! only through these traits. One transaction spans every read and write of a
//! unit of work; dropping a transaction without committing rolls it back.

use chrono::{DateTime, Utc};

use crate::content::{ContentRow, WorkingRow};
use crate::error::StoreError;
use crate::job::{Job, JobId, JobRecord, JobStatus, NewJob};
use crate::query::{ContentQuery, LockMode, WorkingQuery};

/// Factory for transactions.
pub trait Store: Send + Sync {
    type Txn<'a>: StoreTransaction
    where
        Self: 'a;

    fn begin(&self) -> Result<Self::Txn<'_>, StoreError>;
}

/// Reads and writes over content, working and archive tables.
///
/// Paged selects return at most `query.chunk_size` rows ordered by id,
/// starting strictly after `after` when given.
pub trait ContentTransaction {
    fn select_content(
        &self,
        kind: &str,
        query: &ContentQuery,
        after: Option<&str>,
    ) -> Result<Vec<ContentRow>, StoreError>;

    fn select_working(
        &self,
        kind: &str,
        query: &WorkingQuery,
        after: Option<&str>,
    ) -> Result<Vec<WorkingRow>, StoreError>;

    fn get_content(
        &self,
        kind: &str,
        id: &str,
        lock: LockMode,
    ) -> Result<Option<ContentRow>, StoreError>;

    fn get_working(&self, kind: &str, id: &str) -> Result<Option<WorkingRow>, StoreError>;

    /// Insert or replace a content row.
    fn put_content(&self, row: &ContentRow) -> Result<(), StoreError>;

    /// Move a content row into the archive table.
    fn archive_content(&self, row: &ContentRow) -> Result<(), StoreError>;

    fn append_working_rows(&self, kind: &str, rows: &[WorkingRow]) -> Result<(), StoreError>;

    /// Remove every working row of `kind`, returning how many were removed.
    fn clear_working_rows(&self, kind: &str) -> Result<usize, StoreError>;
}

/// Reads and writes over jobs.
pub trait JobTransaction {
    /// Lock and return every non-terminal job whose schedule time is at or
    /// before `now`, ordered by `(schedule_time, id)`.
    fn lock_active_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError>;

    fn get_job(&self, id: JobId, lock: LockMode) -> Result<Option<Job>, StoreError>;

    fn create_job(&self, job: NewJob) -> Result<Job, StoreError>;

    /// Job previously created for `(jobdef_id, schedule_time)`, if any.
    ///
    /// The index slot stays locked for the rest of the transaction, so two
    /// planners cannot both create the same occurrence.
    fn find_planned_job(
        &self,
        jobdef_id: &str,
        schedule_time: DateTime<Utc>,
    ) -> Result<Option<JobId>, StoreError>;

    fn append_messages(&self, id: JobId, messages: &[String]) -> Result<(), StoreError>;

    fn append_records(&self, id: JobId, records: &[JobRecord]) -> Result<(), StoreError>;

    /// Apply a lifecycle transition.
    ///
    /// # Errors
    ///
    /// `StoreError::Conflict` when the transition is not allowed,
    /// `StoreError::NotFound` when the job does not exist.
    fn update_status(
        &self,
        id: JobId,
        status: JobStatus,
        at: DateTime<Utc>,
    ) -> Result<Job, StoreError>;

    /// All jobs ordered by id; terminal jobs only when asked for.
    fn list_jobs(&self, include_terminal: bool) -> Result<Vec<Job>, StoreError>;
}

/// A unit of work over both content and jobs.
pub trait StoreTransaction: ContentTransaction + JobTransaction {
    fn commit(self) -> Result<(), StoreError>;

    fn rollback(self) -> Result<(), StoreError>;
}
