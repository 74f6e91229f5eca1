//! Transactions over the RocksDB store.
//!
//! Reads through `get_for_update` take an exclusive lock on the key that is
//! held until commit or rollback; a competing transaction waits up to the
//! configured lock timeout and then fails with `StoreError::LockTimeout`.
//! Locking a key that has no value still reserves it, which keeps concurrent
//! imports from inserting the same content row twice.
//!
//! Dropping a [`StorageTxn`] without committing discards its writes.

use std::collections::BTreeSet;
use std::ops::Bound;

use chrono::{DateTime, Utc};
use rocksdb::{ColumnFamily, Direction, IteratorMode, Transaction, TransactionDB};
use serde::de::DeserializeOwned;
use tracing::debug;

use idsync_types::{
    ContentQuery, ContentRow, ContentTransaction, Job, JobId, JobRecord, JobStatus,
    JobTransaction, LockMode, NewJob, StoreError, StoreTransaction, WorkingQuery, WorkingRow,
};

use crate::column_families::{
    CF_CONTENT, CF_CONTENT_ARCHIVE, CF_JOBS, CF_JOB_QUEUE, CF_JOB_SCHEDULE, CF_WORKING,
};
use crate::db::Storage;
use crate::error::StorageError;
use crate::keys::{schedule_ms, JobKey, QueueKey, RowKey, ScheduleKey};

/// Keys deleted per pass when clearing a kind's working rows
const CLEAR_BATCH: usize = 1000;

/// A pessimistic RocksDB transaction bound to a [`Storage`].
pub struct StorageTxn<'a> {
    storage: &'a Storage,
    txn: Transaction<'a, TransactionDB>,
}

impl<'a> StorageTxn<'a> {
    pub(crate) fn new(storage: &'a Storage, txn: Transaction<'a, TransactionDB>) -> Self {
        Self { storage, txn }
    }

    fn cf(&self, name: &str) -> Result<&'a ColumnFamily, StorageError> {
        self.storage.cf(name)
    }

    fn read(
        &self,
        cf: &ColumnFamily,
        key: &[u8],
        lock: LockMode,
    ) -> Result<Option<Vec<u8>>, StorageError> {
        let value = match lock {
            LockMode::None => self.txn.get_cf(cf, key)?,
            LockMode::Exclusive => self.txn.get_for_update_cf(cf, key, true)?,
        };
        Ok(value)
    }

    fn load<T: DeserializeOwned>(
        &self,
        cf: &ColumnFamily,
        key: &[u8],
        lock: LockMode,
    ) -> Result<Option<T>, StorageError> {
        match self.read(cf, key, lock)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Walk one kind's rows in id order, starting after `after`.
    ///
    /// With an explicit id set only those keys are probed. `visit` returns
    /// `false` to stop the walk.
    fn visit_kind<F>(
        &self,
        cf: &ColumnFamily,
        kind: &str,
        ids: Option<&BTreeSet<String>>,
        after: Option<&str>,
        mut visit: F,
    ) -> Result<(), StorageError>
    where
        F: FnMut(&[u8], &[u8]) -> Result<bool, StorageError>,
    {
        if let Some(ids) = ids {
            let lower = match after {
                Some(after) => Bound::Excluded(after),
                None => Bound::Unbounded,
            };
            for id in ids.range::<str, _>((lower, Bound::Unbounded)) {
                let key = RowKey::new(kind, id).to_bytes();
                if let Some(value) = self.txn.get_cf(cf, &key)? {
                    if !visit(&key[..], &value[..])? {
                        break;
                    }
                }
            }
            return Ok(());
        }

        let prefix = RowKey::kind_prefix(kind);
        let start = match after {
            Some(after) => RowKey::new(kind, after).to_bytes(),
            None => prefix.clone(),
        };
        let iter = self
            .txn
            .iterator_cf(cf, IteratorMode::From(&start, Direction::Forward));
        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(&prefix) {
                break;
            }
            if after.is_some() && key[..] == start[..] {
                continue;
            }
            if !visit(&key[..], &value[..])? {
                break;
            }
        }
        Ok(())
    }

    fn select_content_rows(
        &self,
        kind: &str,
        query: &ContentQuery,
        after: Option<&str>,
    ) -> Result<Vec<ContentRow>, StorageError> {
        let content_cf = self.cf(CF_CONTENT)?;
        let working_cf = self.cf(CF_WORKING)?;
        let needs_working = query.needs_working();
        let mut rows = Vec::new();

        self.visit_kind(content_cf, kind, query.id_filter(), after, |key, value| {
            let row = ContentRow::from_bytes(value)?;
            let working: Option<WorkingRow> = if needs_working {
                self.load(working_cf, &RowKey::new(kind, &row.id).to_bytes(), LockMode::None)?
            } else {
                None
            };
            if !query.matches(&row, working.as_ref()) {
                return Ok(true);
            }

            let row = match query.lock {
                LockMode::None => row,
                LockMode::Exclusive => {
                    // Re-check under the lock: another writer may have changed the row.
                    match self.load::<ContentRow>(content_cf, key, LockMode::Exclusive)? {
                        Some(locked) if query.matches(&locked, working.as_ref()) => locked,
                        _ => return Ok(true),
                    }
                }
            };
            rows.push(row);
            Ok(rows.len() < query.chunk_size)
        })?;

        Ok(rows)
    }

    fn select_working_rows(
        &self,
        kind: &str,
        query: &WorkingQuery,
        after: Option<&str>,
    ) -> Result<Vec<WorkingRow>, StorageError> {
        let content_cf = self.cf(CF_CONTENT)?;
        let working_cf = self.cf(CF_WORKING)?;
        let needs_content = query.needs_content();
        let mut rows = Vec::new();

        self.visit_kind(working_cf, kind, query.id_filter(), after, |key, value| {
            let row = WorkingRow::from_bytes(value)?;
            let content_key = RowKey::new(kind, &row.id).to_bytes();
            let content: Option<ContentRow> = if needs_content {
                self.load(content_cf, &content_key, LockMode::None)?
            } else {
                None
            };
            if !query.matches(&row, content.as_ref()) {
                return Ok(true);
            }

            let row = match query.lock {
                LockMode::None => row,
                LockMode::Exclusive => {
                    let locked = match self.load::<WorkingRow>(working_cf, key, LockMode::Exclusive)? {
                        Some(locked) => locked,
                        None => return Ok(true),
                    };
                    let content = if needs_content {
                        self.load::<ContentRow>(content_cf, &content_key, LockMode::Exclusive)?
                    } else {
                        None
                    };
                    if !query.matches(&locked, content.as_ref()) {
                        return Ok(true);
                    }
                    locked
                }
            };
            rows.push(row);
            Ok(rows.len() < query.chunk_size)
        })?;

        Ok(rows)
    }

    fn put_row<T: serde::Serialize>(
        &self,
        cf_name: &str,
        kind: &str,
        id: &str,
        value: &T,
    ) -> Result<(), StorageError> {
        let cf = self.cf(cf_name)?;
        let bytes = serde_json::to_vec(value)?;
        self.txn.put_cf(cf, RowKey::new(kind, id).to_bytes(), bytes)?;
        Ok(())
    }

    fn clear_kind(&self, kind: &str) -> Result<usize, StorageError> {
        let cf = self.cf(CF_WORKING)?;
        let prefix = RowKey::kind_prefix(kind);
        let mut removed = 0;

        loop {
            let mut keys = Vec::with_capacity(CLEAR_BATCH);
            let iter = self
                .txn
                .iterator_cf(cf, IteratorMode::From(&prefix, Direction::Forward));
            for item in iter {
                let (key, _) = item?;
                if !key.starts_with(&prefix) || keys.len() >= CLEAR_BATCH {
                    break;
                }
                keys.push(key);
            }

            let batch = keys.len();
            for key in keys {
                self.txn.delete_cf(cf, key)?;
            }
            removed += batch;
            if batch < CLEAR_BATCH {
                break;
            }
        }

        debug!(kind, removed, "Cleared working rows");
        Ok(removed)
    }

    fn job(&self, id: JobId, lock: LockMode) -> Result<Option<Job>, StorageError> {
        self.load(self.cf(CF_JOBS)?, &JobKey::new(id).to_bytes(), lock)
    }

    fn required_job(&self, id: JobId) -> Result<Job, StorageError> {
        self.job(id, LockMode::Exclusive)?
            .ok_or_else(|| StorageError::NotFound(format!("job {}", id)))
    }

    fn put_job(&self, job: &Job) -> Result<(), StorageError> {
        let cf = self.cf(CF_JOBS)?;
        self.txn
            .put_cf(cf, JobKey::new(job.id).to_bytes(), job.to_bytes()?)?;
        Ok(())
    }

    fn insert_job(&self, new: NewJob) -> Result<Job, StorageError> {
        let job = Job::from_new(self.storage.next_job_id(), new);
        self.put_job(&job)?;

        let queue_cf = self.cf(CF_JOB_QUEUE)?;
        self.txn
            .put_cf(queue_cf, QueueKey::new(job.schedule_time, job.id).to_bytes(), b"")?;

        let schedule_cf = self.cf(CF_JOB_SCHEDULE)?;
        self.txn.put_cf(
            schedule_cf,
            ScheduleKey::new(&job.jobdef_id, job.schedule_time).to_bytes(),
            serde_json::to_vec(&job.id)?,
        )?;

        debug!(job_id = %job.id, jobdef = %job.jobdef_id, "Created job");
        Ok(job)
    }

    fn locked_active_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StorageError> {
        let queue_cf = self.cf(CF_JOB_QUEUE)?;
        let jobs_cf = self.cf(CF_JOBS)?;
        let now_ms = schedule_ms(now);
        let mut jobs = Vec::new();

        for item in self.txn.iterator_cf(queue_cf, IteratorMode::Start) {
            let (key, _) = item?;
            let queue_key = QueueKey::from_bytes(&key)?;
            if queue_key.schedule_ms > now_ms {
                break;
            }
            let job: Option<Job> = self.load(
                jobs_cf,
                &JobKey::new(queue_key.id).to_bytes(),
                LockMode::Exclusive,
            )?;
            match job {
                Some(job) if job.status.is_active() && job.schedule_time <= now => jobs.push(job),
                _ => {}
            }
        }
        Ok(jobs)
    }

    fn transition_job(
        &self,
        id: JobId,
        status: JobStatus,
        at: DateTime<Utc>,
    ) -> Result<Job, StorageError> {
        let mut job = self.required_job(id)?;
        job.transition(status, at)
            .map_err(|e| StorageError::Conflict(e.to_string()))?;
        self.put_job(&job)?;

        if job.status.is_terminal() {
            let queue_cf = self.cf(CF_JOB_QUEUE)?;
            self.txn
                .delete_cf(queue_cf, QueueKey::new(job.schedule_time, job.id).to_bytes())?;
        }
        Ok(job)
    }

    fn update_job<F>(&self, id: JobId, update: F) -> Result<(), StorageError>
    where
        F: FnOnce(&mut Job),
    {
        let mut job = self.required_job(id)?;
        update(&mut job);
        job.touch();
        self.put_job(&job)
    }

    fn all_jobs(&self, include_terminal: bool) -> Result<Vec<Job>, StorageError> {
        let cf = self.cf(CF_JOBS)?;
        let mut jobs = Vec::new();
        for item in self.txn.iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            let job = Job::from_bytes(&value)?;
            if include_terminal || job.status.is_active() {
                jobs.push(job);
            }
        }
        Ok(jobs)
    }
}

impl ContentTransaction for StorageTxn<'_> {
    fn select_content(
        &self,
        kind: &str,
        query: &ContentQuery,
        after: Option<&str>,
    ) -> Result<Vec<ContentRow>, StoreError> {
        Ok(self.select_content_rows(kind, query, after)?)
    }

    fn select_working(
        &self,
        kind: &str,
        query: &WorkingQuery,
        after: Option<&str>,
    ) -> Result<Vec<WorkingRow>, StoreError> {
        Ok(self.select_working_rows(kind, query, after)?)
    }

    fn get_content(
        &self,
        kind: &str,
        id: &str,
        lock: LockMode,
    ) -> Result<Option<ContentRow>, StoreError> {
        let cf = self.cf(CF_CONTENT)?;
        Ok(self.load(cf, &RowKey::new(kind, id).to_bytes(), lock)?)
    }

    fn get_working(&self, kind: &str, id: &str) -> Result<Option<WorkingRow>, StoreError> {
        let cf = self.cf(CF_WORKING)?;
        Ok(self.load(cf, &RowKey::new(kind, id).to_bytes(), LockMode::None)?)
    }

    fn put_content(&self, row: &ContentRow) -> Result<(), StoreError> {
        Ok(self.put_row(CF_CONTENT, &row.kind, &row.id, row)?)
    }

    fn archive_content(&self, row: &ContentRow) -> Result<(), StoreError> {
        self.put_row(CF_CONTENT_ARCHIVE, &row.kind, &row.id, row)?;
        let cf = self.cf(CF_CONTENT)?;
        self.txn
            .delete_cf(cf, RowKey::new(&row.kind, &row.id).to_bytes())
            .map_err(StorageError::from)?;
        Ok(())
    }

    fn append_working_rows(&self, kind: &str, rows: &[WorkingRow]) -> Result<(), StoreError> {
        for row in rows {
            self.put_row(CF_WORKING, kind, &row.id, row)?;
        }
        Ok(())
    }

    fn clear_working_rows(&self, kind: &str) -> Result<usize, StoreError> {
        Ok(self.clear_kind(kind)?)
    }
}

impl JobTransaction for StorageTxn<'_> {
    fn lock_active_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        Ok(self.locked_active_jobs(now)?)
    }

    fn get_job(&self, id: JobId, lock: LockMode) -> Result<Option<Job>, StoreError> {
        Ok(self.job(id, lock)?)
    }

    fn create_job(&self, job: NewJob) -> Result<Job, StoreError> {
        Ok(self.insert_job(job)?)
    }

    fn find_planned_job(
        &self,
        jobdef_id: &str,
        schedule_time: DateTime<Utc>,
    ) -> Result<Option<JobId>, StoreError> {
        let cf = self.cf(CF_JOB_SCHEDULE)?;
        let key = ScheduleKey::new(jobdef_id, schedule_time).to_bytes();
        Ok(self.load(cf, &key, LockMode::Exclusive)?)
    }

    fn append_messages(&self, id: JobId, messages: &[String]) -> Result<(), StoreError> {
        if messages.is_empty() {
            return Ok(());
        }
        Ok(self.update_job(id, |job| {
            job.result_messages.extend(messages.iter().cloned())
        })?)
    }

    fn append_records(&self, id: JobId, records: &[JobRecord]) -> Result<(), StoreError> {
        if records.is_empty() {
            return Ok(());
        }
        Ok(self.update_job(id, |job| job.records.extend(records.iter().cloned()))?)
    }

    fn update_status(
        &self,
        id: JobId,
        status: JobStatus,
        at: DateTime<Utc>,
    ) -> Result<Job, StoreError> {
        Ok(self.transition_job(id, status, at)?)
    }

    fn list_jobs(&self, include_terminal: bool) -> Result<Vec<Job>, StoreError> {
        Ok(self.all_jobs(include_terminal)?)
    }
}

impl StoreTransaction for StorageTxn<'_> {
    fn commit(self) -> Result<(), StoreError> {
        self.txn.commit().map_err(StorageError::from)?;
        Ok(())
    }

    fn rollback(self) -> Result<(), StoreError> {
        self.txn.rollback().map_err(StorageError::from)?;
        Ok(())
    }
}
