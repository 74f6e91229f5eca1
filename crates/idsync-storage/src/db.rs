//! RocksDB wrapper for idsync storage.
//!
//! Provides:
//! - Database open with column family setup
//! - Transaction factory with a bounded row-lock timeout
//! - Monotonic job id sequence recovered at open
//! - Row counts for diagnostics

use rocksdb::{
    ColumnFamily, IteratorMode, Options, TransactionDB, TransactionDBOptions, TransactionOptions,
    WriteOptions,
};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

use idsync_types::{JobId, Store, StoreError};

use crate::column_families::{
    build_cf_descriptors, ALL_CF_NAMES, CF_CONTENT, CF_CONTENT_ARCHIVE, CF_JOBS, CF_JOB_QUEUE,
    CF_WORKING,
};
use crate::error::StorageError;
use crate::keys::JobKey;
use crate::txn::StorageTxn;

/// Tuning knobs for [`Storage::open_with_options`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageOptions {
    /// How long a transaction waits for a row lock before failing (ms)
    pub lock_timeout_ms: u64,
}

impl Default for StorageOptions {
    fn default() -> Self {
        Self {
            lock_timeout_ms: 5000,
        }
    }
}

/// Main storage interface for idsync
pub struct Storage {
    db: TransactionDB,
    /// Next job id to hand out
    job_sequence: AtomicU64,
    lock_timeout_ms: i64,
}

impl Storage {
    /// Open storage at the given path, creating if necessary
    pub fn open(path: &Path) -> Result<Self, StorageError> {
        Self::open_with_options(path, StorageOptions::default())
    }

    pub fn open_with_options(path: &Path, options: StorageOptions) -> Result<Self, StorageError> {
        info!("Opening storage at {:?}", path);

        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_background_jobs(4);

        let lock_timeout_ms = i64::try_from(options.lock_timeout_ms).unwrap_or(i64::MAX);
        let mut txn_db_opts = TransactionDBOptions::default();
        txn_db_opts.set_txn_lock_timeout(lock_timeout_ms);

        let cf_descriptors = build_cf_descriptors();
        let db = TransactionDB::open_cf_descriptors(&db_opts, &txn_db_opts, path, cf_descriptors)?;

        let job_sequence = Self::load_job_sequence(&db)?;
        debug!(next_job_id = job_sequence, "Recovered job sequence");

        Ok(Self {
            db,
            job_sequence: AtomicU64::new(job_sequence),
            lock_timeout_ms,
        })
    }

    /// Load the next job id from the highest existing job key
    fn load_job_sequence(db: &TransactionDB) -> Result<u64, StorageError> {
        let cf = db
            .cf_handle(CF_JOBS)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(CF_JOBS.to_string()))?;

        let mut iter = db.iterator_cf(cf, IteratorMode::End);
        if let Some(result) = iter.next() {
            let (key, _) = result?;
            let job_key = JobKey::from_bytes(&key)?;
            return Ok(job_key.id.0 + 1);
        }
        Ok(1)
    }

    /// Get next job id
    pub(crate) fn next_job_id(&self) -> JobId {
        JobId(self.job_sequence.fetch_add(1, Ordering::SeqCst))
    }

    pub(crate) fn cf(&self, name: &str) -> Result<&ColumnFamily, StorageError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StorageError::ColumnFamilyNotFound(name.to_string()))
    }

    /// Start a pessimistic transaction.
    pub fn transaction(&self) -> Result<StorageTxn<'_>, StorageError> {
        let mut txn_opts = TransactionOptions::default();
        txn_opts.set_lock_timeout(self.lock_timeout_ms);
        let txn = self.db.transaction_opt(&WriteOptions::default(), &txn_opts);
        Ok(StorageTxn::new(self, txn))
    }

    /// Count entries in a column family
    fn count_cf_entries(&self, name: &str) -> Result<u64, StorageError> {
        let cf = self.cf(name)?;
        let mut count = 0u64;
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    /// Row counts per table
    pub fn get_stats(&self) -> Result<StorageStats, StorageError> {
        Ok(StorageStats {
            content_count: self.count_cf_entries(CF_CONTENT)?,
            working_count: self.count_cf_entries(CF_WORKING)?,
            archived_count: self.count_cf_entries(CF_CONTENT_ARCHIVE)?,
            job_count: self.count_cf_entries(CF_JOBS)?,
            active_job_count: self.count_cf_entries(CF_JOB_QUEUE)?,
        })
    }

    /// Names of every column family this store opens
    pub fn column_families() -> &'static [&'static str] {
        ALL_CF_NAMES
    }
}

impl Store for Storage {
    type Txn<'a>
        = StorageTxn<'a>
    where
        Self: 'a;

    fn begin(&self) -> Result<StorageTxn<'_>, StoreError> {
        self.transaction().map_err(StoreError::from)
    }
}

/// Storage statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageStats {
    /// Number of content rows across kinds
    pub content_count: u64,
    /// Number of staged working rows
    pub working_count: u64,
    /// Number of archived content rows
    pub archived_count: u64,
    /// Number of jobs in any state
    pub job_count: u64,
    /// Number of non-terminal jobs
    pub active_job_count: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone, Utc};
    use idsync_types::{
        ContentTransaction, JobKind, JobTransaction, NewJob, StoreTransaction,
    };
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn create_test_storage() -> (Storage, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let storage = Storage::open(temp_dir.path()).unwrap();
        (storage, temp_dir)
    }

    fn new_job() -> NewJob {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        NewJob {
            jobdef_id: "import-users".to_string(),
            kind: JobKind::Import,
            target: "USER".to_string(),
            schedule_time: at,
            limit_time: at + Duration::minutes(5),
            properties: BTreeMap::new(),
        }
    }

    #[test]
    fn test_open_creates_column_families() {
        let (storage, _temp) = create_test_storage();
        for name in Storage::column_families() {
            assert!(storage.cf(name).is_ok(), "missing column family {name}");
        }
        assert_eq!(storage.get_stats().unwrap(), StorageStats::default());
    }

    #[test]
    fn test_job_sequence_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        {
            let storage = Storage::open(temp_dir.path()).unwrap();
            let txn = storage.begin().unwrap();
            assert_eq!(txn.create_job(new_job()).unwrap().id, JobId(1));
            assert_eq!(txn.create_job(new_job()).unwrap().id, JobId(2));
            txn.commit().unwrap();
        }

        let storage = Storage::open(temp_dir.path()).unwrap();
        let txn = storage.begin().unwrap();
        assert_eq!(txn.create_job(new_job()).unwrap().id, JobId(3));
    }

    #[test]
    fn test_stats_count_rows() {
        let (storage, _temp) = create_test_storage();
        let txn = storage.begin().unwrap();
        let mut row = idsync_types::ContentRow::new("USER", "u1");
        row.digest = "d".to_string();
        txn.put_content(&row).unwrap();
        txn.create_job(new_job()).unwrap();
        txn.commit().unwrap();

        let stats = storage.get_stats().unwrap();
        assert_eq!(stats.content_count, 1);
        assert_eq!(stats.job_count, 1);
        assert_eq!(stats.active_job_count, 1);
    }
}
