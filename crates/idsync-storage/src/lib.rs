//! Storage layer for idsync.
//!
//! Provides a RocksDB `TransactionDB`-backed implementation of the
//! [`idsync_types::Store`] traits with:
//! - Column family isolation for content, working, archive and job data
//! - Kind-prefixed row keys for ordered, pageable scans
//! - Pessimistic row locks (`get_for_update`) with a bounded lock timeout
//! - A `(schedule_time, id)` queue of non-terminal jobs
//! - A `(jobdef, schedule_time)` index that makes planning idempotent

pub mod column_families;
pub mod db;
pub mod error;
pub mod keys;
pub mod txn;

pub use db::{Storage, StorageOptions, StorageStats};
pub use error::StorageError;
pub use keys::{JobKey, QueueKey, RowKey, ScheduleKey};
pub use txn::StorageTxn;
