//! Column family definitions for RocksDB.
//!
//! Each column family isolates data with different access patterns:
//! - content: Reconciled content rows, keyed by kind and id (compressed)
//! - working: Rows staged by imports, cleared at the start of each import
//! - content_archive: Rows moved out of content by archive jobs (compressed)
//! - jobs: Job rows keyed by id
//! - job_queue: Non-terminal jobs keyed by schedule time then id
//! - job_schedule: `(jobdef, schedule_time)` -> job id, for idempotent planning

use rocksdb::{ColumnFamilyDescriptor, Options};

/// Column family name for reconciled content rows
pub const CF_CONTENT: &str = "content";

/// Column family name for staged working rows
pub const CF_WORKING: &str = "working";

/// Column family name for archived content rows
pub const CF_CONTENT_ARCHIVE: &str = "content_archive";

/// Column family name for job rows
pub const CF_JOBS: &str = "jobs";

/// Column family name for the active job queue
pub const CF_JOB_QUEUE: &str = "job_queue";

/// Column family name for the planned-job index
pub const CF_JOB_SCHEDULE: &str = "job_schedule";

/// All column family names
pub const ALL_CF_NAMES: &[&str] = &[
    CF_CONTENT,
    CF_WORKING,
    CF_CONTENT_ARCHIVE,
    CF_JOBS,
    CF_JOB_QUEUE,
    CF_JOB_SCHEDULE,
];

/// Options for long-lived row tables
fn compressed_options() -> Options {
    let mut opts = Options::default();
    opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
    opts
}

/// Build all column family descriptors
pub fn build_cf_descriptors() -> Vec<ColumnFamilyDescriptor> {
    vec![
        ColumnFamilyDescriptor::new(CF_CONTENT, compressed_options()),
        ColumnFamilyDescriptor::new(CF_WORKING, Options::default()),
        ColumnFamilyDescriptor::new(CF_CONTENT_ARCHIVE, compressed_options()),
        ColumnFamilyDescriptor::new(CF_JOBS, Options::default()),
        ColumnFamilyDescriptor::new(CF_JOB_QUEUE, Options::default()),
        ColumnFamilyDescriptor::new(CF_JOB_SCHEDULE, Options::default()),
    ]
}
