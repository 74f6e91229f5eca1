//! End-to-end test infrastructure for idsync.
//!
//! Provides a shared TestHarness that assembles storage, a manual clock and
//! a coordinator exactly the way the daemon does, plus helpers for writing
//! JSON-lines source files and inspecting jobs and content.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, TimeZone, Utc};

use idsync_daemon::{build_coordinator, open_storage};
use idsync_scheduler::jobs::SourceRecord;
use idsync_scheduler::{Coordinator, JobRequest, SchedulerConfig};
use idsync_storage::Storage;
use idsync_types::{
    Clock, ContentQuery, ContentRow, ContentTransaction, Job, JobDefinition, JobId, JobKind,
    JobTransaction, LockMode, ManualClock, Settings, Store, StoreTransaction,
};

/// How long [`TestHarness::wait_for`] polls before giving up.
const JOB_TIMEOUT: StdDuration = StdDuration::from_secs(10);

/// Start of every harness clock: Monday 2024-01-01 00:00 UTC.
pub fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// Shared test harness for E2E tests.
pub struct TestHarness {
    /// Keeps temp dir alive for the lifetime of the harness
    pub _temp_dir: tempfile::TempDir,
    /// Directory holding source and export files
    pub dir: PathBuf,
    pub storage: Arc<Storage>,
    pub clock: Arc<ManualClock>,
    pub coordinator: Arc<Coordinator<Storage>>,
    pub config: SchedulerConfig,
}

impl TestHarness {
    /// Harness with the standard job definitions and a chunk size of 2, so
    /// every job pages through its rows.
    pub fn new() -> Self {
        Self::with_settings(|_| {})
    }

    pub fn with_settings(customize: impl FnOnce(&mut Settings)) -> Self {
        let temp_dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let dir = temp_dir.path().to_path_buf();

        let mut settings = Settings {
            db_path: dir.join("db").to_string_lossy().to_string(),
            job_definitions: standard_definitions(&dir),
            ..Settings::default()
        };
        settings.reconcile.chunk_size = 2;
        customize(&mut settings);

        let storage = open_storage(&settings).expect("Failed to open test storage");
        let clock = Arc::new(ManualClock::new(base_time()));
        let (coordinator, config) =
            build_coordinator(&settings, Arc::clone(&storage), clock.clone())
                .expect("Failed to build coordinator");

        Self {
            _temp_dir: temp_dir,
            dir,
            storage,
            clock,
            coordinator,
            config,
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Create a job due now and drive the coordinator until it finishes.
    pub fn run_job(&self, jobdef_id: &str, properties: &[(&str, &str)]) -> Job {
        let mut request = JobRequest::new(jobdef_id).at(self.now());
        for (name, value) in properties {
            request = request.with_property(name, *value);
        }
        let job = self
            .coordinator
            .create_job(request)
            .expect("Failed to create job");
        self.wait_for(job.id)
    }

    /// Poll until the job is terminal.
    pub fn wait_for(&self, id: JobId) -> Job {
        let deadline = Instant::now() + JOB_TIMEOUT;
        loop {
            self.coordinator.poll().expect("Poll failed");
            let job = self.job(id);
            if job.status.is_terminal() && self.coordinator.running_jobs().is_empty() {
                return job;
            }
            assert!(
                Instant::now() < deadline,
                "Job {id} still {} after {JOB_TIMEOUT:?}",
                job.status
            );
            std::thread::sleep(StdDuration::from_millis(20));
        }
    }

    pub fn job(&self, id: JobId) -> Job {
        let txn = self.storage.begin().unwrap();
        let job = txn.get_job(id, LockMode::None).unwrap();
        txn.rollback().unwrap();
        job.unwrap_or_else(|| panic!("Job {id} not found"))
    }

    pub fn jobs(&self, include_terminal: bool) -> Vec<Job> {
        let txn = self.storage.begin().unwrap();
        let jobs = txn.list_jobs(include_terminal).unwrap();
        txn.rollback().unwrap();
        jobs
    }

    pub fn content(&self, kind: &str, id: &str) -> Option<ContentRow> {
        let txn = self.storage.begin().unwrap();
        let row = txn.get_content(kind, id, LockMode::None).unwrap();
        txn.rollback().unwrap();
        row
    }

    /// Every content row of a kind, ordered by id.
    pub fn content_rows(&self, kind: &str) -> Vec<ContentRow> {
        let txn = self.storage.begin().unwrap();
        let rows = txn
            .select_content(kind, &ContentQuery::new(10_000), None)
            .unwrap();
        txn.rollback().unwrap();
        rows
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Job definitions every harness starts with. Source and export paths point
/// into `dir`.
pub fn standard_definitions(dir: &Path) -> Vec<JobDefinition> {
    let file = |name: &str| dir.join(name).to_string_lossy().to_string();
    vec![
        JobDefinition::new("users-import", JobKind::Import, "USER")
            .with_property("source_path", file("users.jsonl")),
        JobDefinition::new("groups-import", JobKind::Import, "GROUP")
            .with_property("source_path", file("groups.jsonl")),
        JobDefinition::new("users-export", JobKind::Export, "USER")
            .with_plugin("jsonl")
            .with_property("export_path", file("export/users.jsonl")),
        JobDefinition::new("rebuild-all", JobKind::Rebuild, "*"),
        JobDefinition::new("archive-all", JobKind::Archive, "*")
            .with_property("retention_days", "30"),
    ]
}

/// A USER source record.
pub fn user(id: &str, login: &str) -> SourceRecord {
    SourceRecord::new(id)
        .with_attribute("login", login)
        .with_attribute("display_name", login.to_uppercase())
        .with_attribute("org_id", "o1")
}

/// Write records as JSON lines, replacing the file.
pub fn write_jsonl(path: &Path, records: &[SourceRecord]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    let mut file = File::create(path).unwrap();
    for record in records {
        writeln!(file, "{}", serde_json::to_string(record).unwrap()).unwrap();
    }
}

pub fn read_jsonl(path: &Path) -> Vec<SourceRecord> {
    let file = File::open(path).unwrap();
    BufReader::new(file)
        .lines()
        .map(|line| serde_json::from_str(&line.unwrap()).unwrap())
        .collect()
}

/// `(content_id, message)` pairs of a job's records, sorted.
pub fn record_summary(job: &Job) -> Vec<(String, String)> {
    let mut summary: Vec<(String, String)> = job
        .records
        .iter()
        .map(|r| (r.content_id.clone(), r.message.clone().unwrap_or_default()))
        .collect();
    summary.sort();
    summary
}
