//! Command implementations for the idsync binary.
//!
//! Handles:
//! - start: load config, open storage, drive the heartbeat until a signal
//! - submit: create one job, optionally run it here and wait
//! - jobs: list jobs
//! - preview: resolve a job definition's recurrences over a window
//! - reconcile: dry-run reconciliation counts for one content kind
//!
//! RocksDB admits one process per database, so every command that opens
//! storage must run while the daemon is stopped.

use std::fs;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use tokio::signal;
use tracing::{info, warn};

use idsync_reconcile::{ReconcileEngine, ReconcilePlan};
use idsync_scheduler::jobs::{standard_executors, SinkRegistry, SourceRegistry};
use idsync_scheduler::{
    parse_timezone, validate_definition, AbortStaleJobs, Coordinator, Heartbeat, JobRequest,
    LogStaleJobs, Occurrence, ScheduleResolver, SchedulerConfig, StaleJobHook,
};
use idsync_storage::{Storage, StorageOptions};
use idsync_types::{
    Clock, DefinitionProvider, Job, JobId, JobStatus, JobTransaction, LockMode, Settings,
    StaticDefinitions, Store, StoreTransaction, SystemClock, Targets,
};

/// Pause between polls while `submit --wait` waits for its job.
const WAIT_POLL_INTERVAL: StdDuration = StdDuration::from_millis(200);

/// Load settings and apply CLI overrides (highest precedence).
pub fn load_settings(
    config_path: Option<&str>,
    db_path_override: Option<&str>,
    log_level_override: Option<&str>,
) -> Result<Settings> {
    let mut settings = Settings::load(config_path).context("Failed to load configuration")?;
    if let Some(db_path) = db_path_override {
        settings.db_path = db_path.to_string();
    }
    if let Some(log_level) = log_level_override {
        settings.log_level = log_level.to_string();
    }
    Ok(settings)
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
/// Logs go to stderr so command output on stdout stays parseable.
fn init_logging(log_level: &str) -> Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")
}

/// Open the RocksDB store named by the settings, creating parent directories.
pub fn open_storage(settings: &Settings) -> Result<Arc<Storage>> {
    let db_path = settings.expanded_db_path();
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let options = StorageOptions {
        lock_timeout_ms: settings.store.lock_timeout_ms,
    };
    let storage = Storage::open_with_options(&db_path, options).context("Failed to open storage")?;
    Ok(Arc::new(storage))
}

/// Wire a coordinator from settings: definitions, resolver timezone, the
/// standard job bodies, stale-job policy and chunk size.
pub fn build_coordinator(
    settings: &Settings,
    storage: Arc<Storage>,
    clock: Arc<dyn Clock>,
) -> Result<(Arc<Coordinator<Storage>>, SchedulerConfig)> {
    let config = SchedulerConfig::from_settings(settings).context("Invalid scheduler settings")?;
    for recurrence in &settings.recurrences {
        validate_definition(recurrence)
            .with_context(|| format!("Invalid recurrence {}", recurrence.id))?;
    }

    let definitions: Arc<dyn DefinitionProvider> =
        Arc::new(StaticDefinitions::from_settings(settings));
    let stale_hook: Arc<dyn StaleJobHook> = if config.abort_stale {
        Arc::new(AbortStaleJobs)
    } else {
        Arc::new(LogStaleJobs)
    };

    let coordinator = Coordinator::new(
        storage,
        definitions,
        ScheduleResolver::new(config.timezone),
        clock,
    )
    .with_executors(standard_executors::<Storage>(
        SourceRegistry::standard(),
        SinkRegistry::standard(),
    ))
    .with_stale_hook(stale_hook)
    .with_config(config.coordinator)
    .with_chunk_size(config.chunk_size);

    Ok((Arc::new(coordinator), config))
}

/// Start the daemon.
///
/// 1. Load configuration (defaults -> file -> env -> CLI)
/// 2. Open RocksDB storage
/// 3. Start the heartbeat
/// 4. On SIGINT/SIGTERM, stop ticking and interrupt running jobs
pub async fn start_daemon(
    config_path: Option<&str>,
    db_path_override: Option<&str>,
    log_level_override: Option<&str>,
) -> Result<()> {
    let settings = load_settings(config_path, db_path_override, log_level_override)?;
    init_logging(&settings.log_level)?;

    info!("idsync daemon starting...");
    info!("Configuration:");
    info!("  Database path: {}", settings.db_path);
    info!("  Timezone: {}", settings.timezone);
    info!("  Log level: {}", settings.log_level);
    info!(
        "  Definitions: {} jobs, {} recurrences",
        settings.job_definitions.len(),
        settings.recurrences.len()
    );

    let storage = open_storage(&settings)?;
    let (coordinator, config) = build_coordinator(&settings, storage, Arc::new(SystemClock))?;

    let heartbeat = Heartbeat::new(coordinator, config.heartbeat.clone());
    heartbeat.start().context("Failed to start heartbeat")?;

    shutdown_signal().await?;

    let remaining = heartbeat
        .shutdown()
        .await
        .context("Failed to stop heartbeat")?;
    if remaining > 0 {
        warn!(remaining, "Exiting with jobs still running");
    }
    info!("idsync daemon stopped");
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("Failed to install SIGTERM handler")?;
        tokio::select! {
            result = signal::ctrl_c() => {
                result.context("Failed to listen for Ctrl+C")?;
                info!("Received Ctrl+C, shutting down...");
            }
            _ = terminate.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl+C")?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

/// Create a job from `jobdef_id`. With `wait`, poll in this process until
/// the job is finished and fail unless it succeeded.
pub async fn submit_job(
    settings: &Settings,
    storage: Arc<Storage>,
    jobdef_id: &str,
    at: Option<DateTime<Utc>>,
    properties: Vec<(String, String)>,
    wait: bool,
) -> Result<Job> {
    let (coordinator, config) = build_coordinator(settings, storage, Arc::new(SystemClock))?;

    let mut request = JobRequest::new(jobdef_id);
    if let Some(at) = at {
        request = request.at(at);
    }
    for (name, value) in properties {
        request = request.with_property(&name, value);
    }
    let job = coordinator
        .create_job(request)
        .with_context(|| format!("Failed to create job from {jobdef_id}"))?;
    println!(
        "Created job {} ({} {}) scheduled at {}",
        job.id,
        job.kind,
        job.target,
        job.schedule_time.to_rfc3339()
    );

    if !wait {
        return Ok(job);
    }
    if job.schedule_time > coordinator.now() {
        bail!(
            "Job {} is scheduled in the future; start the daemon to run it",
            job.id
        );
    }

    let finished = wait_for_job(&coordinator, job.id).await?;
    if !coordinator.running_jobs().is_empty() {
        // Other due jobs were claimed by the same polls.
        let timeout = config.heartbeat.shutdown_timeout;
        let waiter = Arc::clone(&coordinator);
        tokio::task::spawn_blocking(move || waiter.shutdown(timeout))
            .await
            .context("Shutdown task failed")?;
    }

    print!("{}", describe_job(&finished));
    if finished.status != JobStatus::Success {
        bail!("Job {} finished with {}", finished.id, finished.status);
    }
    Ok(finished)
}

async fn wait_for_job(coordinator: &Arc<Coordinator<Storage>>, id: JobId) -> Result<Job> {
    loop {
        coordinator.poll().context("Failed to poll jobs")?;

        let txn = coordinator.store().begin()?;
        let job = txn.get_job(id, LockMode::None)?;
        txn.rollback()?;

        match job {
            Some(job) if job.status.is_terminal() => return Ok(job),
            Some(_) => tokio::time::sleep(WAIT_POLL_INTERVAL).await,
            None => bail!("Job {id} not found"),
        }
    }
}

/// Jobs ordered by id; finished ones only with `include_terminal`.
pub fn list_jobs(storage: &Storage, include_terminal: bool) -> Result<Vec<Job>> {
    let txn = storage.begin()?;
    let jobs = txn.list_jobs(include_terminal)?;
    txn.rollback()?;
    Ok(jobs)
}

/// Occurrences of `jobdef_id` in `[from, to]`. Needs no storage.
pub fn preview_schedule(
    settings: &Settings,
    jobdef_id: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<Vec<Occurrence>> {
    let definitions = StaticDefinitions::from_settings(settings);
    if definitions.job_definition(jobdef_id).is_none() {
        bail!("Unknown job definition: {jobdef_id}");
    }
    let tz = parse_timezone(&settings.timezone).context("Invalid timezone")?;
    let resolver = ScheduleResolver::new(tz);
    let occurrences = resolver
        .preview(jobdef_id, &definitions.recurrences(jobdef_id), from, to)
        .context("Failed to resolve recurrences")?;
    Ok(occurrences)
}

/// Bucket counts for `kind` over every row, read-only. Staleness is judged
/// at `clock.now()`.
pub fn reconcile_plan(
    storage: &Storage,
    kind: &str,
    chunk_size: usize,
    clock: &dyn Clock,
) -> Result<ReconcilePlan> {
    let engine = ReconcileEngine::for_kind(kind, chunk_size)?;
    let txn = storage.begin()?;
    let plan = engine.plan(&txn, &Targets::All, &[], clock.now());
    txn.rollback()?;
    Ok(plan?)
}

/// Multi-line summary of a job, its messages and records.
pub fn describe_job(job: &Job) -> String {
    let mut out = format!(
        "Job {}: {} {} {} [{}]\n  scheduled {}  limit {}\n",
        job.id,
        job.kind,
        job.target,
        job.jobdef_id,
        job.status,
        job.schedule_time.to_rfc3339(),
        job.limit_time.to_rfc3339(),
    );
    if let (Some(begin), Some(end)) = (job.begin_time, job.end_time) {
        out.push_str(&format!(
            "  ran {} -> {} ({} ms)\n",
            begin.to_rfc3339(),
            end.to_rfc3339(),
            (end - begin).num_milliseconds()
        ));
    }
    for message in &job.result_messages {
        out.push_str(&format!("  - {message}\n"));
    }
    for record in &job.records {
        out.push_str(&format!(
            "  {:?} {}: {}\n",
            record.kind,
            record.content_id,
            record.message.as_deref().unwrap_or("")
        ));
    }
    out
}

fn print_jobs(jobs: &[Job]) {
    if jobs.is_empty() {
        println!("No jobs");
        return;
    }
    println!(
        "{:>8}  {:<8}  {:<8}  {:<12}  {:<24}  SCHEDULED",
        "ID", "STATUS", "KIND", "TARGET", "JOBDEF"
    );
    for job in jobs {
        println!(
            "{:>8}  {:<8}  {:<8}  {:<12}  {:<24}  {}",
            job.id.0,
            job.status.as_str(),
            job.kind.as_str(),
            job.target,
            job.jobdef_id,
            job.schedule_time.to_rfc3339()
        );
    }
}

fn print_occurrences(occurrences: &[Occurrence], tz: chrono_tz::Tz) {
    if occurrences.is_empty() {
        println!("No occurrences in window");
        return;
    }
    for occurrence in occurrences {
        println!(
            "{}  ({})  recurrence {} {} priority {}",
            occurrence.timestamp.to_rfc3339(),
            occurrence.timestamp.with_timezone(&tz).format("%a %Y-%m-%d %H:%M %Z"),
            occurrence.definition.id,
            occurrence.definition.rule.kind_name(),
            occurrence.definition.priority
        );
    }
}

fn print_plan(kind: &str, plan: &ReconcilePlan) {
    println!("Reconcile plan for {}:", kind.to_ascii_uppercase());
    println!("  additions: {}", plan.additions);
    println!("  updates:   {}", plan.updates);
    println!("  unchanged: {}", plan.unchanged);
    println!("  deletions: {}", plan.deletions);
    println!("  stale:     {}", plan.stale);
}

/// Shared entry for the one-shot commands: load settings, set up logging.
fn prepare(
    config_path: Option<&str>,
    db_path_override: Option<&str>,
    log_level_override: Option<&str>,
) -> Result<Settings> {
    let settings = load_settings(config_path, db_path_override, log_level_override)?;
    init_logging(&settings.log_level)?;
    Ok(settings)
}

pub async fn handle_submit(
    config_path: Option<&str>,
    db_path_override: Option<&str>,
    log_level_override: Option<&str>,
    jobdef_id: &str,
    at: Option<DateTime<Utc>>,
    properties: Vec<(String, String)>,
    wait: bool,
) -> Result<()> {
    let settings = prepare(config_path, db_path_override, log_level_override)?;
    let storage = open_storage(&settings)?;
    submit_job(&settings, storage, jobdef_id, at, properties, wait).await?;
    Ok(())
}

pub fn handle_jobs(
    config_path: Option<&str>,
    db_path_override: Option<&str>,
    log_level_override: Option<&str>,
    all: bool,
) -> Result<()> {
    let settings = prepare(config_path, db_path_override, log_level_override)?;
    let storage = open_storage(&settings)?;
    print_jobs(&list_jobs(&storage, all)?);
    Ok(())
}

pub fn handle_preview(
    config_path: Option<&str>,
    log_level_override: Option<&str>,
    jobdef_id: &str,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> Result<()> {
    let settings = prepare(config_path, None, log_level_override)?;
    let occurrences = preview_schedule(&settings, jobdef_id, from, to)?;
    let tz = parse_timezone(&settings.timezone).context("Invalid timezone")?;
    print_occurrences(&occurrences, tz);
    Ok(())
}

pub fn handle_reconcile(
    config_path: Option<&str>,
    db_path_override: Option<&str>,
    log_level_override: Option<&str>,
    kind: &str,
) -> Result<()> {
    let settings = prepare(config_path, db_path_override, log_level_override)?;
    let storage = open_storage(&settings)?;
    let plan = reconcile_plan(&storage, kind, settings.reconcile.chunk_size, &SystemClock)?;
    print_plan(kind, &plan);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use idsync_types::{
        ContentRow, ContentTransaction, JobDefinition, JobKind, ManualClock, RecurrenceDefinition,
        RecurrenceRule, Validity,
    };
    use tempfile::TempDir;

    fn settings(temp: &TempDir) -> Settings {
        let anchor = chrono::NaiveDate::from_ymd_opt(2024, 1, 1)
            .unwrap()
            .and_hms_opt(6, 0, 0)
            .unwrap();
        Settings {
            db_path: temp.path().join("db").to_string_lossy().to_string(),
            job_definitions: vec![JobDefinition::new("nightly", JobKind::Rebuild, "*")],
            recurrences: vec![RecurrenceDefinition {
                id: 1,
                jobdef_id: "nightly".to_string(),
                priority: 0,
                rule: RecurrenceRule::Daily {
                    anchor,
                    interval: 1,
                },
            }],
            ..Settings::default()
        }
    }

    #[test]
    fn test_load_settings_applies_overrides() {
        let settings = load_settings(None, Some("/custom/db"), Some("debug")).unwrap();
        assert_eq!(settings.db_path, "/custom/db");
        assert_eq!(settings.log_level, "debug");
    }

    #[test]
    fn test_preview_schedule() {
        let temp = TempDir::new().unwrap();
        let settings = settings(&temp);
        let from = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let to = Utc.with_ymd_and_hms(2024, 1, 3, 23, 0, 0).unwrap();

        let occurrences = preview_schedule(&settings, "nightly", from, to).unwrap();
        let hours: Vec<_> = occurrences.iter().map(|o| o.timestamp).collect();
        assert_eq!(
            hours,
            vec![
                Utc.with_ymd_and_hms(2024, 1, 1, 6, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 1, 2, 6, 0, 0).unwrap(),
                Utc.with_ymd_and_hms(2024, 1, 3, 6, 0, 0).unwrap(),
            ]
        );
        assert!(preview_schedule(&settings, "missing", from, to).is_err());
        assert!(preview_schedule(&settings, "nightly", to, from).is_err());
    }

    #[test]
    fn test_build_coordinator_rejects_invalid_recurrence() {
        let temp = TempDir::new().unwrap();
        let mut settings = settings(&temp);
        if let RecurrenceRule::Daily { interval, .. } = &mut settings.recurrences[0].rule {
            *interval = 0;
        }
        let storage = open_storage(&settings).unwrap();
        assert!(build_coordinator(&settings, storage, Arc::new(SystemClock)).is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_submit_wait_then_list() {
        let temp = TempDir::new().unwrap();
        let settings = settings(&temp);

        let storage = open_storage(&settings).unwrap();

        let job = submit_job(&settings, Arc::clone(&storage), "nightly", None, Vec::new(), true)
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Success);
        assert!(describe_job(&job).contains("[SUCCESS]"));

        assert!(list_jobs(&storage, false).unwrap().is_empty());
        let all = list_jobs(&storage, true).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].id, job.id);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_submit_without_wait_leaves_job_scheduled() {
        let temp = TempDir::new().unwrap();
        let settings = settings(&temp);
        let at = Utc.with_ymd_and_hms(2099, 1, 1, 0, 0, 0).unwrap();

        let storage = open_storage(&settings).unwrap();

        let job = submit_job(&settings, Arc::clone(&storage), "nightly", Some(at), Vec::new(), false)
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Schedule);

        let active = list_jobs(&storage, false).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].schedule_time, at);

        assert!(submit_job(&settings, storage, "unknown", None, Vec::new(), false)
            .await
            .is_err());
    }

    #[test]
    fn test_reconcile_plan_on_empty_store() {
        let temp = TempDir::new().unwrap();
        let settings = settings(&temp);

        let storage = open_storage(&settings).unwrap();

        assert_eq!(
            reconcile_plan(&storage, "user", 10, &SystemClock).unwrap(),
            ReconcilePlan::default()
        );
        assert!(reconcile_plan(&storage, "device", 10, &SystemClock).is_err());
    }

    #[test]
    fn test_reconcile_plan_judges_staleness_at_clock_time() {
        let temp = TempDir::new().unwrap();
        let settings = settings(&temp);
        let storage = open_storage(&settings).unwrap();

        let expiry = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let txn = storage.begin().unwrap();
        txn.put_content(
            &ContentRow::new("USER", "u1")
                .with_attribute("login", "ada")
                .with_enabled(true)
                .with_validity(Validity::new(None, Some(expiry))),
        )
        .unwrap();
        txn.commit().unwrap();

        let before = ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(reconcile_plan(&storage, "user", 10, &before).unwrap().stale, 0);

        let after = ManualClock::new(Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap());
        assert_eq!(reconcile_plan(&storage, "user", 10, &after).unwrap().stale, 1);
    }
}
