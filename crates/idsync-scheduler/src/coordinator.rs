//! Job coordinator.
//!
//! Owns the job lifecycle: creates jobs from definitions, plans them from
//! recurrences, claims due jobs under row locks, runs each on a dedicated
//! thread and writes its outcome exactly once.
//!
//! State machine: SCHEDULE -> RUNNING -> {SUCCESS, FAILURE, ABORT}, plus
//! SCHEDULE -> {SUCCESS, FAILURE, ABORT} for jobs that finish without
//! running (validation failures, interrupts before start).

use std::collections::{BTreeMap, HashMap};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration as StdDuration, Instant};

use chrono::{DateTime, Duration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn};

use idsync_types::{
    Clock, DefinitionProvider, Job, JobDefinition, JobId, JobKind, JobStatus, JobTransaction,
    LockMode, NewJob, Store, StoreTransaction,
};

use crate::config::CoordinatorConfig;
use crate::context::{JobContext, JobOutcome};
use crate::error::CoordinatorError;
use crate::executor::JobExecutor;
use crate::registry::{JobRegistry, RunningJob};
use crate::resolver::ScheduleResolver;
use crate::stale::{LogStaleJobs, StaleAction, StaleJobHook};

/// Longest limit a job definition can ask for.
const MAX_TIMEOUT_SECS: i64 = 366 * 24 * 3600;

/// Request to create one job from a job definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub jobdef_id: String,
    /// Defaults to the clock's current time
    pub schedule_time: Option<DateTime<Utc>>,
    /// Override definition properties
    pub properties: BTreeMap<String, String>,
}

impl JobRequest {
    pub fn new(jobdef_id: impl Into<String>) -> Self {
        Self {
            jobdef_id: jobdef_id.into(),
            schedule_time: None,
            properties: BTreeMap::new(),
        }
    }

    pub fn at(mut self, schedule_time: DateTime<Utc>) -> Self {
        self.schedule_time = Some(schedule_time);
        self
    }

    pub fn with_property(mut self, name: &str, value: impl Into<String>) -> Self {
        self.properties.insert(name.to_string(), value.into());
        self
    }
}

/// What one poll did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Active, due jobs returned by the claim
    pub claimed: usize,
    /// Jobs moved to RUNNING and handed to a thread
    pub launched: Vec<JobId>,
    /// Jobs finalized without running
    pub rejected: Vec<JobId>,
    /// Stale jobs the hook asked to abort
    pub stale_aborted: Vec<JobId>,
    /// Owned jobs interrupted by the deadline watchdog
    pub interrupted: Vec<JobId>,
}

pub struct Coordinator<S: Store + 'static> {
    store: Arc<S>,
    definitions: Arc<dyn DefinitionProvider>,
    resolver: ScheduleResolver,
    clock: Arc<dyn Clock>,
    executors: HashMap<JobKind, Arc<dyn JobExecutor<S>>>,
    stale_hook: Arc<dyn StaleJobHook>,
    config: CoordinatorConfig,
    chunk_size: usize,
    registry: JobRegistry,
    threads: Mutex<HashMap<JobId, JoinHandle<()>>>,
}

impl<S: Store + 'static> Coordinator<S> {
    pub fn new(
        store: Arc<S>,
        definitions: Arc<dyn DefinitionProvider>,
        resolver: ScheduleResolver,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            definitions,
            resolver,
            clock,
            executors: HashMap::new(),
            stale_hook: Arc::new(LogStaleJobs),
            config: CoordinatorConfig::default(),
            chunk_size: idsync_types::query::DEFAULT_CHUNK_SIZE,
            registry: JobRegistry::new(),
            threads: Mutex::new(HashMap::new()),
        }
    }

    /// Register the body for one job kind, replacing any previous one.
    pub fn with_executor(mut self, executor: Arc<dyn JobExecutor<S>>) -> Self {
        self.executors.insert(executor.kind(), executor);
        self
    }

    pub fn with_executors(
        self,
        executors: impl IntoIterator<Item = Arc<dyn JobExecutor<S>>>,
    ) -> Self {
        executors.into_iter().fold(self, Self::with_executor)
    }

    pub fn with_stale_hook(mut self, hook: Arc<dyn StaleJobHook>) -> Self {
        self.stale_hook = hook;
        self
    }

    pub fn with_config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn definitions(&self) -> &dyn DefinitionProvider {
        self.definitions.as_ref()
    }

    pub fn resolver(&self) -> &ScheduleResolver {
        &self.resolver
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn enabled_definition(&self, jobdef_id: &str) -> Result<JobDefinition, CoordinatorError> {
        let definition = self
            .definitions
            .job_definition(jobdef_id)
            .ok_or_else(|| CoordinatorError::DefinitionNotFound(jobdef_id.to_string()))?;
        if !definition.enabled {
            return Err(CoordinatorError::DefinitionDisabled(jobdef_id.to_string()));
        }
        Ok(definition)
    }

    fn new_job(
        definition: &JobDefinition,
        schedule_time: DateTime<Utc>,
        overrides: BTreeMap<String, String>,
    ) -> NewJob {
        let timeout = i64::try_from(definition.timeout_secs)
            .unwrap_or(MAX_TIMEOUT_SECS)
            .min(MAX_TIMEOUT_SECS);
        let limit_time = schedule_time
            .checked_add_signed(Duration::seconds(timeout))
            .unwrap_or(schedule_time);

        let mut properties = definition.properties.clone();
        if let Some(plugin) = &definition.plugin {
            properties.insert("plugin".to_string(), plugin.clone());
        }
        properties.extend(overrides);

        NewJob {
            jobdef_id: definition.id.clone(),
            kind: definition.kind,
            target: definition.target.clone(),
            schedule_time,
            limit_time,
            properties,
        }
    }

    /// Create a job in SCHEDULE for an enabled definition.
    ///
    /// # Errors
    ///
    /// `DefinitionNotFound` or `DefinitionDisabled` for a bad definition id;
    /// store errors otherwise.
    pub fn create_job(&self, request: JobRequest) -> Result<Job, CoordinatorError> {
        let definition = self.enabled_definition(&request.jobdef_id)?;
        let schedule_time = request.schedule_time.unwrap_or_else(|| self.clock.now());
        let new = Self::new_job(&definition, schedule_time, request.properties);

        let txn = self.store.begin()?;
        let job = txn.create_job(new)?;
        txn.commit()?;

        info!(
            job_id = %job.id,
            jobdef = %job.jobdef_id,
            schedule_time = %job.schedule_time,
            "Job created"
        );
        Ok(job)
    }

    /// Resolve every enabled definition's recurrences over `[begin, end]` and
    /// create the jobs that do not exist yet.
    ///
    /// Returns only the newly created jobs; planning the same window twice
    /// creates nothing the second time.
    pub fn plan(
        &self,
        begin: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Job>, CoordinatorError> {
        let definitions: HashMap<String, JobDefinition> = self
            .definitions
            .job_definitions()
            .into_iter()
            .filter(|d| d.enabled)
            .map(|d| (d.id.clone(), d))
            .collect();

        let recurrences: Vec<_> = definitions
            .keys()
            .flat_map(|id| self.definitions.recurrences(id))
            .collect();
        let occurrences = self.resolver.resolve(&recurrences, begin, end)?;

        let txn = self.store.begin()?;
        let mut created = Vec::new();
        for occurrence in occurrences {
            let jobdef_id = &occurrence.definition.jobdef_id;
            let Some(definition) = definitions.get(jobdef_id) else {
                continue;
            };
            if txn
                .find_planned_job(jobdef_id, occurrence.timestamp)?
                .is_some()
            {
                continue;
            }
            let new = Self::new_job(definition, occurrence.timestamp, BTreeMap::new());
            created.push(txn.create_job(new)?);
        }
        txn.commit()?;

        if !created.is_empty() {
            info!(count = created.len(), %begin, %end, "Planned jobs");
        }
        Ok(created)
    }

    /// Claim due jobs, launch the ones in SCHEDULE, and handle overdue ones.
    ///
    /// # Errors
    ///
    /// Store errors, including `StoreError::LockTimeout` when another poller
    /// holds the claim. Nothing is retried here.
    pub fn poll(self: &Arc<Self>) -> Result<PollReport, CoordinatorError> {
        self.reap_threads();

        let now = self.clock.now();
        let mut report = PollReport::default();
        let mut launches = Vec::new();

        let txn = self.store.begin()?;
        let claimed = txn.lock_active_jobs(now);
        let staged = claimed.and_then(|jobs| {
            report.claimed = jobs.len();
            for job in jobs {
                if self.registry.is_running(job.id) {
                    continue;
                }
                match job.status {
                    JobStatus::Schedule if !self.executors.contains_key(&job.kind) => {
                        let message = format!("No executor registered for {} jobs", job.kind);
                        warn!(job_id = %job.id, kind = %job.kind, "Rejecting job without executor");
                        txn.append_messages(job.id, &[message])?;
                        txn.update_status(job.id, JobStatus::Failure, now)?;
                        report.rejected.push(job.id);
                    }
                    JobStatus::Schedule => {
                        let job = txn.update_status(job.id, JobStatus::Running, now)?;
                        let token = CancellationToken::new();
                        self.registry.record_start(
                            RunningJob {
                                job_id: job.id,
                                jobdef_id: job.jobdef_id.clone(),
                                kind: job.kind,
                                started_at: now,
                                limit_time: job.limit_time,
                            },
                            token.clone(),
                        );
                        launches.push((job, token));
                    }
                    JobStatus::Running if job.is_overdue(now) => {
                        if self.stale_hook.on_stale(&job, now) == StaleAction::Abort {
                            txn.append_messages(job.id, &["Aborted as stale".to_string()])?;
                            txn.update_status(job.id, JobStatus::Abort, now)?;
                            report.stale_aborted.push(job.id);
                        }
                    }
                    _ => {}
                }
            }
            Ok(())
        });

        if let Err(e) = staged.and_then(|()| txn.commit()) {
            for (job, _) in &launches {
                self.registry.record_complete(job.id);
            }
            return Err(e.into());
        }

        for (job, token) in launches {
            report.launched.push(job.id);
            self.launch(job, token);
        }

        if self.config.enforce_deadlines {
            for id in self.registry.overdue(now) {
                if self.registry.cancel(id) {
                    warn!(job_id = %id, "Interrupting job past its limit time");
                    report.interrupted.push(id);
                }
            }
        }

        if report != PollReport::default() {
            debug!(?report, "Poll finished");
        }
        Ok(report)
    }

    fn launch(self: &Arc<Self>, job: Job, token: CancellationToken) {
        let id = job.id;
        let coordinator = Arc::clone(self);
        let spawned = std::thread::Builder::new()
            .name(format!("idsync-job-{id}"))
            .spawn(move || coordinator.run(job, token));

        match spawned {
            Ok(handle) => {
                self.threads().insert(id, handle);
            }
            Err(e) => {
                error!(job_id = %id, error = %e, "Failed to start job thread");
                let outcome = JobOutcome::failed(format!("Failed to start job thread: {e}"));
                if let Err(e) = self.finalize(id, outcome) {
                    error!(job_id = %id, error = %e, "Failed to finalize job");
                }
            }
        }
    }

    /// Body of a job thread.
    fn run(&self, job: Job, token: CancellationToken) {
        let span = info_span!("job", job_id = %job.id, kind = %job.kind);
        let _entered = span.enter();
        let id = job.id;
        info!(jobdef = %job.jobdef_id, target = %job.target, "Job started");

        let outcome = match self.executors.get(&job.kind) {
            Some(executor) => {
                let mut ctx = JobContext::new(job, token, Arc::clone(&self.clock), self.chunk_size);
                let result =
                    panic::catch_unwind(AssertUnwindSafe(|| executor.execute(&self.store, &mut ctx)));
                let report = ctx.into_report();
                match result {
                    Ok(result) => JobOutcome::from_result(report, result),
                    Err(payload) => JobOutcome::Failed {
                        report,
                        error: format!("Job panicked: {}", panic_message(payload.as_ref())),
                    },
                }
            }
            None => JobOutcome::failed(format!("No executor registered for {} jobs", job.kind)),
        };

        if let Err(e) = self.finalize(id, outcome) {
            error!(error = %e, "Failed to finalize job");
        }
    }

    /// Write a job's outcome and move it to its terminal status.
    ///
    /// A job that is already terminal is returned unchanged. The job is
    /// released from this instance either way.
    pub fn finalize(&self, id: JobId, outcome: JobOutcome) -> Result<Job, CoordinatorError> {
        let result = self.finalize_row(id, outcome);
        self.registry.record_complete(id);
        result
    }

    fn finalize_row(&self, id: JobId, outcome: JobOutcome) -> Result<Job, CoordinatorError> {
        let txn = self.store.begin()?;
        let job = txn
            .get_job(id, LockMode::Exclusive)?
            .ok_or(CoordinatorError::JobNotFound(id))?;
        if job.status.is_terminal() {
            debug!(job_id = %id, status = %job.status, "Job already finalized");
            txn.rollback()?;
            return Ok(job);
        }

        let status = outcome.status();
        let (report, closing) = outcome.into_parts();
        let mut messages = report.messages;
        messages.extend(closing);
        if !messages.is_empty() {
            txn.append_messages(id, &messages)?;
        }
        if !report.records.is_empty() {
            txn.append_records(id, &report.records)?;
        }
        let job = txn.update_status(id, status, self.clock.now())?;
        txn.commit()?;

        info!(
            job_id = %id,
            status = %job.status,
            records = job.records.len(),
            "Job finalized"
        );
        Ok(job)
    }

    /// Interrupt a job.
    ///
    /// A job running here has its token tripped and ends in ABORT once its
    /// body notices. A job still in SCHEDULE is aborted directly. Returns
    /// `false` when there was nothing to interrupt.
    pub fn interrupt(&self, id: JobId) -> Result<bool, CoordinatorError> {
        if self.registry.is_running(id) {
            if self.registry.cancel(id) {
                info!(job_id = %id, "Interrupt delivered");
                return Ok(true);
            }
            debug!(job_id = %id, "Interrupt already pending");
            return Ok(false);
        }

        let txn = self.store.begin()?;
        let job = txn
            .get_job(id, LockMode::Exclusive)?
            .ok_or(CoordinatorError::JobNotFound(id))?;
        match job.status {
            JobStatus::Schedule => {
                txn.append_messages(id, &["Interrupted before start".to_string()])?;
                txn.update_status(id, JobStatus::Abort, self.clock.now())?;
                txn.commit()?;
                info!(job_id = %id, "Scheduled job aborted");
                Ok(true)
            }
            JobStatus::Running => {
                warn!(job_id = %id, "Job is running in another process");
                Ok(false)
            }
            _ => Ok(false),
        }
    }

    pub fn running_jobs(&self) -> Vec<RunningJob> {
        self.registry.running()
    }

    /// Plan ahead when asked to, then poll.
    pub fn tick(
        self: &Arc<Self>,
        plan: bool,
        horizon: Duration,
    ) -> Result<PollReport, CoordinatorError> {
        if plan {
            let now = self.clock.now();
            if let Err(e) = self.plan(now, now + horizon) {
                error!(error = %e, "Planning failed");
            }
        }
        self.poll()
    }

    /// Interrupt every owned job and wait up to `timeout` for their threads.
    ///
    /// Returns how many jobs were still running when the wait ended.
    pub fn shutdown(&self, timeout: StdDuration) -> usize {
        let cancelled = self.registry.cancel_all();
        if cancelled > 0 {
            info!(count = cancelled, "Interrupting running jobs");
        }

        let deadline = Instant::now() + timeout;
        while !self.registry.is_empty() && Instant::now() < deadline {
            std::thread::sleep(StdDuration::from_millis(20));
        }
        self.reap_threads();

        let remaining = self.registry.len();
        if remaining > 0 {
            warn!(remaining, "Jobs still running after shutdown timeout");
        }
        remaining
    }

    fn threads(&self) -> MutexGuard<'_, HashMap<JobId, JoinHandle<()>>> {
        self.threads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Join threads that have already finished.
    fn reap_threads(&self) {
        let finished: Vec<JoinHandle<()>> = {
            let mut threads = self.threads();
            let ids: Vec<JobId> = threads
                .iter()
                .filter(|(_, handle)| handle.is_finished())
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| threads.remove(&id)).collect()
        };
        for handle in finished {
            if handle.join().is_err() {
                warn!("Job thread ended with a panic");
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
