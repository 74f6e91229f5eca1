//! Heartbeat driver.
//!
//! Owns a ticker task that waits the initial delay, then on every tick
//! optionally plans ahead and polls the coordinator. Ticks run on the
//! blocking pool because the coordinator talks to the store synchronously.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use idsync_types::Store;

use crate::config::HeartbeatConfig;
use crate::coordinator::Coordinator;
use crate::error::SchedulerError;

struct Ticker {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Periodic driver for a [`Coordinator`] with explicit start/stop.
pub struct Heartbeat<S: Store + 'static> {
    coordinator: Arc<Coordinator<S>>,
    config: HeartbeatConfig,
    ticker: Mutex<Option<Ticker>>,
    is_running: AtomicBool,
    ticks: Arc<AtomicU64>,
}

impl<S: Store + 'static> Heartbeat<S> {
    /// Create a heartbeat. Nothing runs until [`start`](Self::start).
    pub fn new(coordinator: Arc<Coordinator<S>>, config: HeartbeatConfig) -> Self {
        Self {
            coordinator,
            config,
            ticker: Mutex::new(None),
            is_running: AtomicBool::new(false),
            ticks: Arc::new(AtomicU64::new(0)),
        }
    }

    fn ticker(&self) -> MutexGuard<'_, Option<Ticker>> {
        self.ticker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Spawn the ticker task on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::AlreadyRunning` if the heartbeat is started.
    pub fn start(&self) -> Result<(), SchedulerError> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }

        let token = CancellationToken::new();
        let handle = tokio::spawn(run_ticker(
            Arc::clone(&self.coordinator),
            self.config.clone(),
            token.clone(),
            Arc::clone(&self.ticks),
        ));
        *self.ticker() = Some(Ticker { token, handle });

        info!(
            tick_ms = self.config.tick.as_millis() as u64,
            initial_delay_secs = self.config.initial_delay.as_secs(),
            "Heartbeat started"
        );
        Ok(())
    }

    /// Stop ticking. Jobs already launched keep running.
    ///
    /// # Errors
    ///
    /// Returns `SchedulerError::NotRunning` if the heartbeat is not started.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        let ticker = self.ticker().take().ok_or(SchedulerError::NotRunning)?;
        ticker.token.cancel();
        let joined = ticker.handle.await;
        self.is_running.store(false, Ordering::SeqCst);
        joined.map_err(|e| SchedulerError::Task(e.to_string()))?;

        info!("Heartbeat stopped");
        Ok(())
    }

    /// Stop ticking, then interrupt running jobs and wait for them up to
    /// the shutdown timeout. Returns how many were still running.
    pub async fn shutdown(&self) -> Result<usize, SchedulerError> {
        self.stop().await?;

        info!("Initiating job shutdown");
        let coordinator = Arc::clone(&self.coordinator);
        let timeout = self.config.shutdown_timeout;
        let remaining = tokio::task::spawn_blocking(move || coordinator.shutdown(timeout))
            .await
            .map_err(|e| SchedulerError::Task(e.to_string()))?;

        info!(remaining, "Heartbeat shutdown complete");
        Ok(remaining)
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Ticks completed since creation.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    pub fn coordinator(&self) -> &Arc<Coordinator<S>> {
        &self.coordinator
    }
}

async fn run_ticker<S: Store + 'static>(
    coordinator: Arc<Coordinator<S>>,
    config: HeartbeatConfig,
    token: CancellationToken,
    ticks: Arc<AtomicU64>,
) {
    tokio::select! {
        _ = token.cancelled() => return,
        _ = tokio::time::sleep(config.initial_delay) => {}
    }

    let mut interval = tokio::time::interval(config.tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut count: u64 = 0;

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = interval.tick() => {}
        }

        let plan = config.plan_every_ticks > 0 && count % config.plan_every_ticks == 0;
        count += 1;

        let tick_coordinator = Arc::clone(&coordinator);
        let horizon = config.plan_horizon;
        match tokio::task::spawn_blocking(move || tick_coordinator.tick(plan, horizon)).await {
            Ok(Ok(report)) => {
                if !report.launched.is_empty() {
                    debug!(launched = report.launched.len(), "Heartbeat launched jobs");
                }
            }
            // Retried on the next tick
            Ok(Err(e)) => warn!(error = %e, "Heartbeat tick failed"),
            Err(e) => error!(error = %e, "Heartbeat tick panicked"),
        }
        ticks.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::JobContext;
    use crate::coordinator::JobRequest;
    use crate::error::JobError;
    use crate::executor::JobExecutor;
    use crate::resolver::ScheduleResolver;
    use chrono::{TimeZone, Utc};
    use idsync_storage::Storage;
    use idsync_types::{
        Clock, JobDefinition, JobKind, JobStatus, JobTransaction, LockMode, ManualClock,
        RecurrenceDefinition, RecurrenceRule, StaticDefinitions,
    };
    use std::time::Duration;
    use tempfile::TempDir;

    struct Noop;

    impl<S: Store> JobExecutor<S> for Noop {
        fn kind(&self) -> JobKind {
            JobKind::Rebuild
        }

        fn execute(&self, _store: &S, ctx: &mut JobContext) -> Result<(), JobError> {
            ctx.message("rebuilt");
            Ok(())
        }
    }

    fn fast_config() -> HeartbeatConfig {
        HeartbeatConfig {
            tick: Duration::from_millis(20),
            initial_delay: Duration::ZERO,
            plan_every_ticks: 1,
            plan_horizon: chrono::Duration::hours(48),
            shutdown_timeout: Duration::from_secs(2),
        }
    }

    fn heartbeat(dir: &TempDir) -> Heartbeat<Storage> {
        let storage = Arc::new(Storage::open(dir.path()).unwrap());
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        ));
        let definitions = StaticDefinitions::new(
            vec![JobDefinition::new("rebuild-users", JobKind::Rebuild, "USER")],
            vec![RecurrenceDefinition {
                id: 1,
                jobdef_id: "rebuild-users".to_string(),
                priority: 0,
                rule: RecurrenceRule::Daily {
                    anchor: "2024-01-01T06:00:00".parse().unwrap(),
                    interval: 1,
                },
            }],
        );
        let coordinator = Coordinator::new(
            storage,
            Arc::new(definitions),
            ScheduleResolver::utc(),
            clock,
        )
        .with_executor(Arc::new(Noop));
        Heartbeat::new(Arc::new(coordinator), fast_config())
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..250 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_heartbeat_start_stop() {
        let dir = TempDir::new().unwrap();
        let heartbeat = heartbeat(&dir);
        assert!(!heartbeat.is_running());

        heartbeat.start().unwrap();
        assert!(heartbeat.is_running());
        assert!(matches!(heartbeat.start(), Err(SchedulerError::AlreadyRunning)));

        heartbeat.stop().await.unwrap();
        assert!(!heartbeat.is_running());
        assert!(matches!(heartbeat.stop().await, Err(SchedulerError::NotRunning)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_heartbeat_plans_and_runs_due_jobs() {
        let dir = TempDir::new().unwrap();
        let heartbeat = heartbeat(&dir);
        let job = heartbeat
            .coordinator()
            .create_job(JobRequest::new("rebuild-users"))
            .unwrap();

        heartbeat.start().unwrap();
        let coordinator = Arc::clone(heartbeat.coordinator());
        wait_for(|| {
            let txn = coordinator.store().begin().unwrap();
            txn.get_job(job.id, LockMode::None)
                .unwrap()
                .is_some_and(|j| j.status == JobStatus::Success)
        })
        .await;
        assert!(heartbeat.ticks() >= 1);

        // Occurrences on Jan 1 and Jan 2 at 06:00 were planned but are not due
        let txn = coordinator.store().begin().unwrap();
        let active = txn.list_jobs(false).unwrap();
        assert_eq!(active.len(), 2);
        assert!(active.iter().all(|j| j.status == JobStatus::Schedule));
        drop(txn);

        assert_eq!(heartbeat.shutdown().await.unwrap(), 0);
        assert!(!heartbeat.is_running());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stop_during_initial_delay() {
        let dir = TempDir::new().unwrap();
        let storage_heartbeat = heartbeat(&dir);
        let heartbeat = Heartbeat::new(
            Arc::clone(storage_heartbeat.coordinator()),
            HeartbeatConfig {
                initial_delay: Duration::from_secs(3600),
                ..fast_config()
            },
        );

        heartbeat.start().unwrap();
        heartbeat.stop().await.unwrap();
        assert_eq!(heartbeat.ticks(), 0);
    }
}
