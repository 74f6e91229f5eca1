//! Scheduler configuration.
//!
//! Runtime views of the `heartbeat`, `coordinator`, `reconcile` and
//! `timezone` settings, with durations and the timezone already parsed.

use std::time::Duration;

use chrono_tz::Tz;

use idsync_types::Settings;

use crate::error::ScheduleError;

/// Parse an IANA timezone identifier.
///
/// # Errors
///
/// Returns `ScheduleError::InvalidTimezone` if the string is not a known zone.
pub fn parse_timezone(tz: &str) -> Result<Tz, ScheduleError> {
    tz.parse::<Tz>()
        .map_err(|_| ScheduleError::InvalidTimezone(tz.to_string()))
}

/// Heartbeat timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatConfig {
    pub tick: Duration,
    pub initial_delay: Duration,
    /// Plan every N ticks; 0 disables planning
    pub plan_every_ticks: u64,
    pub plan_horizon: chrono::Duration,
    /// How long shutdown waits for running jobs
    pub shutdown_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            initial_delay: Duration::from_secs(10),
            plan_every_ticks: 60,
            plan_horizon: chrono::Duration::hours(24),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Coordinator policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Interrupt owned jobs past their limit time
    pub enforce_deadlines: bool,
}

/// Everything the daemon needs to assemble a scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub timezone: Tz,
    pub heartbeat: HeartbeatConfig,
    pub coordinator: CoordinatorConfig,
    /// Abort overdue RUNNING jobs nobody owns instead of only logging them
    pub abort_stale: bool,
    pub chunk_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            timezone: Tz::UTC,
            heartbeat: HeartbeatConfig::default(),
            coordinator: CoordinatorConfig::default(),
            abort_stale: false,
            chunk_size: idsync_types::query::DEFAULT_CHUNK_SIZE,
        }
    }
}

impl SchedulerConfig {
    /// # Errors
    ///
    /// Returns `ScheduleError::InvalidTimezone` for an unknown timezone.
    pub fn from_settings(settings: &Settings) -> Result<Self, ScheduleError> {
        let heartbeat = &settings.heartbeat;
        let horizon_hours = i64::try_from(heartbeat.plan_horizon_hours)
            .unwrap_or(i64::MAX)
            .min(24 * 366);

        Ok(Self {
            timezone: parse_timezone(&settings.timezone)?,
            heartbeat: HeartbeatConfig {
                tick: Duration::from_millis(heartbeat.tick_ms.max(1)),
                initial_delay: Duration::from_secs(heartbeat.initial_delay_secs),
                plan_every_ticks: heartbeat.plan_every_ticks,
                plan_horizon: chrono::Duration::hours(horizon_hours),
                shutdown_timeout: Duration::from_secs(heartbeat.shutdown_timeout_secs),
            },
            coordinator: CoordinatorConfig {
                enforce_deadlines: settings.coordinator.enforce_deadlines,
            },
            abort_stale: settings.coordinator.abort_stale,
            chunk_size: settings.reconcile.chunk_size.max(1),
        })
    }
}
