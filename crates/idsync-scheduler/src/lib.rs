//! # idsync-scheduler
//!
//! Turns recurrence definitions into jobs and runs them.
//!
//! This crate provides:
//! - [`ScheduleResolver`]: expands recurrence definitions into concrete,
//!   conflict-resolved occurrences over a time window
//! - [`Coordinator`]: creates and plans jobs, claims due jobs under row locks,
//!   launches each on its own thread and records the outcome
//! - [`Heartbeat`]: periodic driver that plans ahead and polls the coordinator
//! - [`jobs`]: the IMPORT, REBUILD, EXPORT and ARCHIVE job bodies
//!
//! ## Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use idsync_scheduler::{Coordinator, Heartbeat, HeartbeatConfig, ScheduleResolver};
//!
//! let coordinator = Arc::new(
//!     Coordinator::new(store, definitions, ScheduleResolver::new(tz), clock)
//!         .with_executors(executors),
//! );
//! let heartbeat = Heartbeat::new(coordinator, HeartbeatConfig::default());
//! heartbeat.start()?;
//! // ...
//! heartbeat.shutdown().await?;
//! ```

pub mod calendar;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod heartbeat;
pub mod jobs;
pub mod registry;
pub mod resolver;
pub mod stale;

pub use config::{parse_timezone, CoordinatorConfig, HeartbeatConfig, SchedulerConfig};
pub use context::{JobContext, JobOutcome, JobReport};
pub use coordinator::{Coordinator, JobRequest, PollReport};
pub use error::{CoordinatorError, JobError, ScheduleError, SchedulerError};
pub use executor::JobExecutor;
pub use heartbeat::Heartbeat;
pub use registry::{JobRegistry, RunningJob};
pub use resolver::{parse_definition, validate_definition, Occurrence, ScheduleResolver};
pub use stale::{AbortStaleJobs, LogStaleJobs, StaleAction, StaleJobHook};
