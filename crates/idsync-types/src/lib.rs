//! # idsync-types
//!
//! Shared domain types for the idsync platform.
//!
//! This crate defines the data structures and seams used throughout the system:
//! - Content and working rows, validity windows and reconciliation targets
//! - Jobs, their lifecycle states and per-content outcome records
//! - Job and recurrence definitions plus the provider the coordinator reads them from
//! - Query specifications and the transactional store traits
//! - Clock abstraction and layered settings
//!
//! ## Usage
//!
//! ```rust
//! use idsync_types::{JobStatus, Validity};
//!
//! assert!(JobStatus::Success.is_terminal());
//! assert!(Validity::always().contains(chrono::Utc::now()));
//! ```

pub mod clock;
pub mod config;
pub mod content;
pub mod definitions;
pub mod error;
pub mod job;
pub mod query;
pub mod recurrence;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{
    CoordinatorSettings, HeartbeatSettings, ReconcileSettings, Settings, StoreSettings,
};
pub use content::{Attributes, ContentRow, Targets, Validity, WorkingRow};
pub use definitions::{DefinitionProvider, JobDefinition, StaticDefinitions};
pub use error::{IdsyncError, StoreError};
pub use job::{Job, JobId, JobKind, JobRecord, JobStatus, NewJob, RecordKind};
pub use query::{ContentPredicate, ContentQuery, LockMode, WorkingPredicate, WorkingQuery};
pub use recurrence::{RecurrenceDefinition, RecurrenceRule};
pub use store::{ContentTransaction, JobTransaction, Store, StoreTransaction};
