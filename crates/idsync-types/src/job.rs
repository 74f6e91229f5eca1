//! Jobs and their lifecycle.
//!
//! A job is one execution instance of a job definition. It moves through
//! `SCHEDULE -> RUNNING -> {SUCCESS, FAILURE, ABORT}`; a scheduled job may also
//! be finalized directly without running. Terminal states never change again.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::IdsyncError;

/// Monotonic job identifier assigned by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Schedule,
    Running,
    Abort,
    Success,
    Failure,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Abort | Self::Success | Self::Failure)
    }

    /// Active jobs are those the heartbeat still has to look at.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match self {
            Self::Schedule => next != Self::Schedule,
            Self::Running => next.is_terminal(),
            Self::Abort | Self::Success | Self::Failure => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Schedule => "SCHEDULE",
            Self::Running => "RUNNING",
            Self::Abort => "ABORT",
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a job does when it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobKind {
    /// Stage source records and reconcile them into content
    Import,
    /// Flip enabled flags that disagree with validity
    Rebuild,
    /// Write persisted content to a sink
    Export,
    /// Move long-disabled content out of the live table
    Archive,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Import => "IMPORT",
            Self::Rebuild => "REBUILD",
            Self::Export => "EXPORT",
            Self::Archive => "ARCHIVE",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = IdsyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "IMPORT" => Ok(Self::Import),
            "REBUILD" => Ok(Self::Rebuild),
            "EXPORT" => Ok(Self::Export),
            "ARCHIVE" => Ok(Self::Archive),
            other => Err(IdsyncError::InvalidInput(format!("unknown job kind: {other}"))),
        }
    }
}

/// Outcome category of one content entity touched by a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordKind {
    Success,
    Failure,
    Deletion,
}

/// Per-content outcome appended to a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub content_id: String,
    pub kind: RecordKind,
    #[serde(default)]
    pub message: Option<String>,
}

impl JobRecord {
    pub fn success(content_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(content_id, RecordKind::Success, message)
    }

    pub fn failure(content_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(content_id, RecordKind::Failure, message)
    }

    pub fn deletion(content_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(content_id, RecordKind::Deletion, message)
    }

    fn new(content_id: impl Into<String>, kind: RecordKind, message: impl Into<String>) -> Self {
        Self {
            content_id: content_id.into(),
            kind,
            message: Some(message.into()),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.kind == RecordKind::Failure
    }
}

/// Request to persist a new job; the store assigns the id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub jobdef_id: String,
    pub kind: JobKind,
    pub target: String,
    pub schedule_time: DateTime<Utc>,
    pub limit_time: DateTime<Utc>,
    pub properties: BTreeMap<String, String>,
}

/// A persisted job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub jobdef_id: String,
    pub kind: JobKind,

    /// Content kind (or other scope) the job acts on
    pub target: String,

    pub status: JobStatus,
    pub schedule_time: DateTime<Utc>,

    /// Deadline: schedule time plus the definition's timeout
    pub limit_time: DateTime<Utc>,

    #[serde(default)]
    pub begin_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub properties: BTreeMap<String, String>,

    #[serde(default)]
    pub result_messages: Vec<String>,

    #[serde(default)]
    pub records: Vec<JobRecord>,

    /// Incremented on every write
    pub version: u64,
}

impl Job {
    pub fn from_new(id: JobId, new: NewJob) -> Self {
        Self {
            id,
            jobdef_id: new.jobdef_id,
            kind: new.kind,
            target: new.target,
            status: JobStatus::Schedule,
            schedule_time: new.schedule_time,
            limit_time: new.limit_time,
            begin_time: None,
            end_time: None,
            properties: new.properties,
            result_messages: Vec::new(),
            records: Vec::new(),
            version: 0,
        }
    }

    /// Move to `next`, stamping begin/end times.
    ///
    /// # Errors
    ///
    /// Returns `IdsyncError::InvalidTransition` if the lifecycle forbids the move.
    pub fn transition(&mut self, next: JobStatus, at: DateTime<Utc>) -> Result<(), IdsyncError> {
        if !self.status.can_transition_to(next) {
            return Err(IdsyncError::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        if next == JobStatus::Running {
            self.begin_time = Some(at);
        }
        if next.is_terminal() {
            self.end_time = Some(at);
        }
        self.status = next;
        self.touch();
        Ok(())
    }

    pub fn touch(&mut self) {
        self.version += 1;
    }

    pub fn has_failures(&self) -> bool {
        self.records.iter().any(JobRecord::is_failure)
    }

    /// A job is overdue once `now` passes its limit time.
    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        now > self.limit_time
    }

    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties.get(name).map(String::as_str)
    }

    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserialize from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
