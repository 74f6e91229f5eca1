//! Query specifications handed to the store.
//!
//! A query is a conjunction of predicates plus a lock mode and a chunk size.
//! Stores evaluate predicates with [`ContentQuery::matches`] /
//! [`WorkingQuery::matches`], so every backend filters the same way. Under
//! [`LockMode::Exclusive`] a store must re-evaluate the predicates after the
//! row lock is taken and drop rows that no longer qualify.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::content::{ContentRow, WorkingRow};

/// Default number of rows per page.
pub const DEFAULT_CHUNK_SIZE: usize = 500;

/// Whether selected rows are locked for the rest of the transaction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LockMode {
    #[default]
    None,
    Exclusive,
}

/// Filter over content rows.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentPredicate {
    IdIn(BTreeSet<String>),
    Enabled(bool),
    /// A working row with the same id exists
    InWorking,
    NotInWorking,
    /// A working row exists and its digest differs
    DigestDiffersFromWorking,
    /// A working row exists and its digest is equal
    DigestMatchesWorking,
    /// Enabled flag disagrees with validity at the instant
    StaleAt(DateTime<Utc>),
    /// Disabled and validity ended before the instant
    DisabledBefore(DateTime<Utc>),
    AttributeEquals { name: String, value: Value },
}

impl ContentPredicate {
    pub fn needs_working(&self) -> bool {
        matches!(
            self,
            Self::InWorking
                | Self::NotInWorking
                | Self::DigestDiffersFromWorking
                | Self::DigestMatchesWorking
        )
    }

    pub fn matches(&self, row: &ContentRow, working: Option<&WorkingRow>) -> bool {
        match self {
            Self::IdIn(ids) => ids.contains(&row.id),
            Self::Enabled(enabled) => row.enabled == *enabled,
            Self::InWorking => working.is_some(),
            Self::NotInWorking => working.is_none(),
            Self::DigestDiffersFromWorking => working.is_some_and(|w| w.digest != row.digest),
            Self::DigestMatchesWorking => working.is_some_and(|w| w.digest == row.digest),
            Self::StaleAt(at) => row.is_stale_at(*at),
            Self::DisabledBefore(at) => !row.enabled && row.validity.ended_before(*at),
            Self::AttributeEquals { name, value } => row.attributes.get(name) == Some(value),
        }
    }
}

/// Filter over working rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkingPredicate {
    IdIn(BTreeSet<String>),
    /// No content row with the same id exists
    NotInContent,
    InContent,
}

impl WorkingPredicate {
    pub fn needs_content(&self) -> bool {
        matches!(self, Self::NotInContent | Self::InContent)
    }

    pub fn matches(&self, row: &WorkingRow, content: Option<&ContentRow>) -> bool {
        match self {
            Self::IdIn(ids) => ids.contains(&row.id),
            Self::NotInContent => content.is_none(),
            Self::InContent => content.is_some(),
        }
    }
}

/// Paged, optionally locking query over one kind's content rows.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentQuery {
    pub predicates: Vec<ContentPredicate>,
    pub lock: LockMode,
    pub chunk_size: usize,
}

impl ContentQuery {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            predicates: Vec::new(),
            lock: LockMode::None,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn filter(mut self, predicate: ContentPredicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn filters(mut self, predicates: impl IntoIterator<Item = ContentPredicate>) -> Self {
        self.predicates.extend(predicates);
        self
    }

    pub fn locked(mut self) -> Self {
        self.lock = LockMode::Exclusive;
        self
    }

    pub fn needs_working(&self) -> bool {
        self.predicates.iter().any(ContentPredicate::needs_working)
    }

    /// Explicit id list, if the query is restricted to one.
    pub fn id_filter(&self) -> Option<&BTreeSet<String>> {
        self.predicates.iter().find_map(|p| match p {
            ContentPredicate::IdIn(ids) => Some(ids),
            _ => None,
        })
    }

    pub fn matches(&self, row: &ContentRow, working: Option<&WorkingRow>) -> bool {
        self.predicates.iter().all(|p| p.matches(row, working))
    }
}

/// Paged, optionally locking query over one kind's working rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkingQuery {
    pub predicates: Vec<WorkingPredicate>,
    pub lock: LockMode,
    pub chunk_size: usize,
}

impl WorkingQuery {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            predicates: Vec::new(),
            lock: LockMode::None,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn filter(mut self, predicate: WorkingPredicate) -> Self {
        self.predicates.push(predicate);
        self
    }

    pub fn locked(mut self) -> Self {
        self.lock = LockMode::Exclusive;
        self
    }

    pub fn needs_content(&self) -> bool {
        self.predicates.iter().any(WorkingPredicate::needs_content)
    }

    pub fn id_filter(&self) -> Option<&BTreeSet<String>> {
        self.predicates.iter().find_map(|p| match p {
            WorkingPredicate::IdIn(ids) => Some(ids),
            _ => None,
        })
    }

    pub fn matches(&self, row: &WorkingRow, content: Option<&ContentRow>) -> bool {
        self.predicates.iter().all(|p| p.matches(row, content))
    }
}
