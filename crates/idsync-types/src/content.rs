//! Content rows, staged working rows and the validity window they carry.
//!
//! A content row is the persisted, reconciled state of one entity of a
//! content kind (user, group, ...). A working row is a freshly staged copy
//! produced by an import, compared against content by digest.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Free-form attribute payload of a content row.
pub type Attributes = serde_json::Map<String, serde_json::Value>;

/// Closed time interval during which a content row is meant to be enabled.
///
/// A missing bound is open on that side.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validity {
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
}

impl Validity {
    /// Unbounded validity.
    pub fn always() -> Self {
        Self::default()
    }

    pub fn new(from: Option<DateTime<Utc>>, to: Option<DateTime<Utc>>) -> Self {
        Self { from, to }
    }

    /// Whether `at` lies within the window, bounds inclusive.
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from.map_or(true, |from| from <= at) && self.to.map_or(true, |to| at <= to)
    }

    /// Whether the window closed strictly before `at`.
    pub fn ended_before(&self, at: DateTime<Utc>) -> bool {
        self.to.is_some_and(|to| to < at)
    }
}

/// Persisted state of one content entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentRow {
    /// Content kind name (e.g. "USER")
    pub kind: String,

    /// Identifier, unique within the kind
    pub id: String,

    /// Whether the entity is currently active
    pub enabled: bool,

    /// Fingerprint over the kind's ordered fields, enabled flag and validity
    pub digest: String,

    #[serde(default)]
    pub validity: Validity,

    #[serde(default)]
    pub attributes: Attributes,
}

impl ContentRow {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
            enabled: true,
            digest: String::new(),
            validity: Validity::always(),
            attributes: Attributes::new(),
        }
    }

    /// Builder-style attribute setter.
    pub fn with_attribute(mut self, name: &str, value: impl Into<serde_json::Value>) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }

    pub fn with_validity(mut self, validity: Validity) -> Self {
        self.validity = validity;
        self
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// A row is stale when its enabled flag disagrees with its validity at `at`.
    pub fn is_stale_at(&self, at: DateTime<Utc>) -> bool {
        self.enabled != self.validity.contains(at)
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

/// A staged row awaiting reconciliation against content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkingRow {
    pub id: String,
    pub digest: String,

    /// The full row that would be written to content
    pub row: ContentRow,
}

impl WorkingRow {
    /// Stage a fully prepared content row (digest already computed).
    pub fn stage(row: ContentRow) -> Self {
        Self {
            id: row.id.clone(),
            digest: row.digest.clone(),
            row,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Which ids a reconciliation pass considers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Targets {
    /// Every row of the kind
    #[default]
    All,
    /// Only the listed ids
    Ids(BTreeSet<String>),
}

impl Targets {
    pub fn ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Targets::Ids(ids.into_iter().map(Into::into).collect())
    }

    pub fn includes(&self, id: &str) -> bool {
        match self {
            Targets::All => true,
            Targets::Ids(ids) => ids.contains(id),
        }
    }
}
