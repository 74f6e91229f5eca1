//! Job bodies for the four job kinds.
//!
//! # Available Jobs
//!
//! - **import**: stage source records into working, reconcile, apply
//! - **rebuild**: flip enabled flags whose validity boundary was crossed
//! - **export**: write a kind's content rows to a sink
//! - **archive**: move long-disabled rows into the archive table
//!
//! Job properties read by the bodies:
//!
//! | Property | Jobs | Meaning |
//! |----------|------|---------|
//! | `plugin` | import, export | source or sink name (default `jsonl`) |
//! | `source_path` | import | JSON-lines input file |
//! | `export_path` | export | JSON-lines output file |
//! | `ids` | import | comma-separated ids to restrict the pass to |
//! | `delete_missing` | import | soft-delete rows absent from the source (default `true`) |
//! | `delete_where` | import | `attribute=value` narrowing deletions |
//! | `enabled_only` | export | skip disabled rows (default `false`) |
//! | `retention_days` | archive | days a row stays disabled before archiving (default 30) |

pub mod archive;
pub mod export;
pub mod import;
pub mod rebuild;
pub mod sink;
pub mod source;

use std::collections::BTreeMap;
use std::sync::Arc;

use idsync_reconcile::ContentKind;
use idsync_types::{Job, Store};

use crate::error::JobError;
use crate::executor::JobExecutor;

pub use archive::ArchiveJob;
pub use export::ExportJob;
pub use import::ImportJob;
pub use rebuild::RebuildJob;
pub use sink::{ContentSink, JsonLinesSink, SinkWriter};
pub use source::{ContentSource, JsonLinesSource, SourceRecord, SourceRecords};

/// Plugin used when a job names none.
pub const DEFAULT_PLUGIN: &str = "jsonl";

/// Named plugins selected per job by its `plugin` property.
pub struct Plugins<T: ?Sized> {
    entries: BTreeMap<String, Arc<T>>,
}

pub type SourceRegistry = Plugins<dyn ContentSource>;
pub type SinkRegistry = Plugins<dyn ContentSink>;

impl<T: ?Sized> Plugins<T> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, plugin: Arc<T>) -> Self {
        self.entries.insert(name.into(), plugin);
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// The plugin named by the job's `plugin` property.
    pub fn for_job(&self, job: &Job) -> Result<Arc<T>, JobError> {
        let name = job.property("plugin").unwrap_or(DEFAULT_PLUGIN);
        self.entries
            .get(name)
            .cloned()
            .ok_or_else(|| JobError::Invalid(format!("unknown plugin: {name}")))
    }
}

impl<T: ?Sized> Default for Plugins<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceRegistry {
    /// Registry holding the JSON-lines file source.
    pub fn standard() -> Self {
        Self::new().with(DEFAULT_PLUGIN, Arc::new(JsonLinesSource) as Arc<dyn ContentSource>)
    }
}

impl SinkRegistry {
    /// Registry holding the JSON-lines file sink.
    pub fn standard() -> Self {
        Self::new().with(DEFAULT_PLUGIN, Arc::new(JsonLinesSink) as Arc<dyn ContentSink>)
    }
}

/// Content kinds a job targets: one kind by name, or every kind for `*`.
pub fn content_kinds(target: &str) -> Result<Vec<&'static ContentKind>, JobError> {
    if target == "*" {
        return Ok(ContentKind::all().iter().collect());
    }
    ContentKind::lookup(target)
        .map(|kind| vec![kind])
        .ok_or_else(|| JobError::Invalid(format!("unknown content kind: {target}")))
}

/// Parse a boolean job property, falling back to `default` when absent.
pub(crate) fn flag(job: &Job, name: &str, default: bool) -> Result<bool, JobError> {
    match job.property(name) {
        None => Ok(default),
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| JobError::Invalid(format!("{name} must be true or false, got {value}"))),
    }
}

/// Executors for every job kind with the given plugins.
pub fn standard_executors<S: Store + 'static>(
    sources: SourceRegistry,
    sinks: SinkRegistry,
) -> Vec<Arc<dyn JobExecutor<S>>> {
    let import: Arc<dyn JobExecutor<S>> = Arc::new(ImportJob::new(sources));
    let rebuild: Arc<dyn JobExecutor<S>> = Arc::new(RebuildJob);
    let export: Arc<dyn JobExecutor<S>> = Arc::new(ExportJob::new(sinks));
    let archive: Arc<dyn JobExecutor<S>> = Arc::new(ArchiveJob);
    vec![import, rebuild, export, archive]
}


#[cfg(test)]
mod tests {
    use super::test_support::job;
    use super::*;
    use chrono::Utc;
    use idsync_types::JobKind;

    #[test]
    fn test_content_kinds() {
        assert_eq!(content_kinds("user").unwrap()[0].name, "USER");
        assert_eq!(content_kinds("*").unwrap().len(), 4);
        assert!(matches!(content_kinds("ROBOT"), Err(JobError::Invalid(_))));
    }

    #[test]
    fn test_plugin_selection() {
        let sources = SourceRegistry::standard();
        assert_eq!(sources.names().collect::<Vec<_>>(), vec!["jsonl"]);

        let default = job(JobKind::Import, "USER", &[], Utc::now());
        assert_eq!(sources.for_job(&default).unwrap().name(), "jsonl");

        let ldap = job(JobKind::Import, "USER", &[("plugin", "ldap")], Utc::now());
        assert!(matches!(sources.for_job(&ldap), Err(JobError::Invalid(_))));
    }

    #[test]
    fn test_flag_property() {
        let j = job(
            JobKind::Import,
            "USER",
            &[("delete_missing", "false"), ("enabled_only", "maybe")],
            Utc::now(),
        );
        assert!(!flag(&j, "delete_missing", true).unwrap());
        assert!(flag(&j, "absent", true).unwrap());
        assert!(flag(&j, "enabled_only", false).is_err());
    }
}
