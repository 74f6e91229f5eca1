//! EXPORT job: write a kind's content rows to a sink.

use tracing::info;

use idsync_reconcile::ContentChunks;
use idsync_types::{ContentPredicate, ContentQuery, JobKind, Store};

use crate::context::JobContext;
use crate::error::JobError;
use crate::executor::JobExecutor;
use crate::jobs::{content_kinds, flag, SinkRegistry};

pub struct ExportJob {
    sinks: SinkRegistry,
}

impl ExportJob {
    pub fn new(sinks: SinkRegistry) -> Self {
        Self { sinks }
    }
}

impl<S: Store> JobExecutor<S> for ExportJob {
    fn kind(&self) -> JobKind {
        JobKind::Export
    }

    fn execute(&self, store: &S, ctx: &mut JobContext) -> Result<(), JobError> {
        let kinds = content_kinds(&ctx.job().target)?;
        let [kind] = kinds[..] else {
            return Err(JobError::Invalid("export needs a single content kind".to_string()));
        };
        let sink = self.sinks.for_job(ctx.job())?;

        let mut query = ContentQuery::new(ctx.chunk_size());
        if flag(ctx.job(), "enabled_only", false)? {
            query = query.filter(ContentPredicate::Enabled(true));
        }

        // Read-only snapshot; dropped without commit
        let txn = store.begin()?;
        let mut writer = sink.open(ctx.job())?;
        for chunk in ContentChunks::new(&txn, kind.name, query) {
            ctx.checkpoint()?;
            for row in chunk? {
                writer.write(&row)?;
            }
        }
        let written = writer.finish()?;
        drop(txn);

        info!(kind = %kind, written, sink = sink.name(), "Export finished");
        ctx.message(format!("Exported {written} {kind} rows to {}", sink.name()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::source::JsonLinesSource;
    use crate::jobs::test_support::{context, job};
    use chrono::{TimeZone, Utc};
    use idsync_storage::Storage;
    use idsync_types::{ContentRow, ContentTransaction, StoreTransaction};
    use tempfile::TempDir;

    fn seeded() -> (Storage, TempDir) {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        let txn = storage.begin().unwrap();
        txn.put_content(&ContentRow::new("USER", "u1").with_attribute("login", "ada"))
            .unwrap();
        txn.put_content(
            &ContentRow::new("USER", "u2")
                .with_attribute("login", "bob")
                .with_enabled(false),
        )
        .unwrap();
        txn.put_content(&ContentRow::new("GROUP", "g1").with_attribute("name", "ops"))
            .unwrap();
        txn.commit().unwrap();
        (storage, dir)
    }

    #[test]
    fn test_export_writes_kind_rows() {
        let (storage, dir) = seeded();
        let path = dir.path().join("out.jsonl");
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let props = [("export_path", path.to_str().unwrap())];

        let export = ExportJob::new(SinkRegistry::standard());
        let (mut ctx, _token) = context(job(JobKind::Export, "USER", &props, at), at, 1);
        export.execute(&storage, &mut ctx).unwrap();

        let ids: Vec<String> = JsonLinesSource::read(&path)
            .unwrap()
            .map(|r| r.unwrap().id)
            .collect();
        assert_eq!(ids, vec!["u1", "u2"]);
        assert_eq!(
            ctx.into_report().messages,
            vec!["Exported 2 USER rows to jsonl".to_string()]
        );
    }

    #[test]
    fn test_export_enabled_only() {
        let (storage, dir) = seeded();
        let path = dir.path().join("enabled.jsonl");
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let props = [
            ("export_path", path.to_str().unwrap()),
            ("enabled_only", "true"),
        ];

        let export = ExportJob::new(SinkRegistry::standard());
        let (mut ctx, _token) = context(job(JobKind::Export, "USER", &props, at), at, 10);
        export.execute(&storage, &mut ctx).unwrap();

        assert_eq!(JsonLinesSource::read(&path).unwrap().count(), 1);
    }

    #[test]
    fn test_export_requires_path_and_single_kind() {
        let (storage, _dir) = seeded();
        let at = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let export = ExportJob::new(SinkRegistry::standard());

        let (mut ctx, _token) = context(job(JobKind::Export, "USER", &[], at), at, 10);
        assert!(matches!(
            export.execute(&storage, &mut ctx),
            Err(JobError::Invalid(_))
        ));

        let (mut ctx, _token) = context(job(JobKind::Export, "*", &[], at), at, 10);
        assert!(matches!(
            export.execute(&storage, &mut ctx),
            Err(JobError::Invalid(_))
        ));
    }
}
