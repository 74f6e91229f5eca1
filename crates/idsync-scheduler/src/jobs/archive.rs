//! ARCHIVE job: move disabled rows whose validity ended more than
//! `retention_days` ago from content into the archive table.

use chrono::Duration;
use tracing::info;

use idsync_reconcile::ContentChunks;
use idsync_types::{
    ContentPredicate, ContentQuery, ContentTransaction, JobKind, JobRecord, Store,
    StoreTransaction,
};

use crate::context::JobContext;
use crate::error::JobError;
use crate::executor::JobExecutor;
use crate::jobs::content_kinds;

/// Retention when the job names none.
pub const DEFAULT_RETENTION_DAYS: i64 = 30;

#[derive(Debug, Default, Clone, Copy)]
pub struct ArchiveJob;

fn retention(ctx: &JobContext) -> Result<Duration, JobError> {
    let days = match ctx.property("retention_days") {
        None => DEFAULT_RETENTION_DAYS,
        Some(value) => value
            .trim()
            .parse::<i64>()
            .ok()
            .filter(|d| (0..=36_500).contains(d))
            .ok_or_else(|| JobError::Invalid(format!("invalid retention_days: {value}")))?,
    };
    Ok(Duration::days(days))
}

impl<S: Store> JobExecutor<S> for ArchiveJob {
    fn kind(&self) -> JobKind {
        JobKind::Archive
    }

    fn execute(&self, store: &S, ctx: &mut JobContext) -> Result<(), JobError> {
        let cutoff = ctx.now() - retention(ctx)?;

        for kind in content_kinds(&ctx.job().target)? {
            let query = ContentQuery::new(ctx.chunk_size())
                .filter(ContentPredicate::DisabledBefore(cutoff))
                .locked();

            let txn = store.begin()?;
            let mut records = Vec::new();
            for chunk in ContentChunks::new(&txn, kind.name, query) {
                ctx.checkpoint()?;
                for row in chunk? {
                    txn.archive_content(&row)?;
                    records.push(JobRecord::deletion(row.id, "archived"));
                }
            }
            txn.commit()?;

            info!(kind = %kind, archived = records.len(), %cutoff, "Archive applied");
            ctx.message(format!("Archived {} {kind} rows", records.len()));
            ctx.extend_records(records);
        }
        Ok(())
    }
}
