//! IMPORT job.
//!
//! Runs in two transactions:
//! 1. Stage: clear the kind's working rows and stage every valid source
//!    record. Invalid records become FAILURE records and are not staged.
//! 2. Apply: walk additions, updates and deletions from the reconciliation
//!    engine (all locked) and write them to content. Deletions are soft: the
//!    row is disabled and its validity closed.
//!
//! The apply transaction commits all changes or none; per-content records are
//! added to the job only after it commits.

use std::collections::BTreeSet;

use serde_json::Value;
use tracing::{debug, info};

use idsync_reconcile::{ContentKind, ReconcileEngine};
use idsync_types::{
    ContentPredicate, ContentTransaction, JobKind, JobRecord, Store, StoreTransaction, Targets,
    WorkingRow,
};

use crate::context::JobContext;
use crate::error::JobError;
use crate::executor::JobExecutor;
use crate::jobs::{flag, SourceRegistry};

pub struct ImportJob {
    sources: SourceRegistry,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct ImportCounts {
    staged: u64,
    rejected: u64,
    added: u64,
    updated: u64,
    deleted: u64,
}

impl ImportJob {
    pub fn new(sources: SourceRegistry) -> Self {
        Self { sources }
    }

    fn stage<S: Store>(
        &self,
        store: &S,
        kind: &'static ContentKind,
        ctx: &mut JobContext,
        counts: &mut ImportCounts,
    ) -> Result<(), JobError> {
        let source = self.sources.for_job(ctx.job())?;
        let now = ctx.now();
        let chunk_size = ctx.chunk_size();

        let txn = store.begin()?;
        let cleared = txn.clear_working_rows(kind.name)?;
        debug!(kind = %kind, cleared, "Cleared working rows");

        let mut batch = Vec::with_capacity(chunk_size);
        for record in source.open(ctx.job())? {
            let record = record?;
            let validity = record.validity();
            match kind.prepare(&record.id, record.attributes, validity, now) {
                Ok(row) => batch.push(WorkingRow::stage(row)),
                Err(reason) => {
                    counts.rejected += 1;
                    ctx.record(JobRecord::failure(record.id, reason));
                }
            }
            if batch.len() >= chunk_size {
                ctx.checkpoint()?;
                txn.append_working_rows(kind.name, &batch)?;
                counts.staged += batch.len() as u64;
                batch.clear();
            }
        }
        ctx.checkpoint()?;
        txn.append_working_rows(kind.name, &batch)?;
        counts.staged += batch.len() as u64;
        txn.commit()?;

        info!(kind = %kind, staged = counts.staged, rejected = counts.rejected, "Staged source records");
        Ok(())
    }

    fn apply<S: Store>(
        &self,
        store: &S,
        engine: &ReconcileEngine,
        ctx: &JobContext,
        counts: &mut ImportCounts,
    ) -> Result<Vec<JobRecord>, JobError> {
        let kind = engine.kind();
        let now = ctx.now();
        let targets = targets(ctx)?;
        let condition = deletion_condition(ctx, &targets)?;
        let mut records = Vec::new();

        let txn = store.begin()?;

        for id in engine.additions(&txn, &targets) {
            let id = id?;
            ctx.checkpoint()?;
            let working = txn
                .get_working(kind.name, &id)?
                .ok_or_else(|| JobError::Invalid(format!("working row {id} vanished")))?;
            txn.put_content(&working.row)?;
            counts.added += 1;
            records.push(JobRecord::success(id, "added"));
        }

        for row in engine.updates(&txn, &targets) {
            let row = row?;
            ctx.checkpoint()?;
            let working = txn
                .get_working(kind.name, &row.id)?
                .ok_or_else(|| JobError::Invalid(format!("working row {} vanished", row.id)))?;
            txn.put_content(&working.row)?;
            counts.updated += 1;
            records.push(JobRecord::success(row.id, "updated"));
        }

        if let Some(condition) = condition {
            for chunk in engine.deletions(&txn, &condition) {
                ctx.checkpoint()?;
                for mut row in chunk? {
                    kind.retire(&mut row, now);
                    txn.put_content(&row)?;
                    counts.deleted += 1;
                    records.push(JobRecord::deletion(row.id, "disabled"));
                }
            }
        }

        ctx.checkpoint()?;
        txn.commit()?;
        Ok(records)
    }
}

/// `ids` property as a target set.
fn targets(ctx: &JobContext) -> Result<Targets, JobError> {
    match ctx.property("ids") {
        None => Ok(Targets::All),
        Some(list) => {
            let ids: BTreeSet<String> = list
                .split(',')
                .map(str::trim)
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .collect();
            if ids.is_empty() {
                return Err(JobError::Invalid("ids property is empty".to_string()));
            }
            Ok(Targets::Ids(ids))
        }
    }
}

/// Extra predicates for deletions, or `None` when deletions are disabled.
fn deletion_condition(
    ctx: &JobContext,
    targets: &Targets,
) -> Result<Option<Vec<ContentPredicate>>, JobError> {
    if !flag(ctx.job(), "delete_missing", true)? {
        return Ok(None);
    }

    let mut condition = Vec::new();
    if let Targets::Ids(ids) = targets {
        condition.push(ContentPredicate::IdIn(ids.clone()));
    }
    if let Some(filter) = ctx.property("delete_where") {
        let (name, value) = filter.split_once('=').ok_or_else(|| {
            JobError::Invalid(format!("delete_where must be attribute=value, got {filter}"))
        })?;
        condition.push(ContentPredicate::AttributeEquals {
            name: name.trim().to_string(),
            value: Value::String(value.trim().to_string()),
        });
    }
    Ok(Some(condition))
}

impl<S: Store> JobExecutor<S> for ImportJob {
    fn kind(&self) -> JobKind {
        JobKind::Import
    }

    fn execute(&self, store: &S, ctx: &mut JobContext) -> Result<(), JobError> {
        let engine = ReconcileEngine::for_kind(&ctx.job().target, ctx.chunk_size())?;
        let mut counts = ImportCounts::default();

        self.stage(store, engine.kind(), ctx, &mut counts)?;
        let records = self.apply(store, &engine, ctx, &mut counts)?;
        ctx.extend_records(records);

        let summary = format!(
            "Imported {}: {} staged, {} added, {} updated, {} deleted, {} rejected",
            engine.kind(),
            counts.staged,
            counts.added,
            counts.updated,
            counts.deleted,
            counts.rejected
        );
        info!(kind = %engine.kind(), ?counts, "Import applied");
        ctx.message(summary);
        Ok(())
    }
}
