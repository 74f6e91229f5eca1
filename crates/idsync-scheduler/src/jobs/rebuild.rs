//! REBUILD job: bring enabled flags back in line with validity windows.
//!
//! The target is a content kind name, or `*` for every kind.

use tracing::info;

use idsync_reconcile::ReconcileEngine;
use idsync_types::{ContentTransaction, JobKind, JobRecord, Store, StoreTransaction};

use crate::context::JobContext;
use crate::error::JobError;
use crate::executor::JobExecutor;
use crate::jobs::content_kinds;

#[derive(Debug, Default, Clone, Copy)]
pub struct RebuildJob;

impl<S: Store> JobExecutor<S> for RebuildJob {
    fn kind(&self) -> JobKind {
        JobKind::Rebuild
    }

    fn execute(&self, store: &S, ctx: &mut JobContext) -> Result<(), JobError> {
        let now = ctx.now();
        for kind in content_kinds(&ctx.job().target)? {
            let engine = ReconcileEngine::new(kind, ctx.chunk_size());
            let mut records = Vec::new();

            let txn = store.begin()?;
            for chunk in engine.rebuilds(&txn, now) {
                ctx.checkpoint()?;
                for mut row in chunk? {
                    row.enabled = kind.validity_of(&row).contains(now);
                    kind.refresh(&mut row);
                    txn.put_content(&row)?;
                    let state = if row.enabled { "enabled" } else { "disabled" };
                    records.push(JobRecord::success(row.id, state));
                }
            }
            txn.commit()?;

            info!(kind = %kind, flipped = records.len(), "Rebuild applied");
            ctx.message(format!("Rebuilt {kind}: {} rows flipped", records.len()));
            ctx.extend_records(records);
        }
        Ok(())
    }
}
