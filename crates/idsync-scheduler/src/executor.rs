//! Job body seam.

use idsync_types::{JobKind, Store};

use crate::context::JobContext;
use crate::error::JobError;

/// Runs the body of one job kind against a store.
///
/// Executors run on the job's own thread. They should call
/// [`JobContext::checkpoint`] between units of work so interrupts take
/// effect, and return `JobError::Aborted` when they stop early.
pub trait JobExecutor<S: Store>: Send + Sync {
    fn kind(&self) -> JobKind;

    fn execute(&self, store: &S, ctx: &mut JobContext) -> Result<(), JobError>;
}
