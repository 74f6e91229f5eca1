//! Reconciliation error types.

use idsync_types::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Store failures propagate unchanged
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Unknown content kind: {0}")]
    UnknownKind(String),
}
