//! Error types for the idsync system.

use thiserror::Error;

use crate::job::JobStatus;

/// Unified error type for domain-level operations.
#[derive(Debug, Error)]
pub enum IdsyncError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A job was asked to move between states its lifecycle forbids
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    /// Invalid input error
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Errors surfaced by a transactional store.
///
/// Store implementations translate their backend failures into this type so
/// callers (coordinator, reconciliation engine, job bodies) stay backend-agnostic.
#[derive(Debug, Error)]
pub enum StoreError {
    /// A row lock could not be acquired before the lock timeout
    #[error("Lock not acquired: {0}")]
    LockTimeout(String),

    /// The backend rejected or failed the operation
    #[error("Backend error: {0}")]
    Backend(String),

    /// A stored value could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A key in the store did not have the expected layout
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// A referenced row does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// The write conflicts with the current row state
    #[error("Conflict: {0}")]
    Conflict(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}
