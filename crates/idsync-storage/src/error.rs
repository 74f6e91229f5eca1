//! Storage layer error types.

use idsync_types::StoreError;
use rocksdb::ErrorKind;
use thiserror::Error;

/// Errors that can occur in the storage layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// RocksDB operation failed
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    /// Column family not found
    #[error("Column family not found: {0}")]
    ColumnFamilyNotFound(String),

    /// Key encoding/decoding error
    #[error("Key error: {0}")]
    Key(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Row not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Write rejected by the current row state
    #[error("Conflict: {0}")]
    Conflict(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<StorageError> for StoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::RocksDb(e) => match e.kind() {
                ErrorKind::TimedOut | ErrorKind::Busy | ErrorKind::TryAgain => {
                    StoreError::LockTimeout(e.to_string())
                }
                _ => StoreError::Backend(e.to_string()),
            },
            StorageError::ColumnFamilyNotFound(name) => {
                StoreError::Backend(format!("column family not found: {name}"))
            }
            StorageError::Key(msg) => StoreError::InvalidKey(msg),
            StorageError::Serialization(msg) => StoreError::Serialization(msg),
            StorageError::NotFound(msg) => StoreError::NotFound(msg),
            StorageError::Conflict(msg) => StoreError::Conflict(msg),
        }
    }
}
