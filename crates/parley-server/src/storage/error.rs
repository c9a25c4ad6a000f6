//! Storage error types

use parley_core::StoreError;
use thiserror::Error;

/// Errors that can occur during relay storage operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Envelope id collision in the append log
    ///
    /// Ids are assigned by the storage itself, so this only happens if the
    /// log was modified outside the relay.
    #[error("envelope id conflict: expected {expected}, got {got}")]
    Conflict {
        /// Next id the log would assign
        expected: u64,
        /// Id already present
        got: u64,
    },

    /// Serialization or deserialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error (file system, database, etc.)
    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

impl From<StorageError> for StoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::Serialization(reason) => {
                StoreError::Corrupt { what: "replay state", reason }
            },
            other => StoreError::Backend(other.to_string()),
        }
    }
}
