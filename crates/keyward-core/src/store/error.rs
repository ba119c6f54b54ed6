use thiserror::Error;

/// Errors reported by a [`Storage`](super::Storage) backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Underlying database or filesystem failure
    #[error("storage I/O error: {0}")]
    Io(String),

    /// Stored bytes could not be decoded
    #[error("corrupt entry at {path}: {reason}")]
    Corrupt {
        /// Key path of the entry
        path: String,
        /// What was wrong with it
        reason: String,
    },

    /// Identifier cannot be used as a key segment
    #[error("invalid key segment {0:?}")]
    InvalidKey(String),
}
