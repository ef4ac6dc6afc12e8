//! Error types for storage operations.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The stored snapshot is unreadable.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// Another process holds the state file.
    #[error("state file {path:?} is locked by another process")]
    Locked {
        /// Path of the contended state file.
        path: PathBuf,
    },
}
