//! Error types for the sync engine.

use stocksync_protocol::{CodecError, ScopeId};
use stocksync_storage::StorageError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Result type for local store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type for remote calls.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Failures of the device-local persistence layer.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The local store implementation failed.
    #[error("local store error: {0}")]
    Backend(String),

    /// A persisted state slot could not be read or written.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// A persisted state slot holds undecodable data.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// How the engine should react to a remote failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// May succeed if tried again later.
    Transient,
    /// Will fail again no matter how often it is retried.
    Permanent,
    /// The target record does not exist remotely.
    NotFound,
}

/// Failures reported by the remote backend.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// The request never reached the server or the connection dropped.
    #[error("network error: {0}")]
    Network(String),

    /// The server did not answer in time.
    #[error("request timed out")]
    Timeout,

    /// The server failed while handling the request (5xx).
    #[error("server error {status}: {message}")]
    Server {
        /// HTTP-like status code.
        status: u16,
        /// Server message.
        message: String,
    },

    /// The server refused the request (validation, constraint, 4xx).
    #[error("rejected with {status}: {message}")]
    Rejected {
        /// HTTP-like status code.
        status: u16,
        /// Server message.
        message: String,
    },

    /// The addressed record does not exist.
    #[error("record not found")]
    NotFound,
}

impl RemoteError {
    /// Creates a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network(message.into())
    }

    /// Creates a rejection with the given status.
    pub fn rejected(status: u16, message: impl Into<String>) -> Self {
        Self::Rejected {
            status,
            message: message.into(),
        }
    }

    /// Creates a server-side failure with the given status.
    pub fn server(status: u16, message: impl Into<String>) -> Self {
        Self::Server {
            status,
            message: message.into(),
        }
    }

    /// Classifies the error.
    pub fn classify(&self) -> ErrorClass {
        match self {
            RemoteError::Network(_) | RemoteError::Timeout | RemoteError::Server { .. } => {
                ErrorClass::Transient
            }
            RemoteError::Rejected { .. } => ErrorClass::Permanent,
            RemoteError::NotFound => ErrorClass::NotFound,
        }
    }

    /// Returns true if retrying may help.
    pub fn is_transient(&self) -> bool {
        self.classify() == ErrorClass::Transient
    }
}

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// A mutation was submitted without a scope.
    #[error("record in collection {collection} has no scope")]
    MissingScope {
        /// Collection of the offending record.
        collection: String,
    },

    /// The collection is not registered in the configuration.
    #[error("unknown collection: {0}")]
    UnknownCollection(String),

    /// The record cannot be synced as submitted.
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    /// Local persistence failed.
    #[error("local storage error: {0}")]
    LocalStorage(#[from] StoreError),

    /// A remote call failed.
    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    /// A cycle for this scope is already running.
    #[error("sync cycle already in progress for scope {scope}")]
    CycleInProgress {
        /// The contended scope.
        scope: ScopeId,
    },

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,
}

impl From<StorageError> for SyncError {
    fn from(err: StorageError) -> Self {
        SyncError::LocalStorage(err.into())
    }
}

impl From<CodecError> for SyncError {
    fn from(err: CodecError) -> Self {
        SyncError::LocalStorage(err.into())
    }
}

impl SyncError {
    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Remote(e) => e.is_transient(),
            SyncError::CycleInProgress { .. } => true,
            _ => false,
        }
    }
}
