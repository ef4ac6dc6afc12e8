//! State backend trait definition.

use crate::error::StorageResult;

/// A durable single-slot store for engine bookkeeping.
///
/// State backends are **opaque byte stores**. They keep the most recent
/// snapshot written with [`store`](StateBackend::store) and hand it back
/// from [`load`](StateBackend::load), including after a process restart
/// for persistent implementations.
///
/// # Invariants
///
/// - `load` returns exactly the bytes of the last successful `store`
/// - `load` returns `None` when nothing was stored or after `clear`
/// - `store` replaces the whole snapshot atomically
/// - Backends must be `Send + Sync` for concurrent access
///
/// # Implementors
///
/// - [`super::InMemoryBackend`] - For testing
/// - [`super::FileBackend`] - For persistent storage
pub trait StateBackend: Send + Sync {
    /// Loads the current snapshot, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying medium cannot be read.
    fn load(&self) -> StorageResult<Option<Vec<u8>>>;

    /// Replaces the snapshot with `data`.
    ///
    /// After this returns successfully the new snapshot survives process
    /// termination (for persistent backends).
    ///
    /// # Errors
    ///
    /// Returns an error if the write or the durability barrier fails. On
    /// error the previous snapshot is still intact.
    fn store(&self, data: &[u8]) -> StorageResult<()>;

    /// Removes the snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying medium cannot be modified.
    fn clear(&self) -> StorageResult<()>;
}
