//! In-memory state backend for testing.

use crate::backend::StateBackend;
use crate::error::StorageResult;
use parking_lot::RwLock;

/// An in-memory state backend.
///
/// This backend keeps the snapshot in memory and is suitable for:
/// - Unit tests
/// - Integration tests
/// - Sessions that don't need to survive a restart
///
/// # Thread Safety
///
/// This backend is thread-safe and can be shared across tasks.
///
/// # Example
///
/// ```rust
/// use stocksync_storage::{StateBackend, InMemoryBackend};
///
/// let backend = InMemoryBackend::new();
/// backend.store(b"state").unwrap();
/// assert_eq!(backend.store_count(), 1);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    data: RwLock<Option<Vec<u8>>>,
    stores: RwLock<u64>,
}

impl InMemoryBackend {
    /// Creates a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a new in-memory backend holding an existing snapshot.
    ///
    /// Useful for testing restore and corruption scenarios.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self {
            data: RwLock::new(Some(data)),
            stores: RwLock::new(0),
        }
    }

    /// Returns the number of successful `store` calls.
    #[must_use]
    pub fn store_count(&self) -> u64 {
        *self.stores.read()
    }
}

impl StateBackend for InMemoryBackend {
    fn load(&self) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.data.read().clone())
    }

    fn store(&self, data: &[u8]) -> StorageResult<()> {
        *self.data.write() = Some(data.to_vec());
        *self.stores.write() += 1;
        Ok(())
    }

    fn clear(&self) -> StorageResult<()> {
        *self.data.write() = None;
        Ok(())
    }
}
