//! Per-collection, per-scope pull watermarks.

use crate::error::StoreResult;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use stocksync_protocol::{from_cbor, to_cbor, ScopeId, Timestamp};
use stocksync_storage::{InMemoryBackend, StateBackend};

#[derive(Debug, Serialize, Deserialize)]
struct WatermarkEntry {
    collection: String,
    scope: ScopeId,
    last_synced_at: Timestamp,
}

/// Tracks how far each (collection, scope) pair has been pulled.
///
/// A watermark only ever moves forward.
pub struct WatermarkStore {
    marks: Mutex<BTreeMap<(String, ScopeId), Timestamp>>,
    backend: Arc<dyn StateBackend>,
    persist_lock: Mutex<()>,
}

impl WatermarkStore {
    /// Creates an empty store persisting to `backend`.
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self {
            marks: Mutex::new(BTreeMap::new()),
            backend,
            persist_lock: Mutex::new(()),
        }
    }

    /// Creates an empty store backed by memory only.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryBackend::new()))
    }

    /// Restores watermarks from the snapshot in `backend`.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read or the snapshot is
    /// corrupted.
    pub fn restore(backend: Arc<dyn StateBackend>) -> StoreResult<Self> {
        let store = Self::new(Arc::clone(&backend));
        if let Some(bytes) = backend.load()? {
            let entries: Vec<WatermarkEntry> = from_cbor(&bytes)?;
            let mut marks = store.marks.lock();
            for entry in entries {
                marks.insert((entry.collection, entry.scope), entry.last_synced_at);
            }
        }
        Ok(store)
    }

    /// Writes all watermarks to the backend.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the backend write fails.
    pub fn persist(&self) -> StoreResult<()> {
        let _order = self.persist_lock.lock();
        let bytes = {
            let marks = self.marks.lock();
            let entries: Vec<WatermarkEntry> = marks
                .iter()
                .map(|((collection, scope), ts)| WatermarkEntry {
                    collection: collection.clone(),
                    scope: scope.clone(),
                    last_synced_at: *ts,
                })
                .collect();
            to_cbor(&entries)?
        };
        self.backend.store(&bytes)?;
        Ok(())
    }

    /// Returns the watermark, if the pair was ever pulled.
    pub fn get(&self, collection: &str, scope: &ScopeId) -> Option<Timestamp> {
        self.marks
            .lock()
            .get(&(collection.to_owned(), scope.clone()))
            .copied()
    }

    /// Returns the lower bound for the next pull.
    pub fn since(&self, collection: &str, scope: &ScopeId) -> Timestamp {
        self.get(collection, scope).unwrap_or(Timestamp::EPOCH)
    }

    /// Moves the watermark to `to` if that is later than the current one.
    ///
    /// Returns true if the watermark changed.
    pub fn advance(&self, collection: &str, scope: &ScopeId, to: Timestamp) -> bool {
        let mut marks = self.marks.lock();
        let current = marks
            .entry((collection.to_owned(), scope.clone()))
            .or_insert(Timestamp::EPOCH);
        if to > *current {
            *current = to;
            true
        } else {
            false
        }
    }

    /// Returns true if the pair was never pulled or last pulled before
    /// `threshold`.
    pub fn is_stale(&self, collection: &str, scope: &ScopeId, threshold: Timestamp) -> bool {
        match self.get(collection, scope) {
            Some(ts) => ts < threshold,
            None => true,
        }
    }
}

impl std::fmt::Debug for WatermarkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatermarkStore")
            .field("marks", &*self.marks.lock())
            .finish_non_exhaustive()
    }
}
