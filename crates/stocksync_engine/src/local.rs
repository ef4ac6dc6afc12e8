//! Device-local record storage.

use crate::error::{StoreError, StoreResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use stocksync_protocol::{Record, RecordId};

/// The device's record store.
///
/// Every call is a single-record write or a read; the engine never needs
/// multi-record transactions. Implementations must always support the
/// [`SCOPE_INDEX`](stocksync_protocol::SCOPE_INDEX) index. Any other index
/// name refers to a top-level field of `Record::fields`.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Reads a record.
    async fn get(&self, collection: &str, id: &RecordId) -> StoreResult<Option<Record>>;

    /// Inserts or replaces a record.
    async fn put(&self, collection: &str, record: Record) -> StoreResult<()>;

    /// Deletes a record. Deleting a missing record is not an error.
    async fn delete(&self, collection: &str, id: &RecordId) -> StoreResult<()>;

    /// Returns every record whose `index` key equals `value`.
    async fn scan_by_index(
        &self,
        collection: &str,
        index: &str,
        value: &str,
    ) -> StoreResult<Vec<Record>>;
}

/// An in-memory local store for testing.
///
/// Records are kept per collection in id order. The store can be switched
/// into a failing mode to exercise local storage errors.
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    collections: RwLock<HashMap<String, BTreeMap<RecordId, Record>>>,
    failing: AtomicBool,
    writes: AtomicU64,
}

impl MemoryLocalStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Returns all records of a collection in id order.
    pub fn records(&self, collection: &str) -> Vec<Record> {
        self.collections
            .read()
            .get(collection)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the number of records in a collection.
    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .get(collection)
            .map_or(0, BTreeMap::len)
    }

    /// Returns true if the collection has no records.
    pub fn is_empty(&self, collection: &str) -> bool {
        self.len(collection) == 0
    }

    /// Returns the number of successful puts and deletes.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Reads a record without going through the async interface.
    pub fn record(&self, collection: &str, id: &RecordId) -> Option<Record> {
        self.collections.read().get(collection)?.get(id).cloned()
    }

    fn check(&self) -> StoreResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Backend("store unavailable".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn get(&self, collection: &str, id: &RecordId) -> StoreResult<Option<Record>> {
        self.check()?;
        Ok(self.record(collection, id))
    }

    async fn put(&self, collection: &str, record: Record) -> StoreResult<()> {
        self.check()?;
        self.collections
            .write()
            .entry(collection.to_owned())
            .or_default()
            .insert(record.id.clone(), record);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &RecordId) -> StoreResult<()> {
        self.check()?;
        if let Some(rows) = self.collections.write().get_mut(collection) {
            rows.remove(id);
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn scan_by_index(
        &self,
        collection: &str,
        index: &str,
        value: &str,
    ) -> StoreResult<Vec<Record>> {
        self.check()?;
        Ok(self
            .collections
            .read()
            .get(collection)
            .map(|rows| {
                rows.values()
                    .filter(|r| r.index_key(index).as_deref() == Some(value))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use stocksync_protocol::{ScopeId, SCOPE_INDEX};

    #[tokio::test]
    async fn put_get_delete() {
        let store = MemoryLocalStore::new();
        let id = RecordId::new("p-1");

        store
            .put("products", Record::new("p-1", None).with_field("name", json!("Bolt")))
            .await
            .unwrap();
        let found = store.get("products", &id).await.unwrap().unwrap();
        assert_eq!(found.field("name"), Some(&json!("Bolt")));

        store.delete("products", &id).await.unwrap();
        assert!(store.get("products", &id).await.unwrap().is_none());

        // Deleting again is fine.
        store.delete("products", &id).await.unwrap();
        assert_eq!(store.write_count(), 3);
    }

    #[tokio::test]
    async fn scan_by_scope_and_field() {
        let store = MemoryLocalStore::new();
        let north = ScopeId::new("north");
        for (id, scope, product) in [("a", "north", "p1"), ("b", "south", "p1"), ("c", "north", "p2")] {
            store
                .put(
                    "inventory",
                    Record::new(id, Some(ScopeId::new(scope))).with_field("product_id", json!(product)),
                )
                .await
                .unwrap();
        }

        let rows = store
            .scan_by_index("inventory", SCOPE_INDEX, north.as_str())
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);

        let rows = store.scan_by_index("inventory", "product_id", "p1").await.unwrap();
        let ids: Vec<_> = rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        assert!(store.scan_by_index("missing", "x", "y").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failing_mode() {
        let store = MemoryLocalStore::new();
        store.set_failing(true);
        assert!(store.put("x", Record::new("1", None)).await.is_err());
        assert!(store.is_empty("x"));

        store.set_failing(false);
        store.put("x", Record::new("1", None)).await.unwrap();
        assert_eq!(store.len("x"), 1);
    }
}
