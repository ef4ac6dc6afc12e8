//! Durable FIFO of mutations awaiting upload.

use crate::error::StoreResult;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use stocksync_protocol::{
    from_cbor, to_cbor, OpId, OperationKind, PendingOperation, RecordId, ScopeId, Timestamp,
};
use stocksync_storage::{InMemoryBackend, StateBackend};

/// Summary of the queue contents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Total queued operations.
    pub total: usize,
    /// Queued upserts.
    pub upserts: usize,
    /// Queued deletes.
    pub deletes: usize,
    /// Operations with at least one failed attempt.
    pub failed: usize,
    /// Queued operations per scope.
    pub by_scope: BTreeMap<ScopeId, usize>,
    /// Enqueue time of the oldest operation.
    pub oldest_enqueued_at: Option<Timestamp>,
}

#[derive(Debug, Serialize, Deserialize)]
struct QueueSnapshot {
    next_op_id: u64,
    operations: Vec<PendingOperation>,
}

#[derive(Debug)]
struct QueueInner {
    operations: VecDeque<PendingOperation>,
    next_op_id: u64,
}

/// The pending operation queue.
///
/// The queue keeps operations in enqueue order and hands them out oldest
/// first. Mutating methods only touch memory; [`persist`](Self::persist)
/// writes a snapshot to the backing [`StateBackend`].
///
/// # Invariants
///
/// - Operations are in enqueue order, except where `requeue_front` moved one
/// - Op ids increase monotonically and survive persist/restore
/// - Nothing is dropped except through `remove` or `clear`
pub struct PendingQueue {
    inner: Mutex<QueueInner>,
    backend: Arc<dyn StateBackend>,
    // Orders concurrent snapshot writes.
    persist_lock: Mutex<()>,
}

impl PendingQueue {
    /// Creates an empty queue persisting to `backend`.
    pub fn new(backend: Arc<dyn StateBackend>) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                operations: VecDeque::new(),
                next_op_id: 1,
            }),
            backend,
            persist_lock: Mutex::new(()),
        }
    }

    /// Creates an empty queue backed by memory only.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryBackend::new()))
    }

    /// Restores a queue from the snapshot in `backend`.
    ///
    /// An empty backend yields an empty queue.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read or the snapshot is
    /// corrupted.
    pub fn restore(backend: Arc<dyn StateBackend>) -> StoreResult<Self> {
        let queue = Self::new(Arc::clone(&backend));
        if let Some(bytes) = backend.load()? {
            let snapshot: QueueSnapshot = from_cbor(&bytes)?;
            let mut inner = queue.inner.lock();
            let highest = snapshot.operations.iter().map(|op| op.op_id.0).max().unwrap_or(0);
            inner.next_op_id = snapshot.next_op_id.max(highest + 1);
            inner.operations = snapshot.operations.into();
        }
        Ok(queue)
    }

    /// Writes the current contents to the backend.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the backend write fails.
    pub fn persist(&self) -> StoreResult<()> {
        let _order = self.persist_lock.lock();
        let bytes = {
            let inner = self.inner.lock();
            let snapshot = QueueSnapshot {
                next_op_id: inner.next_op_id,
                operations: inner.operations.iter().cloned().collect(),
            };
            to_cbor(&snapshot)?
        };
        self.backend.store(&bytes)?;
        Ok(())
    }

    /// Appends an operation and returns its assigned id.
    pub fn enqueue(&self, mut op: PendingOperation) -> OpId {
        let mut inner = self.inner.lock();
        let op_id = OpId(inner.next_op_id);
        inner.next_op_id += 1;
        op.op_id = op_id;
        inner.operations.push_back(op);
        op_id
    }

    /// Returns up to `max` operations, oldest first.
    pub fn peek_batch(&self, max: usize) -> Vec<PendingOperation> {
        self.inner.lock().operations.iter().take(max).cloned().collect()
    }

    /// Returns up to `max` operations of one scope, oldest first.
    pub fn peek_batch_for(&self, scope: &ScopeId, max: usize) -> Vec<PendingOperation> {
        self.inner
            .lock()
            .operations
            .iter()
            .filter(|op| &op.scope_id == scope)
            .take(max)
            .cloned()
            .collect()
    }

    /// Removes an operation. Removing an unknown id is a no-op.
    pub fn remove(&self, op_id: OpId) -> Option<PendingOperation> {
        let mut inner = self.inner.lock();
        let pos = inner.operations.iter().position(|op| op.op_id == op_id)?;
        inner.operations.remove(pos)
    }

    /// Moves an operation to the head of the queue.
    ///
    /// The relative order of all other operations is unchanged. Returns
    /// false if the id is unknown.
    pub fn requeue_front(&self, op_id: OpId) -> bool {
        let mut inner = self.inner.lock();
        let Some(pos) = inner.operations.iter().position(|op| op.op_id == op_id) else {
            return false;
        };
        if let Some(op) = inner.operations.remove(pos) {
            inner.operations.push_front(op);
        }
        true
    }

    /// Returns a copy of an operation.
    pub fn get(&self, op_id: OpId) -> Option<PendingOperation> {
        self.inner
            .lock()
            .operations
            .iter()
            .find(|op| op.op_id == op_id)
            .cloned()
    }

    /// Records a failed attempt and returns the new attempt count.
    pub fn record_attempt(&self, op_id: OpId, error: &str, at: Timestamp) -> Option<u32> {
        let mut inner = self.inner.lock();
        let op = inner.operations.iter_mut().find(|op| op.op_id == op_id)?;
        op.attempt_count = op.attempt_count.saturating_add(1);
        op.last_attempt_at = Some(at);
        op.last_error = Some(error.to_owned());
        Some(op.attempt_count)
    }

    /// Returns true if any operation targets the record.
    pub fn contains_record(&self, collection: &str, id: &RecordId) -> bool {
        self.count_for_record(collection, id) > 0
    }

    /// Returns the number of operations targeting the record.
    pub fn count_for_record(&self, collection: &str, id: &RecordId) -> usize {
        self.inner
            .lock()
            .operations
            .iter()
            .filter(|op| op.collection == collection && op.record_id() == id)
            .count()
    }

    /// Returns the most recently queued operation targeting the record.
    pub fn latest_for_record(&self, collection: &str, id: &RecordId) -> Option<PendingOperation> {
        self.inner
            .lock()
            .operations
            .iter()
            .rev()
            .find(|op| op.collection == collection && op.record_id() == id)
            .cloned()
    }

    /// Returns the number of operations of one scope.
    pub fn count_for_scope(&self, scope: &ScopeId) -> usize {
        self.inner
            .lock()
            .operations
            .iter()
            .filter(|op| &op.scope_id == scope)
            .count()
    }

    /// Replaces a record id in every queued snapshot of `collection`.
    ///
    /// Returns the number of rewritten operations.
    pub fn rewrite_record_id(&self, collection: &str, old: &RecordId, new: &RecordId) -> usize {
        let mut inner = self.inner.lock();
        let mut rewritten = 0;
        for op in inner
            .operations
            .iter_mut()
            .filter(|op| op.collection == collection && &op.record.id == old)
        {
            op.record.id = new.clone();
            rewritten += 1;
        }
        rewritten
    }

    /// Replaces `old` with `new` in `field` of every queued snapshot of
    /// `collection`.
    ///
    /// Returns the number of rewritten operations.
    pub fn rewrite_reference(
        &self,
        collection: &str,
        field: &str,
        old: &RecordId,
        new: &RecordId,
    ) -> usize {
        let mut inner = self.inner.lock();
        let mut rewritten = 0;
        for op in inner.operations.iter_mut().filter(|op| op.collection == collection) {
            if let Some(value) = op.record.fields.get_mut(field) {
                if value.as_str() == Some(old.as_str()) {
                    *value = Value::String(new.as_str().to_owned());
                    rewritten += 1;
                }
            }
        }
        rewritten
    }

    /// Returns a summary of the queue.
    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        let mut stats = QueueStats {
            total: inner.operations.len(),
            ..QueueStats::default()
        };
        for op in &inner.operations {
            match op.kind {
                OperationKind::Upsert => stats.upserts += 1,
                OperationKind::Delete => stats.deletes += 1,
            }
            if op.attempt_count > 0 {
                stats.failed += 1;
            }
            *stats.by_scope.entry(op.scope_id.clone()).or_default() += 1;
            stats.oldest_enqueued_at = Some(match stats.oldest_enqueued_at {
                Some(t) => t.min(op.enqueued_at),
                None => op.enqueued_at,
            });
        }
        stats
    }

    /// Returns copies of all operations of one kind, oldest first.
    pub fn pending_by_kind(&self, kind: OperationKind) -> Vec<PendingOperation> {
        self.inner
            .lock()
            .operations
            .iter()
            .filter(|op| op.kind == kind)
            .cloned()
            .collect()
    }

    /// Removes every operation. Op ids keep increasing afterwards.
    pub fn clear(&self) {
        self.inner.lock().operations.clear();
    }

    /// Returns the number of queued operations.
    pub fn len(&self) -> usize {
        self.inner.lock().operations.len()
    }

    /// Returns true if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().operations.is_empty()
    }
}

impl std::fmt::Debug for PendingQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingQueue")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;
    use stocksync_protocol::Record;

    fn op(collection: &str, id: &str, scope: &str) -> PendingOperation {
        PendingOperation::new(
            collection,
            OperationKind::Upsert,
            Record::new(id, Some(ScopeId::new(scope))),
            ScopeId::new(scope),
            Timestamp::from_millis(1),
        )
    }

    fn ids(ops: &[PendingOperation]) -> Vec<u64> {
        ops.iter().map(|op| op.op_id.0).collect()
    }

    #[test]
    fn enqueue_assigns_increasing_ids() {
        let queue = PendingQueue::in_memory();
        let a = queue.enqueue(op("inventory", "1", "north"));
        let b = queue.enqueue(op("inventory", "2", "north"));
        assert!(b > a);
        assert_eq!(queue.len(), 2);
        assert_eq!(ids(&queue.peek_batch(10)), vec![a.0, b.0]);
    }

    #[test]
    fn peek_batch_for_filters_scope() {
        let queue = PendingQueue::in_memory();
        queue.enqueue(op("inventory", "1", "north"));
        queue.enqueue(op("inventory", "2", "south"));
        queue.enqueue(op("inventory", "3", "north"));

        let north = queue.peek_batch_for(&ScopeId::new("north"), 10);
        assert_eq!(ids(&north), vec![1, 3]);
        assert_eq!(queue.peek_batch_for(&ScopeId::new("north"), 1).len(), 1);
        assert_eq!(queue.count_for_scope(&ScopeId::new("south")), 1);
    }

    #[test]
    fn latest_for_record_returns_newest_operation() {
        let queue = PendingQueue::in_memory();
        queue.enqueue(op("inventory", "1", "north"));
        let mut delete = op("inventory", "1", "north");
        delete.kind = OperationKind::Delete;
        let last = queue.enqueue(delete);
        queue.enqueue(op("inventory", "2", "north"));

        let latest = queue.latest_for_record("inventory", &RecordId::new("1")).unwrap();
        assert_eq!(latest.op_id, last);
        assert!(latest.is_delete());
        assert!(queue.latest_for_record("products", &RecordId::new("1")).is_none());
    }

    #[test]
    fn remove_is_idempotent() {
        let queue = PendingQueue::in_memory();
        let id = queue.enqueue(op("inventory", "1", "north"));
        assert!(queue.remove(id).is_some());
        assert!(queue.remove(id).is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn requeue_front_keeps_other_order() {
        let queue = PendingQueue::in_memory();
        for i in 0..4 {
            queue.enqueue(op("inventory", &i.to_string(), "north"));
        }

        assert!(queue.requeue_front(OpId(3)));
        assert_eq!(ids(&queue.peek_batch(10)), vec![3, 1, 2, 4]);
        assert!(!queue.requeue_front(OpId(99)));
    }

    #[test]
    fn record_attempt_tracks_failures() {
        let queue = PendingQueue::in_memory();
        let id = queue.enqueue(op("inventory", "1", "north"));

        assert_eq!(queue.record_attempt(id, "timeout", Timestamp::from_millis(5)), Some(1));
        assert_eq!(queue.record_attempt(id, "reset", Timestamp::from_millis(9)), Some(2));

        let stored = queue.get(id).unwrap();
        assert_eq!(stored.last_error.as_deref(), Some("reset"));
        assert_eq!(stored.last_attempt_at, Some(Timestamp::from_millis(9)));
        assert_eq!(queue.stats().failed, 1);
        assert_eq!(queue.record_attempt(OpId(42), "x", Timestamp::EPOCH), None);
    }

    #[test]
    fn rewrite_ids_and_references() {
        let queue = PendingQueue::in_memory();
        let temp = RecordId::new("tmp-1");
        let perm = RecordId::new("p-100");

        queue.enqueue(op("products", "tmp-1", "north"));
        let mut child = op("inventory", "i-1", "north");
        child.record.set_field("product_id", json!("tmp-1"));
        queue.enqueue(child);

        assert_eq!(queue.rewrite_record_id("products", &temp, &perm), 1);
        assert_eq!(queue.rewrite_reference("inventory", "product_id", &temp, &perm), 1);

        assert!(queue.contains_record("products", &perm));
        assert!(!queue.contains_record("products", &temp));
        let child = queue.get(OpId(2)).unwrap();
        assert_eq!(child.record.field("product_id"), Some(&json!("p-100")));
    }

    #[test]
    fn stats_and_kinds() {
        let queue = PendingQueue::in_memory();
        queue.enqueue(op("inventory", "1", "north"));
        let mut delete = op("inventory", "2", "south");
        delete.kind = OperationKind::Delete;
        queue.enqueue(delete);

        let stats = queue.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.upserts, 1);
        assert_eq!(stats.deletes, 1);
        assert_eq!(stats.by_scope.get(&ScopeId::new("north")), Some(&1));
        assert_eq!(stats.oldest_enqueued_at, Some(Timestamp::from_millis(1)));
        assert_eq!(queue.pending_by_kind(OperationKind::Delete).len(), 1);

        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.enqueue(op("inventory", "3", "north")), OpId(3));
    }

    #[test]
    fn persist_and_restore() {
        let backend: Arc<dyn StateBackend> = Arc::new(InMemoryBackend::new());
        let queue = PendingQueue::new(Arc::clone(&backend));
        queue.enqueue(op("inventory", "1", "north"));
        queue.enqueue(op("inventory", "2", "north"));
        queue.remove(OpId(1));
        queue.persist().unwrap();

        let restored = PendingQueue::restore(backend).unwrap();
        assert_eq!(ids(&restored.peek_batch(10)), vec![2]);
        assert_eq!(restored.enqueue(op("inventory", "3", "north")), OpId(3));
    }

    #[test]
    fn restore_empty_backend() {
        let queue = PendingQueue::restore(Arc::new(InMemoryBackend::new())).unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn restore_corrupted_snapshot_fails() {
        let backend = Arc::new(InMemoryBackend::with_data(vec![0xff, 0x00, 0x13]));
        assert!(PendingQueue::restore(backend).is_err());
    }

    proptest! {
        #[test]
        fn removal_preserves_relative_order(count in 1usize..30, removals in prop::collection::vec(any::<prop::sample::Index>(), 0..10)) {
            let queue = PendingQueue::in_memory();
            let mut expected: Vec<u64> = (0..count)
                .map(|i| queue.enqueue(op("inventory", &i.to_string(), "north")).0)
                .collect();

            for index in removals {
                if expected.is_empty() {
                    break;
                }
                let victim = expected.remove(index.index(expected.len()));
                queue.remove(OpId(victim));
            }

            prop_assert_eq!(ids(&queue.peek_batch(usize::MAX)), expected);
        }
    }
}
