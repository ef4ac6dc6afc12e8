//! Pending operations.

use crate::record::{Record, RecordId, ScopeId, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier assigned to a pending operation by the queue.
///
/// Identifiers increase monotonically in enqueue order and are never
/// reused, including across a persist/restore cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpId(pub u64);

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "op#{}", self.0)
    }
}

/// Kind of a pending mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Record was created or updated.
    Upsert,
    /// Record was deleted.
    Delete,
}

impl OperationKind {
    /// Returns a short lowercase name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Upsert => "upsert",
            OperationKind::Delete => "delete",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A local mutation that has not yet been confirmed by the remote.
///
/// The record snapshot is captured at enqueue time. Later local edits to
/// the same record produce their own operations rather than mutating this
/// one, so the queue replays the exact history of local writes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
    /// Queue-assigned identifier.
    pub op_id: OpId,
    /// Target collection.
    pub collection: String,
    /// Upsert or delete.
    pub kind: OperationKind,
    /// Record as it was when the mutation was made.
    pub record: Record,
    /// Scope the mutation was made in.
    pub scope_id: ScopeId,
    /// When the mutation was enqueued.
    pub enqueued_at: Timestamp,
    /// Upload attempts so far, across all cycles.
    pub attempt_count: u32,
    /// When the last upload attempt was made.
    pub last_attempt_at: Option<Timestamp>,
    /// Error message of the last failed attempt.
    pub last_error: Option<String>,
}

impl PendingOperation {
    /// Creates an operation. The queue assigns the real `op_id` on enqueue.
    pub fn new(
        collection: impl Into<String>,
        kind: OperationKind,
        record: Record,
        scope_id: ScopeId,
        enqueued_at: Timestamp,
    ) -> Self {
        Self {
            op_id: OpId(0),
            collection: collection.into(),
            kind,
            record,
            scope_id,
            enqueued_at,
            attempt_count: 0,
            last_attempt_at: None,
            last_error: None,
        }
    }

    /// Returns the id of the affected record.
    #[must_use]
    pub fn record_id(&self) -> &RecordId {
        &self.record.id
    }

    /// Returns true if this is a delete.
    #[must_use]
    pub fn is_delete(&self) -> bool {
        self.kind == OperationKind::Delete
    }
}
