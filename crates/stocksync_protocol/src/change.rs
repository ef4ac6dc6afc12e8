//! Changes observed on the remote side.
//!
//! A pull returns a [`FetchResult`] of [`RemoteChange`]s. The realtime
//! feed delivers the same information one [`ChangeEvent`] at a time.

use crate::record::{Record, RecordId, ScopeId, Timestamp};
use serde::{Deserialize, Serialize};

/// Marker for a record deleted on the remote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
    /// Identifier of the deleted record.
    pub id: RecordId,
    /// Scope the record belonged to.
    pub scope_id: Option<ScopeId>,
    /// When the deletion happened, if known.
    pub deleted_at: Option<Timestamp>,
}

/// A single remote change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RemoteChange {
    /// The record was created or updated.
    Upsert(Record),
    /// The record was deleted.
    Tombstone(Tombstone),
}

impl RemoteChange {
    /// Returns the affected record id.
    #[must_use]
    pub fn id(&self) -> &RecordId {
        match self {
            RemoteChange::Upsert(record) => &record.id,
            RemoteChange::Tombstone(t) => &t.id,
        }
    }

    /// Returns the change time used for last-write-wins.
    #[must_use]
    pub fn modified_at(&self) -> Option<Timestamp> {
        match self {
            RemoteChange::Upsert(record) => record.last_modified,
            RemoteChange::Tombstone(t) => t.deleted_at,
        }
    }

    /// Returns true for deletions.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        matches!(self, RemoteChange::Tombstone(_))
    }
}

/// Result of fetching changes since a watermark.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResult {
    /// Changes with `last_modified` strictly after the requested watermark.
    pub changes: Vec<RemoteChange>,
    /// Server time up to which the result is complete.
    ///
    /// The engine stores this as the next watermark. It comes from the
    /// server so device clock skew cannot cause changes to be skipped.
    pub as_of: Timestamp,
}

/// Type of a realtime change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeType {
    /// A record was inserted.
    Insert,
    /// A record was updated.
    Update,
    /// A record was deleted.
    Delete,
}

/// A change pushed by the remote's realtime feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Collection the change belongs to.
    pub collection: String,
    /// What happened.
    pub change_type: ChangeType,
    /// The change payload.
    pub change: RemoteChange,
}

impl ChangeEvent {
    /// Creates an insert event.
    pub fn insert(collection: impl Into<String>, record: Record) -> Self {
        Self {
            collection: collection.into(),
            change_type: ChangeType::Insert,
            change: RemoteChange::Upsert(record),
        }
    }

    /// Creates an update event.
    pub fn update(collection: impl Into<String>, record: Record) -> Self {
        Self {
            collection: collection.into(),
            change_type: ChangeType::Update,
            change: RemoteChange::Upsert(record),
        }
    }

    /// Creates a delete event.
    pub fn delete(collection: impl Into<String>, tombstone: Tombstone) -> Self {
        Self {
            collection: collection.into(),
            change_type: ChangeType::Delete,
            change: RemoteChange::Tombstone(tombstone),
        }
    }

    /// Returns the scope of the affected record, if any.
    #[must_use]
    pub fn scope_id(&self) -> Option<&ScopeId> {
        match &self.change {
            RemoteChange::Upsert(record) => record.scope_id.as_ref(),
            RemoteChange::Tombstone(t) => t.scope_id.as_ref(),
        }
    }
}
