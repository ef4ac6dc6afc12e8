//! Last-write-wins conflict resolution.
//!
//! Every incoming remote change is merged against the local copy of the
//! same record by comparing `last_modified` (or `deleted_at` for
//! tombstones). The rules are:
//!
//! | Remote    | Local   | Outcome                                     |
//! |-----------|---------|---------------------------------------------|
//! | upsert    | absent  | insert                                      |
//! | upsert    | older   | overwrite local                             |
//! | upsert    | newer   | keep local, push it again                   |
//! | upsert    | equal   | nothing to do                               |
//! | tombstone | older   | delete local                                |
//! | tombstone | not older | keep local, push it again (resurrect)     |
//! | tombstone | absent  | nothing to do                               |
//!
//! A side that carries a timestamp is newer than a side that does not.
//! When neither side has one the remote wins.

use crate::change::RemoteChange;
use crate::record::{Record, RecordId, Timestamp};
use std::cmp::Ordering;

/// Relative age of the remote version compared to the local one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// The remote version is newer.
    RemoteNewer,
    /// The local version is newer.
    LocalNewer,
    /// Both carry the same timestamp.
    Equal,
}

/// Compares a local and a remote modification time.
#[must_use]
pub fn compare_versions(local: Option<Timestamp>, remote: Option<Timestamp>) -> Freshness {
    match (local, remote) {
        (Some(l), Some(r)) => match r.cmp(&l) {
            Ordering::Greater => Freshness::RemoteNewer,
            Ordering::Less => Freshness::LocalNewer,
            Ordering::Equal => Freshness::Equal,
        },
        (Some(_), None) => Freshness::LocalNewer,
        (None, Some(_)) | (None, None) => Freshness::RemoteNewer,
    }
}

/// What to do with an incoming remote change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeDecision {
    /// Record is unknown locally; store the remote copy.
    Insert,
    /// Remote copy is newer; overwrite the local row.
    Overwrite,
    /// Local copy is newer; keep it and make sure it gets pushed.
    KeepLocal,
    /// Both sides already agree.
    Converged,
    /// Remote deletion is newer; remove the local row.
    Delete,
    /// Remote deletion is stale; keep the local row and push it again.
    Resurrect,
    /// Remote deletion of a record that does not exist locally.
    Ignore,
}

impl MergeDecision {
    /// Returns true if the local copy must be queued for upload.
    #[must_use]
    pub fn requires_push(&self) -> bool {
        matches!(self, MergeDecision::KeepLocal | MergeDecision::Resurrect)
    }

    /// Returns true if the local store has to be written.
    #[must_use]
    pub fn writes_local(&self) -> bool {
        matches!(
            self,
            MergeDecision::Insert | MergeDecision::Overwrite | MergeDecision::Delete
        )
    }

    /// Returns the conflict resolution this decision represents, if the
    /// two sides actually disagreed.
    #[must_use]
    pub fn resolution(&self) -> Option<ConflictResolution> {
        match self {
            MergeDecision::Overwrite | MergeDecision::Delete => {
                Some(ConflictResolution::AcceptRemote)
            }
            MergeDecision::KeepLocal | MergeDecision::Resurrect => {
                Some(ConflictResolution::KeepLocal)
            }
            MergeDecision::Insert | MergeDecision::Converged | MergeDecision::Ignore => None,
        }
    }
}

/// Decides how to merge `remote` into the local copy.
#[must_use]
pub fn resolve(local: Option<&Record>, remote: &RemoteChange) -> MergeDecision {
    let Some(local) = local else {
        return match remote {
            RemoteChange::Upsert(_) => MergeDecision::Insert,
            RemoteChange::Tombstone(_) => MergeDecision::Ignore,
        };
    };

    let freshness = compare_versions(local.last_modified, remote.modified_at());
    match (remote, freshness) {
        (RemoteChange::Upsert(_), Freshness::RemoteNewer) => MergeDecision::Overwrite,
        (RemoteChange::Upsert(_), Freshness::LocalNewer) => MergeDecision::KeepLocal,
        (RemoteChange::Upsert(_), Freshness::Equal) => MergeDecision::Converged,
        (RemoteChange::Tombstone(_), Freshness::RemoteNewer) => MergeDecision::Delete,
        (RemoteChange::Tombstone(_), _) => MergeDecision::Resurrect,
    }
}

/// Which side won a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictResolution {
    /// The local version was kept and will be pushed.
    KeepLocal,
    /// The remote version replaced the local one.
    AcceptRemote,
}

/// A conflict between a local record and a remote change, as resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conflict {
    /// Collection name.
    pub collection: String,
    /// Record identifier.
    pub record_id: RecordId,
    /// Local modification time.
    pub local_modified: Option<Timestamp>,
    /// Remote modification time.
    pub remote_modified: Option<Timestamp>,
    /// True when the remote side was a deletion.
    pub remote_deleted: bool,
    /// How it was resolved.
    pub resolution: ConflictResolution,
}

impl Conflict {
    /// Builds the conflict record for a merge, or `None` when the decision
    /// did not involve two diverging versions.
    #[must_use]
    pub fn from_merge(
        collection: &str,
        local: &Record,
        remote: &RemoteChange,
        decision: MergeDecision,
    ) -> Option<Self> {
        Some(Self {
            collection: collection.to_owned(),
            record_id: local.id.clone(),
            local_modified: local.last_modified,
            remote_modified: remote.modified_at(),
            remote_deleted: remote.is_tombstone(),
            resolution: decision.resolution()?,
        })
    }

    /// Returns true if the remote side was a deletion.
    #[must_use]
    pub fn is_update_delete_conflict(&self) -> bool {
        self.remote_deleted
    }
}
