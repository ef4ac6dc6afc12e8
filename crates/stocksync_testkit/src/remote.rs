//! An in-memory authoritative remote.
//!
//! `MemoryRemote` behaves like the hosted backend the engine talks to:
//!
//! - upserts resolve conflicts with last-write-wins on `last_modified`
//! - temporary ids get a permanent id on first upload, and re-uploading
//!   the same temporary id maps to the same permanent id
//! - deletes leave tombstones that are served by later pulls
//! - every write is stamped with a server clock that never goes back, and
//!   `fetch_since` filters on that stamp, not on client timestamps
//!
//! Failures can be scripted per call kind, and the whole remote can be
//! taken offline.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use stocksync_engine::{RemoteClient, RemoteError, RemoteResult};
use stocksync_protocol::{
    compare_versions, FetchResult, Freshness, Record, RecordId, RemoteChange, ScopeId, Timestamp,
    Tombstone,
};

/// Kind of remote call a scripted fault applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultTarget {
    /// `fetch_since` calls.
    Fetch,
    /// `upsert` calls.
    Upsert,
    /// `delete` calls.
    Delete,
    /// Any call.
    Any,
}

impl FaultTarget {
    fn matches(self, call: FaultTarget) -> bool {
        self == FaultTarget::Any || self == call
    }
}

#[derive(Debug, Clone)]
enum Row {
    Live(Record),
    Deleted(Tombstone),
}

#[derive(Debug, Clone)]
struct StoredRow {
    row: Row,
    stored_at: Timestamp,
}

impl StoredRow {
    fn modified_at(&self) -> Option<Timestamp> {
        match &self.row {
            Row::Live(r) => r.last_modified,
            Row::Deleted(t) => t.deleted_at,
        }
    }

    fn scope_id(&self) -> Option<&ScopeId> {
        match &self.row {
            Row::Live(r) => r.scope_id.as_ref(),
            Row::Deleted(t) => t.scope_id.as_ref(),
        }
    }
}

/// Counters of calls received by a [`MemoryRemote`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    /// `fetch_since` calls, including failed ones.
    pub fetches: usize,
    /// `upsert` calls, including failed ones.
    pub upserts: usize,
    /// `delete` calls, including failed ones.
    pub deletes: usize,
}

#[derive(Debug, Default)]
struct RemoteState {
    collections: HashMap<String, BTreeMap<RecordId, StoredRow>>,
    assigned: HashMap<(String, RecordId), RecordId>,
    clock: i64,
    next_id: u64,
    faults: VecDeque<(FaultTarget, RemoteError)>,
    offline: bool,
    calls: CallCounts,
}

impl RemoteState {
    fn tick(&mut self) -> Timestamp {
        self.clock = (self.clock + 1).max(Timestamp::now().as_millis());
        Timestamp::from_millis(self.clock)
    }

    fn take_fault(&mut self, call: FaultTarget) -> RemoteResult<()> {
        if self.offline {
            return Err(RemoteError::network("remote unreachable"));
        }
        if let Some(pos) = self.faults.iter().position(|(t, _)| t.matches(call)) {
            if let Some((_, err)) = self.faults.remove(pos) {
                return Err(err);
            }
        }
        Ok(())
    }

    fn rows(&mut self, collection: &str) -> &mut BTreeMap<RecordId, StoredRow> {
        self.collections.entry(collection.to_owned()).or_default()
    }

    fn resolve_target(&mut self, collection: &str, record: &Record, conflict_key: &str) -> RecordId {
        if let Some(id) = self.assigned.get(&(collection.to_owned(), record.id.clone())) {
            return id.clone();
        }

        if conflict_key != "id" {
            if let Some(key) = record.field(conflict_key) {
                let existing = self.rows(collection).iter().find_map(|(id, stored)| match &stored.row {
                    Row::Live(r) if r.field(conflict_key) == Some(key) => Some(id.clone()),
                    _ => None,
                });
                if let Some(id) = existing {
                    return id;
                }
            }
        }

        if record.id.is_temporary() {
            self.next_id += 1;
            let id = RecordId::new(format!("{collection}-{}", self.next_id));
            self.assigned
                .insert((collection.to_owned(), record.id.clone()), id.clone());
            return id;
        }
        record.id.clone()
    }
}

/// An in-memory remote backend for tests.
#[derive(Debug, Default)]
pub struct MemoryRemote {
    state: Mutex<RemoteState>,
}

impl MemoryRemote {
    /// Creates an empty remote.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next matching call fail with `error`.
    ///
    /// Faults are consumed in the order they were scripted.
    pub fn fail_next(&self, target: FaultTarget, error: RemoteError) {
        self.state.lock().faults.push_back((target, error));
    }

    /// Makes the next `times` matching calls fail with `error`.
    pub fn fail_times(&self, target: FaultTarget, error: RemoteError, times: usize) {
        let mut state = self.state.lock();
        for _ in 0..times {
            state.faults.push_back((target, error.clone()));
        }
    }

    /// Takes the remote offline or back online.
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Returns the number of calls received so far.
    pub fn calls(&self) -> CallCounts {
        self.state.lock().calls
    }

    /// Returns the current server clock.
    pub fn now(&self) -> Timestamp {
        Timestamp::from_millis(self.state.lock().clock)
    }

    /// Writes a record as another client would, bypassing faults and
    /// conflict resolution.
    pub fn seed(&self, collection: &str, mut record: Record) {
        let mut state = self.state.lock();
        let stored_at = state.tick();
        record.is_pending = false;
        state.rows(collection).insert(
            record.id.clone(),
            StoredRow {
                row: Row::Live(record),
                stored_at,
            },
        );
    }

    /// Deletes a record as another client would.
    pub fn seed_tombstone(
        &self,
        collection: &str,
        id: impl Into<RecordId>,
        scope_id: Option<ScopeId>,
        deleted_at: Timestamp,
    ) {
        let mut state = self.state.lock();
        let stored_at = state.tick();
        let id = id.into();
        state.rows(collection).insert(
            id.clone(),
            StoredRow {
                row: Row::Deleted(Tombstone {
                    id,
                    scope_id,
                    deleted_at: Some(deleted_at),
                }),
                stored_at,
            },
        );
    }

    /// Returns a live record.
    pub fn get(&self, collection: &str, id: &RecordId) -> Option<Record> {
        let state = self.state.lock();
        match &state.collections.get(collection)?.get(id)?.row {
            Row::Live(r) => Some(r.clone()),
            Row::Deleted(_) => None,
        }
    }

    /// Returns true if the record is tombstoned.
    pub fn is_deleted(&self, collection: &str, id: &RecordId) -> bool {
        let state = self.state.lock();
        state
            .collections
            .get(collection)
            .and_then(|rows| rows.get(id))
            .is_some_and(|stored| matches!(stored.row, Row::Deleted(_)))
    }

    /// Returns all live records of a collection in id order.
    pub fn records(&self, collection: &str) -> Vec<Record> {
        let state = self.state.lock();
        state
            .collections
            .get(collection)
            .map(|rows| {
                rows.values()
                    .filter_map(|stored| match &stored.row {
                        Row::Live(r) => Some(r.clone()),
                        Row::Deleted(_) => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl RemoteClient for MemoryRemote {
    async fn fetch_since(
        &self,
        collection: &str,
        scope: Option<&ScopeId>,
        since: Timestamp,
    ) -> RemoteResult<FetchResult> {
        let mut state = self.state.lock();
        state.calls.fetches += 1;
        state.take_fault(FaultTarget::Fetch)?;

        let mut rows: Vec<&StoredRow> = state
            .collections
            .get(collection)
            .map(|rows| {
                rows.values()
                    .filter(|stored| stored.stored_at > since)
                    .filter(|stored| scope.is_none() || stored.scope_id() == scope)
                    .collect()
            })
            .unwrap_or_default();
        rows.sort_by_key(|stored| stored.stored_at);

        let changes = rows
            .into_iter()
            .map(|stored| match &stored.row {
                Row::Live(r) => RemoteChange::Upsert(r.clone()),
                Row::Deleted(t) => RemoteChange::Tombstone(t.clone()),
            })
            .collect();

        Ok(FetchResult {
            changes,
            as_of: Timestamp::from_millis(state.clock),
        })
    }

    async fn upsert(
        &self,
        collection: &str,
        record: &Record,
        conflict_key: &str,
    ) -> RemoteResult<Record> {
        let mut state = self.state.lock();
        state.calls.upserts += 1;
        state.take_fault(FaultTarget::Upsert)?;

        let id = state.resolve_target(collection, record, conflict_key);
        let existing = state.rows(collection).get(&id).cloned();

        if let Some(existing) = existing {
            if let Freshness::RemoteNewer = compare_versions(record.last_modified, existing.modified_at()) {
                return match existing.row {
                    Row::Live(current) => Ok(current),
                    Row::Deleted(tombstone) => {
                        // Serve the tombstone again so the client learns about it.
                        let stored_at = state.tick();
                        state.rows(collection).insert(
                            id,
                            StoredRow {
                                row: Row::Deleted(tombstone),
                                stored_at,
                            },
                        );
                        Err(RemoteError::rejected(409, "record was deleted"))
                    }
                };
            }
        }

        let stored_at = state.tick();
        let mut stored = record.clone();
        stored.id = id.clone();
        stored.is_pending = false;
        if stored.last_modified.is_none() {
            stored.last_modified = Some(stored_at);
        }
        state.rows(collection).insert(
            id,
            StoredRow {
                row: Row::Live(stored.clone()),
                stored_at,
            },
        );
        Ok(stored)
    }

    async fn delete(&self, collection: &str, id: &RecordId) -> RemoteResult<()> {
        let mut state = self.state.lock();
        state.calls.deletes += 1;
        state.take_fault(FaultTarget::Delete)?;

        let scope_id = match state.rows(collection).get(id) {
            Some(StoredRow {
                row: Row::Live(r), ..
            }) => r.scope_id.clone(),
            _ => return Err(RemoteError::NotFound),
        };

        let stored_at = state.tick();
        state.rows(collection).insert(
            id.clone(),
            StoredRow {
                row: Row::Deleted(Tombstone {
                    id: id.clone(),
                    scope_id,
                    deleted_at: Some(stored_at),
                }),
                stored_at,
            },
        );
        Ok(())
    }
}
