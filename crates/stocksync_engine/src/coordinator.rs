//! The sync coordinator.
//!
//! A cycle for one scope runs in two phases:
//!
//! 1. **Push**: queued operations of the scope are uploaded oldest first,
//!    one at a time. Transient failures are retried with backoff up to the
//!    policy's attempt limit; permanent failures drop the operation and are
//!    reported as issues.
//! 2. **Pull**: for each registered collection, changes newer than the
//!    stored watermark are fetched and merged with last-write-wins. The
//!    watermark then moves to the server's `as_of`.
//!
//! At most one cycle per scope runs at a time. Different scopes may sync
//! concurrently.

use crate::config::{CollectionSpec, SyncConfig};
use crate::error::{ErrorClass, RemoteError, SyncError, SyncResult};
use crate::local::LocalStore;
use crate::queue::{PendingQueue, QueueStats};
use crate::remote::RemoteClient;
use crate::report::{SyncIssue, SyncPhase, SyncReport, SyncStats};
use crate::watermark::WatermarkStore;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use stocksync_protocol::{
    compare_versions, resolve, ChangeEvent, Conflict, Freshness, MergeDecision, OpId,
    OperationKind, PendingOperation, Record, RecordId, RemoteChange, ScopeId, Timestamp,
    SCOPE_INDEX,
};
use stocksync_storage::FileBackend;
use tracing::{debug, info, instrument, warn};

/// File name of the persisted pending queue inside the state directory.
pub const QUEUE_FILE: &str = "pending_queue.cbor";

/// File name of the persisted watermarks inside the state directory.
pub const WATERMARK_FILE: &str = "watermarks.cbor";

/// Marks a scope as syncing until dropped.
struct InFlightGuard<'a> {
    set: &'a Mutex<HashSet<ScopeId>>,
    scope: ScopeId,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.set.lock().remove(&self.scope);
    }
}

enum PushStep {
    Done,
    Stop,
}

struct Merge {
    decision: MergeDecision,
    conflict: Option<Conflict>,
    requeued: bool,
}

/// Coordinates the local store, the pending queue and the remote.
///
/// The coordinator owns the queue and the watermarks. It is the only
/// component that talks to both sides, so every cross-component rule lives
/// here.
pub struct SyncCoordinator<L: LocalStore, R: RemoteClient> {
    config: SyncConfig,
    local: Arc<L>,
    remote: Arc<R>,
    queue: PendingQueue,
    watermarks: WatermarkStore,
    in_flight: Mutex<HashSet<ScopeId>>,
    cancelled: AtomicBool,
    stats: RwLock<SyncStats>,
}

impl<L: LocalStore, R: RemoteClient> SyncCoordinator<L, R> {
    /// Creates a coordinator whose queue and watermarks live in memory.
    pub fn new(config: SyncConfig, local: Arc<L>, remote: Arc<R>) -> Self {
        Self::with_state(
            config,
            local,
            remote,
            PendingQueue::in_memory(),
            WatermarkStore::in_memory(),
        )
    }

    /// Creates a coordinator from existing queue and watermark state.
    pub fn with_state(
        config: SyncConfig,
        local: Arc<L>,
        remote: Arc<R>,
        queue: PendingQueue,
        watermarks: WatermarkStore,
    ) -> Self {
        Self {
            config,
            local,
            remote,
            queue,
            watermarks,
            in_flight: Mutex::new(HashSet::new()),
            cancelled: AtomicBool::new(false),
            stats: RwLock::new(SyncStats::default()),
        }
    }

    /// Opens a coordinator persisting its state under `state_dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if a state file is locked by another process,
    /// unreadable or corrupted.
    pub fn open(
        config: SyncConfig,
        local: Arc<L>,
        remote: Arc<R>,
        state_dir: &Path,
    ) -> SyncResult<Self> {
        let queue_backend = Arc::new(FileBackend::open(&state_dir.join(QUEUE_FILE))?);
        let mark_backend = Arc::new(FileBackend::open(&state_dir.join(WATERMARK_FILE))?);

        let queue = PendingQueue::restore(queue_backend)?;
        let watermarks = WatermarkStore::restore(mark_backend)?;
        info!(
            pending = queue.len(),
            dir = %state_dir.display(),
            "restored sync state"
        );

        Ok(Self::with_state(config, local, remote, queue, watermarks))
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Returns the local store.
    pub fn local(&self) -> &Arc<L> {
        &self.local
    }

    /// Returns the remote client.
    pub fn remote(&self) -> &Arc<R> {
        &self.remote
    }

    /// Returns the pending queue.
    pub fn queue(&self) -> &PendingQueue {
        &self.queue
    }

    /// Returns the number of queued operations across all scopes.
    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    /// Returns a summary of the queue.
    pub fn queue_stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Returns the pull watermark of a collection for a scope.
    pub fn watermark(&self, collection: &str, scope: &ScopeId) -> Option<Timestamp> {
        self.watermarks.get(collection, scope)
    }

    /// Returns cumulative statistics.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Returns true if a cycle for `scope` is running.
    pub fn is_in_flight(&self, scope: &ScopeId) -> bool {
        self.in_flight.lock().contains(scope)
    }

    /// Asks running cycles to stop at the next item boundary.
    ///
    /// The flag stays set until [`reset_cancel`](Self::reset_cancel).
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Clears the cancellation flag.
    pub fn reset_cancel(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    /// Returns true if there is anything to do for `scope`: queued
    /// operations, or a collection not pulled within `stale_after`.
    pub fn needs_sync(&self, scope: &ScopeId) -> bool {
        if self.queue.count_for_scope(scope) > 0 {
            return true;
        }
        let stale_ms = i64::try_from(self.config.stale_after().as_millis()).unwrap_or(i64::MAX);
        let threshold = Timestamp::now().saturating_sub_millis(stale_ms);
        self.config
            .collections
            .iter()
            .any(|c| self.watermarks.is_stale(&c.name, scope, threshold))
    }

    /// Applies a local mutation and queues it for upload.
    ///
    /// The record must carry a scope. Its `last_modified` is set to now if
    /// missing and never moves behind the stored copy.
    ///
    /// # Errors
    ///
    /// Returns a validation error for unknown collections, records without
    /// scope or with an empty id, and a storage error if the local write or
    /// the queue snapshot fails.
    #[instrument(skip(self, record), fields(record_id = %record.id))]
    pub async fn enqueue_mutation(
        &self,
        collection: &str,
        mut record: Record,
        kind: OperationKind,
    ) -> SyncResult<OpId> {
        self.spec(collection)?;
        let scope = record
            .scope_id
            .clone()
            .ok_or_else(|| SyncError::MissingScope {
                collection: collection.to_owned(),
            })?;
        if record.id.as_str().is_empty() {
            return Err(SyncError::InvalidRecord("record id is empty".into()));
        }

        let now = Timestamp::now();
        let stored = self.local.get(collection, &record.id).await?;
        let mut stamp = record.last_modified.unwrap_or(now);
        if let Some(previous) = stored.as_ref().and_then(|r| r.last_modified) {
            stamp = stamp.max(previous);
        }
        record.last_modified = Some(stamp);
        record.is_pending = true;
        let id = record.id.clone();

        match kind {
            OperationKind::Upsert => self.local.put(collection, record.clone()).await?,
            OperationKind::Delete => self.local.delete(collection, &id).await?,
        }

        let op_id = self
            .queue
            .enqueue(PendingOperation::new(collection, kind, record, scope, now));
        if let Err(e) = self.queue.persist() {
            // An unpersisted mutation must not be pushed later.
            self.queue.remove(op_id);
            self.restore_local(collection, &id, stored).await;
            warn!(%op_id, error = %e, "queue snapshot failed, mutation rolled back");
            return Err(e.into());
        }

        debug!(%op_id, %kind, "queued local mutation");
        Ok(op_id)
    }

    /// Puts back the row that was stored before a rolled-back mutation.
    async fn restore_local(&self, collection: &str, id: &RecordId, previous: Option<Record>) {
        let restored = match previous {
            Some(row) => self.local.put(collection, row).await,
            None => self.local.delete(collection, id).await,
        };
        if let Err(e) = restored {
            warn!(collection, record_id = %id, error = %e, "could not restore local row");
        }
    }

    /// Runs one push-then-pull cycle for `scope`.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::CycleInProgress`] if a cycle for the scope is
    /// already running, [`SyncError::Cancelled`] if cancelled, and a local
    /// storage error if the device store fails. Remote failures do not
    /// abort the cycle; they are reflected in the report.
    #[instrument(skip_all, fields(scope = %scope))]
    pub async fn run_cycle(&self, scope: &ScopeId) -> SyncResult<SyncReport> {
        let _guard = self.begin_cycle(scope)?;
        let start = Instant::now();
        let mut report = SyncReport::new(scope.clone());

        let outcome = match self.push(scope, &mut report).await {
            Ok(()) => self.pull(scope, &mut report).await,
            Err(e) => Err(e),
        };
        report.duration = start.elapsed();

        match outcome {
            Ok(()) => {
                self.stats.write().record(&report);
                info!(
                    pushed = report.pushed,
                    pulled = report.pulled,
                    failed = report.failed,
                    requeued = report.requeued,
                    degraded = report.degraded,
                    "sync cycle finished"
                );
                Ok(report)
            }
            Err(e) => {
                warn!(error = %e, "sync cycle aborted");
                let mut stats = self.stats.write();
                stats.cycles_failed += 1;
                stats.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    /// Merges a realtime change event into the local store.
    ///
    /// Uses the same rules as the pull phase. Watermarks are not touched,
    /// so the next pull still covers the event.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown collections or local storage failures.
    #[instrument(skip_all, fields(collection = %event.collection, change = ?event.change_type))]
    pub async fn apply_change_event(&self, event: ChangeEvent) -> SyncResult<MergeDecision> {
        let spec = self.spec(&event.collection)?;
        let scope = event.scope_id().cloned();
        let merge = self.merge(spec, event.change, scope.as_ref()).await?;

        if merge.conflict.is_some() {
            self.stats.write().conflicts_resolved += 1;
        }
        debug!(decision = ?merge.decision, requeued = merge.requeued, "applied change event");
        Ok(merge.decision)
    }

    /// Queues local rows of `scope` that are marked pending but have no
    /// queued operation.
    ///
    /// This recovers writes whose queue entry was lost between the local
    /// write and the queue snapshot. Returns the number of queued rows.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown collections or storage failures.
    pub async fn reconcile_local(&self, collection: &str, scope: &ScopeId) -> SyncResult<usize> {
        self.spec(collection)?;
        let rows = self
            .local
            .scan_by_index(collection, SCOPE_INDEX, scope.as_str())
            .await?;

        let mut queued = 0;
        for row in rows.into_iter().filter(|r| r.is_pending) {
            if self.queue.contains_record(collection, &row.id) {
                continue;
            }
            self.queue.enqueue(PendingOperation::new(
                collection,
                OperationKind::Upsert,
                row,
                scope.clone(),
                Timestamp::now(),
            ));
            queued += 1;
        }

        if queued > 0 {
            self.queue.persist()?;
            info!(collection, %scope, queued, "queued stranded local changes");
        }
        Ok(queued)
    }

    fn spec(&self, collection: &str) -> SyncResult<&CollectionSpec> {
        self.config
            .collection(collection)
            .ok_or_else(|| SyncError::UnknownCollection(collection.to_owned()))
    }

    fn begin_cycle(&self, scope: &ScopeId) -> SyncResult<InFlightGuard<'_>> {
        if !self.in_flight.lock().insert(scope.clone()) {
            return Err(SyncError::CycleInProgress {
                scope: scope.clone(),
            });
        }
        Ok(InFlightGuard {
            set: &self.in_flight,
            scope: scope.clone(),
        })
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.cancelled.load(Ordering::SeqCst) {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    #[instrument(skip_all)]
    async fn push(&self, scope: &ScopeId, report: &mut SyncReport) -> SyncResult<()> {
        let mut seen = HashSet::new();
        loop {
            let batch: Vec<OpId> = self
                .queue
                .peek_batch_for(scope, usize::MAX)
                .into_iter()
                .map(|op| op.op_id)
                .filter(|op_id| !seen.contains(op_id))
                .take(self.config.push_batch_size)
                .collect();
            if batch.is_empty() {
                return Ok(());
            }

            for op_id in batch {
                self.check_cancelled()?;
                seen.insert(op_id);
                if let PushStep::Stop = self.push_with_retry(op_id, report).await? {
                    report.degraded = true;
                    return Ok(());
                }
            }
        }
    }

    async fn push_with_retry(&self, op_id: OpId, report: &mut SyncReport) -> SyncResult<PushStep> {
        loop {
            let Some(op) = self.queue.get(op_id) else {
                return Ok(PushStep::Done);
            };
            let Some(spec) = self.config.collection(&op.collection) else {
                warn!(collection = %op.collection, %op_id, "operation for unregistered collection left queued");
                report.failed += 1;
                return Ok(PushStep::Done);
            };

            let error = match self.push_one(spec, &op).await {
                Ok(()) => {
                    self.queue.remove(op_id);
                    self.queue.persist()?;
                    report.pushed += 1;
                    debug!(collection = %op.collection, %op_id, record_id = %op.record.id, "pushed");
                    return Ok(PushStep::Done);
                }
                Err(SyncError::Remote(e)) => e,
                Err(other) => return Err(other),
            };

            match error.classify() {
                ErrorClass::Transient => {
                    let attempt = self
                        .queue
                        .record_attempt(op_id, &error.to_string(), Timestamp::now())
                        .unwrap_or(u32::MAX);
                    self.queue.persist()?;

                    if !self.config.retry.should_retry(attempt) {
                        warn!(
                            collection = %op.collection,
                            %op_id,
                            attempt,
                            error = %error,
                            "retries exhausted, leaving operation queued"
                        );
                        report.failed += 1;
                        return Ok(PushStep::Stop);
                    }

                    let delay = self.config.retry.delay_for(attempt);
                    warn!(
                        collection = %op.collection,
                        %op_id,
                        attempt,
                        ?delay,
                        error = %error,
                        "transient push failure, retrying"
                    );
                    report.retries += 1;
                    self.queue.requeue_front(op_id);
                    tokio::time::sleep(delay).await;
                    self.check_cancelled()?;
                }
                ErrorClass::Permanent | ErrorClass::NotFound => {
                    warn!(
                        collection = %op.collection,
                        %op_id,
                        record_id = %op.record.id,
                        error = %error,
                        "push rejected, dropping operation"
                    );
                    self.queue.remove(op_id);
                    self.queue.persist()?;
                    self.settle_pending(&op.collection, op.record_id()).await?;
                    report.failed += 1;
                    report.issues.push(SyncIssue {
                        phase: SyncPhase::Push,
                        collection: op.collection.clone(),
                        op_id: Some(op_id),
                        record_id: Some(op.record.id.clone()),
                        error,
                    });
                    return Ok(PushStep::Done);
                }
            }
        }
    }

    async fn push_one(&self, spec: &CollectionSpec, op: &PendingOperation) -> SyncResult<()> {
        match op.kind {
            OperationKind::Upsert => {
                let payload = op.record.stripped(&spec.local_only_fields);
                let canonical = self
                    .remote
                    .upsert(&spec.name, &payload, &spec.conflict_key)
                    .await?;
                self.confirm_upsert(spec, op, canonical).await
            }
            // A temporary id was never stored remotely.
            OperationKind::Delete if op.record_id().is_temporary() => Ok(()),
            OperationKind::Delete => match self.remote.delete(&spec.name, op.record_id()).await {
                Ok(()) | Err(RemoteError::NotFound) => Ok(()),
                Err(e) => Err(e.into()),
            },
        }
    }

    /// Writes the remote's canonical copy back after a successful upsert,
    /// replacing a temporary id if the remote assigned a permanent one.
    async fn confirm_upsert(
        &self,
        spec: &CollectionSpec,
        op: &PendingOperation,
        canonical: Record,
    ) -> SyncResult<()> {
        let collection = spec.name.as_str();
        let sent_id = op.record_id();
        let new_id = canonical.id.clone();
        let replaced = &new_id != sent_id;

        if replaced {
            self.queue.rewrite_record_id(collection, sent_id, &new_id);
            for reference in &spec.references {
                self.queue
                    .rewrite_reference(&reference.collection, &reference.field, sent_id, &new_id);
            }
        }

        if let Some(local_row) = self.local.get(collection, sent_id).await? {
            let still_pending = self.queue.count_for_record(collection, &new_id) > 1;
            let mut row = match compare_versions(local_row.last_modified, canonical.last_modified) {
                Freshness::LocalNewer => Record {
                    id: new_id.clone(),
                    ..local_row
                },
                _ => with_local_fields(canonical, &local_row, spec),
            };
            row.is_pending = still_pending;

            if replaced {
                self.local.delete(collection, sent_id).await?;
            }
            self.local.put(collection, row).await?;
        }

        if replaced {
            self.rewrite_local_references(spec, sent_id, &new_id).await?;
            info!(collection, temp_id = %sent_id, id = %new_id, "temporary id replaced");
        }
        Ok(())
    }

    async fn rewrite_local_references(
        &self,
        spec: &CollectionSpec,
        old: &RecordId,
        new: &RecordId,
    ) -> SyncResult<()> {
        for reference in &spec.references {
            let rows = self
                .local
                .scan_by_index(&reference.collection, &reference.index, old.as_str())
                .await?;
            for mut row in rows {
                if row.field(&reference.field).and_then(Value::as_str) != Some(old.as_str()) {
                    continue;
                }
                row.set_field(reference.field.clone(), Value::String(new.as_str().to_owned()));
                self.local.put(&reference.collection, row).await?;
            }
        }
        Ok(())
    }

    /// Clears `is_pending` on a local row that has no queued operation left.
    async fn settle_pending(&self, collection: &str, id: &RecordId) -> SyncResult<()> {
        if self.queue.contains_record(collection, id) {
            return Ok(());
        }
        if let Some(mut row) = self.local.get(collection, id).await? {
            if row.is_pending {
                row.is_pending = false;
                self.local.put(collection, row).await?;
            }
        }
        Ok(())
    }

    #[instrument(skip_all)]
    async fn pull(&self, scope: &ScopeId, report: &mut SyncReport) -> SyncResult<()> {
        for spec in &self.config.collections {
            self.check_cancelled()?;

            let since = self.watermarks.since(&spec.name, scope);
            let filter = spec.scope_filter(scope);
            let fetched = match self
                .remote
                .fetch_since(&spec.name, filter.as_ref(), since)
                .await
            {
                Ok(fetched) => fetched,
                Err(error) => {
                    warn!(collection = %spec.name, error = %error, "pull failed, watermark kept");
                    report.degraded = true;
                    if !error.is_transient() {
                        report.issues.push(SyncIssue {
                            phase: SyncPhase::Pull,
                            collection: spec.name.clone(),
                            op_id: None,
                            record_id: None,
                            error,
                        });
                    }
                    continue;
                }
            };

            let count = fetched.changes.len();
            for change in fetched.changes {
                self.check_cancelled()?;
                let merge = self.merge(spec, change, Some(scope)).await?;
                report.pulled += 1;
                if merge.requeued {
                    report.requeued += 1;
                }
                report.conflicts.extend(merge.conflict);
            }

            if self.watermarks.advance(&spec.name, scope, fetched.as_of) {
                self.watermarks.persist()?;
            }
            debug!(collection = %spec.name, changes = count, as_of = %fetched.as_of, "pulled");
        }
        Ok(())
    }

    async fn merge(
        &self,
        spec: &CollectionSpec,
        change: RemoteChange,
        scope_hint: Option<&ScopeId>,
    ) -> SyncResult<Merge> {
        let collection = spec.name.as_str();
        let id = change.id().clone();
        let local = self.local.get(collection, &id).await?;

        if local.is_none() {
            if let Some(deleted) = self.pending_delete_wins(collection, &id, &change) {
                debug!(collection, record_id = %id, "local delete is newer, remote copy not restored");
                let decision = MergeDecision::KeepLocal;
                return Ok(Merge {
                    decision,
                    conflict: Conflict::from_merge(collection, &deleted, &change, decision),
                    requeued: false,
                });
            }
        }

        let decision = resolve(local.as_ref(), &change);
        let conflict = local
            .as_ref()
            .and_then(|l| Conflict::from_merge(collection, l, &change, decision));

        let mut requeued = false;
        match (decision, change) {
            (MergeDecision::Insert | MergeDecision::Overwrite, RemoteChange::Upsert(remote)) => {
                let mut row = match &local {
                    Some(l) => with_local_fields(remote, l, spec),
                    None => remote,
                };
                row.is_pending = self.queue.contains_record(collection, &id);
                self.local.put(collection, row).await?;
            }
            (MergeDecision::Delete, _) => {
                self.local.delete(collection, &id).await?;
            }
            (MergeDecision::KeepLocal | MergeDecision::Resurrect, _) => {
                if let Some(row) = local {
                    requeued = self.requeue_local(spec, row, scope_hint).await?;
                }
            }
            _ => {}
        }

        Ok(Merge {
            decision,
            conflict,
            requeued,
        })
    }

    /// Returns the snapshot of a queued delete that is not older than the
    /// incoming remote upsert.
    fn pending_delete_wins(
        &self,
        collection: &str,
        id: &RecordId,
        change: &RemoteChange,
    ) -> Option<Record> {
        if change.is_tombstone() {
            return None;
        }
        let pending = self.queue.latest_for_record(collection, id)?;
        if !pending.is_delete() {
            return None;
        }
        match compare_versions(pending.record.last_modified, change.modified_at()) {
            Freshness::RemoteNewer => None,
            Freshness::LocalNewer | Freshness::Equal => Some(pending.record),
        }
    }

    async fn requeue_local(
        &self,
        spec: &CollectionSpec,
        mut row: Record,
        scope_hint: Option<&ScopeId>,
    ) -> SyncResult<bool> {
        let collection = spec.name.as_str();
        if self.queue.contains_record(collection, &row.id) {
            return Ok(false);
        }
        let Some(scope) = row.scope_id.clone().or_else(|| scope_hint.cloned()) else {
            warn!(collection, record_id = %row.id, "local copy is newer but has no scope, not queued");
            return Ok(false);
        };

        if !row.is_pending {
            row.is_pending = true;
            self.local.put(collection, row.clone()).await?;
        }
        let record_id = row.id.clone();
        let op_id = self.queue.enqueue(PendingOperation::new(
            collection,
            OperationKind::Upsert,
            row,
            scope,
            Timestamp::now(),
        ));
        self.queue.persist()?;

        debug!(collection, %record_id, %op_id, "local copy is newer, queued for push");
        Ok(true)
    }
}

/// Copies local-only fields and the scope from `local` onto a remote row.
fn with_local_fields(mut remote: Record, local: &Record, spec: &CollectionSpec) -> Record {
    for name in &spec.local_only_fields {
        if let Some(value) = local.fields.get(name) {
            remote
                .fields
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }
    }
    if remote.scope_id.is_none() {
        remote.scope_id = local.scope_id.clone();
    }
    remote
}
