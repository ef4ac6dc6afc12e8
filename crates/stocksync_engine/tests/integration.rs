//! End-to-end sync scenarios against an in-memory remote.

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use stocksync_engine::{
    LocalStore, MemoryLocalStore, RemoteError, RetryPolicy, SyncCoordinator, SyncError, SyncPhase,
    QUEUE_FILE, WATERMARK_FILE,
};
use stocksync_protocol::{
    ChangeEvent, ConflictResolution, MergeDecision, OperationKind, RecordId, ScopeId, Timestamp,
    Tombstone,
};
use stocksync_testkit::prelude::*;
use tempfile::TempDir;

fn north() -> ScopeId {
    ScopeId::new("north")
}

#[tokio::test]
async fn local_write_is_pushed_and_pulled_back() {
    let h = Harness::new();
    h.coordinator
        .enqueue_mutation(INVENTORY, item("i-1", "north", 4, 100), OperationKind::Upsert)
        .await
        .unwrap();

    let report = h.coordinator.run_cycle(&h.scope).await.unwrap();
    assert_eq!(report.pushed, 1);
    assert!(report.is_clean());
    assert_eq!(h.coordinator.pending_count(), 0);

    let remote = h.remote().get(INVENTORY, &RecordId::new("i-1")).unwrap();
    assert_eq!(remote.field("qty"), Some(&json!(4)));

    let local = h.local().record(INVENTORY, &RecordId::new("i-1")).unwrap();
    assert!(!local.is_pending);
    assert_eq!(h.coordinator.stats().cycles_completed, 1);
}

#[tokio::test]
async fn local_only_fields_stay_on_device() {
    let h = Harness::new();
    let record = item("i-1", "north", 4, 100).with_field(DRAFT_NOTE, json!("recount"));
    h.coordinator
        .enqueue_mutation(INVENTORY, record, OperationKind::Upsert)
        .await
        .unwrap();
    h.coordinator.run_cycle(&h.scope).await.unwrap();

    let remote = h.remote().get(INVENTORY, &RecordId::new("i-1")).unwrap();
    assert_eq!(remote.field(DRAFT_NOTE), None);

    // A newer remote version keeps the note.
    h.remote().seed(INVENTORY, item("i-1", "north", 9, 200));
    h.coordinator.run_cycle(&h.scope).await.unwrap();

    let local = h.local().record(INVENTORY, &RecordId::new("i-1")).unwrap();
    assert_eq!(local.field("qty"), Some(&json!(9)));
    assert_eq!(local.field(DRAFT_NOTE), Some(&json!("recount")));
}

#[tokio::test]
async fn newer_local_copy_survives_pull_and_is_pushed() {
    let h = Harness::new();
    h.remote().seed(INVENTORY, item("i-1", "north", 1, 100));
    h.local().put(INVENTORY, item("i-1", "north", 5, 200)).await.unwrap();

    let report = h.coordinator.run_cycle(&h.scope).await.unwrap();
    assert_eq!(report.pulled, 1);
    assert_eq!(report.requeued, 1);
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].resolution, ConflictResolution::KeepLocal);

    let local = h.local().record(INVENTORY, &RecordId::new("i-1")).unwrap();
    assert_eq!(local.field("qty"), Some(&json!(5)));
    assert!(local.is_pending);
    assert_eq!(h.coordinator.pending_count(), 1);

    let report = h.coordinator.run_cycle(&h.scope).await.unwrap();
    assert_eq!(report.pushed, 1);
    let remote = h.remote().get(INVENTORY, &RecordId::new("i-1")).unwrap();
    assert_eq!(remote.field("qty"), Some(&json!(5)));
    assert!(!h.local().record(INVENTORY, &RecordId::new("i-1")).unwrap().is_pending);
}

#[tokio::test]
async fn queued_write_survives_older_pull_while_push_fails() {
    let h = Harness::new();
    let id = RecordId::new("i-7");
    h.coordinator
        .enqueue_mutation(INVENTORY, item("i-7", "north", 9, 200), OperationKind::Upsert)
        .await
        .unwrap();
    h.remote().seed(INVENTORY, item("i-7", "north", 3, 100));
    h.remote().fail_times(FaultTarget::Upsert, RemoteError::Timeout, 3);

    let report = h.coordinator.run_cycle(&h.scope).await.unwrap();
    assert!(report.degraded);
    assert_eq!(report.pulled, 1);
    assert_eq!(report.requeued, 0);
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].resolution, ConflictResolution::KeepLocal);

    let local = h.local().record(INVENTORY, &id).unwrap();
    assert_eq!(local.last_modified, Some(Timestamp::from_millis(200)));
    assert_eq!(local.field("qty"), Some(&json!(9)));
    assert!(local.is_pending);
    assert_eq!(h.coordinator.pending_count(), 1);

    let report = h.coordinator.run_cycle(&h.scope).await.unwrap();
    assert_eq!(report.pushed, 1);
    let remote = h.remote().get(INVENTORY, &id).unwrap();
    assert_eq!(remote.last_modified, Some(Timestamp::from_millis(200)));
    assert_eq!(remote.field("qty"), Some(&json!(9)));
    assert!(!h.local().record(INVENTORY, &id).unwrap().is_pending);
}

#[tokio::test]
async fn older_local_copy_is_overwritten() {
    let h = Harness::new();
    h.local().put(INVENTORY, item("i-1", "north", 1, 100)).await.unwrap();
    h.remote().seed(INVENTORY, item("i-1", "north", 7, 300));

    let report = h.coordinator.run_cycle(&h.scope).await.unwrap();
    assert_eq!(report.conflicts[0].resolution, ConflictResolution::AcceptRemote);
    let local = h.local().record(INVENTORY, &RecordId::new("i-1")).unwrap();
    assert_eq!(local.field("qty"), Some(&json!(7)));
    assert_eq!(h.coordinator.pending_count(), 0);
}

#[tokio::test]
async fn transient_failures_are_retried_within_the_cycle() {
    let h = Harness::new();
    h.coordinator
        .enqueue_mutation(INVENTORY, item("i-1", "north", 4, 100), OperationKind::Upsert)
        .await
        .unwrap();
    h.remote()
        .fail_times(FaultTarget::Upsert, RemoteError::Timeout, 2);

    let report = h.coordinator.run_cycle(&h.scope).await.unwrap();
    assert_eq!(report.pushed, 1);
    assert_eq!(report.retries, 2);
    assert!(!report.degraded);
    assert_eq!(h.remote().calls().upserts, 3);
    assert_eq!(h.coordinator.pending_count(), 0);
    assert!(!h.local().record(INVENTORY, &RecordId::new("i-1")).unwrap().is_pending);
}

#[tokio::test]
async fn attempt_count_records_failures_before_success() {
    let config = inventory_config().with_retry(
        RetryPolicy::new(2)
            .with_base_delay(Duration::ZERO)
            .with_max_delay(Duration::ZERO),
    );
    let h = Harness::with_config(config);
    let op_id = h
        .coordinator
        .enqueue_mutation(INVENTORY, item("i-1", "north", 4, 100), OperationKind::Upsert)
        .await
        .unwrap();
    h.remote().fail_times(FaultTarget::Upsert, RemoteError::Timeout, 2);

    let report = h.coordinator.run_cycle(&h.scope).await.unwrap();
    assert_eq!(report.pushed, 0);
    assert_eq!(report.retries, 1);

    let op = h.coordinator.queue().get(op_id).unwrap();
    assert_eq!(op.attempt_count, 2);
    assert!(op.last_attempt_at.is_some());
    assert!(op.last_error.is_some());

    let report = h.coordinator.run_cycle(&h.scope).await.unwrap();
    assert_eq!(report.pushed, 1);
    assert!(h.coordinator.queue().get(op_id).is_none());
    assert_eq!(h.remote().calls().upserts, 3);
    assert!(!h.local().record(INVENTORY, &RecordId::new("i-1")).unwrap().is_pending);
}

#[tokio::test]
async fn exhausted_retries_leave_operation_queued() {
    let h = Harness::new();
    let op_id = h
        .coordinator
        .enqueue_mutation(INVENTORY, item("i-1", "north", 4, 100), OperationKind::Upsert)
        .await
        .unwrap();
    h.remote()
        .fail_times(FaultTarget::Upsert, RemoteError::network("reset"), 3);

    let report = h.coordinator.run_cycle(&h.scope).await.unwrap();
    assert_eq!(report.pushed, 0);
    assert_eq!(report.failed, 1);
    assert!(report.degraded);

    let op = h.coordinator.queue().get(op_id).unwrap();
    assert_eq!(op.attempt_count, 3);
    assert!(op.last_error.is_some());
    assert!(h.local().record(INVENTORY, &RecordId::new("i-1")).unwrap().is_pending);

    // The remote recovers.
    let report = h.coordinator.run_cycle(&h.scope).await.unwrap();
    assert_eq!(report.pushed, 1);
    assert_eq!(h.coordinator.pending_count(), 0);
}

#[tokio::test]
async fn exhausted_retries_stop_the_push_phase() {
    let h = Harness::new();
    for id in ["i-1", "i-2"] {
        h.coordinator
            .enqueue_mutation(INVENTORY, item(id, "north", 1, 100), OperationKind::Upsert)
            .await
            .unwrap();
    }
    h.remote().fail_times(FaultTarget::Upsert, RemoteError::Timeout, 3);

    let report = h.coordinator.run_cycle(&h.scope).await.unwrap();
    assert!(report.degraded);
    assert_eq!(h.remote().calls().upserts, 3);
    assert_eq!(h.coordinator.pending_count(), 2);
}

#[tokio::test]
async fn permanent_rejection_drops_operation_with_issue() {
    let h = Harness::new();
    let op_id = h
        .coordinator
        .enqueue_mutation(INVENTORY, item("i-1", "north", -3, 100), OperationKind::Upsert)
        .await
        .unwrap();
    h.coordinator
        .enqueue_mutation(INVENTORY, item("i-2", "north", 2, 100), OperationKind::Upsert)
        .await
        .unwrap();
    h.remote()
        .fail_next(FaultTarget::Upsert, RemoteError::rejected(422, "negative quantity"));

    let report = h.coordinator.run_cycle(&h.scope).await.unwrap();
    assert_eq!(report.pushed, 1);
    assert_eq!(report.failed, 1);
    assert!(!report.is_clean());
    assert_eq!(report.issues.len(), 1);

    let issue = &report.issues[0];
    assert_eq!(issue.phase, SyncPhase::Push);
    assert_eq!(issue.op_id, Some(op_id));
    assert_eq!(issue.record_id, Some(RecordId::new("i-1")));

    assert_eq!(h.coordinator.pending_count(), 0);
    assert!(!h.local().record(INVENTORY, &RecordId::new("i-1")).unwrap().is_pending);
}

#[tokio::test]
async fn tombstones_delete_or_resurrect_by_timestamp() {
    let h = Harness::new();
    h.local().put(INVENTORY, item("keep", "north", 5, 500)).await.unwrap();
    h.local().put(INVENTORY, item("drop", "north", 5, 100)).await.unwrap();
    h.remote()
        .seed_tombstone(INVENTORY, "keep", Some(north()), Timestamp::from_millis(400));
    h.remote()
        .seed_tombstone(INVENTORY, "drop", Some(north()), Timestamp::from_millis(300));

    let report = h.coordinator.run_cycle(&h.scope).await.unwrap();
    assert_eq!(report.pulled, 2);
    assert_eq!(report.requeued, 1);
    assert!(h.local().record(INVENTORY, &RecordId::new("drop")).is_none());
    assert!(h.local().record(INVENTORY, &RecordId::new("keep")).is_some());

    let conflicts = &report.conflicts;
    assert_eq!(conflicts.len(), 2);
    assert!(conflicts.iter().all(|c| c.is_update_delete_conflict()));

    h.coordinator.run_cycle(&h.scope).await.unwrap();
    let revived = h.remote().get(INVENTORY, &RecordId::new("keep")).unwrap();
    assert_eq!(revived.last_modified, Some(Timestamp::from_millis(500)));
}

#[tokio::test]
async fn tombstone_with_equal_timestamp_resurrects() {
    let h = Harness::new();
    h.local().put(INVENTORY, item("i-1", "north", 5, 400)).await.unwrap();
    h.remote()
        .seed_tombstone(INVENTORY, "i-1", Some(north()), Timestamp::from_millis(400));

    let report = h.coordinator.run_cycle(&h.scope).await.unwrap();
    assert_eq!(report.requeued, 1);
    assert!(h.local().record(INVENTORY, &RecordId::new("i-1")).is_some());
}

#[tokio::test]
async fn local_delete_reaches_remote() {
    let h = Harness::new();
    h.coordinator
        .enqueue_mutation(INVENTORY, item("i-1", "north", 4, 100), OperationKind::Upsert)
        .await
        .unwrap();
    h.coordinator.run_cycle(&h.scope).await.unwrap();

    h.coordinator
        .enqueue_mutation(INVENTORY, item("i-1", "north", 4, 200), OperationKind::Delete)
        .await
        .unwrap();
    assert!(h.local().record(INVENTORY, &RecordId::new("i-1")).is_none());

    let report = h.coordinator.run_cycle(&h.scope).await.unwrap();
    assert_eq!(report.pushed, 1);
    assert!(h.remote().is_deleted(INVENTORY, &RecordId::new("i-1")));
    assert!(h.local().record(INVENTORY, &RecordId::new("i-1")).is_none());
}

#[tokio::test]
async fn queued_delete_is_not_undone_by_older_remote_copy() {
    let h = Harness::new();
    let id = RecordId::new("i-1");
    h.remote().seed(INVENTORY, item("i-1", "north", 1, 100));
    h.coordinator.run_cycle(&h.scope).await.unwrap();

    // Another device edits before our delete reaches the remote.
    h.remote().seed(INVENTORY, item("i-1", "north", 2, 200));
    h.coordinator
        .enqueue_mutation(INVENTORY, item("i-1", "north", 1, 500), OperationKind::Delete)
        .await
        .unwrap();
    h.remote().fail_times(FaultTarget::Delete, RemoteError::Timeout, 3);

    let report = h.coordinator.run_cycle(&h.scope).await.unwrap();
    assert!(report.degraded);
    assert_eq!(report.pulled, 1);
    assert_eq!(report.conflicts.len(), 1);
    assert_eq!(report.conflicts[0].resolution, ConflictResolution::KeepLocal);
    assert!(h.local().record(INVENTORY, &id).is_none());
    assert_eq!(h.coordinator.pending_count(), 1);

    let report = h.coordinator.run_cycle(&h.scope).await.unwrap();
    assert_eq!(report.pushed, 1);
    assert!(h.remote().is_deleted(INVENTORY, &id));
    assert!(h.local().record(INVENTORY, &id).is_none());
}

#[tokio::test]
async fn change_event_does_not_undo_queued_delete() {
    let h = Harness::new();
    let id = RecordId::new("i-1");
    h.local().put(INVENTORY, item("i-1", "north", 1, 100)).await.unwrap();
    h.coordinator
        .enqueue_mutation(INVENTORY, item("i-1", "north", 1, 500), OperationKind::Delete)
        .await
        .unwrap();

    let decision = h
        .coordinator
        .apply_change_event(ChangeEvent::update(INVENTORY, item("i-1", "north", 2, 200)))
        .await
        .unwrap();
    assert_eq!(decision, MergeDecision::KeepLocal);
    assert!(h.local().record(INVENTORY, &id).is_none());
    assert_eq!(h.coordinator.pending_count(), 1);
    assert_eq!(h.coordinator.stats().conflicts_resolved, 1);

    // A remote edit made after the delete still wins.
    let decision = h
        .coordinator
        .apply_change_event(ChangeEvent::update(INVENTORY, item("i-1", "north", 3, 900)))
        .await
        .unwrap();
    assert_eq!(decision, MergeDecision::Insert);
}

#[tokio::test]
async fn delete_of_missing_remote_row_counts_as_pushed() {
    let h = Harness::new();
    h.coordinator
        .enqueue_mutation(INVENTORY, item("ghost", "north", 0, 100), OperationKind::Delete)
        .await
        .unwrap();

    let report = h.coordinator.run_cycle(&h.scope).await.unwrap();
    assert_eq!(report.pushed, 1);
    assert!(report.issues.is_empty());
    assert_eq!(h.remote().calls().deletes, 1);
}

#[tokio::test]
async fn temporary_ids_are_replaced_everywhere() {
    let h = Harness::new();
    let temp = RecordId::temporary();
    h.coordinator
        .enqueue_mutation(INVENTORY, item(temp.clone(), "north", 8, 100), OperationKind::Upsert)
        .await
        .unwrap();
    h.coordinator
        .enqueue_mutation(STOCK_MOVES, stock_move("m-1", "north", &temp, 8), OperationKind::Upsert)
        .await
        .unwrap();

    let report = h.coordinator.run_cycle(&h.scope).await.unwrap();
    assert_eq!(report.pushed, 2);

    let rows = h.local().records(INVENTORY);
    assert_eq!(rows.len(), 1);
    let permanent = rows[0].id.clone();
    assert!(!permanent.is_temporary());
    assert!(h.local().record(INVENTORY, &temp).is_none());

    let local_move = h.local().record(STOCK_MOVES, &RecordId::new("m-1")).unwrap();
    assert_eq!(local_move.field("item_id"), Some(&json!(permanent.as_str())));
    let remote_move = h.remote().get(STOCK_MOVES, &RecordId::new("m-1")).unwrap();
    assert_eq!(remote_move.field("item_id"), Some(&json!(permanent.as_str())));
}

#[tokio::test]
async fn delete_of_unpushed_temporary_row_skips_remote() {
    let h = Harness::new();
    let temp = RecordId::temporary();
    h.coordinator
        .enqueue_mutation(INVENTORY, item(temp.clone(), "north", 8, 100), OperationKind::Upsert)
        .await
        .unwrap();
    h.coordinator
        .enqueue_mutation(INVENTORY, item(temp.clone(), "north", 8, 200), OperationKind::Delete)
        .await
        .unwrap();
    h.remote().fail_next(FaultTarget::Upsert, RemoteError::rejected(400, "bad"));

    let report = h.coordinator.run_cycle(&h.scope).await.unwrap();
    assert_eq!(report.pushed, 1);
    assert_eq!(h.remote().calls().deletes, 0);
    assert_eq!(h.coordinator.pending_count(), 0);
}

#[tokio::test]
async fn shared_collections_pull_every_scope() {
    let h = Harness::new();
    h.remote().seed(PRODUCTS, product("p-1", "A-100", "Anchor", 10));
    h.remote().seed(PRODUCTS, product("p-2", "B-200", "Bolt", 10));
    h.remote().seed(INVENTORY, item("south-1", "south", 3, 10));

    h.coordinator.run_cycle(&h.scope).await.unwrap();
    assert_eq!(h.local().len(PRODUCTS), 2);
    assert_eq!(h.local().len(INVENTORY), 0);
}

#[tokio::test]
async fn conflict_key_upsert_adopts_remote_id() {
    let h = Harness::new();
    h.remote().seed(PRODUCTS, product("p-1", "A-100", "Anchor", 10));

    let temp = RecordId::temporary();
    let mut local = product(temp.clone(), "A-100", "Anchor XL", 50);
    local.scope_id = Some(north());
    h.coordinator
        .enqueue_mutation(PRODUCTS, local, OperationKind::Upsert)
        .await
        .unwrap();
    h.coordinator.run_cycle(&h.scope).await.unwrap();

    assert!(h.local().record(PRODUCTS, &temp).is_none());
    let adopted = h.local().record(PRODUCTS, &RecordId::new("p-1")).unwrap();
    assert_eq!(adopted.field("name"), Some(&json!("Anchor XL")));
    assert_eq!(h.remote().records(PRODUCTS).len(), 1);
}

#[tokio::test]
async fn watermark_follows_server_clock() {
    let h = Harness::new();
    h.remote().seed(INVENTORY, item("i-1", "north", 1, 10));

    h.coordinator.run_cycle(&h.scope).await.unwrap();
    let first = h.coordinator.watermark(INVENTORY, &h.scope).unwrap();
    assert_eq!(first, h.remote().now());

    // Nothing new: the second pull sees no changes.
    let report = h.coordinator.run_cycle(&h.scope).await.unwrap();
    assert_eq!(report.pulled, 0);
    assert_eq!(h.coordinator.watermark(INVENTORY, &h.scope), Some(first));
}

#[tokio::test]
async fn failed_pull_keeps_watermark() {
    let h = Harness::new();
    h.coordinator.run_cycle(&h.scope).await.unwrap();
    let before = h.coordinator.watermark(INVENTORY, &h.scope);

    h.remote().seed(INVENTORY, item("i-1", "north", 1, 10));
    h.remote().seed(PRODUCTS, product("p-1", "A-100", "Anchor", 10));
    h.remote()
        .fail_next(FaultTarget::Fetch, RemoteError::server(503, "unavailable"));

    let report = h.coordinator.run_cycle(&h.scope).await.unwrap();
    assert!(report.degraded);
    assert!(report.issues.is_empty());
    assert_eq!(h.coordinator.watermark(INVENTORY, &h.scope), before);
    assert_eq!(h.local().len(PRODUCTS), 1);

    // The skipped change arrives on the next cycle.
    let report = h.coordinator.run_cycle(&h.scope).await.unwrap();
    assert_eq!(report.pulled, 1);
    assert!(h.local().record(INVENTORY, &RecordId::new("i-1")).is_some());
}

#[tokio::test]
async fn rejected_pull_is_reported() {
    let h = Harness::new();
    h.remote()
        .fail_next(FaultTarget::Fetch, RemoteError::rejected(403, "forbidden"));

    let report = h.coordinator.run_cycle(&h.scope).await.unwrap();
    assert!(report.degraded);
    assert_eq!(report.issues.len(), 1);
    assert_eq!(report.issues[0].phase, SyncPhase::Pull);
    assert_eq!(report.issues[0].collection, INVENTORY);
    assert_eq!(h.coordinator.watermark(INVENTORY, &h.scope), None);
}

#[tokio::test]
async fn offline_remote_degrades_without_losing_work() {
    let h = Harness::new();
    h.coordinator
        .enqueue_mutation(INVENTORY, item("i-1", "north", 1, 10), OperationKind::Upsert)
        .await
        .unwrap();
    h.remote().set_offline(true);

    let report = h.coordinator.run_cycle(&h.scope).await.unwrap();
    assert!(report.degraded);
    assert_eq!(h.coordinator.pending_count(), 1);

    h.remote().set_offline(false);
    let report = h.coordinator.run_cycle(&h.scope).await.unwrap();
    assert_eq!(report.pushed, 1);
}

#[tokio::test]
async fn local_storage_failure_aborts_cycle() {
    let h = Harness::new();
    h.coordinator
        .enqueue_mutation(INVENTORY, item("i-1", "north", 1, 10), OperationKind::Upsert)
        .await
        .unwrap();
    h.local().set_failing(true);

    let err = h.coordinator.run_cycle(&h.scope).await.unwrap_err();
    assert!(matches!(err, SyncError::LocalStorage(_)));
    assert_eq!(h.coordinator.pending_count(), 1);
    assert_eq!(h.coordinator.watermark(INVENTORY, &h.scope), None);
    assert_eq!(h.coordinator.stats().cycles_failed, 1);
    assert!(!h.coordinator.is_in_flight(&h.scope));

    h.local().set_failing(false);
    let report = h.coordinator.run_cycle(&h.scope).await.unwrap();
    assert_eq!(report.pushed, 1);
    assert_eq!(h.remote().records(INVENTORY).len(), 1);
}

#[tokio::test]
async fn scopes_sync_independently() {
    let h = Harness::new();
    let south = ScopeId::new("south");
    h.coordinator
        .enqueue_mutation(INVENTORY, item("n-1", "north", 1, 10), OperationKind::Upsert)
        .await
        .unwrap();
    h.coordinator
        .enqueue_mutation(INVENTORY, item("s-1", "south", 1, 10), OperationKind::Upsert)
        .await
        .unwrap();

    let report = h.coordinator.run_cycle(&south).await.unwrap();
    assert_eq!(report.pushed, 1);
    assert_eq!(h.coordinator.queue_stats().by_scope.get(&north()), Some(&1));
    assert_eq!(h.coordinator.watermark(INVENTORY, &h.scope), None);
}

#[tokio::test]
async fn state_survives_reopen() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let remote = Arc::new(MemoryRemote::new());
    remote.seed(INVENTORY, item("r-1", "north", 1, 10));

    {
        let coordinator = SyncCoordinator::open(
            inventory_config(),
            Arc::new(MemoryLocalStore::new()),
            Arc::clone(&remote),
            dir.path(),
        )
        .unwrap();
        coordinator.run_cycle(&north()).await.unwrap();
        coordinator
            .enqueue_mutation(INVENTORY, item("i-1", "north", 4, 100), OperationKind::Upsert)
            .await
            .unwrap();
    }
    assert!(dir.path().join(QUEUE_FILE).exists());
    assert!(dir.path().join(WATERMARK_FILE).exists());

    let reopened = SyncCoordinator::open(
        inventory_config(),
        Arc::new(MemoryLocalStore::new()),
        Arc::clone(&remote),
        dir.path(),
    )
    .unwrap();
    assert_eq!(reopened.pending_count(), 1);
    assert!(reopened.watermark(INVENTORY, &north()).is_some());

    let report = reopened.run_cycle(&north()).await.unwrap();
    assert_eq!(report.pushed, 1);
    // Only the new write is pulled; r-1 is behind the restored watermark.
    assert!(reopened.local().record(INVENTORY, &RecordId::new("r-1")).is_none());
}

#[tokio::test]
async fn state_directory_is_exclusive() {
    let dir = TempDir::new().unwrap();
    let _first = SyncCoordinator::open(
        inventory_config(),
        Arc::new(MemoryLocalStore::new()),
        Arc::new(MemoryRemote::new()),
        dir.path(),
    )
    .unwrap();

    let second = SyncCoordinator::open(
        inventory_config(),
        Arc::new(MemoryLocalStore::new()),
        Arc::new(MemoryRemote::new()),
        dir.path(),
    );
    assert!(matches!(second, Err(SyncError::LocalStorage(_))));
}

#[tokio::test]
async fn change_events_merge_without_moving_watermarks() {
    let h = Harness::new();

    let decision = h
        .coordinator
        .apply_change_event(ChangeEvent::insert(INVENTORY, item("i-1", "north", 3, 100)))
        .await
        .unwrap();
    assert_eq!(decision, MergeDecision::Insert);
    assert!(h.local().record(INVENTORY, &RecordId::new("i-1")).is_some());

    let decision = h
        .coordinator
        .apply_change_event(ChangeEvent::update(INVENTORY, item("i-1", "north", 6, 200)))
        .await
        .unwrap();
    assert_eq!(decision, MergeDecision::Overwrite);

    let decision = h
        .coordinator
        .apply_change_event(ChangeEvent::delete(
            INVENTORY,
            Tombstone {
                id: RecordId::new("i-1"),
                scope_id: Some(north()),
                deleted_at: Some(Timestamp::from_millis(150)),
            },
        ))
        .await
        .unwrap();
    assert_eq!(decision, MergeDecision::Resurrect);
    assert_eq!(h.coordinator.pending_count(), 1);
    assert_eq!(h.coordinator.watermark(INVENTORY, &h.scope), None);
    assert_eq!(h.coordinator.stats().conflicts_resolved, 2);
}

#[tokio::test]
async fn change_event_for_unknown_collection_fails() {
    let h = Harness::new();
    let err = h
        .coordinator
        .apply_change_event(ChangeEvent::insert("orders", item("o-1", "north", 1, 1)))
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::UnknownCollection(_)));
}

#[tokio::test]
async fn two_devices_converge() {
    let fleet = Fleet::new(2);
    let (a, b) = (&fleet.devices[0], &fleet.devices[1]);

    a.enqueue_mutation(INVENTORY, item("i-1", "north", 1, 100), OperationKind::Upsert)
        .await
        .unwrap();
    b.enqueue_mutation(INVENTORY, item("i-1", "north", 2, 200), OperationKind::Upsert)
        .await
        .unwrap();
    b.enqueue_mutation(INVENTORY, item("i-2", "north", 5, 150), OperationKind::Upsert)
        .await
        .unwrap();

    fleet.sync_all(&north()).await;
    fleet.sync_all(&north()).await;

    for device in [a, b] {
        let one = device.local().record(INVENTORY, &RecordId::new("i-1")).unwrap();
        assert_eq!(one.field("qty"), Some(&json!(2)));
        assert_eq!(device.local().len(INVENTORY), 2);
        assert_eq!(device.pending_count(), 0);
    }
}
