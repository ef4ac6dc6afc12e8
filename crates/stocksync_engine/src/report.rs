//! Cycle reports and cumulative statistics.

use crate::error::RemoteError;
use std::time::{Duration, Instant};
use stocksync_protocol::{Conflict, OpId, RecordId, ScopeId};

/// Phase of a sync cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    /// Uploading queued operations.
    Push,
    /// Downloading remote changes.
    Pull,
}

/// A failure that did not abort the cycle but needs attention.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncIssue {
    /// Where it happened.
    pub phase: SyncPhase,
    /// Affected collection.
    pub collection: String,
    /// Operation that failed, for push issues.
    pub op_id: Option<OpId>,
    /// Record that failed, for push issues.
    pub record_id: Option<RecordId>,
    /// The remote error.
    pub error: RemoteError,
}

/// Outcome of one sync cycle.
#[derive(Debug, Clone)]
pub struct SyncReport {
    /// Scope the cycle ran for.
    pub scope: ScopeId,
    /// Operations confirmed by the remote.
    pub pushed: usize,
    /// Remote changes merged locally.
    pub pulled: usize,
    /// Operations that were rejected or ran out of retries.
    pub failed: usize,
    /// Local records queued again because they beat a remote change.
    pub requeued: usize,
    /// Retries performed after transient failures.
    pub retries: usize,
    /// True if some work was left undone because of transient failures.
    pub degraded: bool,
    /// Failures worth surfacing.
    pub issues: Vec<SyncIssue>,
    /// Conflicts resolved during the pull.
    pub conflicts: Vec<Conflict>,
    /// Wall time of the cycle.
    pub duration: Duration,
}

impl SyncReport {
    /// Creates an empty report.
    pub fn new(scope: ScopeId) -> Self {
        Self {
            scope,
            pushed: 0,
            pulled: 0,
            failed: 0,
            requeued: 0,
            retries: 0,
            degraded: false,
            issues: Vec::new(),
            conflicts: Vec::new(),
            duration: Duration::ZERO,
        }
    }

    /// Returns true if everything went through.
    pub fn is_clean(&self) -> bool {
        !self.degraded && self.failed == 0 && self.issues.is_empty()
    }
}

/// Statistics accumulated over the coordinator's lifetime.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Cycles that returned a report.
    pub cycles_completed: u64,
    /// Cycles that returned an error.
    pub cycles_failed: u64,
    /// Operations pushed.
    pub operations_pushed: u64,
    /// Changes pulled.
    pub operations_pulled: u64,
    /// Conflicts resolved.
    pub conflicts_resolved: u64,
    /// Retries after transient failures.
    pub retries: u64,
    /// Completion time of the last successful cycle.
    pub last_sync_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

impl SyncStats {
    pub(crate) fn record(&mut self, report: &SyncReport) {
        self.cycles_completed += 1;
        self.operations_pushed += report.pushed as u64;
        self.operations_pulled += report.pulled as u64;
        self.conflicts_resolved += report.conflicts.len() as u64;
        self.retries += report.retries as u64;
        self.last_sync_time = Some(Instant::now());
        self.last_error = None;
    }
}
