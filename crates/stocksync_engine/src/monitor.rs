//! Connectivity-driven sync scheduling.

use crate::coordinator::SyncCoordinator;
use crate::error::SyncError;
use crate::local::LocalStore;
use crate::remote::RemoteClient;
use crate::report::SyncReport;
use parking_lot::RwLock;
use std::sync::Arc;
use stocksync_protocol::ScopeId;
use tokio::sync::{broadcast, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Network reachability as seen by the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    /// The remote cannot be reached.
    Offline,
    /// The remote is reachable.
    Online,
}

/// Triggers sync cycles when the device comes online and on a timer.
///
/// The host reports reachability through
/// [`set_connectivity`](Self::set_connectivity) and drives
/// [`run`](Self::run) on a task. Reports of every triggered cycle are
/// broadcast to subscribers.
pub struct ConnectivityMonitor<L: LocalStore, R: RemoteClient> {
    coordinator: Arc<SyncCoordinator<L, R>>,
    scopes: RwLock<Vec<ScopeId>>,
    state: watch::Sender<Connectivity>,
    shutdown: watch::Sender<bool>,
    reports: broadcast::Sender<SyncReport>,
}

impl<L: LocalStore, R: RemoteClient> ConnectivityMonitor<L, R> {
    /// Creates a monitor in the given initial state.
    pub fn new(coordinator: Arc<SyncCoordinator<L, R>>, initial: Connectivity) -> Self {
        let (state, _) = watch::channel(initial);
        let (shutdown, _) = watch::channel(false);
        let (reports, _) = broadcast::channel(64);
        Self {
            coordinator,
            scopes: RwLock::new(Vec::new()),
            state,
            shutdown,
            reports,
        }
    }

    /// Adds a scope to the set synced automatically.
    pub fn register_scope(&self, scope: ScopeId) {
        let mut scopes = self.scopes.write();
        if !scopes.contains(&scope) {
            scopes.push(scope);
        }
    }

    /// Removes a scope from automatic sync.
    pub fn unregister_scope(&self, scope: &ScopeId) {
        self.scopes.write().retain(|s| s != scope);
    }

    /// Returns the registered scopes.
    pub fn scopes(&self) -> Vec<ScopeId> {
        self.scopes.read().clone()
    }

    /// Publishes a new connectivity state.
    pub fn set_connectivity(&self, state: Connectivity) {
        self.state.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
    }

    /// Returns the current connectivity state.
    pub fn connectivity(&self) -> Connectivity {
        *self.state.borrow()
    }

    /// Subscribes to connectivity changes.
    pub fn watch_connectivity(&self) -> watch::Receiver<Connectivity> {
        self.state.subscribe()
    }

    /// Subscribes to reports of triggered cycles.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncReport> {
        self.reports.subscribe()
    }

    /// Stops [`run`](Self::run) after the current trigger.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    /// Runs a cycle for every registered scope, or only for those that
    /// need one. Scopes with a cycle in flight are skipped.
    ///
    /// Returns the reports of the cycles that ran.
    pub async fn trigger(&self, only_needed: bool) -> Vec<SyncReport> {
        let mut reports = Vec::new();
        for scope in self.scopes() {
            if self.coordinator.is_in_flight(&scope) {
                debug!(%scope, "cycle in flight, trigger coalesced");
                continue;
            }
            if only_needed && !self.coordinator.needs_sync(&scope) {
                continue;
            }

            match self.coordinator.run_cycle(&scope).await {
                Ok(report) => {
                    // No subscribers is fine.
                    let _ = self.reports.send(report.clone());
                    reports.push(report);
                }
                Err(SyncError::CycleInProgress { .. }) => {
                    debug!(%scope, "cycle started elsewhere, trigger coalesced");
                }
                Err(e) => warn!(%scope, error = %e, "triggered cycle failed"),
            }
        }
        reports
    }

    /// Drives automatic sync until [`shutdown`](Self::shutdown).
    ///
    /// An `Offline` to `Online` transition syncs every scope with queued
    /// work or a stale watermark. While online, every registered scope is
    /// synced once per `sync_interval`.
    pub async fn run(&self) {
        let mut state_rx = self.state.subscribe();
        let mut shutdown_rx = self.shutdown.subscribe();
        let period = self.coordinator.config().sync_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut last = *state_rx.borrow_and_update();
        info!(state = ?last, ?period, "connectivity monitor started");

        loop {
            if *shutdown_rx.borrow_and_update() {
                break;
            }

            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let now = *state_rx.borrow_and_update();
                    if last == Connectivity::Offline && now == Connectivity::Online {
                        info!("back online, syncing scopes with pending work");
                        self.trigger(true).await;
                    }
                    last = now;
                }
                _ = ticker.tick() => {
                    if *state_rx.borrow() == Connectivity::Online {
                        debug!("periodic sync");
                        self.trigger(false).await;
                    }
                }
            }
        }

        info!("connectivity monitor stopped");
    }
}
