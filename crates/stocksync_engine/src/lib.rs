//! # StockSync Engine
//!
//! Offline-first bidirectional sync between a device-local store and an
//! authoritative remote backend.
//!
//! This crate provides:
//! - A durable FIFO of pending mutations ([`PendingQueue`])
//! - Per-collection, per-scope pull watermarks ([`WatermarkStore`])
//! - The push-then-pull [`SyncCoordinator`]
//! - Exponential backoff for transient failures ([`RetryPolicy`])
//! - Automatic scheduling on reconnect and on a timer
//!   ([`ConnectivityMonitor`])
//!
//! ## Architecture
//!
//! Local writes go to the [`LocalStore`] immediately and are recorded in
//! the queue. A cycle for a scope first pushes that scope's queued
//! operations, then pulls remote changes newer than the watermark and
//! merges them with last-write-wins.
//!
//! ## Key Invariants
//!
//! - Queued operations are pushed in enqueue order and removed only after
//!   the remote confirmed them or rejected them permanently
//! - Watermarks never move backwards and come from the server clock
//! - At most one cycle per scope runs at a time
//! - A local record newer than the remote copy is never overwritten

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod coordinator;
mod error;
mod local;
mod monitor;
mod queue;
mod remote;
mod report;
mod retry;
mod watermark;

pub use config::{CollectionSpec, Partition, Reference, SyncConfig};
pub use coordinator::{SyncCoordinator, QUEUE_FILE, WATERMARK_FILE};
pub use error::{
    ErrorClass, RemoteError, RemoteResult, StoreError, StoreResult, SyncError, SyncResult,
};
pub use local::{LocalStore, MemoryLocalStore};
pub use monitor::{Connectivity, ConnectivityMonitor};
pub use queue::{PendingQueue, QueueStats};
pub use remote::RemoteClient;
pub use report::{SyncIssue, SyncPhase, SyncReport, SyncStats};
pub use retry::RetryPolicy;
pub use watermark::WatermarkStore;
