//! # StockSync Protocol
//!
//! Data model shared by the StockSync engine and its remotes.
//!
//! This crate provides:
//! - [`Record`] with its [`RecordId`], [`ScopeId`] and [`Timestamp`]
//! - [`PendingOperation`] for mutations awaiting upload
//! - [`RemoteChange`] and [`ChangeEvent`] for server-side changes
//! - Last-write-wins resolution in [`conflict`]
//! - CBOR encoding helpers in [`codec`]
//!
//! This is a pure data crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod change;
pub mod codec;
pub mod conflict;
mod error;
mod operation;
mod record;

pub use change::{ChangeEvent, ChangeType, FetchResult, RemoteChange, Tombstone};
pub use codec::{from_cbor, to_cbor};
pub use conflict::{compare_versions, resolve, Conflict, ConflictResolution, Freshness, MergeDecision};
pub use error::{CodecError, CodecResult};
pub use operation::{OpId, OperationKind, PendingOperation};
pub use record::{Record, RecordId, ScopeId, Timestamp, SCOPE_INDEX, TEMP_ID_PREFIX};
