//! # StockSync Storage
//!
//! Durable state slots for the StockSync engine.
//!
//! This crate provides the lowest-level persistence used by the sync engine
//! for its own bookkeeping (the pending-operation queue and the pull
//! watermarks). A backend holds exactly one **opaque byte snapshot**; it
//! does not interpret the data it stores.
//!
//! ## Design Principles
//!
//! - A backend is a single slot: `load`, `store` (full replace), `clear`
//! - `store` is all-or-nothing: a crash leaves either the old or the new
//!   snapshot, never a mix
//! - Must be `Send + Sync` so the engine can share it across tasks
//! - The engine owns the snapshot format
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For testing and ephemeral state
//! - [`FileBackend`] - Persistent slot using write-then-rename
//!
//! ## Example
//!
//! ```rust
//! use stocksync_storage::{StateBackend, InMemoryBackend};
//!
//! let backend = InMemoryBackend::new();
//! assert_eq!(backend.load().unwrap(), None);
//! backend.store(b"snapshot").unwrap();
//! assert_eq!(backend.load().unwrap().as_deref(), Some(&b"snapshot"[..]));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod memory;

pub use backend::StateBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use memory::InMemoryBackend;
