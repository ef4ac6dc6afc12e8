//! # StockSync Testkit
//!
//! Test utilities for StockSync.
//!
//! This crate provides:
//! - [`MemoryRemote`], an authoritative in-memory backend with scripted
//!   failures
//! - Fixtures for records, configurations and coordinators
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use stocksync_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn pushes_local_write() {
//!     let h = Harness::new();
//!     h.coordinator.enqueue_mutation("inventory", item("a", "north", 3, 100), OperationKind::Upsert).await.unwrap();
//!     h.coordinator.run_cycle(&h.scope).await.unwrap();
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod remote;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::remote::*;
}

pub use fixtures::*;
pub use generators::*;
pub use remote::*;
