//! Remote backend abstraction.

use crate::error::RemoteResult;
use async_trait::async_trait;
use stocksync_protocol::{FetchResult, Record, RecordId, ScopeId, Timestamp};

/// The authoritative remote backend.
///
/// This trait abstracts the network layer, so the coordinator can run
/// against a hosted database, a REST service, or an in-memory double in
/// tests.
#[async_trait]
pub trait RemoteClient: Send + Sync {
    /// Fetches changes made after `since`.
    ///
    /// With `scope = Some(..)` only rows of that scope are returned. The
    /// result's `as_of` is the server time up to which it is complete.
    async fn fetch_since(
        &self,
        collection: &str,
        scope: Option<&ScopeId>,
        since: Timestamp,
    ) -> RemoteResult<FetchResult>;

    /// Creates or updates a record, resolving conflicts on `conflict_key`.
    ///
    /// Returns the canonical stored record, whose id is permanent even if
    /// the submitted one was temporary.
    async fn upsert(
        &self,
        collection: &str,
        record: &Record,
        conflict_key: &str,
    ) -> RemoteResult<Record>;

    /// Deletes a record.
    async fn delete(&self, collection: &str, id: &RecordId) -> RemoteResult<()>;
}
