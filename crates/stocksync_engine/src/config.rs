//! Configuration for the sync engine.

use crate::retry::RetryPolicy;
use std::time::Duration;
use stocksync_protocol::ScopeId;

/// How a collection is partitioned on the remote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Partition {
    /// Each scope only sees its own rows; pulls filter by scope.
    ByScope,
    /// Every scope sees every row; pulls are unfiltered.
    Shared,
}

/// A field in another collection that stores ids of this collection.
///
/// When a temporary id is replaced, rows of `collection` whose `field`
/// holds the old id are rewritten. `index` names the local index used to
/// find them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    /// Collection holding the reference.
    pub collection: String,
    /// Field holding the referenced id.
    pub field: String,
    /// Local index over `field`.
    pub index: String,
}

/// Sync settings for one replicated collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSpec {
    /// Collection name, identical locally and remotely.
    pub name: String,
    /// Partitioning of the remote table.
    pub partition: Partition,
    /// Column the remote upsert resolves conflicts on.
    pub conflict_key: String,
    /// Fields that are never sent to the remote.
    pub local_only_fields: Vec<String>,
    /// Fields elsewhere that reference this collection's ids.
    pub references: Vec<Reference>,
}

impl CollectionSpec {
    /// Creates a scope-partitioned collection keyed on `id`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            partition: Partition::ByScope,
            conflict_key: "id".into(),
            local_only_fields: Vec::new(),
            references: Vec::new(),
        }
    }

    /// Marks the collection as shared by all scopes.
    pub fn shared(mut self) -> Self {
        self.partition = Partition::Shared;
        self
    }

    /// Sets the remote conflict key.
    pub fn with_conflict_key(mut self, key: impl Into<String>) -> Self {
        self.conflict_key = key.into();
        self
    }

    /// Sets the local-only fields.
    pub fn with_local_only_fields<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.local_only_fields = fields.into_iter().map(Into::into).collect();
        self
    }

    /// Adds a reference from `collection.field` into this collection.
    pub fn with_reference(
        mut self,
        collection: impl Into<String>,
        field: impl Into<String>,
        index: impl Into<String>,
    ) -> Self {
        self.references.push(Reference {
            collection: collection.into(),
            field: field.into(),
            index: index.into(),
        });
        self
    }

    /// Returns the scope filter to pull with when syncing `scope`.
    pub fn scope_filter(&self, scope: &ScopeId) -> Option<ScopeId> {
        match self.partition {
            Partition::ByScope => Some(scope.clone()),
            Partition::Shared => None,
        }
    }
}

/// Configuration for sync operations.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Replicated collections, pulled in this order.
    pub collections: Vec<CollectionSpec>,
    /// Maximum operations drained from the queue per batch.
    pub push_batch_size: usize,
    /// Retry policy for transient push failures.
    pub retry: RetryPolicy,
    /// Period of the automatic sync timer.
    pub sync_interval: Duration,
    /// Age after which a watermark counts as stale. Defaults to
    /// `sync_interval`.
    pub stale_after: Option<Duration>,
}

impl SyncConfig {
    /// Creates a configuration with no collections.
    pub fn new() -> Self {
        Self {
            collections: Vec::new(),
            push_batch_size: 20,
            retry: RetryPolicy::default(),
            sync_interval: Duration::from_secs(60),
            stale_after: None,
        }
    }

    /// Registers a collection.
    pub fn with_collection(mut self, spec: CollectionSpec) -> Self {
        self.collections.retain(|c| c.name != spec.name);
        self.collections.push(spec);
        self
    }

    /// Sets the push batch size.
    pub fn with_push_batch_size(mut self, size: usize) -> Self {
        self.push_batch_size = size.max(1);
        self
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the automatic sync interval.
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Sets the staleness threshold for watermarks.
    pub fn with_stale_after(mut self, age: Duration) -> Self {
        self.stale_after = Some(age);
        self
    }

    /// Looks up a registered collection.
    pub fn collection(&self, name: &str) -> Option<&CollectionSpec> {
        self.collections.iter().find(|c| c.name == name)
    }

    /// Returns the effective staleness threshold.
    pub fn stale_after(&self) -> Duration {
        self.stale_after.unwrap_or(self.sync_interval)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}
