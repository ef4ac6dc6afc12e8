//! Test fixtures and coordinator helpers.
//!
//! Provides an inventory-shaped configuration and a harness wiring a
//! coordinator to an in-memory local store and a [`MemoryRemote`].

use crate::remote::MemoryRemote;
use serde_json::json;
use std::path::Path;
use std::sync::{Arc, Once};
use std::time::Duration;
use stocksync_engine::{CollectionSpec, MemoryLocalStore, RetryPolicy, SyncConfig, SyncCoordinator};
use stocksync_protocol::{Record, RecordId, ScopeId, Timestamp};
use tempfile::TempDir;

/// Scoped collection of stock levels.
pub const INVENTORY: &str = "inventory";
/// Shared product catalogue, matched on `sku`.
pub const PRODUCTS: &str = "products";
/// Scoped stock movements referencing inventory rows by `item_id`.
pub const STOCK_MOVES: &str = "stock_moves";
/// Local-only field of inventory rows.
pub const DRAFT_NOTE: &str = "draft_note";

static TRACING: Once = Once::new();

/// Installs a test-friendly tracing subscriber once per process.
///
/// Honors `RUST_LOG`, defaulting to `warn`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Configuration with the three fixture collections.
///
/// Retries use zero delays so tests do not wait.
pub fn inventory_config() -> SyncConfig {
    SyncConfig::new()
        .with_collection(
            CollectionSpec::new(INVENTORY)
                .with_local_only_fields([DRAFT_NOTE])
                .with_reference(STOCK_MOVES, "item_id", "item_id"),
        )
        .with_collection(CollectionSpec::new(PRODUCTS).shared().with_conflict_key("sku"))
        .with_collection(CollectionSpec::new(STOCK_MOVES))
        .with_retry(
            RetryPolicy::new(3)
                .with_base_delay(Duration::ZERO)
                .with_max_delay(Duration::ZERO),
        )
}

/// An inventory row with a quantity and an explicit timestamp.
pub fn item(id: impl Into<RecordId>, scope: &str, qty: i64, modified: i64) -> Record {
    Record::new(id, Some(ScopeId::new(scope)))
        .with_field("qty", json!(qty))
        .with_last_modified(Timestamp::from_millis(modified))
}

/// A product row keyed by `sku`.
pub fn product(id: impl Into<RecordId>, sku: &str, name: &str, modified: i64) -> Record {
    Record::new(id, None)
        .with_field("sku", json!(sku))
        .with_field("name", json!(name))
        .with_last_modified(Timestamp::from_millis(modified))
}

/// A stock movement pointing at an inventory row.
pub fn stock_move(id: impl Into<RecordId>, scope: &str, item_id: &RecordId, delta: i64) -> Record {
    Record::new(id, Some(ScopeId::new(scope)))
        .with_field("item_id", json!(item_id.as_str()))
        .with_field("delta", json!(delta))
}

/// Coordinator wired to in-memory stores.
pub struct Harness {
    /// The coordinator under test.
    pub coordinator: Arc<SyncCoordinator<MemoryLocalStore, MemoryRemote>>,
    /// Default scope used by the harness.
    pub scope: ScopeId,
    _state_dir: Option<TempDir>,
}

impl Harness {
    /// Creates a harness with [`inventory_config`] and scope `north`.
    pub fn new() -> Self {
        Self::with_config(inventory_config())
    }

    /// Creates a harness with a custom configuration.
    pub fn with_config(config: SyncConfig) -> Self {
        init_tracing();
        let coordinator = SyncCoordinator::new(
            config,
            Arc::new(MemoryLocalStore::new()),
            Arc::new(MemoryRemote::new()),
        );
        Self {
            coordinator: Arc::new(coordinator),
            scope: ScopeId::new("north"),
            _state_dir: None,
        }
    }

    /// Creates a harness whose queue and watermarks persist in a fresh
    /// temporary directory.
    pub fn persistent() -> Self {
        init_tracing();
        let dir = TempDir::new().expect("Failed to create temp directory");
        let coordinator = SyncCoordinator::open(
            inventory_config(),
            Arc::new(MemoryLocalStore::new()),
            Arc::new(MemoryRemote::new()),
            dir.path(),
        )
        .expect("Failed to open coordinator");
        Self {
            coordinator: Arc::new(coordinator),
            scope: ScopeId::new("north"),
            _state_dir: Some(dir),
        }
    }

    /// Returns the state directory of a persistent harness.
    pub fn state_dir(&self) -> Option<&Path> {
        self._state_dir.as_ref().map(|d| d.path())
    }

    /// Returns the local store.
    pub fn local(&self) -> &MemoryLocalStore {
        self.coordinator.local()
    }

    /// Returns the remote.
    pub fn remote(&self) -> &MemoryRemote {
        self.coordinator.remote()
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

/// Several devices sharing one remote.
pub struct Fleet {
    /// The shared remote.
    pub remote: Arc<MemoryRemote>,
    /// One coordinator per device.
    pub devices: Vec<Arc<SyncCoordinator<MemoryLocalStore, MemoryRemote>>>,
}

impl Fleet {
    /// Creates `count` devices with [`inventory_config`].
    pub fn new(count: usize) -> Self {
        init_tracing();
        let remote = Arc::new(MemoryRemote::new());
        let devices = (0..count)
            .map(|_| {
                Arc::new(SyncCoordinator::new(
                    inventory_config(),
                    Arc::new(MemoryLocalStore::new()),
                    Arc::clone(&remote),
                ))
            })
            .collect();
        Self { remote, devices }
    }

    /// Runs one cycle on every device in order.
    pub async fn sync_all(&self, scope: &ScopeId) {
        for device in &self.devices {
            device
                .run_cycle(scope)
                .await
                .expect("Sync cycle should succeed");
        }
    }
}
