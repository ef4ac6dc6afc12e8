//! Property-based test generators using proptest.
//!
//! Provides strategies for records, remote changes and device edit
//! scripts.

use proptest::prelude::*;
use serde_json::json;
use stocksync_protocol::{Record, RecordId, RemoteChange, ScopeId, Timestamp, Tombstone};

/// Strategy for ids drawn from a small pool, so edits collide.
pub fn record_id_strategy() -> impl Strategy<Value = RecordId> {
    (0u8..6).prop_map(|n| RecordId::new(format!("item-{n}")))
}

/// Strategy for optional timestamps, mostly present.
pub fn timestamp_strategy() -> impl Strategy<Value = Option<Timestamp>> {
    prop_oneof![
        1 => Just(None),
        6 => (0i64..10_000).prop_map(|ms| Some(Timestamp::from_millis(ms))),
    ]
}

/// Strategy for inventory rows in `scope`.
pub fn record_strategy(scope: &str) -> impl Strategy<Value = Record> {
    let scope = ScopeId::new(scope);
    (record_id_strategy(), -50i64..500, timestamp_strategy()).prop_map(move |(id, qty, ts)| {
        let mut record = Record::new(id, Some(scope.clone())).with_field("qty", json!(qty));
        record.last_modified = ts;
        record
    })
}

/// Strategy for remote changes in `scope`, one in four a tombstone.
pub fn remote_change_strategy(scope: &str) -> impl Strategy<Value = RemoteChange> {
    let scope_id = ScopeId::new(scope);
    prop_oneof![
        3 => record_strategy(scope).prop_map(RemoteChange::Upsert),
        1 => (record_id_strategy(), timestamp_strategy()).prop_map(move |(id, deleted_at)| {
            RemoteChange::Tombstone(Tombstone {
                id,
                scope_id: Some(scope_id.clone()),
                deleted_at,
            })
        }),
    ]
}

/// One local edit made by one device.
#[derive(Debug, Clone)]
pub enum Edit {
    /// Set `qty` of an item.
    Set {
        /// Editing device.
        device: usize,
        /// Item index.
        item: u8,
        /// New quantity.
        qty: i64,
    },
    /// Delete an item.
    Delete {
        /// Editing device.
        device: usize,
        /// Item index.
        item: u8,
    },
}

impl Edit {
    /// Returns the editing device.
    pub fn device(&self) -> usize {
        match self {
            Edit::Set { device, .. } | Edit::Delete { device, .. } => *device,
        }
    }
}

/// Strategy for edit scripts over `devices` devices and a few items.
pub fn edit_script_strategy(devices: usize) -> impl Strategy<Value = Vec<Edit>> {
    let edit = prop_oneof![
        4 => (0..devices, 0u8..4, 0i64..100)
            .prop_map(|(device, item, qty)| Edit::Set { device, item, qty }),
        1 => (0..devices, 0u8..4).prop_map(|(device, item)| Edit::Delete { device, item }),
    ];
    prop::collection::vec(edit, 1..20)
}
