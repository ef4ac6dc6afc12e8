//! Records and their identifiers.

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Prefix that marks a client-generated identifier awaiting a permanent one.
pub const TEMP_ID_PREFIX: &str = "tmp-";

/// Name of the index every local store keeps over `Record::scope_id`.
pub const SCOPE_INDEX: &str = "scope_id";

/// Identifier of a record within its collection.
///
/// Identifiers starting with [`TEMP_ID_PREFIX`] were minted offline and
/// are replaced by the server's permanent identifier on first upload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    /// Creates an identifier from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Mints a fresh temporary identifier.
    #[must_use]
    pub fn temporary() -> Self {
        Self(format!("{TEMP_ID_PREFIX}{}", uuid::Uuid::new_v4()))
    }

    /// Returns true if the server has not assigned this record an id yet.
    #[must_use]
    pub fn is_temporary(&self) -> bool {
        self.0.starts_with(TEMP_ID_PREFIX)
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for RecordId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identifier of a partition of the data set, such as a warehouse area.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopeId(String);

impl ScopeId {
    /// Creates a scope identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScopeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ScopeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ScopeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Milliseconds since the Unix epoch, UTC.
///
/// Ordering is plain integer ordering, so comparisons between timestamps
/// taken on different devices are only as good as their clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// The Unix epoch.
    pub const EPOCH: Timestamp = Timestamp(0);

    /// Creates a timestamp from milliseconds since the epoch.
    #[must_use]
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Returns the current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis())
    }

    /// Returns milliseconds since the epoch.
    #[must_use]
    pub const fn as_millis(&self) -> i64 {
        self.0
    }

    /// Parses an RFC 3339 string such as `2024-05-01T10:00:00.250Z`.
    ///
    /// Returns `None` for unparseable input, which callers treat the same
    /// as a missing timestamp.
    #[must_use]
    pub fn parse_rfc3339(s: &str) -> Option<Self> {
        DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| Self(dt.with_timezone(&Utc).timestamp_millis()))
    }

    /// Formats the timestamp as RFC 3339 with millisecond precision.
    #[must_use]
    pub fn to_rfc3339(&self) -> String {
        match Utc.timestamp_millis_opt(self.0).single() {
            Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
            None => self.0.to_string(),
        }
    }

    /// Returns the timestamp `millis` milliseconds earlier, saturating.
    #[must_use]
    pub const fn saturating_sub_millis(&self, millis: i64) -> Self {
        Self(self.0.saturating_sub(millis))
    }

    /// Returns the timestamp `millis` milliseconds later, saturating.
    #[must_use]
    pub const fn saturating_add_millis(&self, millis: i64) -> Self {
        Self(self.0.saturating_add(millis))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_rfc3339())
    }
}

/// A keyed entity in a collection.
///
/// `fields` carries the payload as JSON values. Fields that exist only on
/// the device (display helpers, markers) are stripped before upload by the
/// engine according to the collection's configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Record identifier.
    pub id: RecordId,
    /// Partition the record belongs to, if the collection is partitioned.
    pub scope_id: Option<ScopeId>,
    /// Payload fields.
    pub fields: Map<String, Value>,
    /// Time of the last modification, if known.
    pub last_modified: Option<Timestamp>,
    /// True while a local change to this record has not been confirmed.
    #[serde(default)]
    pub is_pending: bool,
}

impl Record {
    /// Creates an empty record.
    pub fn new(id: impl Into<RecordId>, scope_id: Option<ScopeId>) -> Self {
        Self {
            id: id.into(),
            scope_id,
            fields: Map::new(),
            last_modified: None,
            is_pending: false,
        }
    }

    /// Sets a field, builder style.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: Value) -> Self {
        self.fields.insert(name.into(), value);
        self
    }

    /// Sets the modification time, builder style.
    #[must_use]
    pub fn with_last_modified(mut self, ts: Timestamp) -> Self {
        self.last_modified = Some(ts);
        self
    }

    /// Returns a field value.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Sets a field in place.
    pub fn set_field(&mut self, name: impl Into<String>, value: Value) {
        self.fields.insert(name.into(), value);
    }

    /// Returns the key this record is indexed under for `index`.
    ///
    /// The [`SCOPE_INDEX`] index maps to `scope_id`; any other name maps to
    /// the field of that name. Strings, numbers and booleans are indexable.
    #[must_use]
    pub fn index_key(&self, index: &str) -> Option<String> {
        if index == SCOPE_INDEX {
            return self.scope_id.as_ref().map(|s| s.as_str().to_owned());
        }
        match self.fields.get(index)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    /// Returns a copy without the named fields and the pending marker.
    #[must_use]
    pub fn stripped(&self, local_only: &[String]) -> Record {
        let mut copy = self.clone();
        for name in local_only {
            copy.fields.remove(name);
        }
        copy.is_pending = false;
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn temporary_ids() {
        let a = RecordId::temporary();
        let b = RecordId::temporary();
        assert!(a.is_temporary());
        assert_ne!(a, b);
        assert!(!RecordId::new("42").is_temporary());
    }

    #[test]
    fn timestamp_rfc3339() {
        let ts = Timestamp::parse_rfc3339("2024-05-01T10:00:00.250Z").unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-05-01T10:00:00.250Z");

        let offset = Timestamp::parse_rfc3339("2024-05-01T12:00:00.250+02:00").unwrap();
        assert_eq!(ts, offset);

        assert!(Timestamp::parse_rfc3339("yesterday").is_none());
    }

    #[test]
    fn timestamp_ordering() {
        let earlier = Timestamp::from_millis(1_000);
        let later = earlier.saturating_add_millis(1);
        assert!(earlier < later);
        assert_eq!(Timestamp::from_millis(i64::MIN).saturating_sub_millis(5).as_millis(), i64::MIN);
    }

    #[test]
    fn index_keys() {
        let record = Record::new("r1", Some(ScopeId::new("area-9")))
            .with_field("product_id", json!("tmp-abc"))
            .with_field("bin", json!(14))
            .with_field("tags", json!(["a"]));

        assert_eq!(record.index_key(SCOPE_INDEX).as_deref(), Some("area-9"));
        assert_eq!(record.index_key("product_id").as_deref(), Some("tmp-abc"));
        assert_eq!(record.index_key("bin").as_deref(), Some("14"));
        assert_eq!(record.index_key("tags"), None);
        assert_eq!(record.index_key("missing"), None);
    }

    #[test]
    fn stripped_drops_local_fields() {
        let mut record = Record::new("r1", None)
            .with_field("name", json!("Nut"))
            .with_field("area_name", json!("North"));
        record.is_pending = true;

        let clean = record.stripped(&["area_name".to_owned()]);
        assert!(clean.field("area_name").is_none());
        assert_eq!(clean.field("name"), Some(&json!("Nut")));
        assert!(!clean.is_pending);
        assert!(record.field("area_name").is_some());
    }
}
