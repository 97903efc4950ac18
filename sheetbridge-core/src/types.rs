//! Domain types shared by the sync engine, the daemon and the CLI.
//!
//! Field values are kept as `serde_json::Value` so text, numbers and dates
//! (ISO strings) pass through untouched; the engine never enforces a schema
//! beyond column identity.

use std::borrow::Borrow;
use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Named scalar fields of one record, keyed by column name.
pub type FieldMap = BTreeMap<String, Value>;

// ---------------------------------------------------------------------------
// Newtypes
// ---------------------------------------------------------------------------

/// Stable business key of a record (e.g. an order code).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordKey(pub String);

impl RecordKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for RecordKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for RecordKey {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl Borrow<str> for RecordKey {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Logical grouping that versions and subscriptions are scoped to
/// (typically one watched sheet).
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CollectionName(pub String);

impl CollectionName {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when the name can stand as a single file stem: non-empty, no
    /// path separators or control characters, and no leading dot (which
    /// also rules out `.` and `..`).
    pub fn is_plain(&self) -> bool {
        let name = self.0.as_str();
        !name.is_empty()
            && !name.starts_with('.')
            && name.trim() == name
            && !name
                .chars()
                .any(|c| matches!(c, '/' | '\\' | ':') || c.is_control())
    }
}

impl fmt::Display for CollectionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<String> for CollectionName {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for CollectionName {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl Borrow<str> for CollectionName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Which side of the bridge a write came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    /// The web client, writing to the relational store.
    Internal,
    /// The human-edited sheet, via its change notification.
    External,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Internal => write!(f, "internal"),
            Source::External => write!(f, "external"),
        }
    }
}

// ---------------------------------------------------------------------------
// Domain structs
// ---------------------------------------------------------------------------

/// A stored record: business key, columns, and the freshness timestamp used
/// by guarded upserts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: RecordKey,
    #[serde(default)]
    pub fields: FieldMap,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// A buffered write waiting for the next flush tick. At most one exists per
/// key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingUpdate {
    pub collection: CollectionName,
    pub key: RecordKey,
    /// Internal (storage) key names.
    pub fields: FieldMap,
    pub source: Source,
    /// When the write happened at its origin; decides conflicts.
    pub timestamp: DateTime<Utc>,
    /// When the queue accepted it.
    pub enqueued_at: DateTime<Utc>,
    /// Failed flush attempts so far.
    #[serde(default)]
    pub attempts: u32,
}

/// One entry of a collection's change history, as returned to pollers and
/// pushed to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedChange {
    pub key: RecordKey,
    pub fields: FieldMap,
    pub version: u64,
    pub recorded_at: DateTime<Utc>,
    pub external: bool,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn newtype_display() {
        assert_eq!(RecordKey::from("DH001").to_string(), "DH001");
        assert_eq!(CollectionName::from("F3").to_string(), "F3");
    }

    #[test]
    fn plain_collection_names() {
        for name in ["orders", "F3", "stock_2026", "Q1 sales"] {
            assert!(CollectionName::from(name).is_plain(), "{name}");
        }
        for name in ["", ".", "..", "../escaped", "a/b", "a\\b", ".hidden", " orders", "c:x", "bad\n"] {
            assert!(!CollectionName::from(name).is_plain(), "{name:?}");
        }
    }

    #[test]
    fn source_serializes_lowercase() {
        assert_eq!(serde_json::to_value(Source::Internal).unwrap(), json!("internal"));
        assert_eq!(Source::External.to_string(), "external");
    }

    #[test]
    fn record_key_is_transparent_in_json() {
        let change = VersionedChange {
            key: RecordKey::from("DH001"),
            fields: FieldMap::new(),
            version: 7,
            recorded_at: Utc::now(),
            external: false,
        };
        let value = serde_json::to_value(&change).unwrap();
        assert_eq!(value["key"], json!("DH001"));
        assert_eq!(value["version"], json!(7));
    }

    #[test]
    fn pending_update_defaults_attempts() {
        let raw = json!({
            "collection": "orders",
            "key": "DH001",
            "fields": {"status": "a"},
            "source": "external",
            "timestamp": "2024-01-01T00:00:00Z",
            "enqueued_at": "2024-01-01T00:00:01Z",
        });
        let update: PendingUpdate = serde_json::from_value(raw).unwrap();
        assert_eq!(update.attempts, 0);
        assert_eq!(update.source, Source::External);
    }
}
