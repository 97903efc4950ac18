//! Record store adapter: source-aware upsert policy over a storage driver.
//!
//! ## Policies
//!
//! - `Trusted` (web-client writes): overwrite the given columns, stamp
//!   freshness with the flush time.
//! - `FreshnessGuarded(ts)` (sheet writes): overwrite only when the stored
//!   freshness is absent or `<= ts`, so a late sheet notification cannot
//!   clobber a newer client write. A rejected write is a silent no-op.
//!
//! Column names that are not plain lower-case identifiers never reach the
//! driver.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use sheetbridge_core::{
    CollectionName, FieldMap, Normalizer, PendingUpdate, Record, RecordKey, Source,
};

use crate::error::StoreError;

/// Longest column name accepted, matching the usual SQL identifier limit.
pub const MAX_COLUMN_LEN: usize = 63;

// ---------------------------------------------------------------------------
// Driver seam
// ---------------------------------------------------------------------------

/// Storage driver. Records are addressed by collection (a table) and
/// business key. Implementations must apply `upsert` atomically: the guard
/// comparison and the write happen under one lock or statement.
pub trait RecordStore: Send + Sync {
    /// Merge `columns` into the record for `key` in `collection`, creating
    /// it if absent, and set its freshness to `freshness`.
    ///
    /// When `guard` is `Some(ts)` the write only happens if the stored
    /// freshness is absent or `<= ts`; otherwise `Ok(None)` is returned.
    fn upsert(
        &self,
        collection: &CollectionName,
        key: &RecordKey,
        columns: &FieldMap,
        freshness: DateTime<Utc>,
        guard: Option<DateTime<Utc>>,
    ) -> Result<Option<Record>, StoreError>;

    fn get(&self, collection: &CollectionName, key: &RecordKey)
        -> Result<Option<Record>, StoreError>;

    /// Number of stored records across all collections.
    fn count(&self) -> Result<usize, StoreError>;
}

/// In-process driver backed by a map. Used by the daemon and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<(CollectionName, RecordKey), Record>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record as-is, bypassing any policy.
    pub fn insert(&self, collection: &CollectionName, record: Record) {
        self.records
            .lock()
            .insert((collection.clone(), record.key.clone()), record);
    }
}

impl RecordStore for MemoryStore {
    fn upsert(
        &self,
        collection: &CollectionName,
        key: &RecordKey,
        columns: &FieldMap,
        freshness: DateTime<Utc>,
        guard: Option<DateTime<Utc>>,
    ) -> Result<Option<Record>, StoreError> {
        let mut records = self.records.lock();
        let slot = (collection.clone(), key.clone());
        let record = records.entry(slot).or_insert_with(|| Record {
            key: key.clone(),
            fields: FieldMap::new(),
            updated_at: None,
        });

        if let (Some(limit), Some(stored)) = (guard, record.updated_at) {
            if stored > limit {
                return Ok(None);
            }
        }

        for (name, value) in columns {
            record.fields.insert(name.clone(), value.clone());
        }
        record.updated_at = Some(freshness);
        Ok(Some(record.clone()))
    }

    fn get(
        &self,
        collection: &CollectionName,
        key: &RecordKey,
    ) -> Result<Option<Record>, StoreError> {
        Ok(self
            .records
            .lock()
            .get(&(collection.clone(), key.clone()))
            .cloned())
    }

    fn count(&self) -> Result<usize, StoreError> {
        Ok(self.records.lock().len())
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

/// How an upsert treats the record's stored freshness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertPolicy {
    Trusted,
    FreshnessGuarded(DateTime<Utc>),
}

impl UpsertPolicy {
    /// Client writes are trusted; sheet writes are guarded by their own
    /// timestamp.
    pub fn for_update(update: &PendingUpdate) -> Self {
        match update.source {
            Source::Internal => UpsertPolicy::Trusted,
            Source::External => UpsertPolicy::FreshnessGuarded(update.timestamp),
        }
    }
}

/// Result of an adapter upsert.
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    /// The write landed. `columns` is exactly what was written.
    Applied { record: Record, columns: FieldMap },
    /// Guarded write found an equal-or-newer stored record.
    Stale,
    /// Nothing valid left to write after column validation.
    NoColumns,
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// Applies column validation, status normalization and the upsert policy in
/// front of a [`RecordStore`].
#[derive(Clone)]
pub struct RecordStoreAdapter {
    store: Arc<dyn RecordStore>,
    normalizer: Normalizer,
}

impl RecordStoreAdapter {
    pub fn new(store: Arc<dyn RecordStore>, normalizer: Normalizer) -> Self {
        Self { store, normalizer }
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        &self.store
    }

    pub fn upsert(
        &self,
        collection: &CollectionName,
        key: &RecordKey,
        fields: &FieldMap,
        policy: UpsertPolicy,
    ) -> Result<UpsertOutcome, StoreError> {
        self.upsert_at(collection, key, fields, policy, Utc::now())
    }

    pub(crate) fn upsert_at(
        &self,
        collection: &CollectionName,
        key: &RecordKey,
        fields: &FieldMap,
        policy: UpsertPolicy,
        now: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        let mut columns = FieldMap::new();
        for (name, value) in fields {
            if is_valid_column(name) {
                columns.insert(name.clone(), value.clone());
            } else {
                tracing::warn!("dropping invalid column name {name:?} for '{collection}/{key}'");
            }
        }
        if columns.is_empty() {
            tracing::warn!("upsert for '{collection}/{key}' has no valid columns; skipping");
            return Ok(UpsertOutcome::NoColumns);
        }
        self.normalizer.normalize_fields(&mut columns);

        let (freshness, guard) = match policy {
            UpsertPolicy::Trusted => (now, None),
            UpsertPolicy::FreshnessGuarded(ts) => (ts, Some(ts)),
        };

        match self.store.upsert(collection, key, &columns, freshness, guard)? {
            Some(record) => {
                tracing::debug!("upserted '{collection}/{key}' ({} column(s))", columns.len());
                Ok(UpsertOutcome::Applied { record, columns })
            }
            None => {
                tracing::info!("stale write skipped for '{collection}/{key}': stored record is newer");
                Ok(UpsertOutcome::Stale)
            }
        }
    }
}

/// `^[a-z_][a-z0-9_]*$`, at most [`MAX_COLUMN_LEN`] bytes.
pub fn is_valid_column(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    name.len() <= MAX_COLUMN_LEN
        && (first.is_ascii_lowercase() || first == '_')
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}
