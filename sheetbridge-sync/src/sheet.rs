//! The external document side: mirroring rows out to the sheet.
//!
//! [`SheetFile`] keeps each collection as one JSON document at
//! `<root>/<collection>.json`. Row writes are hash-gated and atomic:
//!
//! 1. Load the collection document (empty if missing).
//! 2. Merge the incoming cells into the stored row.
//! 3. SHA-256 the merged row; skip if it matches the stored row's digest.
//! 4. Write to `<path>.tmp`.
//! 5. Rename to the final path (atomic on POSIX).
//!
//! Row digests are also what the daemon's watcher diffs to find which rows a
//! human edited.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use sheetbridge_core::{CollectionName, FieldMap, RecordKey};

use crate::error::{sheet_io_err, PropagationError};

/// Outcome of mirroring one row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SheetWrite {
    Written,
    /// Merged row identical to what the sheet already holds.
    Unchanged,
}

/// Write access to the external document.
pub trait SheetDocument: Send + Sync {
    /// Merge `row` (sheet labels → values) into the row for `key`.
    fn write_row(
        &self,
        collection: &CollectionName,
        key: &RecordKey,
        row: &FieldMap,
    ) -> Result<SheetWrite, PropagationError>;
}

// ---------------------------------------------------------------------------
// File-backed sheet
// ---------------------------------------------------------------------------

/// On-disk payload of one collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SheetContents {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rows: BTreeMap<RecordKey, FieldMap>,
}

/// Per-row digests of a collection, keyed by business key.
pub type RowFingerprints = BTreeMap<RecordKey, String>;

/// One JSON file per collection under a root directory.
#[derive(Debug)]
pub struct SheetFile {
    root: PathBuf,
    // Serializes read-merge-write cycles within this process.
    write_lock: Mutex<()>,
}

impl SheetFile {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<collection>.json`. Names that are not a single plain path
    /// component are refused so nothing is written outside `root`.
    pub fn path_for(&self, collection: &CollectionName) -> Result<PathBuf, PropagationError> {
        if !collection.is_plain() {
            return Err(PropagationError::InvalidCollection(collection.to_string()));
        }
        Ok(self.root.join(format!("{}.json", collection.as_str())))
    }

    /// Load a collection. Returns an empty document if the file does not
    /// yet exist.
    pub fn load(&self, collection: &CollectionName) -> Result<SheetContents, PropagationError> {
        load_path(&self.path_for(collection)?)
    }

    /// Save a collection atomically (`.tmp` + rename).
    pub fn save(
        &self,
        collection: &CollectionName,
        contents: &SheetContents,
    ) -> Result<(), PropagationError> {
        let path = self.path_for(collection)?;
        std::fs::create_dir_all(&self.root).map_err(|e| sheet_io_err(&self.root, e))?;

        let json = serde_json::to_string_pretty(contents)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &json).map_err(|e| sheet_io_err(&tmp, e))?;
        if let Err(e) = std::fs::rename(&tmp, &path) {
            let _ = std::fs::remove_file(&tmp);
            return Err(sheet_io_err(&path, e));
        }
        Ok(())
    }

    /// Collection a sheet file path belongs to, if it is one of ours.
    pub fn collection_for_path(&self, path: &Path) -> Option<CollectionName> {
        if path.parent()? != self.root.as_path() {
            return None;
        }
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);
        if !is_json {
            return None;
        }
        path.file_stem()
            .and_then(|stem| stem.to_str())
            .map(CollectionName::from)
            .filter(CollectionName::is_plain)
    }
}

impl SheetDocument for SheetFile {
    fn write_row(
        &self,
        collection: &CollectionName,
        key: &RecordKey,
        row: &FieldMap,
    ) -> Result<SheetWrite, PropagationError> {
        let _guard = self.write_lock.lock();
        let mut contents = self.load(collection)?;

        let existing_digest = contents.rows.get(key).map(row_digest);
        let merged = {
            let entry = contents.rows.entry(key.clone()).or_default();
            for (label, value) in row {
                entry.insert(label.clone(), value.clone());
            }
            entry.clone()
        };
        if existing_digest.as_deref() == Some(row_digest(&merged).as_str()) {
            tracing::debug!("sheet row unchanged: {collection}/{key}");
            return Ok(SheetWrite::Unchanged);
        }

        contents.updated_at = Some(Utc::now());
        self.save(collection, &contents)?;
        tracing::info!("mirrored row to sheet: {collection}/{key}");
        Ok(SheetWrite::Written)
    }
}

fn load_path(path: &Path) -> Result<SheetContents, PropagationError> {
    if !path.exists() {
        return Ok(SheetContents::default());
    }
    let contents = std::fs::read_to_string(path).map_err(|e| sheet_io_err(path, e))?;
    if contents.trim().is_empty() {
        return Ok(SheetContents::default());
    }
    Ok(serde_json::from_str(&contents)?)
}

/// SHA-256 hex digest of a row. `FieldMap` is ordered, so equal rows hash
/// equally regardless of insertion order.
pub fn row_digest(row: &FieldMap) -> String {
    let bytes = serde_json::to_vec(row).unwrap_or_default();
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    hex::encode(hasher.finalize())
}

pub fn fingerprints(contents: &SheetContents) -> RowFingerprints {
    contents
        .rows
        .iter()
        .map(|(key, row)| (key.clone(), row_digest(row)))
        .collect()
}

/// Rows of `current` that are new or differ from `previous`. Deleted rows
/// are not reported; deletion is not synchronized.
pub fn changed_rows(
    previous: &RowFingerprints,
    current: &SheetContents,
) -> Vec<(RecordKey, FieldMap)> {
    current
        .rows
        .iter()
        .filter(|(key, row)| previous.get(*key) != Some(&row_digest(row)))
        .map(|(key, row)| (key.clone(), row.clone()))
        .collect()
}

// ---------------------------------------------------------------------------
// In-memory sheet
// ---------------------------------------------------------------------------

/// Sheet kept in memory; records every write. For embedding and tests.
#[derive(Debug, Default)]
pub struct MemorySheet {
    rows: Mutex<BTreeMap<(CollectionName, RecordKey), FieldMap>>,
    writes: Mutex<Vec<(CollectionName, RecordKey, FieldMap)>>,
}

impl MemorySheet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row(&self, collection: &CollectionName, key: &RecordKey) -> Option<FieldMap> {
        self.rows
            .lock()
            .get(&(collection.clone(), key.clone()))
            .cloned()
    }

    /// Every `write_row` call so far, in order.
    pub fn writes(&self) -> Vec<(CollectionName, RecordKey, FieldMap)> {
        self.writes.lock().clone()
    }
}

impl SheetDocument for MemorySheet {
    fn write_row(
        &self,
        collection: &CollectionName,
        key: &RecordKey,
        row: &FieldMap,
    ) -> Result<SheetWrite, PropagationError> {
        self.writes
            .lock()
            .push((collection.clone(), key.clone(), row.clone()));
        let mut rows = self.rows.lock();
        let entry = rows.entry((collection.clone(), key.clone())).or_default();
        let before = entry.clone();
        for (label, value) in row {
            entry.insert(label.clone(), value.clone());
        }
        if *entry == before {
            Ok(SheetWrite::Unchanged)
        } else {
            Ok(SheetWrite::Written)
        }
    }
}
