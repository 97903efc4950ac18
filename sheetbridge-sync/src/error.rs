//! Error types for sheetbridge-sync.
//!
//! Only [`ValidationError`] ever reaches an enqueue caller. Storage and
//! propagation failures happen inside a flush tick, after the caller already
//! has its verdict, so the flush loop catches them and reports them through
//! [`crate::FlushReport`].

use std::path::PathBuf;

use thiserror::Error;

use sheetbridge_core::CoreError;

/// A write rejected before it reaches the queue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing business key")]
    MissingKey,

    #[error("no fields supplied for key '{key}'")]
    EmptyFields { key: String },

    #[error("invalid collection name {collection:?}")]
    InvalidCollection { collection: String },
}

/// Failure reported by a [`crate::RecordStore`] driver.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not be reached; the write may succeed next tick.
    #[error("record store unavailable: {0}")]
    Unavailable(String),

    /// The backend refused this particular write.
    #[error("record store rejected write for '{key}': {reason}")]
    Rejected { key: String, reason: String },
}

/// Failure mirroring a row out to the sheet.
#[derive(Debug, Error)]
pub enum PropagationError {
    #[error("sheet I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("sheet JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("sheet rejected row '{key}': {reason}")]
    Rejected { key: String, reason: String },

    #[error("collection {0:?} does not name a sheet file")]
    InvalidCollection(String),
}

/// All errors that can arise from sync operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("propagation error: {0}")]
    Propagation(#[from] PropagationError),

    #[error("configuration error: {0}")]
    Core(#[from] CoreError),
}

/// Convenience constructor for [`PropagationError::Io`].
pub(crate) fn sheet_io_err(path: impl Into<PathBuf>, source: std::io::Error) -> PropagationError {
    PropagationError::Io {
        path: path.into(),
        source,
    }
}
