//! Error types for sheetbridge-core.

use std::path::PathBuf;

use thiserror::Error;

/// All errors that can arise from configuration and mapping setup.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Underlying I/O failure (permission denied, disk full, etc.).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization error (save path).
    #[error("YAML serialization error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// YAML parse error on load, with the offending file.
    #[error("failed to parse config at {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// `dirs::home_dir()` returned `None`; cannot locate `~/.sheetbridge/`.
    #[error("cannot determine home directory; set $HOME or equivalent")]
    HomeNotFound,

    /// The column mapping table is not a bijection.
    #[error("invalid field mapping: {0}")]
    InvalidMapping(String),
}
