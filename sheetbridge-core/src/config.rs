//! `config.yaml`: engine tuning and the sheet column mapping.
//!
//! # Storage layout
//!
//! ```text
//! ~/.sheetbridge/
//!   config.yaml   (mode 0600, written by `sheetbridge init`)
//! ```
//!
//! Every field has a default, so a missing file or a partial one is valid.
//! As with every path-taking function in this workspace, `fn_at(home, …)`
//! takes an explicit home and `fn(…)` derives it from `dirs::home_dir()`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::mapping::FieldMapping;
use crate::normalize::Normalizer;
use crate::types::CollectionName;

pub const CONFIG_FILE: &str = "config.yaml";

/// One row of the mapping table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMapping {
    /// Column header as it appears in the sheet.
    pub label: String,
    /// Column name in the relational store.
    pub key: String,
}

impl ColumnMapping {
    pub fn new(label: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            key: key.into(),
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Collection used for client writes that do not name one.
    pub default_collection: CollectionName,
    pub flush_interval_ms: u64,
    /// How long an outward mirror write suppresses the matching inbound echo.
    pub suppression_window_ms: u64,
    /// Ring-buffer capacity of each collection's change history.
    pub history_capacity: usize,
    pub history_max_age_secs: u64,
    pub heartbeat_interval_secs: u64,
    /// Failed flushes after which an update is dead-lettered.
    pub max_flush_attempts: u32,
    /// Storage keys whose values are status-like free text.
    pub status_fields: Vec<String>,
    pub mappings: Vec<ColumnMapping>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            default_collection: CollectionName::from("orders"),
            flush_interval_ms: 1_000,
            suppression_window_ms: 10_000,
            history_capacity: 100,
            history_max_age_secs: 60 * 60,
            heartbeat_interval_secs: 25,
            max_flush_attempts: 5,
            status_fields: vec!["status".to_string()],
            mappings: vec![
                ColumnMapping::new("Order Code", "order_code"),
                ColumnMapping::new("Customer", "customer_name"),
                ColumnMapping::new("Status", "status"),
                ColumnMapping::new("Unit Price", "price"),
                ColumnMapping::new("Quantity", "quantity"),
                ColumnMapping::new("Due Date", "due_date"),
            ],
        }
    }
}

impl SyncConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }

    pub fn suppression_window(&self) -> Duration {
        Duration::from_millis(self.suppression_window_ms)
    }

    pub fn history_max_age(&self) -> Duration {
        Duration::from_secs(self.history_max_age_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn field_mapping(&self) -> Result<FieldMapping, CoreError> {
        FieldMapping::new(&self.mappings)
    }

    pub fn normalizer(&self) -> Normalizer {
        Normalizer::new(self.status_fields.iter().cloned())
    }
}

// ---------------------------------------------------------------------------
// Paths
// ---------------------------------------------------------------------------

/// `<home>/.sheetbridge`
pub fn root_dir(home: &Path) -> PathBuf {
    home.join(".sheetbridge")
}

/// `<home>/.sheetbridge/config.yaml`. Pure, no I/O.
pub fn config_path_at(home: &Path) -> PathBuf {
    root_dir(home).join(CONFIG_FILE)
}

// ---------------------------------------------------------------------------
// Load / save
// ---------------------------------------------------------------------------

/// Load `config.yaml`, or the defaults when it does not exist.
///
/// Returns `CoreError::Parse` (with path) if the YAML is malformed and
/// `CoreError::InvalidMapping` if the mapping table is not a bijection.
pub fn load_at(home: &Path) -> Result<SyncConfig, CoreError> {
    let path = config_path_at(home);
    if !path.exists() {
        return Ok(SyncConfig::default());
    }
    let contents = std::fs::read_to_string(&path)?;
    let config: SyncConfig =
        serde_yaml::from_str(&contents).map_err(|e| CoreError::Parse { path, source: e })?;
    config.field_mapping()?;
    Ok(config)
}

/// `load_at` convenience wrapper.
pub fn load() -> Result<SyncConfig, CoreError> {
    load_at(&home()?)
}

/// Atomically save `config.yaml`.
///
/// Write flow: serialize → `config.yaml.tmp` sibling → `chmod 0600` → `rename`.
pub fn save_at(home: &Path, config: &SyncConfig) -> Result<PathBuf, CoreError> {
    let dir = root_dir(home);
    if !dir.exists() {
        std::fs::create_dir_all(&dir)?;
        set_dir_permissions(&dir)?;
    }
    let path = config_path_at(home);
    let tmp_path = path.with_file_name(format!("{CONFIG_FILE}.tmp"));

    let yaml = serde_yaml::to_string(config)?;
    std::fs::write(&tmp_path, yaml)?;
    set_file_permissions(&tmp_path)?;
    std::fs::rename(&tmp_path, &path)?;
    Ok(path)
}

/// Write the default config unless one exists. Idempotent: an existing file
/// is loaded and returned unchanged.
pub fn init_at(home: &Path) -> Result<(SyncConfig, PathBuf), CoreError> {
    let path = config_path_at(home);
    if path.exists() {
        return Ok((load_at(home)?, path));
    }
    let config = SyncConfig::default();
    let path = save_at(home, &config)?;
    Ok((config, path))
}

/// `init_at` convenience wrapper.
pub fn init() -> Result<(SyncConfig, PathBuf), CoreError> {
    init_at(&home()?)
}

/// Resolve the user's home directory.
pub fn home() -> Result<PathBuf, CoreError> {
    dirs::home_dir().ok_or(CoreError::HomeNotFound)
}

#[cfg(unix)]
fn set_dir_permissions(path: &Path) -> Result<(), CoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_dir_permissions(_path: &Path) -> Result<(), CoreError> {
    Ok(())
}

#[cfg(unix)]
fn set_file_permissions(path: &Path) -> Result<(), CoreError> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}
#[cfg(not(unix))]
fn set_file_permissions(_path: &Path) -> Result<(), CoreError> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
