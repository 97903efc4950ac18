use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);
pub const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

pub const DAEMON_SOCKET: &str = "daemon.sock";
pub const SHEETS_DIR: &str = "sheets";

pub fn sheetbridge_root(home: &Path) -> PathBuf {
    sheetbridge_core::config::root_dir(home)
}

pub fn socket_path(home: &Path) -> PathBuf {
    sheetbridge_root(home).join(DAEMON_SOCKET)
}

/// Directory holding one `<collection>.json` per sheet.
pub fn sheets_dir(home: &Path) -> PathBuf {
    sheetbridge_root(home).join(SHEETS_DIR)
}
