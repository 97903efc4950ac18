pub mod daemon;
pub mod flush;
pub mod init;
pub mod poll;
pub mod status;
pub mod subscribe;
pub mod write;

use std::path::PathBuf;

use anyhow::{Context, Result};

use sheetbridge_daemon::DaemonError;

pub(crate) fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().context("could not determine home directory")
}

/// Attach a start-the-daemon hint to "not running" errors.
pub(crate) fn daemon_call<T>(result: Result<T, DaemonError>, action: &str) -> Result<T> {
    match result {
        Ok(value) => Ok(value),
        Err(err @ DaemonError::DaemonNotRunning { .. }) => Err(err)
            .with_context(|| format!("{action}: start it with `sheetbridge daemon start`")),
        Err(err) => Err(err).with_context(|| action.to_string()),
    }
}
