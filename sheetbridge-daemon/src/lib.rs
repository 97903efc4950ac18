//! Daemon runtime: flush timer, heartbeats, sheet-file watcher and the
//! Unix socket server in front of one shared [`sheetbridge_sync::SyncEngine`].

mod error;
pub mod paths;
pub mod protocol;
mod runtime;

pub use error::DaemonError;
pub use protocol::{
    request_flush, request_ingest, request_poll, request_requeue_dead, request_status,
    request_stop, request_write, send_request, subscribe, DaemonRequest, DaemonResponse,
};
pub use runtime::{run, start_blocking, SheetSnapshots};
