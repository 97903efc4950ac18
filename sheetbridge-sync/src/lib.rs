//! # sheetbridge-sync
//!
//! The synchronous core of the bridge: update queue and conflict resolution,
//! freshness-guarded store writes, sheet mirroring with echo suppression,
//! change history and subscriber fan-out.
//!
//! Build a [`SyncEngine`] from a [`sheetbridge_core::SyncConfig`], feed it
//! through [`SyncEngine::ingest`] and [`SyncEngine::client_write`], and
//! call [`SyncEngine::flush`] on a timer.

pub mod engine;
pub mod error;
pub mod hub;
pub mod ingest;
pub mod queue;
pub mod sheet;
pub mod store;
pub mod suppression;
pub mod versions;

pub use engine::{EngineStatus, FlushOutcome, FlushReport, SyncEngine};
pub use error::{PropagationError, StoreError, SyncError, ValidationError};
pub use hub::{BroadcastHub, EventSink, HubEvent, HubStats, SubscriberId, TransportError};
pub use ingest::{ChangeNotification, ClientWrite, IngestOutcome};
pub use queue::{EnqueueOutcome, UpdateQueue, WriteRequest};
pub use sheet::{MemorySheet, SheetDocument, SheetFile, SheetWrite};
pub use store::{MemoryStore, RecordStore, RecordStoreAdapter, UpsertOutcome, UpsertPolicy};
pub use suppression::SuppressionLocks;
pub use versions::VersionTracker;
