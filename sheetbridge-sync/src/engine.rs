//! The sync engine: one process-scoped owner of every moving part.
//!
//! Construct it once from [`SyncConfig`] and share it (`Arc<SyncEngine>`)
//! between the flush timer, the ingestion entry points and whatever serves
//! clients. Nothing here spawns threads or timers; the caller drives
//! [`SyncEngine::flush`] on its own schedule.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use sheetbridge_core::{
    CollectionName, FieldMap, FieldMapping, Normalizer, PendingUpdate, RecordKey, Source,
    SyncConfig, VersionedChange,
};

use crate::error::SyncError;
use crate::hub::{BroadcastHub, HubStats};
use crate::queue::{Requeue, UpdateQueue};
use crate::sheet::SheetDocument;
use crate::store::{RecordStore, RecordStoreAdapter, UpsertOutcome, UpsertPolicy};
use crate::suppression::SuppressionLocks;
use crate::versions::{CollectionHistory, VersionTracker};

/// Tally of one flush tick.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushReport {
    pub started_at: DateTime<Utc>,
    /// Updates taken from the queue.
    pub batch: usize,
    pub applied: usize,
    pub stale: usize,
    pub skipped_empty: usize,
    /// Store writes that failed.
    pub failed: usize,
    pub requeued: usize,
    pub dead_lettered: usize,
    /// Rows mirrored to the sheet.
    pub propagated: usize,
    pub propagation_failures: usize,
    pub duration_ms: u64,
}

impl FlushReport {
    fn new(started_at: DateTime<Utc>, batch: usize) -> Self {
        Self {
            started_at,
            batch,
            applied: 0,
            stale: 0,
            skipped_empty: 0,
            failed: 0,
            requeued: 0,
            dead_lettered: 0,
            propagated: 0,
            propagation_failures: 0,
            duration_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum FlushOutcome {
    Completed(FlushReport),
    /// Another flush was already running; this one did nothing.
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    pub queue_depth: usize,
    pub flush_in_progress: bool,
    /// `None` when the store could not be asked.
    pub tracked_records: Option<usize>,
    pub active_locks: usize,
    pub dead_letters: usize,
    pub subscribers: HubStats,
    pub collections: BTreeMap<String, CollectionHistory>,
    pub last_flush: Option<FlushReport>,
}

/// Clears the in-progress flag when the flush ends, including by panic.
struct FlushGuard<'a>(&'a AtomicBool);

impl<'a> FlushGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlushGuard(flag))
    }
}

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct SyncEngine {
    pub(crate) config: SyncConfig,
    pub(crate) mapping: FieldMapping,
    pub(crate) normalizer: Normalizer,
    pub(crate) queue: UpdateQueue,
    locks: Arc<SuppressionLocks>,
    store: RecordStoreAdapter,
    sheet: Arc<dyn SheetDocument>,
    pub(crate) versions: VersionTracker,
    pub(crate) hub: BroadcastHub,
    flushing: AtomicBool,
    last_flush: Mutex<Option<FlushReport>>,
}

impl SyncEngine {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn RecordStore>,
        sheet: Arc<dyn SheetDocument>,
    ) -> Result<Self, SyncError> {
        let mapping = config.field_mapping()?;
        let normalizer = config.normalizer();
        let locks = Arc::new(SuppressionLocks::new(config.suppression_window()));
        let queue = UpdateQueue::new(mapping.clone(), Arc::clone(&locks), config.max_flush_attempts);
        tracing::info!(
            "sync engine ready: {} mapped column(s), default collection '{}'",
            mapping.len(),
            config.default_collection
        );
        Ok(Self {
            store: RecordStoreAdapter::new(store, normalizer.clone()),
            versions: VersionTracker::new(config.history_capacity),
            hub: BroadcastHub::new(),
            sheet,
            queue,
            locks,
            mapping,
            normalizer,
            config,
            flushing: AtomicBool::new(false),
            last_flush: Mutex::new(None),
        })
    }

    pub fn flush(&self) -> FlushOutcome {
        self.flush_at(Utc::now())
    }

    /// Run one flush tick. Returns [`FlushOutcome::Skipped`] without
    /// touching the queue if another tick is still running.
    pub fn flush_at(&self, now: DateTime<Utc>) -> FlushOutcome {
        let Some(_guard) = FlushGuard::acquire(&self.flushing) else {
            tracing::debug!("flush already in progress; skipping tick");
            return FlushOutcome::Skipped;
        };

        let started = Instant::now();
        self.locks.prune_at(now);
        let batch = self.queue.drain();
        let mut report = FlushReport::new(now, batch.len());

        for update in batch {
            self.flush_one(update, now, &mut report);
        }

        report.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        if report.batch > 0 {
            tracing::info!(
                "flushed {} update(s): {} applied, {} stale, {} failed, {} mirrored",
                report.batch,
                report.applied,
                report.stale,
                report.failed,
                report.propagated
            );
        }
        *self.last_flush.lock() = Some(report.clone());
        FlushOutcome::Completed(report)
    }

    fn flush_one(&self, update: PendingUpdate, now: DateTime<Utc>, report: &mut FlushReport) {
        let policy = UpsertPolicy::for_update(&update);
        match self
            .store
            .upsert_at(&update.collection, &update.key, &update.fields, policy, now)
        {
            Ok(UpsertOutcome::Applied { columns, .. }) => {
                report.applied += 1;
                // Sheet changes were recorded and broadcast when ingested.
                if update.source == Source::External {
                    return;
                }
                // Armed before the write so the echo can never beat it.
                self.locks.arm_at(&update.collection, &update.key, now);
                let row = self.mapping.to_external(&columns);
                match self.sheet.write_row(&update.collection, &update.key, &row) {
                    Ok(_) => report.propagated += 1,
                    Err(e) => {
                        report.propagation_failures += 1;
                        tracing::warn!(
                            "mirror write for '{}/{}' failed: {e}",
                            update.collection,
                            update.key
                        );
                    }
                }
                self.record_and_broadcast(&update.collection, &update.key, &columns, false, now);
            }
            Ok(UpsertOutcome::Stale) => report.stale += 1,
            Ok(UpsertOutcome::NoColumns) => report.skipped_empty += 1,
            Err(e) => {
                report.failed += 1;
                tracing::warn!(
                    "store write for '{}/{}' failed: {e}",
                    update.collection,
                    update.key
                );
                match self.queue.requeue_failed(update) {
                    Requeue::Requeued => report.requeued += 1,
                    Requeue::DeadLettered => report.dead_lettered += 1,
                    Requeue::Superseded => {}
                }
            }
        }
    }

    pub(crate) fn record_and_broadcast(
        &self,
        collection: &CollectionName,
        key: &RecordKey,
        fields: &FieldMap,
        external: bool,
        now: DateTime<Utc>,
    ) -> (u64, usize) {
        let version = self
            .versions
            .record_change_at(collection, key, fields, external, now);
        let change = VersionedChange {
            key: key.clone(),
            fields: fields.clone(),
            version,
            recorded_at: now,
            external,
        };
        let delivered = self.hub.publish_change(collection, &change);
        (version, delivered)
    }

    /// Move dead letters back into the queue.
    pub fn requeue_dead_letters(&self) -> usize {
        let requeued = self.queue.requeue_dead_letters();
        if requeued > 0 {
            tracing::info!("requeued {requeued} dead-lettered update(s)");
        }
        requeued
    }

    /// Drop history older than the configured maximum age and expired
    /// suppression locks.
    pub fn prune_at(&self, now: DateTime<Utc>) -> (usize, usize) {
        let changes = self
            .versions
            .prune_older_than_at(self.config.history_max_age(), now);
        let locks = self.locks.prune_at(now);
        (changes, locks)
    }

    pub fn status(&self) -> EngineStatus {
        let now = Utc::now();
        let tracked_records = match self.store.store().count() {
            Ok(count) => Some(count),
            Err(e) => {
                tracing::warn!("record count unavailable: {e}");
                None
            }
        };
        EngineStatus {
            queue_depth: self.queue.depth(),
            flush_in_progress: self.is_flushing(),
            tracked_records,
            active_locks: self.locks.active_at(now),
            dead_letters: self.queue.dead_letter_count(),
            subscribers: self.hub.stats(),
            collections: self.versions.collections(),
            last_flush: self.last_flush.lock().clone(),
        }
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing.load(Ordering::Acquire)
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn mapping(&self) -> &FieldMapping {
        &self.mapping
    }

    pub fn queue(&self) -> &UpdateQueue {
        &self.queue
    }

    pub fn locks(&self) -> &SuppressionLocks {
        &self.locks
    }

    pub fn store(&self) -> &Arc<dyn RecordStore> {
        self.store.store()
    }

    pub fn versions(&self) -> &VersionTracker {
        &self.versions
    }

    pub fn hub(&self) -> &BroadcastHub {
        &self.hub
    }
}
