//! Update queue and conflict resolver.
//!
//! Holds at most one pending write per row, a row being a business key
//! within its collection. A second write to the same row before the next flush is resolved on the spot: the later
//! timestamp wins, ties go to the write that arrived last, and the loser is
//! reported back to its caller as a conflict.
//!
//! Writes that fail to reach the store are merged back with the same rule.
//! After `max_attempts` failures an update is parked in a bounded
//! dead-letter buffer instead of cycling through every tick forever.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use sheetbridge_core::{CollectionName, FieldMap, FieldMapping, PendingUpdate, RecordKey, Source};

use crate::suppression::SuppressionLocks;

/// Dead letters kept before the oldest is discarded.
pub const DEAD_LETTER_CAPACITY: usize = 100;

/// A write offered to the queue.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteRequest {
    pub collection: CollectionName,
    pub key: RecordKey,
    /// Sheet labels or storage keys; translated on enqueue.
    pub fields: FieldMap,
    pub source: Source,
    /// Origin time of the write. Defaults to arrival time.
    pub timestamp: Option<DateTime<Utc>>,
}

/// Immediate verdict for an enqueue call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueOutcome {
    pub queued: bool,
    pub conflict: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winner: Option<Source>,
}

impl EnqueueOutcome {
    pub fn queued() -> Self {
        Self {
            queued: true,
            conflict: false,
            winner: None,
        }
    }

    /// Echo dropped under a suppression lock.
    pub fn suppressed() -> Self {
        Self {
            queued: false,
            conflict: false,
            winner: None,
        }
    }

    pub fn conflict(winner: Source) -> Self {
        Self {
            queued: false,
            conflict: true,
            winner: Some(winner),
        }
    }
}

/// What happened to an update handed back after a failed flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    Requeued,
    /// A newer write for the key arrived meanwhile and was kept instead.
    Superseded,
    DeadLettered,
}

/// Queue slot of one row: keys are only unique within their collection.
type RowId = (CollectionName, RecordKey);

fn row_id(update: &PendingUpdate) -> RowId {
    (update.collection.clone(), update.key.clone())
}

/// Newer-wins: true when `incoming` should replace `existing`.
pub fn incoming_wins(existing: &PendingUpdate, incoming: &PendingUpdate) -> bool {
    incoming.timestamp >= existing.timestamp
}

pub struct UpdateQueue {
    mapping: FieldMapping,
    locks: Arc<SuppressionLocks>,
    max_attempts: u32,
    pending: Mutex<HashMap<RowId, PendingUpdate>>,
    dead_letters: Mutex<VecDeque<PendingUpdate>>,
}

impl UpdateQueue {
    pub fn new(mapping: FieldMapping, locks: Arc<SuppressionLocks>, max_attempts: u32) -> Self {
        Self {
            mapping,
            locks,
            max_attempts: max_attempts.max(1),
            pending: Mutex::new(HashMap::new()),
            dead_letters: Mutex::new(VecDeque::new()),
        }
    }

    pub fn enqueue(&self, request: WriteRequest) -> EnqueueOutcome {
        self.enqueue_at(request, Utc::now())
    }

    pub fn enqueue_at(&self, request: WriteRequest, now: DateTime<Utc>) -> EnqueueOutcome {
        if request.source == Source::External
            && self
                .locks
                .is_suppressed_at(&request.collection, &request.key, now)
        {
            tracing::debug!("suppressed echo for '{}/{}'", request.collection, request.key);
            return EnqueueOutcome::suppressed();
        }

        let incoming = PendingUpdate {
            fields: self.mapping.to_internal(&request.fields),
            collection: request.collection,
            key: request.key,
            source: request.source,
            timestamp: request.timestamp.unwrap_or(now),
            enqueued_at: now,
            attempts: 0,
        };

        let slot = row_id(&incoming);
        let mut pending = self.pending.lock();
        if let Some(existing) = pending.get(&slot) {
            if !incoming_wins(existing, &incoming) {
                tracing::info!(
                    "conflict on '{}/{}': pending {} write is newer; rejecting {} write",
                    incoming.collection,
                    incoming.key,
                    existing.source,
                    incoming.source
                );
                return EnqueueOutcome::conflict(existing.source);
            }
            tracing::debug!(
                "'{}/{}': {} write replaces pending {} write",
                incoming.collection,
                incoming.key,
                incoming.source,
                existing.source
            );
        }
        pending.insert(slot, incoming);
        EnqueueOutcome::queued()
    }

    /// Take every pending update, oldest arrival first, leaving the queue
    /// empty.
    pub fn drain(&self) -> Vec<PendingUpdate> {
        let taken = std::mem::take(&mut *self.pending.lock());
        let mut batch: Vec<PendingUpdate> = taken.into_values().collect();
        batch.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at));
        batch
    }

    /// Hand back an update whose store write failed.
    pub fn requeue_failed(&self, mut update: PendingUpdate) -> Requeue {
        update.attempts += 1;
        if update.attempts >= self.max_attempts {
            tracing::error!(
                "giving up on '{}' after {} failed flush attempt(s); moved to dead letters",
                update.key,
                update.attempts
            );
            let mut dead = self.dead_letters.lock();
            if dead.len() >= DEAD_LETTER_CAPACITY {
                dead.pop_front();
            }
            dead.push_back(update);
            return Requeue::DeadLettered;
        }
        self.merge(update)
    }

    /// Put dead letters back in the queue with a fresh attempt budget.
    /// Returns how many were requeued (superseded ones are dropped).
    pub fn requeue_dead_letters(&self) -> usize {
        let dead: Vec<PendingUpdate> = self.dead_letters.lock().drain(..).collect();
        dead.into_iter()
            .map(|mut update| {
                update.attempts = 0;
                self.merge(update)
            })
            .filter(|outcome| *outcome == Requeue::Requeued)
            .count()
    }

    fn merge(&self, update: PendingUpdate) -> Requeue {
        let slot = row_id(&update);
        let mut pending = self.pending.lock();
        match pending.get(&slot) {
            Some(existing) if !incoming_wins(existing, &update) => Requeue::Superseded,
            _ => {
                pending.insert(slot, update);
                Requeue::Requeued
            }
        }
    }

    pub fn depth(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn pending(&self, collection: &CollectionName, key: &RecordKey) -> Option<PendingUpdate> {
        self.pending
            .lock()
            .get(&(collection.clone(), key.clone()))
            .cloned()
    }

    pub fn dead_letter_count(&self) -> usize {
        self.dead_letters.lock().len()
    }

    pub fn dead_letters(&self) -> Vec<PendingUpdate> {
        self.dead_letters.lock().iter().cloned().collect()
    }

    pub fn mapping(&self) -> &FieldMapping {
        &self.mapping
    }
}
