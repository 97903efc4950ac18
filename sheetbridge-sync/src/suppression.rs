//! Echo suppression locks.
//!
//! When a client write is mirrored out to the sheet, the sheet's own change
//! notification for that row comes back a moment later. A lock per row
//! (collection and business key), armed before the mirror write, makes the queue drop that echo. Locks
//! expire passively: expiry is checked on read, and `prune_at` bounds memory.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use sheetbridge_core::{CollectionName, RecordKey};

#[derive(Debug)]
pub struct SuppressionLocks {
    window: chrono::Duration,
    locks: Mutex<HashMap<(CollectionName, RecordKey), DateTime<Utc>>>,
}

impl SuppressionLocks {
    pub fn new(window: Duration) -> Self {
        Self {
            window: chrono::Duration::from_std(window)
                .unwrap_or_else(|_| chrono::Duration::days(365)),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Arm (or re-arm) the lock for `collection`/`key`. Returns its expiry.
    pub fn arm_at(
        &self,
        collection: &CollectionName,
        key: &RecordKey,
        now: DateTime<Utc>,
    ) -> DateTime<Utc> {
        let expires_at = now.checked_add_signed(self.window).unwrap_or(now);
        self.locks
            .lock()
            .insert((collection.clone(), key.clone()), expires_at);
        expires_at
    }

    /// True while an unexpired lock exists. An expired lock found here is
    /// removed.
    pub fn is_suppressed_at(
        &self,
        collection: &CollectionName,
        key: &RecordKey,
        now: DateTime<Utc>,
    ) -> bool {
        let row = (collection.clone(), key.clone());
        let mut locks = self.locks.lock();
        match locks.get(&row) {
            Some(expires_at) if *expires_at > now => true,
            Some(_) => {
                locks.remove(&row);
                false
            }
            None => false,
        }
    }

    pub fn expires_at(&self, collection: &CollectionName, key: &RecordKey) -> Option<DateTime<Utc>> {
        self.locks
            .lock()
            .get(&(collection.clone(), key.clone()))
            .copied()
    }

    /// Drop expired locks. Returns how many were removed.
    pub fn prune_at(&self, now: DateTime<Utc>) -> usize {
        let mut locks = self.locks.lock();
        let before = locks.len();
        locks.retain(|_, expires_at| *expires_at > now);
        before - locks.len()
    }

    pub fn active_at(&self, now: DateTime<Utc>) -> usize {
        self.locks
            .lock()
            .values()
            .filter(|expires_at| **expires_at > now)
            .count()
    }
}
