//! Per-collection change history for polling clients.
//!
//! Versions are millisecond timestamps bumped to stay strictly increasing
//! across the whole tracker, so two changes recorded in the same
//! millisecond still get distinct, ordered versions. Each collection keeps
//! at most `capacity` entries; the oldest fall off first.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use sheetbridge_core::{CollectionName, FieldMap, RecordKey, VersionedChange};

/// Snapshot of one collection's history, for status output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionHistory {
    pub retained: usize,
    pub last_version: u64,
}

#[derive(Default)]
struct TrackerState {
    last_version: u64,
    history: HashMap<CollectionName, VecDeque<VersionedChange>>,
    latest: HashMap<CollectionName, u64>,
}

pub struct VersionTracker {
    capacity: usize,
    state: Mutex<TrackerState>,
}

impl VersionTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(TrackerState::default()),
        }
    }

    pub fn record_change(
        &self,
        collection: &CollectionName,
        key: &RecordKey,
        fields: &FieldMap,
        external: bool,
    ) -> u64 {
        self.record_change_at(collection, key, fields, external, Utc::now())
    }

    /// Append a change and return its version.
    pub fn record_change_at(
        &self,
        collection: &CollectionName,
        key: &RecordKey,
        fields: &FieldMap,
        external: bool,
        now: DateTime<Utc>,
    ) -> u64 {
        let mut state = self.state.lock();
        let now_ms = u64::try_from(now.timestamp_millis()).unwrap_or(0);
        let version = now_ms.max(state.last_version + 1);
        state.last_version = version;
        state.latest.insert(collection.clone(), version);

        let history = state.history.entry(collection.clone()).or_default();
        history.push_back(VersionedChange {
            key: key.clone(),
            fields: fields.clone(),
            version,
            recorded_at: now,
            external,
        });
        while history.len() > self.capacity {
            history.pop_front();
        }
        version
    }

    /// Retained changes with a version strictly greater than `since`,
    /// oldest first. Unknown collections yield an empty list.
    pub fn changes_since(&self, collection: &CollectionName, since: u64) -> Vec<VersionedChange> {
        let state = self.state.lock();
        state
            .history
            .get(collection)
            .map(|history| {
                history
                    .iter()
                    .filter(|change| change.version > since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Latest version issued for `collection`, or 0 if none. Survives
    /// pruning.
    pub fn last_version(&self, collection: &CollectionName) -> u64 {
        self.state.lock().latest.get(collection).copied().unwrap_or(0)
    }

    pub fn prune_older_than(&self, max_age: Duration) -> usize {
        self.prune_older_than_at(max_age, Utc::now())
    }

    /// Drop entries recorded more than `max_age` before `now`. Returns how
    /// many were removed.
    pub fn prune_older_than_at(&self, max_age: Duration, now: DateTime<Utc>) -> usize {
        let Ok(max_age) = chrono::Duration::from_std(max_age) else {
            return 0;
        };
        let Some(cutoff) = now.checked_sub_signed(max_age) else {
            return 0;
        };

        let mut state = self.state.lock();
        let mut removed = 0;
        for history in state.history.values_mut() {
            while history.front().is_some_and(|c| c.recorded_at < cutoff) {
                history.pop_front();
                removed += 1;
            }
        }
        state.history.retain(|_, history| !history.is_empty());
        if removed > 0 {
            tracing::debug!("pruned {removed} change(s) older than {cutoff}");
        }
        removed
    }

    pub fn collections(&self) -> BTreeMap<String, CollectionHistory> {
        let state = self.state.lock();
        state
            .latest
            .iter()
            .map(|(name, last_version)| {
                let retained = state.history.get(name).map_or(0, VecDeque::len);
                (
                    name.to_string(),
                    CollectionHistory {
                        retained,
                        last_version: *last_version,
                    },
                )
            })
            .collect()
    }
}
