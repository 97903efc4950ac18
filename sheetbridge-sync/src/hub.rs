//! Per-collection fan-out of change events to live subscribers.
//!
//! The hub never blocks on a subscriber: sinks are expected to hand events
//! to their own transport (a channel, a socket writer task) and fail fast
//! when that transport is gone. A sink that fails is evicted on the spot.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use sheetbridge_core::{CollectionName, VersionedChange};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriberId(pub u64);

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Events pushed to subscribers. Serialized as
/// `{"event": "connected" | "change" | "heartbeat", ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HubEvent {
    Connected {
        collection: CollectionName,
        subscriber: SubscriberId,
        at: DateTime<Utc>,
    },
    Change {
        collection: CollectionName,
        change: VersionedChange,
    },
    Heartbeat {
        at: DateTime<Utc>,
    },
}

#[derive(Debug, Error)]
#[error("subscriber transport closed: {0}")]
pub struct TransportError(pub String);

/// A subscriber's outbound transport.
pub trait EventSink: Send + Sync {
    fn send(&self, event: &HubEvent) -> Result<(), TransportError>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HubStats {
    /// Live subscribers per collection.
    pub collections: BTreeMap<String, usize>,
    pub total_subscribers: usize,
    pub total_connects: u64,
    pub messages_sent: u64,
    pub evictions: u64,
}

struct Registration {
    id: SubscriberId,
    sink: Arc<dyn EventSink>,
}

#[derive(Default)]
struct HubState {
    subscribers: HashMap<CollectionName, Vec<Registration>>,
    total_connects: u64,
    messages_sent: u64,
    evictions: u64,
}

#[derive(Default)]
pub struct BroadcastHub {
    next_id: AtomicU64,
    state: Mutex<HubState>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &self,
        collection: &CollectionName,
        sink: Arc<dyn EventSink>,
    ) -> Result<SubscriberId, TransportError> {
        self.subscribe_at(collection, sink, Utc::now())
    }

    /// Register `sink` for `collection`. The sink receives a `Connected`
    /// event before anything else; if that first send fails the sink is
    /// not registered.
    ///
    /// The send and the registration happen under the state lock, so no
    /// broadcast can fall between them: every change published after this
    /// returns reaches the sink, and always after `Connected`.
    pub fn subscribe_at(
        &self,
        collection: &CollectionName,
        sink: Arc<dyn EventSink>,
        now: DateTime<Utc>,
    ) -> Result<SubscriberId, TransportError> {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let mut state = self.state.lock();
        if let Err(e) = sink.send(&HubEvent::Connected {
            collection: collection.clone(),
            subscriber: id,
            at: now,
        }) {
            tracing::warn!("subscriber {id} dropped before joining '{collection}': {e}");
            return Err(e);
        }

        state
            .subscribers
            .entry(collection.clone())
            .or_default()
            .push(Registration { id, sink });
        state.total_connects += 1;
        state.messages_sent += 1;
        drop(state);
        tracing::info!("subscriber {id} joined '{collection}'");
        Ok(id)
    }

    /// Remove a subscriber. Returns false when it was already gone.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let mut state = self.state.lock();
        let mut found = false;
        for registrations in state.subscribers.values_mut() {
            let before = registrations.len();
            registrations.retain(|r| r.id != id);
            found |= registrations.len() != before;
        }
        state.subscribers.retain(|_, registrations| !registrations.is_empty());
        if found {
            tracing::info!("subscriber {id} left");
        }
        found
    }

    /// Send `event` to every subscriber of `collection`. Returns how many
    /// received it.
    pub fn broadcast(&self, collection: &CollectionName, event: &HubEvent) -> usize {
        let targets: Vec<(SubscriberId, Arc<dyn EventSink>)> = {
            let state = self.state.lock();
            match state.subscribers.get(collection) {
                Some(registrations) => registrations
                    .iter()
                    .map(|r| (r.id, Arc::clone(&r.sink)))
                    .collect(),
                None => return 0,
            }
        };
        self.deliver(targets, event)
    }

    pub fn publish_change(&self, collection: &CollectionName, change: &VersionedChange) -> usize {
        self.broadcast(
            collection,
            &HubEvent::Change {
                collection: collection.clone(),
                change: change.clone(),
            },
        )
    }

    /// Send a heartbeat to every subscriber of every collection.
    pub fn heartbeat_at(&self, now: DateTime<Utc>) -> usize {
        let targets: Vec<(SubscriberId, Arc<dyn EventSink>)> = {
            let state = self.state.lock();
            state
                .subscribers
                .values()
                .flatten()
                .map(|r| (r.id, Arc::clone(&r.sink)))
                .collect()
        };
        self.deliver(targets, &HubEvent::Heartbeat { at: now })
    }

    pub fn subscriber_count(&self, collection: &CollectionName) -> usize {
        self.state
            .lock()
            .subscribers
            .get(collection)
            .map_or(0, Vec::len)
    }

    pub fn stats(&self) -> HubStats {
        let state = self.state.lock();
        let collections: BTreeMap<String, usize> = state
            .subscribers
            .iter()
            .map(|(name, registrations)| (name.to_string(), registrations.len()))
            .collect();
        HubStats {
            total_subscribers: collections.values().sum(),
            collections,
            total_connects: state.total_connects,
            messages_sent: state.messages_sent,
            evictions: state.evictions,
        }
    }

    // Sends happen outside the state lock so a slow sink cannot stall
    // subscribe/unsubscribe.
    fn deliver(&self, targets: Vec<(SubscriberId, Arc<dyn EventSink>)>, event: &HubEvent) -> usize {
        let mut delivered = 0;
        let mut failed = Vec::new();
        for (id, sink) in targets {
            match sink.send(event) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!("evicting subscriber {id}: {e}");
                    failed.push(id);
                }
            }
        }

        let mut state = self.state.lock();
        state.messages_sent += delivered as u64;
        if !failed.is_empty() {
            for registrations in state.subscribers.values_mut() {
                registrations.retain(|r| !failed.contains(&r.id));
            }
            state.subscribers.retain(|_, registrations| !registrations.is_empty());
            state.evictions += failed.len() as u64;
        }
        delivered
    }
}
