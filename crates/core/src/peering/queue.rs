use std::{
    collections::{BTreeMap, HashMap},
    time::Duration,
};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::delay::{Delay, DelayClass};
use crate::{
    types::{PeerCandidate, PeerId},
    util::time_source::elapsed_between,
};

/// A peer waiting in the queue together with its backoff bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedPeer {
    candidate: PeerCandidate,
    delay: Delay,
    /// Start of the current backoff window.
    base_connection_ts: DateTime<Utc>,
    /// Start of the current window without confirmed activity.
    base_deprecation_ts: DateTime<Utc>,
    last_activity: Option<DateTime<Utc>>,
}

impl TrackedPeer {
    pub fn new(candidate: PeerCandidate, now: DateTime<Utc>) -> Self {
        let last_activity = candidate.last_activity;
        Self {
            candidate,
            delay: Delay::immediate(),
            base_connection_ts: now,
            base_deprecation_ts: now,
            last_activity,
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.candidate.id
    }

    pub fn candidate(&self) -> &PeerCandidate {
        &self.candidate
    }

    pub fn delay(&self) -> Delay {
        self.delay
    }

    pub fn base_connection_ts(&self) -> DateTime<Utc> {
        self.base_connection_ts
    }

    pub fn base_deprecation_ts(&self) -> DateTime<Utc> {
        self.base_deprecation_ts
    }

    pub fn next_eligible(&self) -> DateTime<Utc> {
        self.delay.next_eligible(self.base_connection_ts)
    }

    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.next_eligible() <= now
    }

    /// Starts a new backoff window for the outcome `class`.
    pub fn record_outcome(&mut self, class: DelayClass, now: DateTime<Utc>) {
        self.base_connection_ts = now;
        self.delay.update(class);
    }

    /// Restarts the deprecation window after the peer proved to be alive.
    pub fn confirm_activity(&mut self, now: DateTime<Utc>) {
        self.base_deprecation_ts = now;
        self.last_activity = Some(now);
    }

    pub fn is_deprecable(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        elapsed_between(self.base_deprecation_ts, now).is_some_and(|idle| idle >= threshold)
    }

    /// Whether the last known sign of life is older than `threshold`.
    pub fn has_left_network(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        let last_seen = self.last_activity.unwrap_or(self.base_deprecation_ts);
        elapsed_between(last_seen, now).is_some_and(|idle| idle >= threshold)
    }
}

/// Peers awaiting a connection attempt.
///
/// Entries are indexed by id and kept in a separate dial order that is
/// re-sorted by next eligible time on every resync. A cursor walks the order
/// during a pass; entries are only dropped through [`PeerQueue::remove`].
#[derive(Debug, Default)]
pub struct PeerQueue {
    inner: RwLock<QueueInner>,
}

#[derive(Debug, Default)]
struct QueueInner {
    order: Vec<PeerId>,
    peers: HashMap<PeerId, TrackedPeer>,
    cursor: usize,
}

impl PeerQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds every candidate not already queued. Existing entries are left untouched.
    ///
    /// Returns how many peers were added.
    pub fn upsert_from_candidates(
        &self,
        candidates: impl IntoIterator<Item = PeerCandidate>,
        now: DateTime<Utc>,
    ) -> usize {
        let mut inner = self.inner.write();
        let mut added = 0;
        for candidate in candidates {
            if inner.peers.contains_key(&candidate.id) {
                continue;
            }
            inner.order.push(candidate.id.clone());
            inner
                .peers
                .insert(candidate.id.clone(), TrackedPeer::new(candidate, now));
            added += 1;
        }
        added
    }

    /// Queues `peer` unless its id is already present.
    pub fn insert(&self, peer: TrackedPeer) -> bool {
        let mut inner = self.inner.write();
        if inner.peers.contains_key(peer.id()) {
            return false;
        }
        inner.order.push(peer.id().clone());
        inner.peers.insert(peer.id().clone(), peer);
        true
    }

    /// The peer under the cursor, if it may be dialed at `now`.
    pub fn next_eligible(&self, now: DateTime<Utc>) -> Option<TrackedPeer> {
        let inner = self.inner.read();
        let id = inner.order.get(inner.cursor)?;
        inner
            .peers
            .get(id)
            .filter(|peer| peer.is_eligible(now))
            .cloned()
    }

    pub fn advance(&self) {
        let mut inner = self.inner.write();
        if inner.cursor < inner.order.len() {
            inner.cursor += 1;
        }
    }

    pub fn reset_cursor(&self) {
        self.inner.write().cursor = 0;
    }

    pub fn remove(&self, id: &PeerId) -> Option<TrackedPeer> {
        let mut inner = self.inner.write();
        let peer = inner.peers.remove(id)?;
        if let Some(pos) = inner.order.iter().position(|queued| queued == id) {
            inner.order.remove(pos);
            // keep pointing at the same next peer
            if pos < inner.cursor {
                inner.cursor -= 1;
            }
        }
        Some(peer)
    }

    pub fn get(&self, id: &PeerId) -> Option<TrackedPeer> {
        self.inner.read().peers.get(id).cloned()
    }

    /// Applies `f` to the queued peer, returning `None` if it is not queued.
    pub fn update<R>(&self, id: &PeerId, f: impl FnOnce(&mut TrackedPeer) -> R) -> Option<R> {
        self.inner.write().peers.get_mut(id).map(f)
    }

    pub fn sort_by_next_eligible(&self) {
        let mut inner = self.inner.write();
        let QueueInner { order, peers, .. } = &mut *inner;
        // stable, so ties keep their insertion order
        order.sort_by_cached_key(|id| peers.get(id).map(TrackedPeer::next_eligible));
    }

    pub fn len(&self) -> usize {
        self.inner.read().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().peers.is_empty()
    }

    pub fn class_distribution(&self) -> BTreeMap<DelayClass, usize> {
        let inner = self.inner.read();
        let mut distribution = BTreeMap::new();
        for peer in inner.peers.values() {
            *distribution.entry(peer.delay().class()).or_default() += 1;
        }
        distribution
    }

    #[cfg(test)]
    fn ordered_ids(&self) -> Vec<PeerId> {
        self.inner.read().order.clone()
    }
}
