use std::{
    collections::{HashMap, VecDeque},
    sync::Arc,
};

use futures::{future::BoxFuture, FutureExt};
use parking_lot::RwLock;

use super::{CandidateSource, ControlInfo, PersistenceSink, Record, RecordLog, StoreError};
use crate::{
    events::ConnectionRecord,
    peering::ConnectionAttempt,
    types::{PeerCandidate, PeerId},
};

/// Attempts and connection records kept in memory; older entries are dropped first.
const HISTORY_LIMIT: usize = 10_000;

/// In-process peer store.
///
/// Serves as candidate source and persistence sink at once: attempt results
/// update the per-peer [`ControlInfo`], and deprecated peers stop being
/// offered as candidates until discovery reports them again.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<StoreState>>,
    record_log: Option<RecordLog>,
}

#[derive(Default)]
struct StoreState {
    peers: HashMap<PeerId, StoredPeer>,
    attempts: VecDeque<ConnectionAttempt>,
    connections: VecDeque<ConnectionRecord>,
}

struct StoredPeer {
    candidate: PeerCandidate,
    control: ControlInfo,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mirrors every persisted attempt and record into `log`.
    pub fn with_record_log(mut self, log: RecordLog) -> Self {
        self.record_log = Some(log);
        self
    }

    /// Registers a peer reported by discovery, refreshing its addresses and
    /// clearing any previous deprecation.
    pub fn add_discovered(&self, candidate: PeerCandidate) {
        let mut inner = self.inner.write();
        match inner.peers.get_mut(&candidate.id) {
            Some(stored) => {
                if stored.control.deprecated {
                    tracing::debug!(peer = %candidate.id, "Deprecated peer rediscovered");
                }
                stored.control.deprecated = false;
                stored.control.left_network = false;
                stored.candidate = candidate;
            }
            None => {
                inner.peers.insert(
                    candidate.id.clone(),
                    StoredPeer {
                        candidate,
                        control: ControlInfo::default(),
                    },
                );
            }
        }
    }

    pub fn control_info(&self, peer: &PeerId) -> Option<ControlInfo> {
        self.inner
            .read()
            .peers
            .get(peer)
            .map(|stored| stored.control.clone())
    }

    pub fn attempts(&self) -> Vec<ConnectionAttempt> {
        self.inner.read().attempts.iter().cloned().collect()
    }

    pub fn connections(&self) -> Vec<ConnectionRecord> {
        self.inner.read().connections.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().peers.is_empty()
    }
}

fn push_bounded<T>(history: &mut VecDeque<T>, item: T) {
    if history.len() == HISTORY_LIMIT {
        history.pop_front();
    }
    history.push_back(item);
}

impl CandidateSource for MemoryStore {
    fn connectable_peers(&self) -> BoxFuture<'_, Result<Vec<PeerCandidate>, StoreError>> {
        let candidates: Vec<_> = self
            .inner
            .read()
            .peers
            .values()
            .filter(|stored| !stored.control.deprecated)
            .map(|stored| {
                let mut candidate = stored.candidate.clone();
                if let Some(ts) = stored.control.last_activity {
                    candidate.last_activity = Some(ts);
                }
                candidate
            })
            .collect();
        async move { Ok(candidates) }.boxed()
    }
}

impl PersistenceSink for MemoryStore {
    fn persist_attempt(&self, attempt: ConnectionAttempt) {
        {
            let mut inner = self.inner.write();
            match inner.peers.get_mut(&attempt.peer) {
                Some(stored) => stored.control.apply(&attempt),
                None => {
                    tracing::debug!(peer = %attempt.peer, "Attempt for a peer unknown to the store");
                }
            }
            push_bounded(&mut inner.attempts, attempt.clone());
        }
        if let Some(log) = &self.record_log {
            log.append(Record::Attempt(attempt));
        }
    }

    fn persist_connection(&self, record: ConnectionRecord) {
        push_bounded(&mut self.inner.write().connections, record.clone());
        if let Some(log) = &self.record_log {
            log.append(Record::Connection(record));
        }
    }
}
