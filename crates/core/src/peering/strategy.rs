//! The control loop deciding which peer is dialed next.
//!
//! The loop walks the [`PeerQueue`] in passes. Each pass starts with a resync
//! against the candidate source and a re-sort by next eligible time, then
//! hands out peers to idle workers until the cursor reaches the end or the
//! next peer is still backing off. A new pass never starts sooner than the
//! minimum iteration interval after the previous one.

use std::{
    collections::{HashSet, VecDeque},
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot},
    time::Instant,
};
use tokio_util::sync::CancellationToken;

use super::{
    delay::DelayClass,
    metrics::PeeringMetrics,
    queue::{PeerQueue, TrackedPeer},
    ConnectionAttempt,
};
use crate::{
    config::{self, Config, DeprecationReset},
    store::{CandidateSource, PersistenceSink},
    types::{Network, PeerCandidate, PeerId},
    util::time_source::TimeSource,
};

const INBOX_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrategyConfig {
    /// Network assigned to peers first seen through an inbound connection.
    pub network: Network,
    pub min_iteration_interval: Duration,
    pub deprecation_time: Duration,
    pub left_network_time: Duration,
    pub reset_deprecation_on: DeprecationReset,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            network: Network::default(),
            min_iteration_interval: config::DEFAULT_MIN_ITERATION_INTERVAL,
            deprecation_time: config::DEFAULT_DEPRECATION_TIME,
            left_network_time: config::DEFAULT_LEFT_NETWORK_TIME,
            reset_deprecation_on: DeprecationReset::default(),
        }
    }
}

impl From<&Config> for StrategyConfig {
    fn from(config: &Config) -> Self {
        Self {
            network: config.network,
            min_iteration_interval: config.min_iteration_interval,
            deprecation_time: config.deprecation_time,
            left_network_time: config.left_network_time,
            reset_deprecation_on: config.reset_deprecation_on,
        }
    }
}

/// Result of an identification handshake, as reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identification {
    pub peer: PeerId,
    pub remote: Option<SocketAddr>,
    pub identified: bool,
}

pub(crate) enum StrategyMsg {
    NextPeer(oneshot::Sender<PeerCandidate>),
    AttemptFinished(ConnectionAttempt),
    AlreadyConnected(PeerId),
    Identified(Identification),
}

#[derive(Debug, Error)]
#[error("scheduling strategy stopped")]
pub struct StrategyStopped;

/// Cloneable entry point into the strategy loop.
#[derive(Clone)]
pub struct StrategyHandle {
    sender: mpsc::Sender<StrategyMsg>,
}

impl StrategyHandle {
    pub(crate) fn new(sender: mpsc::Sender<StrategyMsg>) -> Self {
        Self { sender }
    }

    /// Waits for the next peer to dial. Returns `None` once the loop is gone.
    pub async fn next_peer(&self) -> Option<PeerCandidate> {
        let (tx, rx) = oneshot::channel();
        self.sender.send(StrategyMsg::NextPeer(tx)).await.ok()?;
        rx.await.ok()
    }

    pub async fn attempt_finished(&self, attempt: ConnectionAttempt) -> Result<(), StrategyStopped> {
        self.send(StrategyMsg::AttemptFinished(attempt)).await
    }

    pub async fn already_connected(&self, peer: PeerId) -> Result<(), StrategyStopped> {
        self.send(StrategyMsg::AlreadyConnected(peer)).await
    }

    pub async fn identified(&self, identification: Identification) -> Result<(), StrategyStopped> {
        self.send(StrategyMsg::Identified(identification)).await
    }

    async fn send(&self, msg: StrategyMsg) -> Result<(), StrategyStopped> {
        self.sender.send(msg).await.map_err(|_| StrategyStopped)
    }
}

pub struct SchedulingStrategy {
    queue: Arc<PeerQueue>,
    source: Arc<dyn CandidateSource>,
    sink: Arc<dyn PersistenceSink>,
    metrics: PeeringMetrics,
    time: Arc<dyn TimeSource>,
    config: StrategyConfig,
    inbox: mpsc::Receiver<StrategyMsg>,
    /// Workers waiting for a peer, oldest first.
    waiting: VecDeque<oneshot::Sender<PeerCandidate>>,
    /// Peers handed out during the current pass.
    attempted: HashSet<PeerId>,
    /// Peers handed out whose result has not arrived yet.
    in_flight: HashSet<PeerId>,
    pass_started: Instant,
    resync_at: Option<Instant>,
}

impl SchedulingStrategy {
    pub fn new(
        queue: Arc<PeerQueue>,
        source: Arc<dyn CandidateSource>,
        sink: Arc<dyn PersistenceSink>,
        metrics: PeeringMetrics,
        time: Arc<dyn TimeSource>,
        config: StrategyConfig,
    ) -> (Self, StrategyHandle) {
        let (sender, inbox) = mpsc::channel(INBOX_CAPACITY);
        let strategy = Self {
            queue,
            source,
            sink,
            metrics,
            time,
            config,
            inbox,
            waiting: VecDeque::new(),
            attempted: HashSet::new(),
            in_flight: HashSet::new(),
            pass_started: Instant::now(),
            resync_at: None,
        };
        (strategy, StrategyHandle::new(sender))
    }

    pub async fn run(mut self, cancel: CancellationToken) -> anyhow::Result<()> {
        self.resync().await;
        loop {
            let resync_at = self.resync_at;
            let resync_due = async move {
                match resync_at {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => futures::future::pending().await,
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => break,
                msg = self.inbox.recv() => {
                    let Some(msg) = msg else { break; };
                    self.handle(msg);
                }
                _ = resync_due => {
                    self.resync().await;
                    self.dispatch();
                }
            }
        }
        tracing::debug!(queued = self.queue.len(), "Scheduling strategy stopped");
        Ok(())
    }

    fn handle(&mut self, msg: StrategyMsg) {
        match msg {
            StrategyMsg::NextPeer(reply) => {
                self.waiting.push_back(reply);
                self.dispatch();
            }
            StrategyMsg::AttemptFinished(attempt) => {
                self.in_flight.remove(&attempt.peer);
                self.on_attempt(attempt);
            }
            StrategyMsg::AlreadyConnected(peer) => {
                tracing::trace!(%peer, "Peer already connected, attempt skipped");
                self.in_flight.remove(&peer);
            }
            StrategyMsg::Identified(identification) => self.on_identified(identification),
        }
    }

    /// Hands eligible peers to waiting workers until either runs out.
    fn dispatch(&mut self) {
        while !self.waiting.is_empty() && self.resync_at.is_none() {
            let Some(peer) = self.queue.next_eligible(self.time.now()) else {
                self.end_pass();
                break;
            };

            let id = peer.id().clone();
            if self.in_flight.contains(&id) || self.attempted.contains(&id) {
                tracing::trace!(peer = %id, "Peer already attempted in this pass");
                self.queue.advance();
                continue;
            }
            if !self.deliver(peer.candidate().clone()) {
                tracing::trace!(peer = %id, "Waiting workers left, peer kept for the next request");
                break;
            }
            self.queue.advance();
            self.metrics.record_dispatch(peer.delay().class());
            self.attempted.insert(id.clone());
            self.in_flight.insert(id);
        }
    }

    /// Sends `candidate` to the oldest worker still waiting. Returns `false`
    /// when every waiting worker has gone away.
    fn deliver(&mut self, mut candidate: PeerCandidate) -> bool {
        while let Some(reply) = self.waiting.pop_front() {
            match reply.send(candidate) {
                Ok(()) => return true,
                Err(returned) => candidate = returned,
            }
        }
        false
    }

    fn end_pass(&mut self) {
        let elapsed = self.pass_started.elapsed();
        self.metrics.finish_pass(elapsed, self.attempted.len());
        tracing::debug!(
            attempted = self.attempted.len(),
            queued = self.queue.len(),
            ?elapsed,
            "Finished pass over peer queue"
        );
        self.resync_at = Some(self.pass_started + self.config.min_iteration_interval);
    }

    async fn resync(&mut self) {
        self.resync_at = None;
        match self.source.connectable_peers().await {
            Ok(candidates) => {
                let added = self
                    .queue
                    .upsert_from_candidates(candidates, self.time.now());
                if added > 0 {
                    tracing::debug!(added, "New peers queued");
                }
            }
            Err(error) => {
                tracing::warn!(%error, "Peer queue resync failed, keeping queued peers");
            }
        }
        self.queue.sort_by_next_eligible();
        self.queue.reset_cursor();
        self.attempted.clear();
        self.metrics
            .record_queue_distribution(self.queue.class_distribution(), self.queue.len());
        self.pass_started = Instant::now();
    }

    fn on_attempt(&mut self, mut attempt: ConnectionAttempt) {
        let now = self.time.now();
        let class = DelayClass::classify(attempt.error);
        self.metrics.record_attempt(attempt.error);

        let reset_on_connect = self.config.reset_deprecation_on == DeprecationReset::Connect;
        let deprecation_time = self.config.deprecation_time;
        let left_network_time = self.config.left_network_time;
        let deprecation = self.queue.update(&attempt.peer, |peer| {
            peer.record_outcome(class, now);
            if class == DelayClass::Success {
                if reset_on_connect {
                    peer.confirm_activity(now);
                }
                None
            } else if peer.is_deprecable(now, deprecation_time) {
                Some(peer.has_left_network(now, left_network_time))
            } else {
                None
            }
        });

        match deprecation {
            None => {
                tracing::debug!(peer = %attempt.peer, "Attempt result for a peer that is not queued");
            }
            Some(Some(left_network)) => {
                attempt.deprecable = true;
                attempt.left_network = left_network;
                self.queue.remove(&attempt.peer);
                self.metrics.record_deprecation();
                tracing::info!(
                    peer = %attempt.peer,
                    error = %attempt.error,
                    left_network,
                    "Peer deprecated"
                );
            }
            Some(None) => {
                tracing::trace!(
                    peer = %attempt.peer,
                    error = %attempt.error,
                    %class,
                    "Attempt recorded"
                );
            }
        }
        self.sink.persist_attempt(attempt);
    }

    fn on_identified(&mut self, identification: Identification) {
        let now = self.time.now();
        let Identification {
            peer,
            remote,
            identified,
        } = identification;

        let queued = self
            .queue
            .update(&peer, |tracked| {
                if identified {
                    tracked.confirm_activity(now);
                }
            })
            .is_some();
        if queued {
            return;
        }

        // inbound peer we have never dialed
        let (true, Some(remote)) = (identified, remote) else {
            return;
        };
        let candidate = PeerCandidate::new(peer.clone(), vec![remote], self.config.network);
        let mut tracked = TrackedPeer::new(candidate, now);
        tracked.record_outcome(DelayClass::Success, now);
        tracked.confirm_activity(now);
        if self.queue.insert(tracked) {
            tracing::debug!(%peer, %remote, "Tracking peer first seen inbound");
        }
    }
}
