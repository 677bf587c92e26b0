use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{CloseInfo, ConnEventTrace, ConnectionRecord, OpenInfo};
use crate::{store::PersistenceSink, types::PeerId, util::time_source::elapsed_between};

/// Partial record for a connection that has not been fully observed yet.
#[derive(Debug, Default)]
struct PendingConnEvent {
    open: Option<OpenInfo>,
    close: Option<CloseInfo>,
}

impl PendingConnEvent {
    fn apply(&mut self, peer: &PeerId, trace: ConnEventTrace) {
        match trace {
            ConnEventTrace::Open(info) => {
                if self
                    .close
                    .is_some_and(|close| close.closed_at < info.opened_at)
                {
                    tracing::debug!(%peer, "Dropping close of an earlier connection never seen open");
                    self.close = None;
                }
                self.apply_open(peer, info);
            }
            ConnEventTrace::Close(info) => {
                self.close = Some(info);
            }
        }
    }

    fn apply_open(&mut self, peer: &PeerId, mut info: OpenInfo) {
        match self.open.as_mut() {
            Some(previous) => {
                tracing::debug!(%peer, "Connection opened twice before closing, keeping latest");
                let mut attributes = std::mem::take(&mut previous.attributes);
                attributes.append(&mut info.attributes);
                *previous = OpenInfo { attributes, ..info };
            }
            None => self.open = Some(info),
        }
    }

    fn is_complete(&self) -> bool {
        self.open.is_some() && self.close.is_some()
    }

    fn into_record(self, peer: PeerId) -> Option<ConnectionRecord> {
        let (open, close) = (self.open?, self.close?);
        let duration = elapsed_between(open.opened_at, close.closed_at).unwrap_or_else(|| {
            tracing::debug!(%peer, "Close reported before open time, recording zero duration");
            Duration::ZERO
        });
        Some(ConnectionRecord {
            peer,
            direction: open.direction,
            opened_at: open.opened_at,
            closed_at: close.closed_at,
            duration,
            latency: open.latency,
            identified: open.identified,
            attributes: open.attributes,
            error: open.error,
        })
    }
}

/// Merges open and close traces per peer into complete connection records.
///
/// The aggregator owns its map and is driven by a single task, so traces can
/// arrive in any order without any locking. A record is handed to the sink
/// exactly when both halves are known, and is forgotten right after.
pub struct ConnEventAggregator {
    pending: HashMap<PeerId, PendingConnEvent>,
    sink: Arc<dyn PersistenceSink>,
}

impl ConnEventAggregator {
    pub fn new(sink: Arc<dyn PersistenceSink>) -> Self {
        Self {
            pending: HashMap::new(),
            sink,
        }
    }

    /// Folds `trace` into the pending record for `peer`. Returns whether that
    /// completed the record and handed it to the sink.
    pub fn record(&mut self, peer: PeerId, trace: ConnEventTrace) -> bool {
        let entry = self.pending.entry(peer.clone()).or_default();
        entry.apply(&peer, trace);
        if !entry.is_complete() {
            return false;
        }
        let Some(record) = self
            .pending
            .remove(&peer)
            .and_then(|pending| pending.into_record(peer))
        else {
            return false;
        };
        tracing::debug!(
            peer = %record.peer,
            duration = ?record.duration,
            identified = record.identified,
            "Connection record complete"
        );
        self.sink.persist_connection(record);
        true
    }

    pub fn in_flight(&self) -> usize {
        self.pending.len()
    }

    pub async fn run(
        mut self,
        mut traces: mpsc::Receiver<(PeerId, ConnEventTrace)>,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                trace = traces.recv() => {
                    let Some((peer, trace)) = trace else { break; };
                    self.record(peer, trace);
                }
            }
        }
        tracing::debug!(in_flight = self.in_flight(), "Connection event aggregator stopped");
        Ok(())
    }
}
