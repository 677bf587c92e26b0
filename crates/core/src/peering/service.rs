use std::sync::Arc;

use tokio::{sync::mpsc, task::JoinSet};
use tokio_util::sync::CancellationToken;

use super::{
    metrics::PeeringMetrics,
    queue::PeerQueue,
    strategy::{Identification, SchedulingStrategy, StrategyConfig, StrategyHandle},
    worker::DialWorker,
};
use crate::{
    config::Config,
    events::{ConnEventAggregator, ConnEventTrace},
    store::{CandidateSource, PersistenceSink},
    transport::{ConnectionNotification, Transport},
    types::PeerId,
    util::time_source::{SystemTimeSrc, TimeSource},
};

const TRACE_CAPACITY: usize = 1024;

/// Runs the scheduling strategy, the dial workers, the connection event
/// aggregator and the router between transport notifications and both.
///
/// Every task shares one [`CancellationToken`]; cancelling it, or any task
/// failing, tears the whole service down.
pub struct PeeringService {
    config: Config,
    transport: Arc<dyn Transport>,
    notifications: mpsc::Receiver<ConnectionNotification>,
    source: Arc<dyn CandidateSource>,
    sink: Arc<dyn PersistenceSink>,
    time: Arc<dyn TimeSource>,
    queue: Arc<PeerQueue>,
    metrics: PeeringMetrics,
}

impl PeeringService {
    pub fn new(
        config: &Config,
        transport: Arc<dyn Transport>,
        notifications: mpsc::Receiver<ConnectionNotification>,
        source: Arc<dyn CandidateSource>,
        sink: Arc<dyn PersistenceSink>,
    ) -> Self {
        Self {
            config: config.clone(),
            transport,
            notifications,
            source,
            sink,
            time: Arc::new(SystemTimeSrc::new()),
            queue: Arc::new(PeerQueue::new()),
            metrics: PeeringMetrics::new(),
        }
    }

    pub fn with_time_source(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.time = time;
        self
    }

    pub fn metrics(&self) -> PeeringMetrics {
        self.metrics.clone()
    }

    pub fn queue(&self) -> Arc<PeerQueue> {
        self.queue.clone()
    }

    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let (strategy, handle) = SchedulingStrategy::new(
            self.queue.clone(),
            self.source,
            self.sink.clone(),
            self.metrics.clone(),
            self.time.clone(),
            StrategyConfig::from(&self.config),
        );
        let (trace_tx, trace_rx) = mpsc::channel(TRACE_CAPACITY);

        let mut tasks = JoinSet::new();
        tasks.spawn(strategy.run(cancel.clone()));
        tasks.spawn(ConnEventAggregator::new(self.sink).run(trace_rx, cancel.clone()));
        tasks.spawn(route_notifications(
            self.notifications,
            handle.clone(),
            trace_tx,
            cancel.clone(),
        ));
        for id in 0..self.config.workers {
            let worker = DialWorker::new(
                id,
                self.transport.clone(),
                handle.clone(),
                self.time.clone(),
                self.config.dial_timeout,
                self.config.dial_attempts,
            );
            tasks.spawn(worker.run(cancel.clone()));
        }
        drop(handle);
        tracing::info!(workers = self.config.workers, "Peering service started");

        let mut result = Ok(());
        while let Some(joined) = tasks.join_next().await {
            let outcome = joined
                .map_err(anyhow::Error::from)
                .and_then(|task_result| task_result);
            if let Err(error) = outcome {
                tracing::error!(%error, "Peering task failed, shutting down");
                cancel.cancel();
                if result.is_ok() {
                    result = Err(error);
                }
            }
        }
        tracing::info!("Peering service stopped");
        result
    }
}

/// Fans transport notifications out to the strategy (identification results)
/// and the aggregator (open and close traces).
async fn route_notifications(
    mut notifications: mpsc::Receiver<ConnectionNotification>,
    strategy: StrategyHandle,
    traces: mpsc::Sender<(PeerId, ConnEventTrace)>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        let notification = tokio::select! {
            _ = cancel.cancelled() => break,
            notification = notifications.recv() => match notification {
                Some(notification) => notification,
                None => break,
            },
        };
        let (peer, trace) = match notification {
            ConnectionNotification::Opened { peer, remote, info } => {
                let identification = Identification {
                    peer: peer.clone(),
                    remote,
                    identified: info.identified,
                };
                if strategy.identified(identification).await.is_err() {
                    break;
                }
                (peer, ConnEventTrace::Open(info))
            }
            ConnectionNotification::Closed { peer, info } => (peer, ConnEventTrace::Close(info)),
        };
        if traces.send((peer, trace)).await.is_err() {
            break;
        }
    }
    tracing::trace!("Notification router stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use futures::{future::BoxFuture, FutureExt};

    use super::*;
    use crate::{
        events::{CloseInfo, ConnDirection, OpenInfo},
        store::MemoryStore,
        transport::{ConnectionNotifier, DialError},
        types::{Network, PeerCandidate},
    };

    /// Accepts every dial and reports an identified connection that closes
    /// right away.
    struct EchoTransport {
        notifier: ConnectionNotifier,
    }

    impl Transport for EchoTransport {
        fn connect<'a>(&'a self, peer: &'a PeerCandidate) -> BoxFuture<'a, Result<(), DialError>> {
            async move {
                let now = Utc::now();
                let mut info = OpenInfo::new(ConnDirection::Outbound, now);
                info.identified = true;
                self.notifier
                    .opened(peer.id.clone(), peer.addrs.first().copied(), info)
                    .await;
                self.notifier
                    .closed(peer.id.clone(), CloseInfo { closed_at: now })
                    .await;
                Ok(())
            }
            .boxed()
        }

        fn is_connected(&self, _peer: &PeerId) -> bool {
            false
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_attempts_and_connections_are_persisted() -> testresult::TestResult {
        let store = MemoryStore::new();
        for id in ["a", "b", "c"] {
            store.add_discovered(PeerCandidate::new(
                id,
                vec!["127.0.0.1:9000".parse()?],
                Network::Ethereum,
            ));
        }
        let (notifier, notifications) = ConnectionNotifier::channel(16);
        let config = Config {
            workers: 2,
            min_iteration_interval: Duration::from_millis(50),
            ..Default::default()
        };
        let service = PeeringService::new(
            &config,
            Arc::new(EchoTransport { notifier }),
            notifications,
            Arc::new(store.clone()),
            Arc::new(store.clone()),
        );
        let metrics = service.metrics();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(service.run(cancel.clone()));

        tokio::time::timeout(Duration::from_secs(5), async {
            while store.connections().len() < 3 || store.attempts().len() < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await?;

        assert!(store.attempts().iter().all(|attempt| attempt.is_success()));
        assert!(store.connections().iter().all(|record| record.identified));
        // successful peers now wait out the success delay
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.attempts().len(), 3);
        assert!(metrics.snapshot().passes >= 1);

        cancel.cancel();
        task.await??;
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_cancel_stops_all_tasks() -> testresult::TestResult {
        let store = MemoryStore::new();
        let (notifier, notifications) = ConnectionNotifier::channel(16);
        let service = PeeringService::new(
            &Config::default(),
            Arc::new(EchoTransport { notifier }),
            notifications,
            Arc::new(store.clone()),
            Arc::new(store),
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn(service.run(cancel.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task).await???;
        Ok(())
    }
}
