use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use super::{strategy::StrategyHandle, ConnectionAttempt};
use crate::{
    transport::{ErrorCategory, Transport},
    types::PeerCandidate,
    util::time_source::TimeSource,
};

/// Pulls peers from the strategy and dials them one at a time.
pub(crate) struct DialWorker {
    id: usize,
    transport: Arc<dyn Transport>,
    strategy: StrategyHandle,
    time: Arc<dyn TimeSource>,
    dial_timeout: Duration,
    dial_attempts: u32,
}

impl DialWorker {
    pub fn new(
        id: usize,
        transport: Arc<dyn Transport>,
        strategy: StrategyHandle,
        time: Arc<dyn TimeSource>,
        dial_timeout: Duration,
        dial_attempts: u32,
    ) -> Self {
        Self {
            id,
            transport,
            strategy,
            time,
            dial_timeout,
            dial_attempts: dial_attempts.max(1),
        }
    }

    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        loop {
            let peer = tokio::select! {
                _ = cancel.cancelled() => break,
                peer = self.strategy.next_peer() => match peer {
                    Some(peer) => peer,
                    None => break,
                },
            };

            if self.transport.is_connected(&peer.id) {
                if self.strategy.already_connected(peer.id).await.is_err() {
                    break;
                }
                continue;
            }

            let attempt = tokio::select! {
                _ = cancel.cancelled() => break,
                attempt = self.dial(&peer) => attempt,
            };
            if self.strategy.attempt_finished(attempt).await.is_err() {
                break;
            }
        }
        tracing::trace!(worker = self.id, "Dial worker stopped");
        Ok(())
    }

    async fn dial(&self, peer: &PeerCandidate) -> ConnectionAttempt {
        let attempted_at = self.time.now();
        let mut category = ErrorCategory::Unknown;
        for attempt in 1..=self.dial_attempts {
            category =
                match tokio::time::timeout(self.dial_timeout, self.transport.connect(peer)).await {
                    Ok(Ok(())) => ErrorCategory::NoError,
                    Ok(Err(error)) => {
                        tracing::trace!(peer = %peer.id, %error, "Dial failed");
                        error.category()
                    }
                    Err(_) => ErrorCategory::ContextDeadlineExceeded,
                };
            if category.is_success() {
                break;
            }
            tracing::debug!(
                worker = self.id,
                peer = %peer.id,
                attempt,
                %category,
                "Dial attempt failed"
            );
        }
        ConnectionAttempt::new(peer.id.clone(), attempted_at, category)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use chrono::Utc;
    use futures::{future::BoxFuture, FutureExt};
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        peering::strategy::StrategyMsg,
        transport::DialError,
        types::{Network, PeerId},
        util::time_source::SystemTimeSrc,
    };

    #[derive(Default)]
    struct ScriptedTransport {
        connected: HashSet<PeerId>,
        hanging: HashSet<PeerId>,
        dials: Mutex<Vec<PeerId>>,
    }

    impl Transport for ScriptedTransport {
        fn connect<'a>(&'a self, peer: &'a PeerCandidate) -> BoxFuture<'a, Result<(), DialError>> {
            self.dials.lock().push(peer.id.clone());
            async move {
                if self.hanging.contains(&peer.id) {
                    futures::future::pending::<()>().await;
                }
                match peer.id.as_str() {
                    "alive" => Ok(()),
                    _ => Err(DialError::Io(std::io::ErrorKind::ConnectionRefused.into())),
                }
            }
            .boxed()
        }

        fn is_connected(&self, peer: &PeerId) -> bool {
            self.connected.contains(peer)
        }
    }

    fn candidate(id: &str) -> PeerCandidate {
        PeerCandidate::new(id, vec!["127.0.0.1:9000".parse().unwrap()], Network::Ethereum)
    }

    fn spawn_worker(
        transport: Arc<ScriptedTransport>,
        dial_attempts: u32,
    ) -> (mpsc::Receiver<StrategyMsg>, CancellationToken) {
        let (tx, rx) = mpsc::channel(8);
        let worker = DialWorker::new(
            0,
            transport,
            StrategyHandle::new(tx),
            Arc::new(SystemTimeSrc::new()),
            Duration::from_millis(50),
            dial_attempts,
        );
        let cancel = CancellationToken::new();
        tokio::spawn(worker.run(cancel.clone()));
        (rx, cancel)
    }

    async fn serve(rx: &mut mpsc::Receiver<StrategyMsg>, peer: &str) {
        match rx.recv().await {
            Some(StrategyMsg::NextPeer(reply)) => {
                let _ = reply.send(candidate(peer));
            }
            _ => panic!("expected a peer request"),
        }
    }

    async fn outcome(rx: &mut mpsc::Receiver<StrategyMsg>) -> ConnectionAttempt {
        match rx.recv().await {
            Some(StrategyMsg::AttemptFinished(attempt)) => attempt,
            _ => panic!("expected an attempt result"),
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_reports_success_and_failure() {
        let transport = Arc::new(ScriptedTransport::default());
        let (mut rx, cancel) = spawn_worker(transport, 1);

        serve(&mut rx, "alive").await;
        let attempt = outcome(&mut rx).await;
        assert!(attempt.is_success());
        assert_eq!(attempt.error, ErrorCategory::NoError);

        serve(&mut rx, "dead").await;
        let attempt = outcome(&mut rx).await;
        assert!(!attempt.is_success());
        assert_eq!(attempt.error, ErrorCategory::ConnectionRefused);
        assert!(attempt.attempted_at <= Utc::now());
        cancel.cancel();
    }

    #[test_log::test(tokio::test)]
    async fn test_hanging_dial_times_out() {
        let transport = Arc::new(ScriptedTransport {
            hanging: HashSet::from([PeerId::new("slow")]),
            ..Default::default()
        });
        let (mut rx, cancel) = spawn_worker(transport, 1);

        serve(&mut rx, "slow").await;
        let attempt = outcome(&mut rx).await;
        assert_eq!(attempt.error, ErrorCategory::ContextDeadlineExceeded);
        cancel.cancel();
    }

    #[test_log::test(tokio::test)]
    async fn test_connected_peer_is_not_dialed() {
        let transport = Arc::new(ScriptedTransport {
            connected: HashSet::from([PeerId::new("alive")]),
            ..Default::default()
        });
        let (mut rx, cancel) = spawn_worker(transport.clone(), 1);

        serve(&mut rx, "alive").await;
        match rx.recv().await {
            Some(StrategyMsg::AlreadyConnected(peer)) => assert_eq!(peer, PeerId::new("alive")),
            _ => panic!("expected an already-connected report"),
        }
        assert!(transport.dials.lock().is_empty());
        cancel.cancel();
    }

    #[test_log::test(tokio::test)]
    async fn test_retries_up_to_configured_attempts() {
        let transport = Arc::new(ScriptedTransport::default());
        let (mut rx, cancel) = spawn_worker(transport.clone(), 3);

        serve(&mut rx, "dead").await;
        let attempt = outcome(&mut rx).await;
        assert_eq!(attempt.error, ErrorCategory::ConnectionRefused);
        assert_eq!(transport.dials.lock().len(), 3);
        cancel.cancel();
    }

    #[test_log::test(tokio::test)]
    async fn test_stops_when_strategy_is_gone() {
        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        let worker = DialWorker::new(
            0,
            Arc::new(ScriptedTransport::default()),
            StrategyHandle::new(tx),
            Arc::new(SystemTimeSrc::new()),
            Duration::from_millis(50),
            1,
        );
        tokio::time::timeout(Duration::from_secs(5), worker.run(CancellationToken::new()))
            .await
            .expect("worker did not stop")
            .unwrap();
    }
}
