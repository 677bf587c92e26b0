//! End-to-end runs of the peering service: real TCP dials on loopback, and a
//! scripted transport with a mock clock for the deprecation lifecycle.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use chrono::{TimeDelta, Utc};
use futures::{future::BoxFuture, FutureExt};
use peerwatch::{
    config::Config,
    peering::{AttemptStatus, PeeringService},
    store::{MemoryStore, RecordLog},
    transport::{ConnectionNotifier, DialError, ErrorCategory, TcpTransport, Transport},
    types::{Network, PeerCandidate, PeerId},
    util::time_source::MockTimeSource,
};
use tokio::{io::AsyncReadExt, net::TcpListener, time::timeout};
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(10);

fn test_config() -> Config {
    Config {
        workers: 2,
        dial_timeout: Duration::from_secs(2),
        min_iteration_interval: Duration::from_millis(50),
        ..Default::default()
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> testresult::TestResult {
    timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await?;
    Ok(())
}

/// Accepts connections and closes each one after `linger`.
async fn serve(listener: TcpListener, linger: Duration) {
    while let Ok((mut stream, _)) = listener.accept().await {
        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let _ = timeout(linger, stream.read(&mut buf)).await;
        });
    }
}

#[test_log::test(tokio::test)]
async fn test_tcp_crawl_end_to_end() -> testresult::TestResult {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let alive_addr = listener.local_addr()?;
    tokio::spawn(serve(listener, Duration::from_millis(100)));
    let dead_addr: SocketAddr = {
        let closed = TcpListener::bind("127.0.0.1:0").await?;
        closed.local_addr()?
    };

    let dir = tempfile::tempdir()?;
    let log_path = dir.path().join("records.jsonl");
    let log = RecordLog::open(&log_path).await?;
    let store = MemoryStore::new().with_record_log(log.clone());
    store.add_discovered(PeerCandidate::new("alive", vec![alive_addr], Network::Ethereum));
    store.add_discovered(PeerCandidate::new("dead", vec![dead_addr], Network::Ethereum));

    let (notifier, notifications) = ConnectionNotifier::channel(64);
    let transport = Arc::new(TcpTransport::new(notifier, Duration::from_secs(5)));
    let service = PeeringService::new(
        &test_config(),
        transport,
        notifications,
        Arc::new(store.clone()),
        Arc::new(store.clone()),
    );
    let metrics = service.metrics();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(service.run(cancel.clone()));

    wait_until(|| !store.connections().is_empty()).await?;
    wait_until(|| store.attempts().len() >= 2).await?;

    let attempts = store.attempts();
    let alive = attempts
        .iter()
        .find(|attempt| attempt.peer == PeerId::new("alive"))
        .expect("alive peer attempted");
    assert_eq!(alive.status, AttemptStatus::Positive);
    let dead = attempts
        .iter()
        .find(|attempt| attempt.peer == PeerId::new("dead"))
        .expect("dead peer attempted");
    assert_eq!(dead.error, ErrorCategory::ConnectionRefused);

    let record = &store.connections()[0];
    assert_eq!(record.peer, PeerId::new("alive"));
    assert!(record.latency.is_some());
    assert!(record.closed_at >= record.opened_at);

    let snapshot = metrics.snapshot();
    assert!(snapshot.total_errors.contains_key(&ErrorCategory::NoError));
    assert!(snapshot.total_errors.contains_key(&ErrorCategory::ConnectionRefused));

    cancel.cancel();
    task.await??;

    log.flush().await;
    let content = tokio::fs::read_to_string(&log_path).await?;
    let kinds: Vec<String> = content
        .lines()
        .map(|line| {
            let value: serde_json::Value = serde_json::from_str(line)?;
            Ok(value["kind"].as_str().unwrap_or_default().to_owned())
        })
        .collect::<Result<_, serde_json::Error>>()?;
    assert!(kinds.iter().any(|kind| kind == "attempt"));
    assert!(kinds.iter().any(|kind| kind == "connection"));
    Ok(())
}

/// Fails every dial as if the host were unreachable.
struct UnreachableTransport;

impl Transport for UnreachableTransport {
    fn connect<'a>(&'a self, _peer: &'a PeerCandidate) -> BoxFuture<'a, Result<(), DialError>> {
        async { Err(DialError::Other("dial tcp: no route to host".into())) }.boxed()
    }

    fn is_connected(&self, _peer: &PeerId) -> bool {
        false
    }
}

#[test_log::test(tokio::test)]
async fn test_unreachable_peers_are_deprecated() -> testresult::TestResult {
    let start = Utc::now();
    let clock = MockTimeSource::new(start);
    let store = MemoryStore::new();
    let addr: SocketAddr = "192.0.2.1:9000".parse()?;
    store.add_discovered(PeerCandidate::new("recent", vec![addr], Network::Ethereum));
    store.add_discovered(
        PeerCandidate::new("gone", vec![addr], Network::Ethereum)
            .with_last_activity(start - TimeDelta::days(90)),
    );

    let (_notifier, notifications) = ConnectionNotifier::channel(8);
    let config = test_config();
    let deprecation_time = config.deprecation_time;
    let service = PeeringService::new(
        &config,
        Arc::new(UnreachableTransport),
        notifications,
        Arc::new(store.clone()),
        Arc::new(store.clone()),
    )
    .with_time_source(Arc::new(clock.clone()));
    let queue = service.queue();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(service.run(cancel.clone()));

    // one failure each, still inside the deprecation window
    wait_until(|| store.attempts().len() >= 2).await?;
    assert!(store.attempts().iter().all(|attempt| !attempt.deprecable));
    assert_eq!(store.attempts()[0].error, ErrorCategory::NoRouteToHost);

    clock.advance_time(deprecation_time * 3);
    wait_until(|| queue.is_empty()).await?;

    let recent = store
        .control_info(&PeerId::new("recent"))
        .expect("known peer");
    assert!(recent.deprecated);
    assert!(!recent.left_network);
    let gone = store.control_info(&PeerId::new("gone")).expect("known peer");
    assert!(gone.deprecated);
    assert!(gone.left_network);

    cancel.cancel();
    task.await??;
    Ok(())
}
