use std::{net::SocketAddr, sync::Arc, time::Duration};

use chrono::Utc;
use dashmap::DashMap;
use futures::{future::BoxFuture, FutureExt};
use tokio::{io::AsyncReadExt, net::TcpStream, time::Instant};

use super::{ConnectionNotifier, DialError, Transport};
use crate::{
    events::{CloseInfo, ConnDirection, OpenInfo},
    types::{PeerCandidate, PeerId},
};

/// Reachability probe over plain TCP.
///
/// A successful connect counts as an open connection with the connect round
/// trip as latency. No identify protocol runs, so opened connections are
/// reported as not identified. Each connection is held until the remote
/// closes it or the hold time passes.
pub struct TcpTransport {
    notifier: ConnectionNotifier,
    hold: Duration,
    connections: Arc<DashMap<PeerId, SocketAddr>>,
}

impl TcpTransport {
    pub fn new(notifier: ConnectionNotifier, hold: Duration) -> Self {
        Self {
            notifier,
            hold,
            connections: Arc::new(DashMap::new()),
        }
    }

    pub fn open_connections(&self) -> usize {
        self.connections.len()
    }

    /// Registers the connection and hands it to a background task that
    /// reports it open, holds it and reports it closed. Nothing here awaits,
    /// so a caller dropping the dial future cannot leave a stale entry behind.
    fn track(&self, peer: PeerId, remote: SocketAddr, stream: TcpStream, latency: Duration) {
        self.connections.insert(peer.clone(), remote);

        let mut info = OpenInfo::new(ConnDirection::Outbound, Utc::now());
        info.latency = Some(latency);
        info.attributes.insert("remote".into(), remote.to_string());

        let connections = self.connections.clone();
        let notifier = self.notifier.clone();
        let hold = self.hold;
        tokio::spawn(async move {
            let mut stream = stream;
            notifier.opened(peer.clone(), Some(remote), info).await;
            let mut buf = [0u8; 1024];
            let _ = tokio::time::timeout(hold, async {
                loop {
                    match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {}
                    }
                }
            })
            .await;
            drop(stream);
            connections.remove(&peer);
            tracing::trace!(%peer, %remote, "Connection closed");
            notifier
                .closed(
                    peer,
                    CloseInfo {
                        closed_at: Utc::now(),
                    },
                )
                .await;
        });
    }
}

impl Transport for TcpTransport {
    fn connect<'a>(&'a self, peer: &'a PeerCandidate) -> BoxFuture<'a, Result<(), DialError>> {
        async move {
            let mut last_error = None;
            for addr in &peer.addrs {
                let started = Instant::now();
                match TcpStream::connect(addr).await {
                    Ok(stream) => {
                        let latency = started.elapsed();
                        tracing::debug!(peer = %peer.id, %addr, ?latency, "Connected");
                        self.track(peer.id.clone(), *addr, stream, latency);
                        return Ok(());
                    }
                    Err(error) => {
                        tracing::trace!(peer = %peer.id, %addr, %error, "Connect failed");
                        last_error = Some(error);
                    }
                }
            }
            Err(match last_error {
                Some(error) => DialError::Io(error),
                None => DialError::NoAddresses(peer.id.clone()),
            })
        }
        .boxed()
    }

    fn is_connected(&self, peer: &PeerId) -> bool {
        self.connections.contains_key(peer)
    }
}
