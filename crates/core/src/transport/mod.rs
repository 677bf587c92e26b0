//! Boundary towards the peer-to-peer transport.
//!
//! Dial workers call [`Transport::connect`]; the transport reports the life of
//! every connection through a [`ConnectionNotifier`]. Handshake and identify
//! protocols live behind this boundary.

use std::net::SocketAddr;

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::{
    events::{CloseInfo, OpenInfo},
    types::{PeerCandidate, PeerId},
};

pub mod errors;
mod tcp;

pub use errors::{DialError, ErrorCategory};
pub use tcp::TcpTransport;

pub trait Transport: Send + Sync + 'static {
    /// Dials `peer` on any of its known addresses.
    ///
    /// Callers bound the attempt with their own timeout, so the future may be
    /// dropped at any point.
    fn connect<'a>(&'a self, peer: &'a PeerCandidate) -> BoxFuture<'a, Result<(), DialError>>;

    fn is_connected(&self, peer: &PeerId) -> bool;
}

/// Lifecycle signal for one connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionNotification {
    /// Connection established and identification finished, successfully or not.
    Opened {
        peer: PeerId,
        remote: Option<SocketAddr>,
        info: OpenInfo,
    },
    Closed {
        peer: PeerId,
        info: CloseInfo,
    },
}

/// Sending half handed to a transport so it can report connection events.
#[derive(Debug, Clone)]
pub struct ConnectionNotifier {
    sender: mpsc::Sender<ConnectionNotification>,
}

impl ConnectionNotifier {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ConnectionNotification>) {
        let (sender, recv) = mpsc::channel(capacity);
        (Self { sender }, recv)
    }

    pub async fn opened(&self, peer: PeerId, remote: Option<SocketAddr>, info: OpenInfo) {
        self.notify(ConnectionNotification::Opened { peer, remote, info })
            .await
    }

    pub async fn closed(&self, peer: PeerId, info: CloseInfo) {
        self.notify(ConnectionNotification::Closed { peer, info })
            .await
    }

    async fn notify(&self, notification: ConnectionNotification) {
        if self.sender.send(notification).await.is_err() {
            tracing::debug!("Connection notification receiver dropped");
        }
    }
}
