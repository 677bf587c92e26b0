use std::{fmt::Display, net::SocketAddr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable identifier of a remote peer, usually derived from its public key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Overlay network a peer was discovered on.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Ethereum,
    Ipfs,
    Filecoin,
}

impl Display for Network {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Network::Ethereum => write!(f, "ethereum"),
            Network::Ipfs => write!(f, "ipfs"),
            Network::Filecoin => write!(f, "filecoin"),
        }
    }
}

/// A peer that can be dialed, as handed out by discovery or persistence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerCandidate {
    pub id: PeerId,
    pub addrs: Vec<SocketAddr>,
    #[serde(default)]
    pub network: Network,
    /// Last time the peer was seen alive, if persistence knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
}

impl PeerCandidate {
    pub fn new(id: impl Into<PeerId>, addrs: Vec<SocketAddr>, network: Network) -> Self {
        Self {
            id: id.into(),
            addrs,
            network,
            last_activity: None,
        }
    }

    pub fn with_last_activity(mut self, ts: DateTime<Utc>) -> Self {
        self.last_activity = Some(ts);
        self
    }
}
