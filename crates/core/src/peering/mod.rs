//! Peer scheduling: which peer to dial next, how long to back off after a
//! failure and when to give up on a peer.
//!
//! A single [`strategy`] loop owns the [`PeerQueue`] and all delay state.
//! Dial workers only talk to it through a [`StrategyHandle`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{transport::errors::ErrorCategory, types::PeerId};

pub mod delay;
mod metrics;
mod queue;
mod service;
mod strategy;
mod worker;

pub use delay::{Delay, DelayClass};
pub use metrics::{MetricsSnapshot, PeeringMetrics};
pub use queue::{PeerQueue, TrackedPeer};
pub use service::PeeringService;
pub use strategy::{Identification, SchedulingStrategy, StrategyConfig, StrategyHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptStatus {
    Positive,
    Negative,
}

/// Outcome of dialing one peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionAttempt {
    pub peer: PeerId,
    pub attempted_at: DateTime<Utc>,
    pub status: AttemptStatus,
    pub error: ErrorCategory,
    /// Set by the strategy when this attempt made the peer deprecated.
    pub deprecable: bool,
    /// Set together with `deprecable` when the peer looks permanently gone.
    pub left_network: bool,
}

impl ConnectionAttempt {
    pub fn new(peer: PeerId, attempted_at: DateTime<Utc>, error: ErrorCategory) -> Self {
        let status = if error.is_success() {
            AttemptStatus::Positive
        } else {
            AttemptStatus::Negative
        };
        Self {
            peer,
            attempted_at,
            status,
            error,
            deprecable: false,
            left_network: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == AttemptStatus::Positive
    }
}
