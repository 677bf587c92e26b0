//! Boundaries towards discovery and persistence.
//!
//! The scheduler pulls candidates through [`CandidateSource`] on every queue
//! resync and pushes finished attempts and connection records through
//! [`PersistenceSink`]. Sinks must not block the caller: writes are queued
//! and completed in the background.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    events::ConnectionRecord, peering::ConnectionAttempt, transport::errors::ErrorCategory,
    types::PeerCandidate,
};

mod memory;
mod record_log;

pub use memory::MemoryStore;
pub use record_log::{Record, RecordLog};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("candidate source unavailable: {0}")]
    Unavailable(String),
    #[error("record log error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub trait CandidateSource: Send + Sync + 'static {
    /// Peers that are currently worth dialing. Returns an empty list when none are known.
    fn connectable_peers(&self) -> BoxFuture<'_, Result<Vec<PeerCandidate>, StoreError>>;
}

pub trait PersistenceSink: Send + Sync + 'static {
    fn persist_attempt(&self, attempt: ConnectionAttempt);
    fn persist_connection(&self, record: ConnectionRecord);
}

/// Per-peer liveness bookkeeping kept by persistence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlInfo {
    pub deprecated: bool,
    pub left_network: bool,
    pub last_activity: Option<DateTime<Utc>>,
    pub last_attempt: Option<DateTime<Utc>>,
    pub last_error: Option<ErrorCategory>,
}

impl ControlInfo {
    pub fn apply(&mut self, attempt: &ConnectionAttempt) {
        self.last_attempt = Some(attempt.attempted_at);
        self.last_error = Some(attempt.error);
        if attempt.is_success() {
            self.last_activity = Some(attempt.attempted_at);
        }
        if attempt.deprecable {
            self.deprecated = true;
        }
        if attempt.left_network {
            self.left_network = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PeerId;

    #[test]
    fn test_control_info_tracks_attempts() {
        let now = Utc::now();
        let mut info = ControlInfo::default();

        info.apply(&ConnectionAttempt::new(
            PeerId::new("a"),
            now,
            ErrorCategory::NoError,
        ));
        assert_eq!(info.last_activity, Some(now));
        assert_eq!(info.last_error, Some(ErrorCategory::NoError));

        let mut failed = ConnectionAttempt::new(PeerId::new("a"), now, ErrorCategory::NoRouteToHost);
        failed.deprecable = true;
        info.apply(&failed);

        assert!(info.deprecated);
        assert!(!info.left_network);
        assert_eq!(info.last_activity, Some(now));
        assert_eq!(info.last_error, Some(ErrorCategory::NoRouteToHost));
    }
}
