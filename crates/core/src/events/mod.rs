//! Connection telemetry: partial traces reported by the transport and the
//! complete per-connection records built out of them.

use std::{collections::BTreeMap, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds};

use crate::types::PeerId;

mod aggregator;

pub use aggregator::ConnEventAggregator;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnDirection {
    #[default]
    Unknown,
    Inbound,
    Outbound,
}

/// What is known once a connection is open and identification has finished.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenInfo {
    pub direction: ConnDirection,
    pub opened_at: DateTime<Utc>,
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub latency: Option<Duration>,
    pub identified: bool,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OpenInfo {
    pub fn new(direction: ConnDirection, opened_at: DateTime<Utc>) -> Self {
        Self {
            direction,
            opened_at,
            latency: None,
            identified: false,
            attributes: BTreeMap::new(),
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseInfo {
    pub closed_at: DateTime<Utc>,
}

/// A partial signal about one connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnEventTrace {
    Open(OpenInfo),
    Close(CloseInfo),
}

/// One finished connection lifetime, ready for persistence.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionRecord {
    pub peer: PeerId,
    pub direction: ConnDirection,
    pub opened_at: DateTime<Utc>,
    pub closed_at: DateTime<Utc>,
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub duration: Duration,
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub latency: Option<Duration>,
    pub identified: bool,
    pub attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
