use std::{fmt::Display, str::FromStr};

use serde_with::{DeserializeFromStr, SerializeDisplay};
use thiserror::Error;

use crate::types::PeerId;

/// Error raised by a transport while dialing a peer.
#[derive(Debug, Error)]
pub enum DialError {
    #[error("no addresses known for peer {0}")]
    NoAddresses(PeerId),

    #[error("network error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl DialError {
    /// Normalizes the error into the category vocabulary used for backoff decisions.
    pub fn category(&self) -> ErrorCategory {
        match self {
            DialError::NoAddresses(_) => ErrorCategory::NoGoodAddresses,
            DialError::Io(err) => ErrorCategory::from_io_error(err),
            DialError::Other(msg) => ErrorCategory::parse(msg),
        }
    }
}

/// Normalized outcome of a connection attempt.
///
/// The textual form of each category is what gets persisted, so it must stay
/// stable across releases.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, SerializeDisplay, DeserializeFromStr,
)]
pub enum ErrorCategory {
    NoError,
    ConnectionRefused,
    ConnectionResetByPeer,
    ContextDeadlineExceeded,
    Backoff,
    ErrorRequestingMetadata,
    NoRouteToHost,
    NetworkUnreachable,
    PeerIdMismatch,
    DialToSelf,
    NoGoodAddresses,
    IoTimeout,
    HostIsDown,
    TooManyOpenFiles,
    StreamReset,
    MaxDialAttemptsExceeded,
    NoPublicIp,
    SecurityNegotiation,
    ResourceLimitExceeded,
    ProtocolNotSupported,
    NoRecentNetworkActivity,
    Unknown,
}

// Matched in order against the lowercased error text; first hit wins.
const KNOWN_ERRORS: &[(&str, ErrorCategory)] = &[
    ("connection refused", ErrorCategory::ConnectionRefused),
    ("connection reset by peer", ErrorCategory::ConnectionResetByPeer),
    ("context deadline exceeded", ErrorCategory::ContextDeadlineExceeded),
    ("dial backoff", ErrorCategory::Backoff),
    ("error requesting metadata", ErrorCategory::ErrorRequestingMetadata),
    ("no route to host", ErrorCategory::NoRouteToHost),
    ("network is unreachable", ErrorCategory::NetworkUnreachable),
    ("peer id mismatch", ErrorCategory::PeerIdMismatch),
    ("dial to self attempted", ErrorCategory::DialToSelf),
    ("no good addresses", ErrorCategory::NoGoodAddresses),
    ("no addresses", ErrorCategory::NoGoodAddresses),
    ("i/o timeout", ErrorCategory::IoTimeout),
    ("timed out", ErrorCategory::IoTimeout),
    ("host is down", ErrorCategory::HostIsDown),
    ("too many open files", ErrorCategory::TooManyOpenFiles),
    ("stream reset", ErrorCategory::StreamReset),
    ("max dial attempts exceeded", ErrorCategory::MaxDialAttemptsExceeded),
    ("no public ip address", ErrorCategory::NoPublicIp),
    (
        "failed to negotiate security protocol",
        ErrorCategory::SecurityNegotiation,
    ),
    ("resource limit exceeded", ErrorCategory::ResourceLimitExceeded),
    ("protocols not supported", ErrorCategory::ProtocolNotSupported),
    ("protocol not supported", ErrorCategory::ProtocolNotSupported),
    ("no recent network activity", ErrorCategory::NoRecentNetworkActivity),
];

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 22] = [
        ErrorCategory::NoError,
        ErrorCategory::ConnectionRefused,
        ErrorCategory::ConnectionResetByPeer,
        ErrorCategory::ContextDeadlineExceeded,
        ErrorCategory::Backoff,
        ErrorCategory::ErrorRequestingMetadata,
        ErrorCategory::NoRouteToHost,
        ErrorCategory::NetworkUnreachable,
        ErrorCategory::PeerIdMismatch,
        ErrorCategory::DialToSelf,
        ErrorCategory::NoGoodAddresses,
        ErrorCategory::IoTimeout,
        ErrorCategory::HostIsDown,
        ErrorCategory::TooManyOpenFiles,
        ErrorCategory::StreamReset,
        ErrorCategory::MaxDialAttemptsExceeded,
        ErrorCategory::NoPublicIp,
        ErrorCategory::SecurityNegotiation,
        ErrorCategory::ResourceLimitExceeded,
        ErrorCategory::ProtocolNotSupported,
        ErrorCategory::NoRecentNetworkActivity,
        ErrorCategory::Unknown,
    ];

    /// Categorizes a free-form error message.
    pub fn parse(msg: &str) -> Self {
        let msg = msg.to_lowercase();
        KNOWN_ERRORS
            .iter()
            .find(|(pattern, _)| msg.contains(pattern))
            .map(|(_, category)| *category)
            .unwrap_or(ErrorCategory::Unknown)
    }

    pub fn from_io_error(err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::ConnectionRefused => ErrorCategory::ConnectionRefused,
            ErrorKind::ConnectionReset => ErrorCategory::ConnectionResetByPeer,
            ErrorKind::TimedOut => ErrorCategory::IoTimeout,
            ErrorKind::AddrNotAvailable => ErrorCategory::NoGoodAddresses,
            _ => Self::parse(&err.to_string()),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ErrorCategory::NoError)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::NoError => "none",
            ErrorCategory::ConnectionRefused => "connection_refused",
            ErrorCategory::ConnectionResetByPeer => "connection_reset_by_peer",
            ErrorCategory::ContextDeadlineExceeded => "context_deadline_exceeded",
            ErrorCategory::Backoff => "backoff",
            ErrorCategory::ErrorRequestingMetadata => "error_requesting_metadata",
            ErrorCategory::NoRouteToHost => "no_route_to_host",
            ErrorCategory::NetworkUnreachable => "network_unreachable",
            ErrorCategory::PeerIdMismatch => "peer_id_mismatch",
            ErrorCategory::DialToSelf => "dial_to_self",
            ErrorCategory::NoGoodAddresses => "no_good_addresses",
            ErrorCategory::IoTimeout => "i/o_timeout",
            ErrorCategory::HostIsDown => "host_is_down",
            ErrorCategory::TooManyOpenFiles => "too_many_open_files",
            ErrorCategory::StreamReset => "stream_reset",
            ErrorCategory::MaxDialAttemptsExceeded => "max_dial_attempts_exceeded",
            ErrorCategory::NoPublicIp => "no_public_ip",
            ErrorCategory::SecurityNegotiation => "security_negotiation",
            ErrorCategory::ResourceLimitExceeded => "resource_limit_exceeded",
            ErrorCategory::ProtocolNotSupported => "protocol_not_supported",
            ErrorCategory::NoRecentNetworkActivity => "no_recent_network_activity",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

impl Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown error category: {0}")]
pub struct UnknownCategory(String);

impl FromStr for ErrorCategory {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorCategory::ALL
            .into_iter()
            .find(|category| category.as_str() == s)
            .ok_or_else(|| UnknownCategory(s.to_owned()))
    }
}
