/// Command line, environment and file configuration, plus logger setup.
pub mod config;

/// Merging of connection open and close events into connection records.
pub mod events;

/// Peer scheduling: delays, the peer queue, the strategy loop and dial workers.
pub mod peering;

/// Candidate source and persistence sink boundaries, with an in-memory store.
pub mod store;

/// Tracing subscriber setup.
mod tracing;

/// Dialing peers and reporting connection lifecycles.
pub mod transport;

pub mod types;

pub mod util;
