//! Scheduling metrics collected while the strategy walks the peer queue.
//!
//! The collector is created by whoever builds the service and handed to the
//! strategy, so several services in one process never share counters.
//! Readers get a consistent copy through [`PeeringMetrics::snapshot`].

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use parking_lot::RwLock;
use serde::Serialize;
use serde_with::{serde_as, DurationMilliSeconds};

use super::delay::DelayClass;
use crate::transport::errors::ErrorCategory;

#[serde_as]
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    /// Queued peers per delay class, as of the last resync.
    pub queued_by_class: BTreeMap<DelayClass, usize>,
    pub queue_len: usize,
    /// Peers handed to workers during the current pass, per delay class.
    pub attempted_by_class: BTreeMap<DelayClass, usize>,
    /// Attempt outcomes during the current pass.
    pub pass_errors: BTreeMap<ErrorCategory, u64>,
    /// Attempt outcomes since start.
    pub total_errors: BTreeMap<ErrorCategory, u64>,
    #[serde_as(as = "Option<DurationMilliSeconds<u64>>")]
    pub last_pass_duration: Option<Duration>,
    pub peers_attempted_last_pass: usize,
    pub passes: u64,
    pub deprecated: u64,
}

#[derive(Debug, Clone, Default)]
pub struct PeeringMetrics {
    inner: Arc<RwLock<MetricsSnapshot>>,
}

impl PeeringMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        self.inner.read().clone()
    }

    pub(crate) fn record_queue_distribution(
        &self,
        distribution: BTreeMap<DelayClass, usize>,
        queue_len: usize,
    ) {
        let mut inner = self.inner.write();
        inner.queued_by_class = distribution;
        inner.queue_len = queue_len;
    }

    pub(crate) fn record_dispatch(&self, class: DelayClass) {
        *self
            .inner
            .write()
            .attempted_by_class
            .entry(class)
            .or_default() += 1;
    }

    pub(crate) fn record_attempt(&self, category: ErrorCategory) {
        let mut inner = self.inner.write();
        *inner.pass_errors.entry(category).or_default() += 1;
        *inner.total_errors.entry(category).or_default() += 1;
    }

    pub(crate) fn record_deprecation(&self) {
        self.inner.write().deprecated += 1;
    }

    /// Closes the current pass and clears the per-pass distributions.
    pub(crate) fn finish_pass(&self, elapsed: Duration, attempted: usize) {
        let mut inner = self.inner.write();
        inner.last_pass_duration = Some(elapsed);
        inner.peers_attempted_last_pass = attempted;
        inner.passes += 1;
        inner.attempted_by_class.clear();
        inner.pass_errors.clear();
    }
}
