//! Backoff classes assigned to peers after each connection outcome.
//!
//! Every dial outcome is mapped to a [`DelayClass`]. Failure classes back off
//! exponentially with the retry degree of the peer:
//!
//! - degree 0: no wait
//! - degree `n >= 1`: `base * 2^(n - 1)`
//! - capped at [`MAX_DELAY`]
//!
//! Repeating the same class increments the degree, any other class starts
//! over at degree 0.

use std::{fmt::Display, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{transport::errors::ErrorCategory, util::time_source::to_time_delta};

/// Fixed wait after a confirmed good connection.
pub const SUCCESS_DELAY: Duration = Duration::from_secs(32 * 60);
pub const RECOVERABLE_BASE: Duration = Duration::from_secs(2 * 60);
pub const TIMEOUT_BASE: Duration = Duration::from_secs(60 * 60);
pub const UNRECOVERABLE_BASE: Duration = Duration::from_secs(120 * 60);
/// Upper bound for any computed delay.
pub const MAX_DELAY: Duration = Duration::from_secs(34 * 24 * 60 * 60);

// 2 minutes * 2^20 is already far past MAX_DELAY.
const MAX_EXPONENT: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DelayClass {
    /// Never attempted, always eligible.
    Immediate,
    Success,
    Zero,
    RecoverableFailure,
    UnrecoverableFailure,
    TimeoutFailure,
}

impl DelayClass {
    pub const ALL: [DelayClass; 6] = [
        DelayClass::Immediate,
        DelayClass::Success,
        DelayClass::Zero,
        DelayClass::RecoverableFailure,
        DelayClass::UnrecoverableFailure,
        DelayClass::TimeoutFailure,
    ];

    pub fn classify(category: ErrorCategory) -> Self {
        match category {
            ErrorCategory::NoError => DelayClass::Success,
            ErrorCategory::ConnectionRefused
            | ErrorCategory::ConnectionResetByPeer
            | ErrorCategory::ContextDeadlineExceeded
            | ErrorCategory::Backoff
            | ErrorCategory::ErrorRequestingMetadata => DelayClass::RecoverableFailure,
            ErrorCategory::NoRouteToHost
            | ErrorCategory::NetworkUnreachable
            | ErrorCategory::PeerIdMismatch
            | ErrorCategory::DialToSelf
            | ErrorCategory::NoGoodAddresses => DelayClass::UnrecoverableFailure,
            ErrorCategory::IoTimeout => DelayClass::TimeoutFailure,
            unclassified => {
                tracing::debug!(
                    category = %unclassified,
                    "Unclassified connection error, backing off as recoverable"
                );
                DelayClass::RecoverableFailure
            }
        }
    }

    pub fn is_failure(&self) -> bool {
        self.failure_base().is_some()
    }

    fn failure_base(&self) -> Option<Duration> {
        match self {
            DelayClass::RecoverableFailure => Some(RECOVERABLE_BASE),
            DelayClass::UnrecoverableFailure => Some(UNRECOVERABLE_BASE),
            DelayClass::TimeoutFailure => Some(TIMEOUT_BASE),
            DelayClass::Immediate | DelayClass::Success | DelayClass::Zero => None,
        }
    }

    /// Wait imposed by this class at the given retry degree.
    ///
    /// `Immediate` reports zero here; its eligibility is handled by
    /// [`Delay::next_eligible`], which places it before every other peer.
    pub fn duration(&self, degree: u32) -> Duration {
        match self {
            DelayClass::Immediate | DelayClass::Zero => Duration::ZERO,
            DelayClass::Success => SUCCESS_DELAY,
            failure => match failure.failure_base() {
                Some(base) => exponential(base, degree),
                None => Duration::ZERO,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DelayClass::Immediate => "immediate",
            DelayClass::Success => "success",
            DelayClass::Zero => "zero",
            DelayClass::RecoverableFailure => "recoverable_failure",
            DelayClass::UnrecoverableFailure => "unrecoverable_failure",
            DelayClass::TimeoutFailure => "timeout_failure",
        }
    }
}

impl Display for DelayClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[inline]
fn exponential(base: Duration, degree: u32) -> Duration {
    if degree == 0 {
        return Duration::ZERO;
    }
    let exponent = (degree - 1).min(MAX_EXPONENT);
    base.saturating_mul(1u32 << exponent).min(MAX_DELAY)
}

/// Backoff state of a single peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delay {
    class: DelayClass,
    degree: u32,
}

impl Delay {
    pub const fn immediate() -> Self {
        Delay {
            class: DelayClass::Immediate,
            degree: 0,
        }
    }

    pub fn class(&self) -> DelayClass {
        self.class
    }

    pub fn degree(&self) -> u32 {
        self.degree
    }

    /// Folds in the class of the latest outcome.
    pub fn update(&mut self, class: DelayClass) {
        if self.class == class {
            self.degree = self.degree.saturating_add(1);
        } else {
            *self = Delay { class, degree: 0 };
        }
    }

    pub fn duration(&self) -> Duration {
        self.class.duration(self.degree)
    }

    /// Earliest time a peer whose backoff window started at `base` may be dialed.
    pub fn next_eligible(&self, base: DateTime<Utc>) -> DateTime<Utc> {
        if self.class == DelayClass::Immediate {
            return DateTime::<Utc>::MIN_UTC;
        }
        base.checked_add_signed(to_time_delta(self.duration()))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl Default for Delay {
    fn default() -> Self {
        Self::immediate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: Duration = Duration::from_secs(60);

    #[test]
    fn test_failure_classes_double_per_degree() {
        assert_eq!(DelayClass::RecoverableFailure.duration(0), Duration::ZERO);
        assert_eq!(DelayClass::RecoverableFailure.duration(1), 2 * MIN);
        assert_eq!(DelayClass::RecoverableFailure.duration(2), 4 * MIN);
        assert_eq!(DelayClass::RecoverableFailure.duration(3), 8 * MIN);
        assert_eq!(DelayClass::TimeoutFailure.duration(1), 60 * MIN);
        assert_eq!(DelayClass::UnrecoverableFailure.duration(2), 240 * MIN);
    }

    #[test]
    fn test_backoff_is_monotonic_and_capped() {
        for class in [
            DelayClass::RecoverableFailure,
            DelayClass::UnrecoverableFailure,
            DelayClass::TimeoutFailure,
        ] {
            for degree in 1..200 {
                let current = class.duration(degree);
                assert!(class.duration(degree + 1) >= current);
                assert!(current <= MAX_DELAY);
            }
            assert_eq!(class.duration(u32::MAX), MAX_DELAY);
        }
    }

    #[test]
    fn test_fixed_classes_ignore_degree() {
        assert_eq!(DelayClass::Success.duration(0), SUCCESS_DELAY);
        assert_eq!(DelayClass::Success.duration(9), SUCCESS_DELAY);
        assert_eq!(DelayClass::Zero.duration(5), Duration::ZERO);
    }

    #[test]
    fn test_classification_table() {
        let cases = [
            (ErrorCategory::NoError, DelayClass::Success),
            (ErrorCategory::ConnectionRefused, DelayClass::RecoverableFailure),
            (ErrorCategory::ConnectionResetByPeer, DelayClass::RecoverableFailure),
            (ErrorCategory::Backoff, DelayClass::RecoverableFailure),
            (ErrorCategory::ContextDeadlineExceeded, DelayClass::RecoverableFailure),
            (ErrorCategory::NoRouteToHost, DelayClass::UnrecoverableFailure),
            (ErrorCategory::NetworkUnreachable, DelayClass::UnrecoverableFailure),
            (ErrorCategory::PeerIdMismatch, DelayClass::UnrecoverableFailure),
            (ErrorCategory::DialToSelf, DelayClass::UnrecoverableFailure),
            (ErrorCategory::IoTimeout, DelayClass::TimeoutFailure),
            (ErrorCategory::StreamReset, DelayClass::RecoverableFailure),
            (ErrorCategory::Unknown, DelayClass::RecoverableFailure),
        ];
        for (category, class) in cases {
            assert_eq!(DelayClass::classify(category), class, "{category}");
        }
    }

    #[test]
    fn test_repeated_refusals_wait_zero_two_four_minutes() {
        let mut delay = Delay::immediate();
        let mut waits = vec![];
        for _ in 0..3 {
            delay.update(DelayClass::classify(ErrorCategory::ConnectionRefused));
            waits.push(delay.duration());
        }
        assert_eq!(waits, vec![Duration::ZERO, 2 * MIN, 4 * MIN]);
    }

    #[test]
    fn test_class_change_resets_degree() {
        let mut delay = Delay::immediate();
        for _ in 0..4 {
            delay.update(DelayClass::RecoverableFailure);
        }
        assert_eq!(delay.degree(), 3);

        delay.update(DelayClass::Success);
        assert_eq!(delay.class(), DelayClass::Success);
        assert_eq!(delay.degree(), 0);

        delay.update(DelayClass::RecoverableFailure);
        assert_eq!(delay.degree(), 0);
        assert_eq!(delay.duration(), Duration::ZERO);

        delay.update(DelayClass::RecoverableFailure);
        assert_eq!(delay.degree(), 1);
    }

    #[test]
    fn test_immediate_precedes_delayed_peers() {
        let base = Utc::now();
        let fresh = Delay::immediate();
        let mut failed = Delay::immediate();
        failed.update(DelayClass::RecoverableFailure);
        failed.update(DelayClass::RecoverableFailure);

        assert!(fresh.next_eligible(base) < failed.next_eligible(base));
        assert!(fresh.next_eligible(base) < base);
    }
}
