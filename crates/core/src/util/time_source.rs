use std::{sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;

/// Wall-clock source for every scheduling decision and persisted timestamp.
pub trait TimeSource: Send + Sync + 'static {
    fn now(&self) -> DateTime<Utc>;
}

/// A simple time source that returns the current time using `Utc::now()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTimeSrc(());

impl SystemTimeSrc {
    pub fn new() -> Self {
        SystemTimeSrc(())
    }
}

impl TimeSource for SystemTimeSrc {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A manually driven clock. Clones share the same current time, so a test can
/// hand one copy to the scheduler and keep another to move time forward.
#[derive(Debug, Clone)]
pub struct MockTimeSource {
    current: Arc<Mutex<DateTime<Utc>>>,
}

impl MockTimeSource {
    pub fn new(start: DateTime<Utc>) -> Self {
        MockTimeSource {
            current: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance_time(&self, duration: Duration) {
        let mut current = self.current.lock();
        *current = current
            .checked_add_signed(to_time_delta(duration))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
    }
}

impl TimeSource for MockTimeSource {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock()
    }
}

/// Converts a std duration into a chrono delta, saturating on overflow.
pub fn to_time_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

/// Time elapsed from `earlier` to `later`, or `None` if `later` is before `earlier`.
pub fn elapsed_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> Option<Duration> {
    (later - earlier).to_std().ok()
}
