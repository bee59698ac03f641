//! Wall-clock abstraction.
//!
//! Resend windows and timers compare wall-clock timestamps. Production code
//! uses [`SystemClock`]; tests drive a [`ManualClock`].

use chrono::{DateTime, TimeDelta, Utc};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The host clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
///
/// Time is stored as milliseconds since the Unix epoch, so the clock can be
/// shared across threads.
#[derive(Debug)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    /// A clock starting at the Unix epoch.
    pub fn new() -> Self {
        Self::at_millis(0)
    }

    /// A clock starting at `millis` after the Unix epoch.
    pub fn at_millis(millis: i64) -> Self {
        Self {
            millis: AtomicI64::new(millis),
        }
    }

    pub fn set_millis(&self, millis: i64) {
        self.millis.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        let by = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.millis.fetch_add(by, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.millis.load(Ordering::SeqCst)).unwrap_or_default()
    }
}

/// `at + window`, saturating at the maximum representable time.
pub fn deadline(at: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(window)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Time from `since` to `now`; zero if `now` is earlier.
pub fn elapsed(now: DateTime<Utc>, since: DateTime<Utc>) -> Duration {
    (now - since).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new();
        assert_eq!(clock.now().timestamp_millis(), 0);

        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.now().timestamp_millis(), 1500);

        clock.set_millis(10);
        assert_eq!(clock.now().timestamp_millis(), 10);
    }

    #[test]
    fn deadline_saturates() {
        let at = DateTime::<Utc>::MAX_UTC;
        assert_eq!(deadline(at, Duration::from_secs(1)), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn elapsed_never_negative() {
        let early = DateTime::from_timestamp_millis(0).unwrap();
        let late = DateTime::from_timestamp_millis(1000).unwrap();
        assert_eq!(elapsed(late, early), Duration::from_millis(1000));
        assert_eq!(elapsed(early, late), Duration::ZERO);
    }
}
