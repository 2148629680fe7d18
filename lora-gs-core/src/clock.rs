use chrono::{DateTime, TimeZone, Utc};
use std::{
    sync::atomic::{AtomicI64, Ordering},
    time::Duration,
};

/// Wall-clock source, injectable for deterministic expiry tests.
pub trait Clock: Send + Sync + 'static {
    /// Current time.
    fn now(&self) -> DateTime<Utc>;
}

/// [`Clock`] backed by [`Utc::now`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually advanced clock.
#[derive(Debug)]
pub struct MockClock {
    nanos: AtomicI64,
}

impl MockClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            nanos: AtomicI64::new(start.timestamp_nanos_opt().unwrap_or_default()),
        }
    }

    pub fn set(&self, t: DateTime<Utc>) {
        self.nanos
            .store(t.timestamp_nanos_opt().unwrap_or_default(), Ordering::SeqCst);
    }

    /// Moves the clock forward by `d`.
    pub fn advance(&self, d: Duration) {
        let d = i64::try_from(d.as_nanos()).unwrap_or(i64::MAX);
        self.nanos.fetch_add(d, Ordering::SeqCst);
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new(Utc::now())
    }
}

impl Clock for MockClock {
    fn now(&self) -> DateTime<Utc> {
        Utc.timestamp_nanos(self.nanos.load(Ordering::SeqCst))
    }
}

/// Rate limit for sweeps of expired map entries.
///
/// [`SweepSchedule::due`] returns true for at most one caller per `every`.
#[derive(Debug)]
pub(crate) struct SweepSchedule {
    next_nanos: AtomicI64,
    every: Duration,
}

impl SweepSchedule {
    pub(crate) fn new(every: Duration) -> Self {
        Self {
            next_nanos: AtomicI64::new(i64::MIN),
            every,
        }
    }

    pub(crate) fn due(&self, now: DateTime<Utc>) -> bool {
        let now = now.timestamp_nanos_opt().unwrap_or_default();
        let next = self.next_nanos.load(Ordering::Acquire);
        if now < next {
            return false;
        }
        let every = i64::try_from(self.every.as_nanos()).unwrap_or(i64::MAX);
        self.next_nanos
            .compare_exchange(next, now.saturating_add(every), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_clock_advances() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = MockClock::new(start);
        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(90));
    }

    #[test]
    fn sweeps_are_rate_limited() {
        let clock = MockClock::default();
        let schedule = SweepSchedule::new(Duration::from_secs(60));
        assert!(schedule.due(clock.now()));
        assert!(!schedule.due(clock.now()));
        clock.advance(Duration::from_secs(59));
        assert!(!schedule.due(clock.now()));
        clock.advance(Duration::from_secs(1));
        assert!(schedule.due(clock.now()));
    }
}
