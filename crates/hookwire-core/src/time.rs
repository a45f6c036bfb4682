//! Clock abstraction for timestamps.
//!
//! Every `created_at`, `updated_at`, `failed_at` and lease expiry in the
//! system comes from an injected `Clock`, so tests can pin and advance time.

use std::{
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, TimeZone, Utc};

/// Source of wall-clock timestamps.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock backed by the system time.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a new real clock instance.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for deterministic tests.
///
/// Clones share the same underlying time.
#[derive(Debug, Clone)]
pub struct TestClock {
    /// Microseconds since the UNIX epoch.
    micros: Arc<AtomicI64>,
}

impl TestClock {
    /// Creates a test clock starting at the current system time.
    pub fn new() -> Self {
        Self::with_start_time(Utc::now())
    }

    /// Creates a test clock starting at `start`.
    pub fn with_start_time(start: DateTime<Utc>) -> Self {
        Self { micros: Arc::new(AtomicI64::new(start.timestamp_micros())) }
    }

    /// Moves the clock forward.
    pub fn advance(&self, duration: Duration) {
        let micros = i64::try_from(duration.as_micros()).unwrap_or(i64::MAX);
        self.micros.fetch_add(micros, Ordering::AcqRel);
    }

    /// Sets the clock to `time`, forwards or backwards.
    pub fn jump_to(&self, time: DateTime<Utc>) {
        self.micros.store(time.timestamp_micros(), Ordering::Release);
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> DateTime<Utc> {
        let micros = self.micros.load(Ordering::Acquire);
        Utc.timestamp_micros(micros).single().unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_advances() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let clock = TestClock::with_start_time(start);
        assert_eq!(clock.now(), start);

        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.now(), start + chrono::Duration::seconds(90));
    }

    #[test]
    fn clones_share_time() {
        let clock = TestClock::new();
        let other = clock.clone();
        clock.advance(Duration::from_secs(5));
        assert_eq!(clock.now(), other.now());
    }

    #[test]
    fn jump_can_go_backwards() {
        let clock = TestClock::new();
        let target = Utc.with_ymd_and_hms(2000, 6, 1, 12, 0, 0).unwrap();
        clock.jump_to(target);
        assert_eq!(clock.now(), target);
    }
}
