//! Time source seam.
//!
//! Every wall-clock read in the log routes through [`TimeSource`] so that
//! timestamp-sensitive behavior (root freshness, guard windows, merge
//! delay) is deterministic under test. Production code uses
//! [`SystemTimeSource`]; tests use [`ManualTimeSource`] and advance it
//! explicitly.

use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of wall-clock instants.
pub trait TimeSource: Send + Sync {
    /// Returns the current instant.
    fn now(&self) -> SystemTime;
}

/// The real system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualTimeSource {
    now: Mutex<SystemTime>,
}

impl ManualTimeSource {
    /// Creates a manual clock starting at `start`.
    #[must_use]
    pub const fn new(start: SystemTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Advances the clock by `step`.
    pub fn advance(&self, step: Duration) {
        let mut now = self
            .now
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *now += step;
    }

    /// Sets the clock to an absolute instant.
    pub fn set(&self, instant: SystemTime) {
        let mut now = self
            .now
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *now = instant;
    }
}

impl TimeSource for ManualTimeSource {
    fn now(&self) -> SystemTime {
        *self
            .now
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Nanoseconds between `instant` and the Unix epoch, saturating at zero
/// for pre-epoch instants and at `u64::MAX` far in the future.
#[must_use]
pub fn unix_nanos(instant: SystemTime) -> u64 {
    instant
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_nanos()).unwrap_or(u64::MAX))
}

/// Seconds elapsed on `time_source` since `start`, as observed for latency
/// histograms. Clamps to zero if the clock moved backwards.
#[must_use]
pub fn seconds_since(time_source: &dyn TimeSource, start: SystemTime) -> f64 {
    time_source
        .now()
        .duration_since(start)
        .map_or(0.0, |d| d.as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_time_source_advances() {
        let start = UNIX_EPOCH + Duration::from_secs(100);
        let clock = ManualTimeSource::new(start);
        assert_eq!(clock.now(), start);

        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now(), start + Duration::from_millis(250));

        clock.set(start);
        assert_eq!(clock.now(), start);
    }

    #[test]
    fn unix_nanos_saturates_before_epoch() {
        assert_eq!(unix_nanos(UNIX_EPOCH - Duration::from_secs(1)), 0);
        assert_eq!(
            unix_nanos(UNIX_EPOCH + Duration::from_nanos(123)),
            123
        );
    }

    #[test]
    fn seconds_since_measures_manual_clock() {
        let start = UNIX_EPOCH + Duration::from_secs(5);
        let clock = ManualTimeSource::new(start);
        clock.advance(Duration::from_millis(1500));
        let elapsed = seconds_since(&clock, start);
        assert!((elapsed - 1.5).abs() < f64::EPSILON);
    }
}
