/*!
 * Clock Abstraction
 * Monotonic time source, swappable for deterministic tests
 */

use parking_lot::Mutex;
use std::fmt;
use std::time::{Duration, Instant};

/// Monotonic time source
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Instant;
}

/// Wall-clock backed by `Instant::now`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Stands in for an unbounded wait when a timeout overflows `Instant`
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `Instant::now() + timeout`, saturating instead of panicking
///
/// Timeouts such as `Duration::MAX` resolve to a deadline decades away.
pub fn deadline_after(timeout: Duration) -> Instant {
    instant_after(Instant::now(), timeout)
}

/// `base + delay`, saturating like [`deadline_after`]
pub fn instant_after(base: Instant, delay: Duration) -> Instant {
    base.checked_add(delay)
        .or_else(|| base.checked_add(FAR_FUTURE))
        .unwrap_or(base)
}

/// Manually advanced clock
///
/// Starts at the instant it was created and only moves on `advance`
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        *self.offset.lock() += by;
    }

    /// Time elapsed since creation
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock()
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances_only_on_demand() {
        let clock = ManualClock::new();
        let t0 = clock.now();
        assert_eq!(clock.now(), t0);

        clock.advance(Duration::from_millis(250));
        assert_eq!(clock.now() - t0, Duration::from_millis(250));
        assert_eq!(clock.elapsed(), Duration::from_millis(250));
    }

    #[test]
    fn test_deadline_saturates_on_overflow() {
        let now = Instant::now();
        let deadline = deadline_after(Duration::MAX);
        assert!(deadline >= now + Duration::from_secs(86_400 * 365));

        let base = Instant::now();
        assert_eq!(instant_after(base, Duration::from_secs(1)), base + Duration::from_secs(1));
    }
}
