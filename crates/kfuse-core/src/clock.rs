use std::time::{Duration, Instant};

use kfuse_types::Timespec;
use parking_lot::Mutex;

/// Source of "now" for attribute deadlines.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timespec;
}

/// Uptime-style clock measured from construction.
#[derive(Debug)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Timespec {
        Timespec::from_duration(self.origin.elapsed())
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<Timespec>,
}

impl ManualClock {
    pub fn new(start: Timespec) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn set(&self, now: Timespec) {
        *self.now.lock() = now;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now = *now + Timespec::from_duration(by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timespec {
        *self.now.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances() {
        let clock = ManualClock::new(Timespec::new(10, 0));
        clock.advance(Duration::from_millis(1500));
        assert_eq!(clock.now(), Timespec::new(11, 500_000_000));
        clock.set(Timespec::new(3, 0));
        assert_eq!(clock.now(), Timespec::new(3, 0));
    }

    #[test]
    fn test_monotonic_clock_never_goes_back() {
        let clock = MonotonicClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }
}
