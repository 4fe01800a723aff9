use std::cmp::Ordering;
use std::fmt;
use std::ops::Add;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const NANOS_PER_SEC: u32 = 1_000_000_000;

/// Seconds + nanoseconds, the shape timestamps and TTLs take on the wire.
///
/// Values are kept normalized (`nsec < 1_000_000_000`), so the derived
/// field order gives the same answer as comparing seconds first and then
/// nanoseconds.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: u32,
}

impl Timespec {
    pub const ZERO: Timespec = Timespec { sec: 0, nsec: 0 };

    /// Build a timespec, carrying excess nanoseconds into seconds.
    pub fn new(sec: i64, nsec: u32) -> Self {
        Self {
            sec: sec.saturating_add(i64::from(nsec / NANOS_PER_SEC)),
            nsec: nsec % NANOS_PER_SEC,
        }
    }

    pub fn from_duration(d: Duration) -> Self {
        Self {
            sec: i64::try_from(d.as_secs()).unwrap_or(i64::MAX),
            nsec: d.subsec_nanos(),
        }
    }

    /// Convert to a `Duration`; negative values clamp to zero.
    pub fn to_duration(self) -> Duration {
        if self.sec < 0 {
            return Duration::ZERO;
        }
        Duration::new(self.sec as u64, self.nsec)
    }

    /// Round down to a multiple of `granularity`.
    ///
    /// A zero granularity leaves the value untouched.
    pub fn truncate_to(self, granularity: Duration) -> Self {
        let step = granularity.as_nanos();
        if step <= 1 || self.sec < 0 {
            return self;
        }
        let total = self.to_duration().as_nanos();
        let floored = total - total % step;
        let secs = (floored / u128::from(NANOS_PER_SEC)) as i64;
        let nanos = (floored % u128::from(NANOS_PER_SEC)) as u32;
        Self { sec: secs, nsec: nanos }
    }
}

impl Add for Timespec {
    type Output = Timespec;

    fn add(self, rhs: Timespec) -> Timespec {
        let mut sec = self.sec.saturating_add(rhs.sec);
        let mut nsec = self.nsec + rhs.nsec;
        if nsec >= NANOS_PER_SEC {
            sec = sec.saturating_add(1);
            nsec -= NANOS_PER_SEC;
        }
        Timespec { sec, nsec }
    }
}

impl Ord for Timespec {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sec.cmp(&other.sec).then(self.nsec.cmp(&other.nsec))
    }
}

impl PartialOrd for Timespec {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<Duration> for Timespec {
    fn from(d: Duration) -> Self {
        Self::from_duration(d)
    }
}

impl fmt::Debug for Timespec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timespec({}.{:09})", self.sec, self.nsec)
    }
}

impl fmt::Display for Timespec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.sec, self.nsec)
    }
}
