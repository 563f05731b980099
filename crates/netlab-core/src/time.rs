//! # Virtual Time
//!
//! Fixed-point simulated clock with nanosecond resolution. Every scheduling
//! decision and every trace row timestamp is expressed in [`SimTime`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Sub};

const NANOS_PER_SEC: f64 = 1_000_000_000.0;

// ─── SimTime ────────────────────────────────────────────────────────────────

/// Instant on the simulated clock, in nanoseconds since experiment start.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SimTime(u64);

impl SimTime {
    pub const ZERO: SimTime = SimTime(0);
    pub const MAX: SimTime = SimTime(u64::MAX);

    pub const fn from_nanos(nanos: u64) -> Self {
        SimTime(nanos)
    }

    pub const fn from_millis(millis: u64) -> Self {
        SimTime(millis * 1_000_000)
    }

    /// Converts fractional seconds, rounding to the nearest nanosecond.
    /// Negative and non-finite inputs clamp to zero.
    pub fn from_secs_f64(secs: f64) -> Self {
        if !secs.is_finite() || secs <= 0.0 {
            return SimTime::ZERO;
        }
        SimTime((secs * NANOS_PER_SEC).round() as u64)
    }

    pub const fn as_nanos(self) -> u64 {
        self.0
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / NANOS_PER_SEC
    }

    /// Signed distance from `earlier` to `self`.
    pub fn since(self, earlier: SimTime) -> SimDuration {
        SimDuration(self.0 as i64 - earlier.0 as i64)
    }

    /// Adds a delay, returning `None` for negative delays or overflow.
    pub fn checked_add(self, delay: SimDuration) -> Option<SimTime> {
        if delay.0 < 0 {
            return None;
        }
        self.0.checked_add(delay.0 as u64).map(SimTime)
    }
}

impl Add<SimDuration> for SimTime {
    type Output = SimTime;

    fn add(self, rhs: SimDuration) -> SimTime {
        SimTime(self.0.saturating_add_signed(rhs.0))
    }
}

impl AddAssign<SimDuration> for SimTime {
    fn add_assign(&mut self, rhs: SimDuration) {
        *self = *self + rhs;
    }
}

impl Sub for SimTime {
    type Output = SimDuration;

    fn sub(self, rhs: SimTime) -> SimDuration {
        self.since(rhs)
    }
}

/// Seconds, the row format used by every trace file.
impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_secs_f64())
    }
}

// ─── SimDuration ────────────────────────────────────────────────────────────

/// Signed span of simulated time in nanoseconds.
///
/// Signed so that a negative scheduling delay is representable and can be
/// rejected instead of silently wrapping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SimDuration(i64);

impl SimDuration {
    pub const ZERO: SimDuration = SimDuration(0);

    pub const fn from_nanos(nanos: i64) -> Self {
        SimDuration(nanos)
    }

    pub const fn from_micros(micros: i64) -> Self {
        SimDuration(micros * 1_000)
    }

    pub const fn from_millis(millis: i64) -> Self {
        SimDuration(millis * 1_000_000)
    }

    pub const fn from_secs(secs: i64) -> Self {
        SimDuration(secs * 1_000_000_000)
    }

    pub fn from_secs_f64(secs: f64) -> Self {
        if !secs.is_finite() {
            return SimDuration::ZERO;
        }
        SimDuration((secs * NANOS_PER_SEC).round() as i64)
    }

    pub fn from_std(d: std::time::Duration) -> Self {
        SimDuration(i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
    }

    pub const fn as_nanos(self) -> i64 {
        self.0
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / NANOS_PER_SEC
    }

    pub const fn is_negative(self) -> bool {
        self.0 < 0
    }

    pub const fn is_positive(self) -> bool {
        self.0 > 0
    }

    pub fn mul_f64(self, factor: f64) -> Self {
        SimDuration((self.0 as f64 * factor).round() as i64)
    }
}

impl Add for SimDuration {
    type Output = SimDuration;

    fn add(self, rhs: SimDuration) -> SimDuration {
        SimDuration(self.0.saturating_add(rhs.0))
    }
}

impl fmt::Display for SimDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_secs_f64())
    }
}
