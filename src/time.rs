/*
    emucore: emulation substrate library.
    Copyright (C) 2019-2024  Rafal Michalski

    For the full copyright notice, see the lib.rs file.
*/
//! Fixed-point emulated time.
//!
//! Both [Duration] and [Instant] are represented with 32 bits of whole seconds and 64 bits of
//! a binary fraction of a second. A single unit of the fraction is `2^-64` seconds, which is
//! about 0.054 attoseconds, so the clock frequencies of any emulated hardware never alias.
//!
//! All arithmetic is exact integer arithmetic. Conversions from clock cycles round toward zero,
//! and conversions to clock cycles never produce a count whose duration exceeds the converted
//! value.
use core::fmt;
use core::ops::{Add, AddAssign, Div, Mul, Sub, SubAssign};

#[cfg(feature = "serde")] use serde::{Serialize, Deserialize};

/// The number of bits of the sub-second fraction.
pub const FRAC_BITS: u32 = 64;

/// A relative span of emulated time.
///
/// A special [Duration::NEVER] value (all bits set) represents an infinitely distant time.
/// Any arithmetic involving `NEVER` or overflowing the seconds range results in `NEVER`.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Duration {
    secs: u32,
    frac: u64
}

/// An absolute point of emulated time, measured since the machine was powered on.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct Instant(Duration);

const ATTOS_PER_SECOND: u128 = 1_000_000_000_000_000_000;
const NEVER_FIXED: u128 = (1 << (32 + FRAC_BITS)) - 1;

impl Duration {
    /// A zero length duration.
    pub const ZERO: Duration = Duration { secs: 0, frac: 0 };
    /// The "never" sentinel.
    pub const NEVER: Duration = Duration { secs: u32::MAX, frac: u64::MAX };
    /// The largest finite duration.
    pub const MAX: Duration = Duration { secs: u32::MAX, frac: u64::MAX - 1 };

    /// Create a duration from whole seconds and a raw binary fraction in units of `2^-64` seconds.
    #[inline]
    pub const fn from_raw(secs: u32, frac: u64) -> Self {
        Duration { secs, frac }
    }

    #[inline]
    pub const fn from_secs(secs: u32) -> Self {
        Duration::from_raw(secs, 0)
    }

    #[inline]
    pub fn from_millis(millis: u64) -> Self {
        Duration::from_ticks(millis, 1_000)
    }

    #[inline]
    pub fn from_micros(micros: u64) -> Self {
        Duration::from_ticks(micros, 1_000_000)
    }

    #[inline]
    pub fn from_nanos(nanos: u64) -> Self {
        Duration::from_ticks(nanos, 1_000_000_000)
    }

    /// Return the period of a single cycle of a clock running at `hz`.
    ///
    /// # Panics
    /// Panics if `hz` is 0.
    #[inline]
    pub fn from_hz(hz: u32) -> Self {
        Duration::from_ticks(1, hz)
    }

    /// Convert a number of `ticks` of a clock running at `hz` into a duration.
    ///
    /// The sub-second part is rounded toward zero. Results beyond the seconds range
    /// saturate to [Duration::NEVER].
    ///
    /// # Panics
    /// Panics if `hz` is 0.
    pub fn from_ticks(ticks: u64, hz: u32) -> Self {
        assert_ne!(hz, 0, "a clock frequency must not be 0");
        let hz = u64::from(hz);
        let secs = ticks / hz;
        if secs > u64::from(u32::MAX) {
            return Duration::NEVER
        }
        let rem = u128::from(ticks % hz);
        let frac = ((rem << FRAC_BITS) / u128::from(hz)) as u64;
        Duration::from_fixed((u128::from(secs) << FRAC_BITS) | u128::from(frac))
    }

    /// Return the number of whole ticks of a clock running at `hz` that fit in this duration.
    ///
    /// This is the largest tick count `t` for which `Duration::from_ticks(t, hz) <= self`,
    /// so `Duration::from_ticks(t, hz).as_ticks(hz) == t` for every `t`.
    ///
    /// Returns `u64::MAX` for [Duration::NEVER].
    ///
    /// # Panics
    /// Panics if `hz` is 0.
    pub fn as_ticks(self, hz: u32) -> u64 {
        assert_ne!(hz, 0, "a clock frequency must not be 0");
        if self.is_never() {
            return u64::MAX
        }
        let hz = u64::from(hz);
        let wide = u128::from(hz);
        let sub = ((u128::from(self.frac) + 1) * wide - 1) >> FRAC_BITS;
        u64::from(self.secs) * hz + sub as u64
    }

    #[inline]
    pub const fn is_never(self) -> bool {
        self.secs == u32::MAX && self.frac == u64::MAX
    }

    #[inline]
    pub const fn is_zero(self) -> bool {
        self.secs == 0 && self.frac == 0
    }

    /// Whole seconds.
    #[inline]
    pub const fn secs(self) -> u32 {
        self.secs
    }

    /// The sub-second fraction in units of `2^-64` seconds.
    #[inline]
    pub const fn frac(self) -> u64 {
        self.frac
    }

    /// The sub-second fraction in attoseconds, rounded toward zero.
    pub fn subsec_attos(self) -> u64 {
        ((u128::from(self.frac) * ATTOS_PER_SECOND) >> FRAC_BITS) as u64
    }

    /// An approximate value in seconds. Meant for diagnostics only.
    pub fn as_secs_f64(self) -> f64 {
        if self.is_never() {
            return f64::INFINITY
        }
        self.secs as f64 + self.frac as f64 / 18_446_744_073_709_551_616.0
    }

    #[inline(always)]
    fn to_fixed(self) -> u128 {
        (u128::from(self.secs) << FRAC_BITS) | u128::from(self.frac)
    }

    #[inline(always)]
    fn from_fixed(fixed: u128) -> Self {
        if fixed >= NEVER_FIXED {
            Duration::NEVER
        }
        else {
            Duration { secs: (fixed >> FRAC_BITS) as u32, frac: fixed as u64 }
        }
    }

    /// Subtract `rhs`, returning `None` if the result would be negative.
    ///
    /// `NEVER - x` is `NEVER` for every finite `x`.
    pub fn checked_sub(self, rhs: Duration) -> Option<Duration> {
        if self.is_never() {
            return (!rhs.is_never()).then_some(Duration::NEVER)
        }
        self.to_fixed().checked_sub(rhs.to_fixed()).map(Duration::from_fixed)
    }

    /// Subtract `rhs`, returning [Duration::ZERO] instead of a negative result.
    pub fn saturating_sub(self, rhs: Duration) -> Duration {
        self.checked_sub(rhs).unwrap_or(Duration::ZERO)
    }

    /// The number of whole `period`s needed to cover `self`, rounded up.
    /// Saturates to `u64::MAX`.
    ///
    /// # Panics
    /// Panics if `period` is zero.
    pub fn periods_ceil(self, period: Duration) -> u64 {
        let (fixed, period) = (self.to_fixed(), period.to_fixed());
        assert!(period != 0, "zero period");
        let periods = fixed / period + u128::from(fixed % period != 0);
        u64::try_from(periods).unwrap_or(u64::MAX)
    }

    /// Multiply by an integer factor. Saturates to [Duration::NEVER].
    pub fn saturating_mul(self, factor: u64) -> Duration {
        if self.is_never() {
            return Duration::NEVER
        }
        match self.to_fixed().checked_mul(u128::from(factor)) {
            Some(fixed) => Duration::from_fixed(fixed),
            None => Duration::NEVER
        }
    }
}

impl Add for Duration {
    type Output = Duration;

    #[inline]
    fn add(self, rhs: Duration) -> Duration {
        if self.is_never() || rhs.is_never() {
            return Duration::NEVER
        }
        Duration::from_fixed(self.to_fixed() + rhs.to_fixed())
    }
}

impl AddAssign for Duration {
    #[inline]
    fn add_assign(&mut self, rhs: Duration) {
        *self = *self + rhs;
    }
}

impl Sub for Duration {
    type Output = Duration;

    /// # Panics
    /// Panics if `rhs` is larger than `self`.
    #[inline]
    fn sub(self, rhs: Duration) -> Duration {
        match self.checked_sub(rhs) {
            Some(res) => res,
            None => panic!("negative duration: {} - {}", self, rhs)
        }
    }
}

impl SubAssign for Duration {
    #[inline]
    fn sub_assign(&mut self, rhs: Duration) {
        *self = *self - rhs;
    }
}

impl Mul<u64> for Duration {
    type Output = Duration;

    #[inline]
    fn mul(self, rhs: u64) -> Duration {
        self.saturating_mul(rhs)
    }
}

impl Div<u64> for Duration {
    type Output = Duration;

    /// Divides rounding toward zero. `NEVER / n` is `NEVER`.
    ///
    /// # Panics
    /// Panics if `rhs` is 0.
    #[inline]
    fn div(self, rhs: u64) -> Duration {
        if self.is_never() {
            return Duration::NEVER
        }
        Duration::from_fixed(self.to_fixed() / u128::from(rhs))
    }
}

impl From<core::time::Duration> for Duration {
    fn from(d: core::time::Duration) -> Self {
        if d.as_secs() > u64::from(u32::MAX) {
            return Duration::NEVER
        }
        Duration::from_secs(d.as_secs() as u32) + Duration::from_nanos(d.subsec_nanos().into())
    }
}

impl fmt::Display for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_never() {
            f.write_str("never")
        }
        else {
            write!(f, "{}.{:018}", self.secs, self.subsec_attos())
        }
    }
}

impl fmt::Debug for Duration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Duration({})", self)
    }
}

impl Instant {
    /// The power-on instant.
    pub const ZERO: Instant = Instant(Duration::ZERO);
    /// The "never" sentinel, later than any other instant.
    pub const NEVER: Instant = Instant(Duration::NEVER);

    /// Create an instant from the duration elapsed since power-on.
    #[inline]
    pub const fn from_duration(since_start: Duration) -> Self {
        Instant(since_start)
    }

    /// Return the duration elapsed since power-on.
    #[inline]
    pub const fn as_duration(self) -> Duration {
        self.0
    }

    #[inline]
    pub const fn is_never(self) -> bool {
        self.0.is_never()
    }

    /// Return the duration elapsed from `earlier` to `self`.
    ///
    /// # Panics
    /// Panics if `earlier` is later than `self`.
    #[inline]
    pub fn duration_since(self, earlier: Instant) -> Duration {
        self.0 - earlier.0
    }

    #[inline]
    pub fn checked_duration_since(self, earlier: Instant) -> Option<Duration> {
        self.0.checked_sub(earlier.0)
    }

    #[inline]
    pub fn saturating_duration_since(self, earlier: Instant) -> Duration {
        self.0.saturating_sub(earlier.0)
    }
}

impl Add<Duration> for Instant {
    type Output = Instant;

    #[inline]
    fn add(self, rhs: Duration) -> Instant {
        Instant(self.0 + rhs)
    }
}

impl AddAssign<Duration> for Instant {
    #[inline]
    fn add_assign(&mut self, rhs: Duration) {
        self.0 += rhs;
    }
}

impl Sub<Duration> for Instant {
    type Output = Instant;

    /// # Panics
    /// Panics if the result would precede the power-on instant.
    #[inline]
    fn sub(self, rhs: Duration) -> Instant {
        Instant(self.0 - rhs)
    }
}

impl Sub for Instant {
    type Output = Duration;

    /// # Panics
    /// Panics if `rhs` is later than `self`.
    #[inline]
    fn sub(self, rhs: Instant) -> Duration {
        self.duration_since(rhs)
    }
}

impl From<Duration> for Instant {
    fn from(d: Duration) -> Self {
        Instant(d)
    }
}

impl fmt::Display for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for Instant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Instant({})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_ticks_conversion() {
        assert_eq!(Duration::from_ticks(1_000_000, 1_000_000), Duration::from_secs(1));
        assert_eq!(Duration::from_ticks(44_100, 44_100).as_ticks(44_100), 44_100);
        assert_eq!(Duration::from_ticks(0, 1), Duration::ZERO);
        let third = Duration::from_ticks(1, 3);
        assert_eq!(third.secs(), 0);
        assert_eq!(third.frac(), u64::MAX / 3);
        assert_eq!(third.as_ticks(3), 1);
        assert_eq!((third * 2).as_ticks(3), 2);
        // three truncated thirds fall short of a whole second
        assert_eq!((third * 3).as_ticks(3), 2);
        assert_eq!((third * 3).as_ticks(1), 0);
        assert_eq!(Duration::from_secs(1).as_ticks(1), 1);
        // never overshoots
        let almost = Duration::from_secs(1).saturating_sub(Duration::from_raw(0, 1));
        assert_eq!(almost.as_ticks(1_000_000), 999_999);
        assert_eq!(Duration::NEVER.as_ticks(1), u64::MAX);
        assert_eq!(Duration::from_ticks(u64::MAX, 1), Duration::NEVER);
        assert_eq!(Duration::from_ticks(u32::MAX as u64, 1), Duration::from_secs(u32::MAX));
    }

    #[test]
    fn time_ticks_round_trip_extremes() {
        for &hz in &[1u32, 2, 3, 7, 44_100, 1_000_000, 3_579_545, 1_000_000_000, u32::MAX - 1, u32::MAX] {
            for &t in &[0u64, 1, 2, hz as u64 - 1, hz as u64, hz as u64 + 1, u32::MAX as u64 - 1, u32::MAX as u64] {
                assert_eq!(Duration::from_ticks(t, hz).as_ticks(hz), t, "t: {} hz: {}", t, hz);
            }
        }
    }

    #[test]
    fn time_arithmetic() {
        let a = Duration::from_millis(1500);
        let b = Duration::from_micros(500_000);
        assert_eq!(a + b, Duration::from_secs(2));
        assert_eq!(a - b, Duration::from_secs(1));
        assert_eq!(b.checked_sub(a), None);
        assert_eq!(b.saturating_sub(a), Duration::ZERO);
        assert_eq!(Duration::from_secs(3) / 3, Duration::from_secs(1));
        assert_eq!(Duration::from_secs(1) * 3, Duration::from_secs(3));
        assert!(Duration::from_millis(1) < Duration::from_millis(2));
        assert!(Duration::MAX < Duration::NEVER);
        assert_eq!(Duration::NEVER + Duration::from_secs(1), Duration::NEVER);
        assert_eq!(Duration::NEVER - Duration::from_secs(1), Duration::NEVER);
        assert_eq!(Duration::NEVER / 2, Duration::NEVER);
        assert_eq!(Duration::MAX + Duration::from_raw(0, 1), Duration::NEVER);
        assert_eq!(Duration::from_secs(u32::MAX / 2 + 1) * 2, Duration::NEVER);
        assert_eq!(Duration::from(core::time::Duration::from_millis(250)), Duration::from_millis(250));
    }

    #[test]
    #[should_panic]
    fn time_negative_panics() {
        let _ = Duration::from_secs(1) - Duration::from_secs(2);
    }

    #[test]
    fn time_periods_ceil() {
        let period = Duration::from_millis(2);
        assert_eq!(Duration::ZERO.periods_ceil(period), 0);
        assert_eq!(period.periods_ceil(period), 1);
        assert_eq!((period + Duration::from_raw(0, 1)).periods_ceil(period), 2);
        assert_eq!(Duration::from_secs(3).periods_ceil(Duration::from_secs(2)), 2);
        assert_eq!(Duration::from_secs(1).periods_ceil(Duration::from_raw(0, 1)), u64::MAX);
    }

    #[test]
    fn time_instant() {
        let start = Instant::ZERO + Duration::from_millis(10);
        let end = start + Duration::from_millis(5);
        assert_eq!(end - start, Duration::from_millis(5));
        assert_eq!(end.checked_duration_since(Instant::NEVER), None);
        assert_eq!(start.saturating_duration_since(end), Duration::ZERO);
        assert!(end < Instant::NEVER);
        assert_eq!(Instant::NEVER + Duration::ZERO, Instant::NEVER);
    }

    #[test]
    fn time_display() {
        assert_eq!(format!("{}", Duration::from_millis(1500)), "1.500000000000000000");
        assert_eq!(format!("{}", Duration::from_ticks(1, 4)), "0.250000000000000000");
        assert_eq!(format!("{}", Instant::NEVER), "never");
        assert_eq!(format!("{:?}", Duration::from_secs(2)), "Duration(2.000000000000000000)");
    }
}
