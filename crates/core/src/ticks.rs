//! Overflow-safe simulated time.
//!
//! [`Ticks`] counts elapsed AVR clock ticks as whole cycles of
//! [`CYCLE_LENGTH`] ticks plus a sub-cycle remainder. Every mutating
//! operation folds excess remainder into cycles, so `remainder < CYCLE_LENGTH`
//! holds at all times and a long simulation never overflows a single integer.
//!
//! Subtraction requires `other <= self`. Violating that is a scheduling bug;
//! the `-` and `-=` operators panic instead of wrapping, and
//! [`Ticks::checked_sub`] is available where the caller wants to handle it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

/// Ticks per cycle.
pub const CYCLE_LENGTH: u64 = 1_000_000;

/// Elapsed simulated ticks as `(cycles, remainder)`.
///
/// Field order makes the derived ordering lexicographic, which is the
/// numeric ordering because the remainder is always normalized.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Ticks {
    cycles: u64,
    remainder: u64,
}

impl Ticks {
    pub const ZERO: Ticks = Ticks { cycles: 0, remainder: 0 };

    pub fn new(ticks: u64) -> Self {
        let mut t = Ticks { cycles: 0, remainder: ticks };
        t.normalize();
        t
    }

    pub fn from_parts(cycles: u64, remainder: u64) -> Self {
        let mut t = Ticks { cycles, remainder };
        t.normalize();
        t
    }

    pub fn cycles(&self) -> u64 { self.cycles }
    pub fn remainder(&self) -> u64 { self.remainder }

    pub fn reset(&mut self) {
        *self = Ticks::ZERO;
    }

    pub fn set(&mut self, ticks: u64) {
        *self = Ticks::new(ticks);
    }

    /// Exact total tick count.
    pub fn get(&self) -> u128 {
        self.cycles as u128 * CYCLE_LENGTH as u128 + self.remainder as u128
    }

    /// Total as `u64`, saturating. Used for statistics and reporting.
    pub fn get_u64(&self) -> u64 {
        u64::try_from(self.get()).unwrap_or(u64::MAX)
    }

    fn normalize(&mut self) {
        if self.remainder >= CYCLE_LENGTH {
            self.cycles += self.remainder / CYCLE_LENGTH;
            self.remainder %= CYCLE_LENGTH;
        }
    }

    pub fn checked_sub(self, other: Ticks) -> Option<Ticks> {
        if other > self {
            return None;
        }
        let (cycles, remainder) = if self.remainder >= other.remainder {
            (self.cycles - other.cycles, self.remainder - other.remainder)
        } else {
            (self.cycles - other.cycles - 1, CYCLE_LENGTH - (other.remainder - self.remainder))
        };
        Some(Ticks { cycles, remainder })
    }

    /// `self - other`, or zero when `other > self`.
    pub fn saturating_sub(self, other: Ticks) -> Ticks {
        self.checked_sub(other).unwrap_or(Ticks::ZERO)
    }
}

impl From<u64> for Ticks {
    fn from(ticks: u64) -> Self { Ticks::new(ticks) }
}

impl Add for Ticks {
    type Output = Ticks;
    fn add(self, other: Ticks) -> Ticks {
        Ticks::from_parts(self.cycles + other.cycles, self.remainder + other.remainder)
    }
}

impl Add<u64> for Ticks {
    type Output = Ticks;
    fn add(self, ticks: u64) -> Ticks {
        self + Ticks::new(ticks)
    }
}

impl AddAssign for Ticks {
    fn add_assign(&mut self, other: Ticks) {
        *self = *self + other;
    }
}

impl AddAssign<u64> for Ticks {
    fn add_assign(&mut self, ticks: u64) {
        *self = *self + ticks;
    }
}

impl Sub for Ticks {
    type Output = Ticks;
    fn sub(self, other: Ticks) -> Ticks {
        match self.checked_sub(other) {
            Some(t) => t,
            None => panic!("tick underflow: {} - {}", self, other),
        }
    }
}

impl Sub<u64> for Ticks {
    type Output = Ticks;
    fn sub(self, ticks: u64) -> Ticks {
        self - Ticks::new(ticks)
    }
}

impl SubAssign for Ticks {
    fn sub_assign(&mut self, other: Ticks) {
        *self = *self - other;
    }
}

impl SubAssign<u64> for Ticks {
    fn sub_assign(&mut self, ticks: u64) {
        *self = *self - ticks;
    }
}

impl fmt::Display for Ticks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:06}", self.cycles, self.remainder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_on_construction() {
        let t = Ticks::new(2 * CYCLE_LENGTH + 5);
        assert_eq!(t.cycles(), 2);
        assert_eq!(t.remainder(), 5);
        // Exactly one cycle must fold, not sit at remainder == CYCLE_LENGTH
        let t = Ticks::new(CYCLE_LENGTH);
        assert_eq!((t.cycles(), t.remainder()), (1, 0));
    }

    #[test]
    fn test_both_constructors_normalize() {
        let a = Ticks::new(CYCLE_LENGTH * 3 + 1);
        let b = Ticks::from_parts(1, CYCLE_LENGTH * 2 + 1);
        assert_eq!((a.cycles(), a.remainder()), (3, 1));
        assert_eq!(a, b);
        assert_eq!(b.get(), (CYCLE_LENGTH * 3 + 1) as u128);
    }

    #[test]
    fn test_add_accumulates_exactly() {
        let mut t = Ticks::ZERO;
        for _ in 0..7 {
            t += 400_000;
            assert!(t.remainder() < CYCLE_LENGTH);
        }
        assert_eq!(t.get(), 2_800_000);
        assert_eq!(t.cycles(), 2);
    }

    #[test]
    fn test_sub_borrows_cycle() {
        let a = Ticks::from_parts(3, 100);
        let b = Ticks::from_parts(1, 200);
        let d = a - b;
        assert_eq!(d.get(), a.get() - b.get());
        assert_eq!(d.cycles(), 1);
        assert_eq!(d.remainder(), CYCLE_LENGTH - 100);
    }

    #[test]
    fn test_checked_sub_underflow() {
        assert_eq!(Ticks::new(5).checked_sub(Ticks::new(6)), None);
        assert_eq!(Ticks::new(5).saturating_sub(Ticks::new(6)), Ticks::ZERO);
    }

    #[test]
    #[should_panic(expected = "tick underflow")]
    fn test_sub_underflow_panics() {
        let _ = Ticks::new(1) - Ticks::new(2);
    }

    #[test]
    fn test_ordering() {
        let a = Ticks::from_parts(1, 999_999);
        let b = Ticks::from_parts(2, 0);
        assert!(a < b);
        assert!(a <= b);
        assert!(b > a);
        assert!(b >= a);
        assert_eq!(a + 1, b);
    }

    #[test]
    fn test_display() {
        assert_eq!(Ticks::from_parts(4, 42).to_string(), "4:000042");
    }
}
