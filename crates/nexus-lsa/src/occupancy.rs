//! Occupancy statistics.

use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

/// Free and total byte counts of a segment, region or shard.
///
/// Used space is always `total_space - free_space`. Occupancies of disjoint
/// memory add up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OccupancyStats {
    free_space: usize,
    total_space: usize,
}

impl OccupancyStats {
    /// Creates occupancy statistics.
    ///
    /// # Panics
    ///
    /// Panics if `free_space` exceeds `total_space`.
    pub fn new(free_space: usize, total_space: usize) -> Self {
        assert!(
            free_space <= total_space,
            "free space {free_space} exceeds total space {total_space}"
        );
        Self {
            free_space,
            total_space,
        }
    }

    /// Returns empty statistics.
    pub const fn empty() -> Self {
        Self {
            free_space: 0,
            total_space: 0,
        }
    }

    /// Returns the free space in bytes.
    #[must_use]
    #[inline]
    pub const fn free_space(&self) -> usize {
        self.free_space
    }

    /// Returns the total space in bytes.
    #[must_use]
    #[inline]
    pub const fn total_space(&self) -> usize {
        self.total_space
    }

    /// Returns the used space in bytes.
    #[must_use]
    #[inline]
    pub const fn used_space(&self) -> usize {
        self.total_space - self.free_space
    }

    /// Returns the used fraction in `[0, 1]`. Empty statistics report 0.
    #[must_use]
    pub fn used_fraction(&self) -> f64 {
        if self.total_space == 0 {
            0.0
        } else {
            self.used_space() as f64 / self.total_space as f64
        }
    }

    /// Records `bytes` of previously used space as free.
    pub(crate) fn release(&mut self, bytes: usize) {
        debug_assert!(self.free_space + bytes <= self.total_space);
        self.free_space += bytes;
    }
}

impl Add for OccupancyStats {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            free_space: self.free_space + rhs.free_space,
            total_space: self.total_space + rhs.total_space,
        }
    }
}

impl AddAssign for OccupancyStats {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for OccupancyStats {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self::new(
            self.free_space - rhs.free_space,
            self.total_space - rhs.total_space,
        )
    }
}

impl SubAssign for OccupancyStats {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl fmt::Display for OccupancyStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.2}%, {} / {} [B]",
            self.used_fraction() * 100.0,
            self.used_space(),
            self.total_space
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_used_space() {
        let occ = OccupancyStats::new(300, 1000);
        assert_eq!(occ.used_space(), 700);
        assert!((occ.used_fraction() - 0.7).abs() < f64::EPSILON);
        assert_eq!(OccupancyStats::empty().used_fraction(), 0.0);
    }

    #[test]
    fn test_arithmetic() {
        let a = OccupancyStats::new(100, 400);
        let b = OccupancyStats::new(50, 200);

        let mut sum = a + b;
        assert_eq!(sum, OccupancyStats::new(150, 600));

        sum -= b;
        assert_eq!(sum, a);

        sum.release(10);
        assert_eq!(sum.free_space(), 110);
        assert_eq!(sum.used_space(), 290);
    }

    #[test]
    #[should_panic(expected = "exceeds total space")]
    fn test_invalid_occupancy() {
        let _ = OccupancyStats::new(10, 5);
    }

    #[test]
    fn test_display() {
        let occ = OccupancyStats::new(512, 1024);
        assert_eq!(occ.to_string(), "50.00%, 512 / 1024 [B]");
    }
}
