//! Pool occupancy statistics.

use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

/// Monoid representing pool occupancy statistics.
///
/// Naturally ordered by used fraction so that sparser pools come first.
/// All sizes in bytes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OccupancyStats {
    free_space: usize,
    total_space: usize,
}

impl OccupancyStats {
    /// Creates occupancy statistics from free and total space.
    #[inline]
    #[must_use]
    pub const fn new(free_space: usize, total_space: usize) -> Self {
        Self {
            free_space,
            total_space,
        }
    }

    /// Returns the used space in bytes.
    #[inline]
    #[must_use]
    pub const fn used_space(&self) -> usize {
        self.total_space - self.free_space
    }

    /// Returns the free space in bytes.
    #[inline]
    #[must_use]
    pub const fn free_space(&self) -> usize {
        self.free_space
    }

    /// Returns the total space in bytes.
    #[inline]
    #[must_use]
    pub const fn total_space(&self) -> usize {
        self.total_space
    }

    /// Returns the used fraction, or 0 for an empty pool.
    #[must_use]
    pub fn used_fraction(&self) -> f64 {
        if self.total_space == 0 {
            0.0
        } else {
            self.used_space() as f64 / self.total_space as f64
        }
    }

    /// Returns true if any space is tracked.
    #[inline]
    #[must_use]
    pub const fn is_populated(&self) -> bool {
        self.total_space > 0
    }
}

impl Add for OccupancyStats {
    type Output = Self;

    fn add(mut self, other: Self) -> Self {
        self += other;
        self
    }
}

impl AddAssign for OccupancyStats {
    fn add_assign(&mut self, other: Self) {
        self.free_space += other.free_space;
        self.total_space += other.total_space;
    }
}

impl Sub for OccupancyStats {
    type Output = Self;

    fn sub(mut self, other: Self) -> Self {
        self -= other;
        self
    }
}

impl SubAssign for OccupancyStats {
    fn sub_assign(&mut self, other: Self) {
        self.free_space -= other.free_space;
        self.total_space -= other.total_space;
    }
}

impl fmt::Display for OccupancyStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.2}%, {} / {} [B]",
            self.used_fraction() * 100.0,
            self.used_space(),
            self.total_space()
        )
    }
}
