//! Core identifier types for logmem.
//!
//! These types provide type-safe wrappers around numeric identifiers,
//! preventing accidental misuse of different ID types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Region identifier - uniquely identifies an allocator region on a worker.
///
/// Region IDs are monotonically increasing and never reused within a
/// process.
///
/// # Example
///
/// ```rust
/// use logmem_common::types::RegionId;
///
/// let region = RegionId::new(7);
/// assert_eq!(region.as_u64(), 7);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct RegionId(u64);

impl RegionId {
    /// Invalid region ID, used as a sentinel value.
    pub const INVALID: Self = Self(u64::MAX);

    /// Creates a new `RegionId` from a raw u64 value.
    #[inline]
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw u64 value.
    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Checks if this is a valid region ID.
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 != Self::INVALID.0
    }
}

impl fmt::Debug for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::INVALID {
            write!(f, "RegionId(INVALID)")
        } else {
            write!(f, "RegionId({})", self.0)
        }
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for RegionId {
    #[inline]
    fn from(id: u64) -> Self {
        Self::new(id)
    }
}

impl From<RegionId> for u64 {
    #[inline]
    fn from(id: RegionId) -> Self {
        id.0
    }
}

/// Migrator identifier - indexes the worker's migrator table.
///
/// Migrator IDs appear inside object headers, so the ID space is kept
/// compact: deregistered IDs are recycled before the table grows.
///
/// # Example
///
/// ```rust
/// use logmem_common::types::MigratorId;
///
/// let migrator = MigratorId::new(3);
/// assert_eq!(migrator.as_u32(), 3);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct MigratorId(u32);

impl MigratorId {
    /// Creates a new `MigratorId` from a raw u32 value.
    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the raw u32 value.
    #[inline]
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for MigratorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MigratorId({})", self.0)
    }
}

impl fmt::Display for MigratorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for MigratorId {
    #[inline]
    fn from(id: u32) -> Self {
        Self::new(id)
    }
}

impl From<MigratorId> for u32 {
    #[inline]
    fn from(id: MigratorId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_id() {
        let region = RegionId::new(42);
        assert_eq!(region.as_u64(), 42);
        assert!(region.is_valid());
        assert!(!RegionId::INVALID.is_valid());
    }

    #[test]
    fn test_migrator_id() {
        let migrator = MigratorId::new(5);
        assert_eq!(migrator.as_u32(), 5);
        assert_eq!(format!("{}", migrator), "5");
    }

    #[test]
    fn test_ordering() {
        assert!(RegionId::new(1) < RegionId::new(2));
        assert!(MigratorId::new(1) < MigratorId::new(2));
    }
}
