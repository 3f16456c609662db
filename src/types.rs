//! Common types used across basehw_r
//!
//! This module defines shared types to avoid circular dependencies.

use core::fmt;

/// Architecture-width call argument / return word
pub type Word = usize;

/// Hardware interrupt line number
pub type IrqLine = u32;

/// Maximum number of CPUs a kernel instance can manage
pub const MAX_CPUS: usize = 16;

/// Kernel object identifier (index into the object table)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ObjectId(pub u32);

impl ObjectId {
    /// Slot index of this id
    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Generation-checked reference to a kernel object
///
/// The id of a destroyed object is recycled, the generation is not. A
/// reference whose generation no longer matches the slot is dead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjRef {
    pub id: ObjectId,
    pub generation: u32,
}

impl ObjRef {
    pub const fn new(id: ObjectId, generation: u32) -> Self {
        Self { id, generation }
    }
}

/// Capability selector, local to one protection domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CapId(pub u32);

impl CapId {
    /// The invalid capability selector
    pub const INVALID: Self = Self(0);

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// Interpret a call argument as capability selector
    pub fn from_word(word: Word) -> Self {
        u32::try_from(word).map(Self).unwrap_or(Self::INVALID)
    }

    pub fn as_word(self) -> Word {
        self.0 as Word
    }
}

/// Physical CPU identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CpuId(pub usize);

impl CpuId {
    /// The CPU the kernel boots on
    pub const PRIMARY: Self = Self(0);
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

/// Scheduling priority, a higher value is more important
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Priority(u8);

impl Priority {
    /// Number of distinct priority levels
    pub const LEVELS: usize = 128;
    /// Lowest priority
    pub const MIN: Self = Self(0);
    /// Highest priority (used by the core thread)
    pub const MAX: Self = Self((Self::LEVELS - 1) as u8);

    /// Create a priority, clamped to the valid range
    pub fn new(value: u8) -> Self {
        Self(value.min(Self::MAX.0))
    }

    /// Interpret a call argument as priority, `None` if out of range
    pub fn from_word(word: Word) -> Option<Self> {
        if word < Self::LEVELS {
            Some(Self(word as u8))
        } else {
            None
        }
    }

    pub fn value(self) -> u8 {
        self.0
    }

    pub fn level(self) -> usize {
        self.0 as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_clamp() {
        assert_eq!(Priority::new(200), Priority::MAX);
        assert_eq!(Priority::new(10).value(), 10);
        assert!(Priority::from_word(128).is_none());
        assert_eq!(Priority::from_word(127), Some(Priority::MAX));
    }

    #[test]
    fn test_cap_id_from_word() {
        assert_eq!(CapId::from_word(7), CapId(7));
        assert!(!CapId::from_word(0).is_valid());
        assert_eq!(CapId::from_word(usize::MAX), CapId::INVALID);
    }
}
