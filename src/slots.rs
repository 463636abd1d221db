//! Fixed-capacity slot allocation for loaded executables.
//!
//! Identifier assignment is allocation-free: a bitmask tracks occupancy and
//! `allocate` hands out the lowest clear bit. Mutation is serialized by the
//! registry's structural mutex; the registry additionally mirrors the
//! registered subset of this mask into an atomic for lock-free queries.

use crate::error::{LoaderError, Result};

/// Maximum number of executables resident in one registry. Bounded by the
/// width of the occupancy mask.
pub const MAX_EXECUTABLES: usize = 32;

/// Occupancy-mask allocator over a table of at most `MAX_EXECUTABLES` slots.
/// Invariant: bit `i` set ⇔ slot `i` holds (or is being loaded into) an
/// image.
#[derive(Debug, Clone)]
pub struct SlotAllocator {
    bits: u32,
    capacity: u16,
}

impl SlotAllocator {
    /// Allocator with `capacity` slots, `1..=MAX_EXECUTABLES`.
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity >= 1 && capacity <= MAX_EXECUTABLES,
            "slot capacity must be in 1..={MAX_EXECUTABLES}, got {capacity}"
        );
        Self {
            bits: 0,
            capacity: capacity as u16,
        }
    }

    /// Reserve the lowest-numbered free slot.
    pub fn allocate(&mut self) -> Result<u16> {
        let id = (!self.bits).trailing_zeros() as u16;
        if id >= self.capacity {
            return Err(LoaderError::ResourceExhausted(format!(
                "all {} executable slots occupied",
                self.capacity
            )));
        }
        self.bits |= 1 << id;
        Ok(id)
    }

    /// Return slot `id` to the pool.
    pub fn free(&mut self, id: u16) -> Result<()> {
        if id >= self.capacity {
            return Err(LoaderError::InvalidArgument(format!(
                "slot id {} out of range (capacity {})",
                id, self.capacity
            )));
        }
        if self.bits & (1 << id) == 0 {
            return Err(LoaderError::InvalidArgument(format!(
                "slot id {} is already free",
                id
            )));
        }
        self.bits &= !(1 << id);
        Ok(())
    }

    /// Whether slot `id` is occupied.
    #[inline]
    pub fn is_set(&self, id: u16) -> bool {
        id < self.capacity && (self.bits >> id) & 1 != 0
    }

    /// Raw occupancy mask.
    #[inline]
    pub fn bits(&self) -> u32 {
        self.bits
    }

    /// Number of occupied slots.
    #[inline]
    pub fn occupied(&self) -> u32 {
        self.bits.count_ones()
    }

    #[inline]
    pub fn capacity(&self) -> u16 {
        self.capacity
    }

    /// Iterate over occupied slot ids, lowest first.
    pub fn iter_occupied(&self) -> impl Iterator<Item = u16> + '_ {
        (0..self.capacity).filter(|&id| self.is_set(id))
    }
}
