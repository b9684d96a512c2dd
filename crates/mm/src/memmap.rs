//! The firmware memory map as seen by the allocators.

use crate::PhysicalAddress;

/// One `(base, length, type)` entry of the firmware memory map.
pub trait BootMemoryRegion {
    fn base(&self) -> PhysicalAddress;
    fn size(&self) -> usize;
    /// Whether firmware reports this range as free RAM.
    fn is_usable(&self) -> bool;

    fn end(&self) -> PhysicalAddress {
        self.base() + self.size()
    }
}

/// A plain memory-map entry, for callers that do not have their own type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base: PhysicalAddress,
    pub size: usize,
    pub usable: bool,
}

impl MemoryRegion {
    pub const fn usable(base: PhysicalAddress, size: usize) -> Self {
        Self {
            base,
            size,
            usable: true,
        }
    }

    pub const fn reserved(base: PhysicalAddress, size: usize) -> Self {
        Self {
            base,
            size,
            usable: false,
        }
    }
}

impl BootMemoryRegion for MemoryRegion {
    fn base(&self) -> PhysicalAddress {
        self.base
    }

    fn size(&self) -> usize {
        self.size
    }

    fn is_usable(&self) -> bool {
        self.usable
    }
}
