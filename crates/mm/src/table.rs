//! Page-table entries and nodes.

use core::ops::{Index, IndexMut};

use bitflags::bitflags;

use crate::{FrameUsage, PhysicalAddress, arch::ENTRIES_PER_TABLE};

bitflags! {
    /// Hardware flag bits of a page-table entry.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct PageFlags: u64 {
        const PRESENT = 1;
        const WRITABLE = 1 << 1;
        const USER = 1 << 2;
        const WRITE_THROUGH = 1 << 3;
        const NO_CACHE = 1 << 4;
        const ACCESSED = 1 << 5;
        const DIRTY = 1 << 6;
        const HUGE = 1 << 7;
        const GLOBAL = 1 << 8;
        const NO_EXECUTE = 1 << 63;
    }
}

/// A single 64-bit page-table entry.
///
/// Bits 12..52 hold the frame address. Bits 9..12 are ignored by the MMU and
/// carry the [`FrameUsage`] of leaf mappings.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageEntry(u64);

impl PageEntry {
    const ADDRESS_MASK: u64 = 0x000F_FFFF_FFFF_F000;
    const USAGE_SHIFT: u32 = 9;
    const USAGE_MASK: u64 = 0b111 << Self::USAGE_SHIFT;

    pub const fn empty() -> Self {
        Self(0)
    }

    /// A present leaf mapping `frame`.
    pub fn leaf(frame: PhysicalAddress, flags: PageFlags, usage: FrameUsage) -> Self {
        debug_assert!(frame.is_page_aligned(), "frame must be page-aligned");
        let usage_bits = (usage.bits() as u64) << Self::USAGE_SHIFT;
        Self(
            (frame.as_u64() & Self::ADDRESS_MASK)
                | (flags | PageFlags::PRESENT).bits()
                | usage_bits,
        )
    }

    /// A present entry pointing at a lower-level table.
    ///
    /// Intermediate entries are maximally permissive; the leaf decides access.
    pub fn table(table: PhysicalAddress, user: bool) -> Self {
        let mut flags = PageFlags::PRESENT | PageFlags::WRITABLE;
        if user {
            flags |= PageFlags::USER;
        }
        Self::leaf(table, flags, FrameUsage::PageTable)
    }

    pub fn address(self) -> Option<PhysicalAddress> {
        self.is_present()
            .then(|| PhysicalAddress::new((self.0 & Self::ADDRESS_MASK) as usize))
    }

    pub fn flags(self) -> PageFlags {
        PageFlags::from_bits_truncate(self.0)
    }

    pub fn usage(self) -> FrameUsage {
        FrameUsage::from_bits(((self.0 & Self::USAGE_MASK) >> Self::USAGE_SHIFT) as u8)
    }

    pub fn is_present(self) -> bool {
        self.flags().contains(PageFlags::PRESENT)
    }

    /// A present entry at level 1 or 2 that maps a 2 MiB or 1 GiB page.
    pub fn is_huge(self) -> bool {
        self.is_present() && self.flags().contains(PageFlags::HUGE)
    }

    pub fn clear(&mut self) {
        self.0 = 0;
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl core::fmt::Debug for PageEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageEntry")
            .field("address", &self.address())
            .field("flags", &self.flags())
            .field("usage", &self.usage())
            .finish()
    }
}

/// One 4 KiB page-table node of 512 entries.
#[derive(Clone)]
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntry; ENTRIES_PER_TABLE],
}

impl PageTable {
    pub const fn new() -> Self {
        Self {
            entries: [PageEntry::empty(); ENTRIES_PER_TABLE],
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, PageEntry)> + '_ {
        self.entries.iter().copied().enumerate()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| !e.is_present())
    }
}

impl Default for PageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Index<usize> for PageTable {
    type Output = PageEntry;

    fn index(&self, index: usize) -> &PageEntry {
        &self.entries[index]
    }
}

impl IndexMut<usize> for PageTable {
    fn index_mut(&mut self, index: usize) -> &mut PageEntry {
        &mut self.entries[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_keeps_address_flags_and_usage() {
        let entry = PageEntry::leaf(
            PhysicalAddress::new(0x1234_5000),
            PageFlags::WRITABLE | PageFlags::NO_EXECUTE,
            FrameUsage::Shared,
        );
        assert_eq!(entry.address(), Some(PhysicalAddress::new(0x1234_5000)));
        assert!(entry.flags().contains(PageFlags::PRESENT | PageFlags::WRITABLE | PageFlags::NO_EXECUTE));
        assert_eq!(entry.usage(), FrameUsage::Shared);
    }

    #[test]
    fn empty_entry_has_no_address() {
        let mut entry = PageEntry::table(PhysicalAddress::new(0x2000), true);
        assert!(entry.flags().contains(PageFlags::USER));
        entry.clear();
        assert_eq!(entry.address(), None);
        assert!(!entry.is_present());
    }

    #[test]
    fn table_is_one_page() {
        assert_eq!(core::mem::size_of::<PageTable>(), crate::PAGE_SIZE);
        assert_eq!(core::mem::align_of::<PageTable>(), crate::PAGE_SIZE);
        assert!(PageTable::new().is_empty());
    }
}
