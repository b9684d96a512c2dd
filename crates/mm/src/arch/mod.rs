//! Paging geometry and the handful of CPU operations the memory manager needs.
//!
//! The geometry is always amd64 four-level paging. What differs between the
//! hardware backend and the software emulation used by tests is how physical
//! memory is reached, how CR3 is loaded, and how the TLB is invalidated.

#[cfg(all(target_arch = "x86_64", not(any(test, feature = "software-emulation"))))]
mod x86_64;
#[cfg(all(target_arch = "x86_64", not(any(test, feature = "software-emulation"))))]
pub use self::x86_64::*;

#[cfg(any(test, feature = "software-emulation"))]
mod software;
#[cfg(any(test, feature = "software-emulation"))]
pub use software::*;

/// Size of a base page and of every page-table node.
pub const PAGE_SIZE: usize = 4096;

/// Number of 8-byte entries in one page-table node.
pub const ENTRIES_PER_TABLE: usize = 512;

/// PML4, PDPT, PD, PT.
pub const PAGE_TABLE_LEVELS: usize = 4;

/// Architectural limit on physical address width.
pub const MAX_PHYSICAL_BITS: usize = 52;

/// Virtual address width with four-level paging.
pub const MAX_VIRTUAL_BITS: usize = 48;

/// First top-level index belonging to the kernel (upper) half.
pub const KERNEL_HALF_START: usize = ENTRIES_PER_TABLE / 2;

/// Returns the table index for `address` at `level`, where level 0 is the PT
/// and level 3 is the PML4.
#[inline]
pub const fn page_index(address: usize, level: usize) -> usize {
    assert!(level < PAGE_TABLE_LEVELS, "level out of range for four-level paging");
    (address >> level_shift(level)) & (ENTRIES_PER_TABLE - 1)
}

/// Number of address bits below the index field of `level`.
#[inline]
pub const fn level_shift(level: usize) -> usize {
    12 + level * 9
}

/// Bytes of address space covered by one entry at `level`.
#[inline]
pub const fn level_span(level: usize) -> usize {
    1 << level_shift(level)
}

#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr < (1usize << MAX_PHYSICAL_BITS)
}

/// Virtual addresses must be canonical: bits 48..64 replicate bit 47.
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    canonicalize_virtual(addr) == addr
}

#[inline]
pub const fn canonicalize_virtual(addr: usize) -> usize {
    if addr & (1 << 47) != 0 {
        addr | 0xFFFF_0000_0000_0000
    } else {
        addr & 0x0000_FFFF_FFFF_FFFF
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_for_each_level() {
        let addr = 0xFFFF_8000_0020_3000usize;
        assert_eq!(page_index(addr, 3), 256);
        assert_eq!(page_index(addr, 2), 0);
        assert_eq!(page_index(addr, 1), 1);
        assert_eq!(page_index(addr, 0), 3);
    }

    #[test]
    fn spans_grow_by_512() {
        assert_eq!(level_span(0), PAGE_SIZE);
        assert_eq!(level_span(1), 2 * 1024 * 1024);
        assert_eq!(level_span(2), 1024 * 1024 * 1024);
        assert_eq!(level_span(3), 512 * 1024 * 1024 * 1024);
    }

    #[test]
    fn canonical_addresses() {
        assert!(validate_virtual(0x0000_7FFF_FFFF_FFFF));
        assert!(validate_virtual(0xFFFF_8000_0000_0000));
        assert!(!validate_virtual(0x0000_8000_0000_0000));
        assert_eq!(canonicalize_virtual(0x0000_8000_0000_0000), 0xFFFF_8000_0000_0000);
    }
}
