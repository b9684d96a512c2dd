//! Physical and virtual address newtypes and the direct-map translator.
//!
//! Kernel virtual addresses in the direct-mapped upper region are always
//! `physical + offset`. User addresses have no such relation and must go
//! through a page-table walk. The only conversions between the two address
//! types live here, at the direct-mapping boundary.

use core::fmt;
use core::ops::{Add, Sub};

use crate::arch;

#[cfg(any(test, feature = "software-emulation"))]
use crate::arch::EmulatedMemory;

/// Converts between physical addresses and their direct-mapped virtual aliases.
pub enum AddressTranslator {
    /// All physical memory is mapped at `direct_map_offset` in the upper half.
    Hardware { direct_map_offset: usize },
    /// Physical memory is a host buffer (tests and emulation).
    #[cfg(any(test, feature = "software-emulation"))]
    Emulated(EmulatedMemory),
}

impl AddressTranslator {
    pub const fn hardware(direct_map_offset: usize) -> Self {
        Self::Hardware { direct_map_offset }
    }

    #[cfg(any(test, feature = "software-emulation"))]
    pub fn emulated(size: usize) -> Self {
        Self::Emulated(EmulatedMemory::new(size))
    }

    /// Installs the translator. Must happen exactly once, before any page
    /// table or heap operation.
    ///
    /// # Panics
    ///
    /// Panics if a translator is already installed.
    pub fn set_current(translator: AddressTranslator) {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            if ADDRESS_TRANSLATOR.get().is_some() {
                panic!("address translator already set");
            }
            ADDRESS_TRANSLATOR.call_once(|| translator);
        }

        #[cfg(any(test, feature = "software-emulation"))]
        ADDRESS_TRANSLATOR.with(|t| {
            if t.get().is_some() {
                panic!("address translator already set");
            }
            t.call_once(|| translator);
        });
    }

    /// # Panics
    ///
    /// Panics if no translator has been installed.
    pub fn current() -> &'static AddressTranslator {
        Self::try_current()
            .expect("address translator not set; call AddressTranslator::set_current during initialization")
    }

    pub fn try_current() -> Option<&'static AddressTranslator> {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            ADDRESS_TRANSLATOR.get()
        }

        #[cfg(any(test, feature = "software-emulation"))]
        {
            ADDRESS_TRANSLATOR.with(|t| {
                // SAFETY: the thread-local outlives every use on this thread and
                // is never replaced once set.
                t.get().map(|translator| unsafe { &*(translator as *const AddressTranslator) })
            })
        }
    }

    /// Returns the direct-mapped alias of `phys`.
    pub fn to_virtual(&self, phys: PhysicalAddress) -> VirtualAddress {
        match self {
            Self::Hardware { direct_map_offset } => {
                VirtualAddress::new(phys.as_usize().wrapping_add(*direct_map_offset))
            }
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => VirtualAddress(mem.translate(phys.as_usize()) as usize),
        }
    }

    /// Returns the physical address behind a direct-mapped virtual address, or
    /// `None` if `virt` is not inside the direct map.
    pub fn to_physical(&self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        match self {
            Self::Hardware { direct_map_offset } => {
                let phys = virt.as_usize().checked_sub(*direct_map_offset)?;
                arch::validate_physical(phys).then_some(PhysicalAddress(phys))
            }
            #[cfg(any(test, feature = "software-emulation"))]
            Self::Emulated(mem) => mem.ptr_to_phys(virt.as_ptr()).map(PhysicalAddress),
        }
    }

    #[inline]
    pub fn phys_to_ptr<T>(&self, phys: PhysicalAddress) -> *mut T {
        self.to_virtual(phys).as_mut_ptr()
    }

    /// Carves `size` bytes out of emulated physical memory.
    ///
    /// # Panics
    ///
    /// Panics on the hardware translator.
    #[cfg(any(test, feature = "software-emulation"))]
    pub fn allocate(&self, size: usize, align: usize) -> Option<PhysicalAddress> {
        match self {
            Self::Hardware { .. } => panic!("cannot allocate from hardware translator"),
            Self::Emulated(mem) => mem.allocate(size, align).map(PhysicalAddress),
        }
    }
}

#[cfg(not(any(test, feature = "software-emulation")))]
static ADDRESS_TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();

// Per-thread so every test owns an independent emulated machine.
#[cfg(any(test, feature = "software-emulation"))]
std::thread_local! {
    static ADDRESS_TRANSLATOR: spin::Once<AddressTranslator> = spin::Once::new();
}

macro_rules! impl_address_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// # Safety
            ///
            /// The caller must ensure the value is a valid address of this kind.
            #[inline]
            pub const unsafe fn new_unchecked(addr: usize) -> Self {
                Self(addr)
            }

            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            #[inline]
            pub const fn as_u64(self) -> u64 {
                self.0 as u64
            }

            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }

            #[inline]
            pub const fn align_up(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self((self.0 + align - 1) & !(align - 1))
            }

            #[inline]
            pub const fn is_page_aligned(self) -> bool {
                self.is_aligned(arch::PAGE_SIZE)
            }

            /// Byte offset within the containing 4 KiB page.
            #[inline]
            pub const fn page_offset(self) -> usize {
                self.0 & (arch::PAGE_SIZE - 1)
            }
        }

        impl fmt::Pointer for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:p}", self.0 as *const u8)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl From<u64> for $name {
            #[inline]
            fn from(addr: u64) -> Self {
                Self::new(addr as usize)
            }
        }

        impl From<usize> for $name {
            #[inline]
            fn from(addr: usize) -> Self {
                Self::new(addr)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self::new(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self::new(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_address_common!(
    PhysicalAddress,
    "A physical memory address.\n\n\
     Never dereferenced directly; reach the memory through\n\
     [`VirtualAddress::direct_mapped`] or [`AddressTranslator::phys_to_ptr`]."
);

impl PhysicalAddress {
    /// # Panics
    ///
    /// Panics if the address exceeds the architectural physical address width.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            arch::validate_physical(addr),
            "physical address exceeds maximum width"
        );
        Self(addr)
    }

    /// Converts a direct-mapped virtual address back to physical, or `None` if
    /// the address lies outside the direct map.
    ///
    /// # Panics
    ///
    /// Panics if the address translator has not been installed.
    #[inline]
    pub fn from_direct_mapped(virt: VirtualAddress) -> Option<Self> {
        AddressTranslator::current().to_physical(virt)
    }

    /// Index of the 4 KiB frame containing this address.
    #[inline]
    pub const fn frame_index(self) -> usize {
        self.0 / arch::PAGE_SIZE
    }

    #[inline]
    pub const fn from_frame_index(index: usize) -> Self {
        Self::new(index * arch::PAGE_SIZE)
    }
}

impl_address_common!(
    VirtualAddress,
    "A canonical virtual memory address.\n\n\
     Provides the per-level page-table indices used by the four-level walk."
);

impl VirtualAddress {
    /// # Panics
    ///
    /// Panics if the address is not canonical.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(arch::validate_virtual(addr), "address is not canonical");
        Self(addr)
    }

    /// Wraps a host pointer. Under emulation host pointers are not required to
    /// be canonical for the guest.
    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        #[cfg(any(test, feature = "software-emulation"))]
        return Self(ptr as usize);

        #[cfg(not(any(test, feature = "software-emulation")))]
        Self::new(ptr as usize)
    }

    /// Returns the direct-mapped alias of `phys`.
    ///
    /// # Panics
    ///
    /// Panics if the address translator has not been installed.
    #[inline]
    pub fn direct_mapped(phys: PhysicalAddress) -> Self {
        AddressTranslator::current().to_virtual(phys)
    }

    /// Lower half addresses belong to user space.
    #[inline]
    pub const fn is_user(self) -> bool {
        self.0 < 0x0000_8000_0000_0000
    }

    #[inline]
    pub const fn is_kernel(self) -> bool {
        !self.is_user()
    }

    #[inline]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Index into the table at `level` (0 = PT, 3 = PML4).
    #[inline]
    pub const fn page_index(self, level: usize) -> usize {
        arch::page_index(self.0, level)
    }

    /// Adds `rhs`, returning `None` on overflow or if the result is not canonical.
    #[inline]
    pub const fn checked_add(self, rhs: usize) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(addr) if arch::validate_virtual(addr) => Some(Self(addr)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod physical_address {
        use super::*;

        #[test]
        fn new_valid_address() {
            assert_eq!(PhysicalAddress::new(0x1000).as_usize(), 0x1000);
        }

        #[test]
        #[should_panic(expected = "physical address exceeds maximum width")]
        fn new_exceeds_max() {
            PhysicalAddress::new(1usize << arch::MAX_PHYSICAL_BITS);
        }

        #[test]
        fn alignment() {
            let addr = PhysicalAddress::new(0x1234);
            assert_eq!(addr.align_down(arch::PAGE_SIZE), PhysicalAddress::new(0x1000));
            assert_eq!(addr.align_up(arch::PAGE_SIZE), PhysicalAddress::new(0x2000));
            assert!(!addr.is_page_aligned());
            assert_eq!(addr.page_offset(), 0x234);
        }

        #[test]
        fn frame_index_round_trip() {
            let addr = PhysicalAddress::new(0x5000);
            assert_eq!(addr.frame_index(), 5);
            assert_eq!(PhysicalAddress::from_frame_index(5), addr);
        }

        #[test]
        fn arithmetic() {
            let a = PhysicalAddress::new(0x2000);
            assert_eq!((a + 0x1000).as_usize(), 0x3000);
            assert_eq!((a - 0x1000).as_usize(), 0x1000);
            assert_eq!(PhysicalAddress::new(0x3000) - a, 0x1000);
        }

        #[test]
        fn formatting() {
            let addr = PhysicalAddress::new(0x1000);
            assert_eq!(format!("{addr:?}"), "PhysicalAddress(0x1000)");
            assert_eq!(format!("{addr}"), "0x1000");
        }
    }

    mod virtual_address {
        use super::*;

        #[test]
        fn halves() {
            assert!(VirtualAddress::new(0x40_0000).is_user());
            assert!(VirtualAddress::new(0xFFFF_8000_0000_0000).is_kernel());
        }

        #[test]
        #[should_panic(expected = "address is not canonical")]
        fn non_canonical_panics() {
            VirtualAddress::new(0x0000_8000_0000_0000);
        }

        #[test]
        fn page_indices() {
            let addr = VirtualAddress::new(0x0000_0080_4020_1000);
            assert_eq!(addr.page_index(3), 1);
            assert_eq!(addr.page_index(2), 1);
            assert_eq!(addr.page_index(1), 1);
            assert_eq!(addr.page_index(0), 1);
        }

        #[test]
        fn checked_add_rejects_hole() {
            let top = VirtualAddress::new(0x0000_7FFF_FFFF_F000);
            assert_eq!(top.checked_add(0x1000), None);
            assert_eq!(
                VirtualAddress::new(0x1000).checked_add(0x1000),
                Some(VirtualAddress::new(0x2000))
            );
        }
    }

    mod direct_mapping {
        use super::*;

        #[test]
        fn hardware_offset_round_trip() {
            let translator = AddressTranslator::hardware(0xFFFF_8000_0000_0000);
            let phys = PhysicalAddress::new(0x20_0000);
            let virt = translator.to_virtual(phys);
            assert_eq!(virt.as_usize(), 0xFFFF_8000_0020_0000);
            assert_eq!(translator.to_physical(virt), Some(phys));
        }

        #[test]
        fn hardware_rejects_user_address() {
            let translator = AddressTranslator::hardware(0xFFFF_8000_0000_0000);
            assert_eq!(translator.to_physical(VirtualAddress::new(0x40_0000)), None);
        }

        #[test]
        fn emulated_round_trip() {
            AddressTranslator::set_current(AddressTranslator::emulated(64 * 1024));
            let phys = PhysicalAddress::new(0x3000);
            let virt = VirtualAddress::direct_mapped(phys);
            assert_eq!(PhysicalAddress::from_direct_mapped(virt), Some(phys));
        }

        #[test]
        #[should_panic(expected = "address translator already set")]
        fn set_twice_panics() {
            AddressTranslator::set_current(AddressTranslator::emulated(4096));
            AddressTranslator::set_current(AddressTranslator::emulated(4096));
        }
    }
}
