use core::fmt;

use mm::{BootMemoryRegion, PhysicalAddress};

/// e820-style range type.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct MemoryKind(pub u32);

impl MemoryKind {
    pub const USABLE: Self = Self(1);
    pub const RESERVED: Self = Self(2);
    pub const ACPI_RECLAIMABLE: Self = Self(3);
    pub const ACPI_NVS: Self = Self(4);
    pub const BAD: Self = Self(5);

    pub fn name(self) -> &'static str {
        match self {
            Self::USABLE => "usable",
            Self::RESERVED => "reserved",
            Self::ACPI_RECLAIMABLE => "acpi-reclaimable",
            Self::ACPI_NVS => "acpi-nvs",
            Self::BAD => "bad",
            _ => "unknown",
        }
    }
}

impl fmt::Debug for MemoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct MemoryMapEntry {
    pub base: u64,
    pub length: u64,
    pub kind: MemoryKind,
    pub attributes: u32,
}

impl MemoryMapEntry {
    pub const fn new(base: u64, length: u64, kind: MemoryKind) -> Self {
        Self {
            base,
            length,
            kind,
            attributes: 0,
        }
    }
}

impl BootMemoryRegion for MemoryMapEntry {
    fn base(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base as usize)
    }

    fn size(&self) -> usize {
        self.length as usize
    }

    fn is_usable(&self) -> bool {
        self.kind == MemoryKind::USABLE
    }
}
