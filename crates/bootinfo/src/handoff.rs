//! The loader-to-kernel handoff block.
//!
//! Pointer fields hold physical addresses. The loader direct-maps all of
//! physical memory at `direct_map_offset` before entering the kernel, and
//! every accessor below goes through that mapping.

use core::{mem::size_of, slice};

use crate::{CommandLine, Elf64Symbol, MemoryMapEntry, SymbolTable};

/// "TERN"
pub const BOOT_INFO_MAGIC: u32 = 0x5445_524E;
pub const BOOT_INFO_VERSION: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BootInfoError {
    #[error("bad boot info magic {0:#x}")]
    BadMagic(u32),
    #[error("unsupported boot info version {0}")]
    UnsupportedVersion(u16),
    #[error("boot info size {0} does not match the kernel's layout")]
    SizeMismatch(u32),
    #[error("boot info checksum does not validate (byte sum {0:#x})")]
    BadChecksum(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct BootInfo {
    pub magic: u32,
    pub version: u16,
    /// Chosen so every byte of the structure sums to zero.
    pub checksum: u8,
    pub reserved: u8,
    /// `size_of::<BootInfo>()` as the loader saw it.
    pub size: u32,
    pub flags: u32,
    pub memory_map: u64,
    /// Number of [`MemoryMapEntry`] records.
    pub memory_map_entries: u64,
    pub command_line: u64,
    pub command_line_len: u64,
    pub initrd_base: u64,
    pub initrd_len: u64,
    pub symtab: u64,
    /// Bytes, a multiple of the ELF symbol size.
    pub symtab_len: u64,
    pub strtab: u64,
    pub strtab_len: u64,
    pub kernel_base: u64,
    pub kernel_len: u64,
    pub rsdp: u64,
    pub direct_map_offset: u64,
}

/// Wrapping byte sum of `bytes`.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

impl BootInfo {
    pub const fn empty() -> Self {
        Self {
            magic: BOOT_INFO_MAGIC,
            version: BOOT_INFO_VERSION,
            checksum: 0,
            reserved: 0,
            size: size_of::<Self>() as u32,
            flags: 0,
            memory_map: 0,
            memory_map_entries: 0,
            command_line: 0,
            command_line_len: 0,
            initrd_base: 0,
            initrd_len: 0,
            symtab: 0,
            symtab_len: 0,
            strtab: 0,
            strtab_len: 0,
            kernel_base: 0,
            kernel_len: 0,
            rsdp: 0,
            direct_map_offset: 0,
        }
    }

    /// Validates the block at `ptr` and returns it.
    ///
    /// # Safety
    ///
    /// `ptr` must point to readable memory at least `size_of::<BootInfo>()`
    /// bytes long that stays valid and unmodified for `'a`.
    pub unsafe fn from_ptr<'a>(ptr: *const BootInfo) -> Result<&'a BootInfo, BootInfoError> {
        // SAFETY: guaranteed by the caller.
        let info = unsafe { &*ptr };
        info.validate()?;
        Ok(info)
    }

    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: repr(C) with no padding; every field is plain data.
        unsafe { slice::from_raw_parts((self as *const Self).cast::<u8>(), size_of::<Self>()) }
    }

    /// Recomputes `checksum` after the loader has filled in the fields.
    pub fn seal(&mut self) {
        self.checksum = 0;
        self.checksum = 0u8.wrapping_sub(checksum(self.as_bytes()));
    }

    pub fn validate(&self) -> Result<(), BootInfoError> {
        if self.magic != BOOT_INFO_MAGIC {
            return Err(BootInfoError::BadMagic(self.magic));
        }
        if self.version != BOOT_INFO_VERSION {
            return Err(BootInfoError::UnsupportedVersion(self.version));
        }
        if self.size as usize != size_of::<Self>() {
            return Err(BootInfoError::SizeMismatch(self.size));
        }
        match checksum(self.as_bytes()) {
            0 => Ok(()),
            sum => Err(BootInfoError::BadChecksum(sum)),
        }
    }

    fn direct<T>(&self, phys: u64) -> *const T {
        phys.wrapping_add(self.direct_map_offset) as *const T
    }

    /// # Safety
    ///
    /// The pointer and length fields must describe memory that is mapped at
    /// `direct_map_offset` and outlives `self`.
    unsafe fn slice<T>(&self, phys: u64, len: u64) -> &[T] {
        if phys == 0 || len == 0 {
            return &[];
        }
        // SAFETY: guaranteed by the caller.
        unsafe { slice::from_raw_parts(self.direct(phys), len as usize) }
    }

    pub fn memory_map(&self) -> &[MemoryMapEntry] {
        // SAFETY: a validated handoff block describes loader-owned memory
        // that is never reclaimed.
        unsafe { self.slice(self.memory_map, self.memory_map_entries) }
    }

    /// The kernel command line. A line that is not valid UTF-8 is logged and
    /// treated as empty.
    pub fn command_line(&self) -> CommandLine<'_> {
        // SAFETY: see `memory_map`.
        let bytes: &[u8] = unsafe { self.slice(self.command_line, self.command_line_len) };
        let bytes = bytes.split(|b| *b == 0).next().unwrap_or_default();
        match core::str::from_utf8(bytes) {
            Ok(line) => CommandLine::new(line),
            Err(err) => {
                log::warn!("kernel command line is not UTF-8 ({err}), ignoring it");
                CommandLine::new("")
            }
        }
    }

    pub fn initrd(&self) -> &[u8] {
        // SAFETY: see `memory_map`.
        unsafe { self.slice(self.initrd_base, self.initrd_len) }
    }

    pub fn symbols(&self) -> SymbolTable<'_> {
        let count = self.symtab_len / size_of::<Elf64Symbol>() as u64;
        // SAFETY: see `memory_map`.
        unsafe {
            SymbolTable::new(
                self.slice(self.symtab, count),
                self.slice(self.strtab, self.strtab_len),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryKind;

    fn addr<T>(data: &[T]) -> (u64, u64) {
        (data.as_ptr() as u64, data.len() as u64)
    }

    #[test]
    fn layout_has_no_padding() {
        assert_eq!(size_of::<BootInfo>(), 16 + 8 * 14);
    }

    #[test]
    fn sealed_block_validates() {
        let mut info = BootInfo::empty();
        info.kernel_base = 0x10_0000;
        info.kernel_len = 0x5_4321;
        info.seal();
        assert_eq!(checksum(info.as_bytes()), 0);
        assert_eq!(info.validate(), Ok(()));
        assert_eq!(unsafe { BootInfo::from_ptr(&info) }.map(|i| i.kernel_len), Ok(0x5_4321));
    }

    #[test]
    fn any_modified_byte_breaks_the_checksum() {
        let mut info = BootInfo::empty();
        info.seal();
        info.initrd_len ^= 0x40;
        assert!(matches!(info.validate(), Err(BootInfoError::BadChecksum(0x40))));
    }

    #[test]
    fn unsealed_block_is_rejected() {
        let mut info = BootInfo::empty();
        info.rsdp = 0xE0000;
        assert!(matches!(info.validate(), Err(BootInfoError::BadChecksum(_))));
    }

    #[test]
    fn header_is_checked_before_checksum() {
        let mut info = BootInfo::empty();
        info.magic = 0xDEAD_BEEF;
        info.seal();
        assert_eq!(info.validate(), Err(BootInfoError::BadMagic(0xDEAD_BEEF)));

        let mut info = BootInfo::empty();
        info.version = 2;
        info.seal();
        assert_eq!(info.validate(), Err(BootInfoError::UnsupportedVersion(2)));

        let mut info = BootInfo::empty();
        info.size = 64;
        info.seal();
        assert_eq!(info.validate(), Err(BootInfoError::SizeMismatch(64)));
    }

    #[test]
    fn exposes_loader_data() {
        let map = [
            MemoryMapEntry::new(0, 0x9_F000, MemoryKind::USABLE),
            MemoryMapEntry::new(0x10_0000, 0x70_0000, MemoryKind::USABLE),
            MemoryMapEntry::new(0xFEC0_0000, 0x1000, MemoryKind::RESERVED),
        ];
        let line = b"loglevel=info nosmp\0garbage";
        let initrd = [7u8; 32];

        let mut info = BootInfo::empty();
        (info.memory_map, info.memory_map_entries) = addr(&map);
        (info.command_line, info.command_line_len) = addr(line);
        (info.initrd_base, info.initrd_len) = addr(&initrd);
        info.seal();

        assert_eq!(info.memory_map(), &map);
        assert_eq!(info.command_line().as_str(), "loglevel=info nosmp");
        assert!(!info.command_line().parse().smp);
        assert_eq!(info.initrd(), &initrd);
        assert!(info.symbols().is_empty());
    }

    #[test]
    fn symbols_come_from_symtab_and_strtab() {
        let strings = b"\0panic_entry\0";
        let symbols = [
            Elf64Symbol::default(),
            Elf64Symbol {
                name: 1,
                info: 0x12,
                value: 0xFFFF_FFFF_8000_1000,
                size: 0x40,
                ..Default::default()
            },
        ];
        let mut info = BootInfo::empty();
        info.symtab = symbols.as_ptr() as u64;
        info.symtab_len = size_of::<[Elf64Symbol; 2]>() as u64;
        (info.strtab, info.strtab_len) = addr(strings);

        let table = info.symbols();
        assert_eq!(table.len(), 2);
        assert_eq!(table.lookup(0xFFFF_FFFF_8000_1010).unwrap().name, "panic_entry");
    }

    #[test]
    fn invalid_command_line_reads_as_empty() {
        let line = [0xFFu8, 0xFE];
        let mut info = BootInfo::empty();
        (info.command_line, info.command_line_len) = addr(&line);
        assert_eq!(info.command_line().as_str(), "");
    }
}
