#![cfg_attr(not(test), no_std)]

//! # Tern boot handoff
//!
//! The loader leaves a single [`BootInfo`] block in memory before jumping to
//! the kernel. This crate defines its layout, validates its checksum, and
//! gives typed access to what it points at: the firmware memory map, the
//! kernel command line, the initrd and the kernel's own ELF symbol table.

mod cmdline;
mod handoff;
mod memory_map;
mod symbols;

pub use cmdline::{CommandLine, DEFAULT_TIMER_HZ, KernelConfig};
pub use handoff::{BOOT_INFO_MAGIC, BOOT_INFO_VERSION, BootInfo, BootInfoError, checksum};
pub use memory_map::{MemoryKind, MemoryMapEntry};
pub use symbols::{Elf64Symbol, Symbol, SymbolTable};
