#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Tern Memory Manager
//!
//! Everything the kernel needs to own physical and virtual memory:
//!
//! - A bitmap frame allocator over the firmware memory map.
//! - A fixed pool of zeroed pages reserved for page tables.
//! - Four-level address spaces with map, unmap, free-range search, clone and fork.
//! - A first-fit kernel heap over a pre-mapped region.
//! - Software emulation of physical memory for testing in non-kernel environments.

extern crate alloc;

mod address;
mod address_space;
mod arch;
mod bitmap;
mod frame_allocator;
mod heap;
mod manager;
mod memmap;
mod pool;
mod table;
mod usage;

pub use address::{AddressTranslator, PhysicalAddress, VirtualAddress};
pub use address_space::{AddressSpace, CloneFlags, MapError, USER_SPACE_END, USER_SPACE_START};
pub use bitmap::PageBitmap;
pub use frame_allocator::{FrameAllocator, FrameError, TRACKING_WINDOW};
pub use heap::{BlockInfo, HEAP_ALIGN, HeapStats, KernelHeap, LockedHeap};
pub use manager::MemoryManager;
pub use memmap::{BootMemoryRegion, MemoryRegion};
pub use pool::{PageTablePool, PoolError};
pub use table::{PageEntry, PageFlags, PageTable};
pub use usage::FrameUsage;

pub use arch::{ENTRIES_PER_TABLE, KERNEL_HALF_START, PAGE_SIZE, active_root, flush, flush_all};

#[cfg(any(test, feature = "software-emulation"))]
pub use arch::{EmulatedMemory, take_flushes};
