//! Memory bring-up.
//!
//! Physical memory right after the kernel image holds, in order, the
//! page-table pool and the kernel heap. Together with the image they form the
//! reserved prefix the frame allocator never hands out.

use alloc::sync::Arc;

use bootinfo::BootInfo;
use mm::{
    AddressSpace, AddressTranslator, BootMemoryRegion, FrameAllocator, FrameUsage, LockedHeap,
    MemoryManager, PAGE_SIZE, PageFlags, PageTablePool, PhysicalAddress, VirtualAddress,
    active_root,
};
use spin::Once;

#[global_allocator]
static HEAP: LockedHeap = LockedHeap::empty();

static MEMORY: Once<MemoryManager> = Once::new();

/// 4 MiB of page tables.
const POOL_PAGES: usize = 1024;
const HEAP_SIZE: usize = 16 * 1024 * 1024;
/// The AP trampoline and its parameter block live below this.
const LOW_MEMORY_END: usize = 0x10_0000;

pub struct Memory {
    pub mm: &'static MemoryManager,
    /// The loader's page tables, adopted as the kernel's own.
    pub kernel_space: Arc<AddressSpace>,
}

/// # Panics
///
/// Panics if no usable memory region can hold the pool and heap right
/// after the kernel image.
pub fn init(boot_info: &BootInfo) -> Memory {
    AddressTranslator::set_current(AddressTranslator::hardware(
        boot_info.direct_map_offset as usize,
    ));

    let map = boot_info.memory_map();
    for region in map {
        log::debug!(
            "memory: {:#014x}..{:#014x} {:?}",
            region.base,
            region.base + region.length,
            region.kind
        );
    }

    let image_end = (boot_info.kernel_base + boot_info.kernel_len) as usize;
    let pool_base = PhysicalAddress::new(image_end.max(LOW_MEMORY_END)).align_up(PAGE_SIZE);
    let heap_base = pool_base + POOL_PAGES * PAGE_SIZE;
    let reserved_end = heap_base + HEAP_SIZE;
    if !map
        .iter()
        .any(|r| r.is_usable() && r.base() <= pool_base && reserved_end <= r.end())
    {
        panic!("no usable memory for the page-table pool and heap at {pool_base}..{reserved_end}");
    }

    // SAFETY: the region is usable RAM past the image, reached through the
    // direct map, and excluded from the frame allocator below.
    unsafe { HEAP.init(VirtualAddress::direct_mapped(heap_base), HEAP_SIZE) };

    let pool = PageTablePool::new(pool_base, POOL_PAGES);
    let frames = FrameAllocator::new(map, reserved_end);
    log::info!(
        "memory: {} MiB free, reserved prefix ends at {reserved_end}",
        frames.free_frames() * PAGE_SIZE / (1024 * 1024)
    );
    let mm = MEMORY.call_once(|| MemoryManager::new(frames, pool));

    // SAFETY: CR3 holds the loader's tables, which map the kernel and the
    // direct map.
    let kernel_space = Arc::new(unsafe { AddressSpace::from_root(active_root()) });
    Memory { mm, kernel_space }
}

/// Maps the register page containing `phys` uncached at its direct-map
/// address and returns the address of `phys` itself.
///
/// # Panics
///
/// Panics if the page-table pool runs dry, which cannot be recovered from
/// during boot.
pub fn map_device(mm: &MemoryManager, space: &AddressSpace, phys: PhysicalAddress) -> VirtualAddress {
    let page = phys.align_down(PAGE_SIZE);
    let virt = VirtualAddress::direct_mapped(page);
    if space.translate(virt).is_none() {
        let flags = PageFlags::WRITABLE | PageFlags::NO_CACHE | PageFlags::WRITE_THROUGH | PageFlags::NO_EXECUTE;
        if let Err(err) = space.map_single(mm, virt, page, flags, FrameUsage::Device) {
            panic!("cannot map device registers at {page}: {err}");
        }
    }
    virt + phys.page_offset()
}

/// Identity-maps one low page for the AP trampoline. Returns whether a new
/// mapping was made (and must be removed again).
pub fn identity_map_low(mm: &MemoryManager, space: &AddressSpace, phys: PhysicalAddress) -> bool {
    let virt = VirtualAddress::new(phys.as_usize());
    if space.translate(virt) == Some(phys) {
        return false;
    }
    if let Err(err) = space.map_single(mm, virt, phys, PageFlags::WRITABLE, FrameUsage::Device) {
        panic!("cannot identity-map {phys} for CPU startup: {err}");
    }
    true
}

/// Walks the whole heap chain, panicking on a corrupted block, and logs
/// what is left.
pub fn check_heap() {
    if let Some(heap) = &*HEAP.lock() {
        let stats = heap.check();
        log::debug!(
            "heap: {} KiB free in {} of {} blocks, largest {} KiB",
            stats.free_bytes / 1024,
            stats.free_blocks,
            stats.blocks,
            stats.largest_free / 1024
        );
    }
}
