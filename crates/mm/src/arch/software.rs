//! Software emulation of physical memory and the paging registers.
//!
//! Paging geometry is the real amd64 one; only the machine underneath is
//! simulated. Physical memory is a page-aligned host buffer, CR3 is a
//! per-thread cell and TLB invalidations are recorded so tests can assert on
//! them.

use core::cell::{Cell, RefCell};
use core::sync::atomic::{AtomicUsize, Ordering};
use std::alloc::{Layout, alloc_zeroed, dealloc};

use crate::{PAGE_SIZE, PhysicalAddress, VirtualAddress};

std::thread_local! {
    static ACTIVE_ROOT: Cell<usize> = const { Cell::new(0) };
    static FLUSHED: RefCell<Vec<usize>> = const { RefCell::new(Vec::new()) };
}

/// Records `root` as the active page-table root of this emulated CPU.
///
/// # Safety
///
/// Always safe under emulation; the signature matches the hardware backend.
pub unsafe fn activate(root: PhysicalAddress) {
    ACTIVE_ROOT.with(|r| r.set(root.as_usize()));
}

pub fn active_root() -> PhysicalAddress {
    PhysicalAddress::new(ACTIVE_ROOT.with(Cell::get))
}

pub fn flush(virt: VirtualAddress) {
    FLUSHED.with(|f| f.borrow_mut().push(virt.as_usize()));
}

pub fn flush_all() {
    FLUSHED.with(|f| f.borrow_mut().clear());
}

/// Drains the list of single-page invalidations recorded on this thread.
pub fn take_flushes() -> Vec<VirtualAddress> {
    FLUSHED.with(|f| {
        f.borrow_mut()
            .drain(..)
            .map(VirtualAddress::new)
            .collect()
    })
}

/// Emulated physical memory.
///
/// Physical address `p` corresponds to byte `p` of the buffer. The buffer is
/// page-aligned so page tables placed in it can be referenced as `PageTable`.
pub struct EmulatedMemory {
    base: *mut u8,
    size: usize,
    next_alloc: AtomicUsize,
}

// The buffer is owned exclusively by this value.
unsafe impl Send for EmulatedMemory {}
unsafe impl Sync for EmulatedMemory {}

impl EmulatedMemory {
    pub fn new(size: usize) -> Self {
        let size = size.next_multiple_of(PAGE_SIZE).max(PAGE_SIZE);
        let layout = Layout::from_size_align(size, PAGE_SIZE).expect("invalid emulated memory size");
        // SAFETY: layout has a non-zero size.
        let base = unsafe { alloc_zeroed(layout) };
        assert!(!base.is_null(), "failed to allocate emulated memory");
        Self {
            base,
            size,
            next_alloc: AtomicUsize::new(0),
        }
    }

    /// Bump-allocates `size` bytes of emulated physical memory.
    pub fn allocate(&self, size: usize, align: usize) -> Option<usize> {
        loop {
            let current = self.next_alloc.load(Ordering::Relaxed);
            let aligned = current.next_multiple_of(align);
            let end = aligned.checked_add(size)?;
            if end > self.size {
                return None;
            }
            if self
                .next_alloc
                .compare_exchange(current, end, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return Some(aligned);
            }
        }
    }

    /// Returns a host pointer to emulated physical address `phys`.
    pub fn translate(&self, phys: usize) -> *mut u8 {
        assert!(phys < self.size, "physical address out of bounds");
        // SAFETY: bounds checked above.
        unsafe { self.base.add(phys) }
    }

    /// Maps a host pointer back to its emulated physical address, if it lies
    /// inside the buffer.
    pub fn ptr_to_phys(&self, ptr: *const u8) -> Option<usize> {
        let offset = (ptr as usize).checked_sub(self.base as usize)?;
        (offset < self.size).then_some(offset)
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for EmulatedMemory {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.size, PAGE_SIZE).expect("layout was valid at creation");
        // SAFETY: allocated in `new` with this layout.
        unsafe { dealloc(self.base, layout) };
    }
}
