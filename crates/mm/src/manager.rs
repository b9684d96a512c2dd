//! The memory-management context shared by every address space.

use ksync::{IrqSpinlock, IrqSpinlockGuard};

use crate::{FrameAllocator, FrameError, PageTablePool, PhysicalAddress};

/// Owns the physical allocators and the kernel-half write lock.
///
/// Lock order, outermost first: an address space's own lock, the kernel-half
/// lock, the page-table pool, the frame allocator.
pub struct MemoryManager {
    frames: IrqSpinlock<FrameAllocator>,
    pool: IrqSpinlock<PageTablePool>,
    kernel_half: IrqSpinlock<KernelHalf>,
}

/// State of the shared upper-half mappings.
pub(crate) struct KernelHalf {
    /// Once set, no new top-level kernel entry may be created: existing
    /// address spaces copied the top level and would never see it.
    pub(crate) sealed: bool,
}

impl MemoryManager {
    pub fn new(frames: FrameAllocator, pool: PageTablePool) -> Self {
        Self {
            frames: IrqSpinlock::new(frames),
            pool: IrqSpinlock::new(pool),
            kernel_half: IrqSpinlock::new(KernelHalf { sealed: false }),
        }
    }

    pub fn alloc_frame(&self) -> Result<PhysicalAddress, FrameError> {
        self.frames.lock().alloc_page()
    }

    pub fn alloc_contiguous(&self, count: usize) -> Result<PhysicalAddress, FrameError> {
        self.frames.lock().alloc_contiguous(count)
    }

    /// # Panics
    ///
    /// Panics on a double free or a frame outside the tracked region.
    pub fn free_frame(&self, frame: PhysicalAddress) {
        self.frames.lock().free(frame);
    }

    pub fn frames(&self) -> IrqSpinlockGuard<'_, FrameAllocator> {
        self.frames.lock()
    }

    pub fn pool(&self) -> IrqSpinlockGuard<'_, PageTablePool> {
        self.pool.lock()
    }

    /// Forbids creating new top-level kernel entries from now on.
    pub fn seal_kernel_half(&self) {
        self.kernel_half.lock().sealed = true;
        log::debug!("kernel half sealed");
    }

    pub fn is_kernel_half_sealed(&self) -> bool {
        self.kernel_half.lock().sealed
    }

    pub(crate) fn kernel_half(&self) -> IrqSpinlockGuard<'_, KernelHalf> {
        self.kernel_half.lock()
    }
}
