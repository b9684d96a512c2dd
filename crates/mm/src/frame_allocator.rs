//! Physical page-frame allocator.
//!
//! Tracks every 4 KiB frame below the tracking window with one bit. Frames the
//! firmware does not report as usable, and everything below the reserved
//! prefix (kernel image and page-table pool), are permanently allocated.

use crate::{BootMemoryRegion, PAGE_SIZE, PhysicalAddress, bitmap::PageBitmap};

/// Highest physical address (exclusive) the allocator tracks.
pub const TRACKING_WINDOW: usize = 4 * 1024 * 1024 * 1024;

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("no free physical frame")]
    Exhausted,
    #[error("no run of {0} contiguous free physical frames")]
    NoContiguousRun(usize),
}

pub struct FrameAllocator {
    bitmap: PageBitmap,
    reserved_end: PhysicalAddress,
    initially_free: usize,
}

impl FrameAllocator {
    /// Builds the allocator from the firmware memory map.
    ///
    /// `reserved_end` is the end of the kernel image plus the page-table pool;
    /// no frame below it is ever handed out.
    pub fn new<R: BootMemoryRegion>(regions: &[R], reserved_end: PhysicalAddress) -> Self {
        let top = regions
            .iter()
            .filter(|r| r.is_usable())
            .map(|r| r.end().as_usize())
            .max()
            .unwrap_or(0)
            .min(TRACKING_WINDOW);
        let frames = top / PAGE_SIZE;

        let mut bitmap = PageBitmap::new_allocated(frames);
        for region in regions.iter().filter(|r| r.is_usable()) {
            // Only whole frames inside the region are usable.
            let first = region.base().align_up(PAGE_SIZE).frame_index();
            let last = region.end().as_usize().min(top) / PAGE_SIZE;
            if last > first {
                bitmap.clear_range(first, last - first);
            }
        }
        let reserved_frames = reserved_end.align_up(PAGE_SIZE).frame_index();
        bitmap.set_range(0, reserved_frames);

        log::debug!(
            "frame allocator: {} frames tracked, {} free, reserved prefix ends at {}",
            frames,
            bitmap.free(),
            reserved_end
        );

        Self {
            initially_free: bitmap.free(),
            bitmap,
            reserved_end,
        }
    }

    /// Allocates one frame.
    pub fn alloc_page(&mut self) -> Result<PhysicalAddress, FrameError> {
        let index = self.bitmap.claim_one().ok_or(FrameError::Exhausted)?;
        log::trace!("alloc frame {:#x}", index * PAGE_SIZE);
        Ok(PhysicalAddress::from_frame_index(index))
    }

    /// Allocates `count` physically contiguous frames.
    ///
    /// # Panics
    ///
    /// Panics if `count` is zero.
    pub fn alloc_contiguous(&mut self, count: usize) -> Result<PhysicalAddress, FrameError> {
        let index = self
            .bitmap
            .claim_run(count)
            .ok_or(FrameError::NoContiguousRun(count))?;
        Ok(PhysicalAddress::from_frame_index(index))
    }

    /// Returns a frame to the allocator.
    ///
    /// # Panics
    ///
    /// Panics if `frame` is unaligned, outside the tracked range, inside the
    /// reserved prefix, or not currently allocated.
    pub fn free(&mut self, frame: PhysicalAddress) {
        let index = self.checked_index(frame);
        if !self.bitmap.clear(index) {
            panic!("double free of physical frame {frame}");
        }
        log::trace!("free frame {frame}");
    }

    pub fn free_contiguous(&mut self, base: PhysicalAddress, count: usize) {
        for i in 0..count {
            self.free(base + i * PAGE_SIZE);
        }
    }

    /// Permanently marks a usable range as allocated, e.g. firmware tables or
    /// the application-processor trampoline.
    pub fn reserve(&mut self, base: PhysicalAddress, size: usize) {
        let first = base.align_down(PAGE_SIZE).frame_index();
        let last = (base + size).align_up(PAGE_SIZE).frame_index().min(self.bitmap.len());
        for index in first..last {
            if self.bitmap.set(index) {
                self.initially_free -= 1;
            }
        }
    }

    pub fn is_allocated(&self, frame: PhysicalAddress) -> bool {
        let index = frame.frame_index();
        index >= self.bitmap.len() || self.bitmap.is_set(index)
    }

    pub fn free_frames(&self) -> usize {
        self.bitmap.free()
    }

    /// Frames that were free after initialization and reservations.
    pub fn usable_frames(&self) -> usize {
        self.initially_free
    }

    pub fn tracked_frames(&self) -> usize {
        self.bitmap.len()
    }

    pub fn reserved_end(&self) -> PhysicalAddress {
        self.reserved_end
    }

    fn checked_index(&self, frame: PhysicalAddress) -> usize {
        if !frame.is_page_aligned() {
            panic!("free of unaligned physical address {frame}");
        }
        if frame < self.reserved_end || frame.frame_index() >= self.bitmap.len() {
            panic!("free of physical frame {frame} outside the tracked region");
        }
        frame.frame_index()
    }
}

impl core::fmt::Debug for FrameAllocator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FrameAllocator")
            .field("bitmap", &self.bitmap)
            .field("reserved_end", &self.reserved_end)
            .finish()
    }
}
