//! Kernel heap.
//!
//! A first-fit allocator over one fixed, pre-mapped virtual region. Every
//! block starts with a [`BlockHeader`]; headers form a doubly linked list in
//! address order that covers the region with no gaps. Blocks are split on
//! allocation and merged with free neighbours on free.
//!
//! The heap never reports corruption as an error. A bad magic value, a double
//! free or a pointer outside the region means the kernel can no longer trust
//! its own memory, so those all panic.

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull};

use ksync::{IrqSpinlock, IrqSpinlockGuard};

use crate::VirtualAddress;

/// Alignment and size granularity of every allocation.
pub const HEAP_ALIGN: usize = 16;

/// Seed of the pattern written over a fresh heap.
pub const FILL_SEED: u64 = 0x9E37_79B9_7F4A_7C15;

const MAGIC: u32 = 0x6B48_EA50;
const USED: u32 = 1;
const HEADER_SIZE: usize = core::mem::size_of::<BlockHeader>();

#[repr(C)]
struct BlockHeader {
    /// `MAGIC`, with the low bit set while the block is allocated.
    magic: u32,
    _reserved: u32,
    /// Payload bytes following the header.
    size: usize,
    prev: *mut BlockHeader,
    next: *mut BlockHeader,
}

impl BlockHeader {
    fn is_used(&self) -> bool {
        self.magic & USED != 0
    }

    fn payload(block: *mut BlockHeader) -> *mut u8 {
        block.cast::<u8>().wrapping_add(HEADER_SIZE)
    }
}

/// Summary produced by [`KernelHeap::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub blocks: usize,
    pub free_blocks: usize,
    pub free_bytes: usize,
    pub largest_free: usize,
}

/// One block as seen by [`KernelHeap::blocks`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockInfo {
    /// Offset of the header from the start of the heap.
    pub offset: usize,
    pub size: usize,
    pub used: bool,
}

pub struct KernelHeap {
    start: usize,
    end: usize,
    head: *mut BlockHeader,
    free_bytes: usize,
}

// The heap exclusively owns its region; callers serialise access.
unsafe impl Send for KernelHeap {}

impl KernelHeap {
    /// Takes over `size` bytes at `start`, fills them with a deterministic
    /// pseudo-random pattern and creates one free block spanning everything.
    ///
    /// # Safety
    ///
    /// The region must be mapped, writable, unused by anything else, and stay
    /// so for the lifetime of the heap.
    ///
    /// # Panics
    ///
    /// Panics if `start` is not 16-byte aligned or the region cannot hold a
    /// single minimal block.
    pub unsafe fn new(start: VirtualAddress, size: usize) -> Self {
        assert!(start.is_aligned(HEAP_ALIGN), "heap start must be 16-byte aligned");
        let size = size & !(HEAP_ALIGN - 1);
        assert!(size >= HEADER_SIZE + HEAP_ALIGN, "heap region too small");

        let base = start.as_mut_ptr::<u64>();
        let mut state = FILL_SEED;
        for word in 0..size / 8 {
            // xorshift64
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            // SAFETY: in bounds of the caller-provided region.
            unsafe { base.add(word).write(state) };
        }

        let head = start.as_mut_ptr::<BlockHeader>();
        // SAFETY: the region is large enough for a header and 16-byte aligned.
        unsafe {
            head.write(BlockHeader {
                magic: MAGIC,
                _reserved: 0,
                size: size - HEADER_SIZE,
                prev: ptr::null_mut(),
                next: ptr::null_mut(),
            });
        }

        log::debug!("kernel heap: {} KiB at {}", size / 1024, start);
        Self {
            start: start.as_usize(),
            end: start.as_usize() + size,
            head,
            free_bytes: size - HEADER_SIZE,
        }
    }

    /// Allocates `size` bytes (rounded up to 16) with first-fit placement.
    pub fn alloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        let need = size.max(1).checked_next_multiple_of(HEAP_ALIGN)?;
        let mut block = self.head;
        while !block.is_null() {
            self.verify(block);
            // SAFETY: verified above.
            let (used, available, next) =
                unsafe { ((*block).is_used(), (*block).size, (*block).next) };
            if !used && available >= need {
                if available - need >= HEADER_SIZE + HEAP_ALIGN {
                    self.split(block, need);
                    self.free_bytes -= need + HEADER_SIZE;
                } else {
                    self.free_bytes -= available;
                }
                // SAFETY: verified above; `split` only touched the tail.
                unsafe { (*block).magic |= USED };
                return NonNull::new(BlockHeader::payload(block));
            }
            block = next;
        }
        log::trace!("kernel heap: no block for {size} bytes");
        None
    }

    /// Frees a pointer returned by [`alloc`](Self::alloc).
    ///
    /// # Panics
    ///
    /// Panics if `ptr` is outside the heap, misaligned, has a corrupted
    /// header or is not currently allocated.
    pub fn free(&mut self, ptr: NonNull<u8>) {
        let addr = ptr.as_ptr() as usize;
        if addr < self.start + HEADER_SIZE || addr >= self.end {
            panic!("free of {addr:#x} outside the kernel heap");
        }
        if addr % HEAP_ALIGN != 0 {
            panic!("free of misaligned heap pointer {addr:#x}");
        }
        let block = (addr - HEADER_SIZE) as *mut BlockHeader;
        self.verify(block);
        // SAFETY: header verified above.
        let header = unsafe { &mut *block };
        if !header.is_used() {
            panic!("double free of heap block at {addr:#x}");
        }
        header.magic &= !USED;
        self.free_bytes += header.size;

        let next = header.next;
        if !next.is_null() && self.is_free(next) {
            self.merge(block, next);
        }
        let prev = header.prev;
        if !prev.is_null() && self.is_free(prev) {
            self.merge(prev, block);
        }
    }

    /// Payload bytes available in free blocks.
    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    pub fn size(&self) -> usize {
        self.end - self.start
    }

    /// Number of blocks, free and used.
    pub fn block_count(&self) -> usize {
        self.blocks().count()
    }

    pub fn contains(&self, ptr: *const u8) -> bool {
        (self.start..self.end).contains(&(ptr as usize))
    }

    pub fn blocks(&self) -> impl Iterator<Item = BlockInfo> + '_ {
        let mut block = self.head;
        core::iter::from_fn(move || {
            if block.is_null() {
                return None;
            }
            // SAFETY: chain pointers were written by this heap.
            let header = unsafe { &*block };
            let info = BlockInfo {
                offset: block as usize - self.start,
                size: header.size,
                used: header.is_used(),
            };
            block = header.next;
            Some(info)
        })
    }

    /// Walks the whole chain and checks every structural invariant.
    ///
    /// # Panics
    ///
    /// Panics on a bad magic value, a broken back link, a gap or overlap
    /// between blocks, two adjacent free blocks, or a free-byte count that
    /// does not match the chain.
    pub fn check(&self) -> HeapStats {
        let mut stats = HeapStats {
            blocks: 0,
            free_blocks: 0,
            free_bytes: 0,
            largest_free: 0,
        };
        let mut expected = self.start;
        let mut prev: *mut BlockHeader = ptr::null_mut();
        let mut prev_free = false;
        let mut block = self.head;
        while !block.is_null() {
            self.verify(block);
            // SAFETY: verified above.
            let header = unsafe { &*block };
            assert_eq!(block as usize, expected, "gap or overlap in heap block chain");
            assert_eq!(header.prev, prev, "broken back link in heap block chain");
            let free = !header.is_used();
            assert!(!(free && prev_free), "adjacent free heap blocks were not merged");
            stats.blocks += 1;
            if free {
                stats.free_blocks += 1;
                stats.free_bytes += header.size;
                stats.largest_free = stats.largest_free.max(header.size);
            }
            expected = block as usize + HEADER_SIZE + header.size;
            prev_free = free;
            prev = block;
            block = header.next;
        }
        assert_eq!(expected, self.end, "heap block chain does not cover the region");
        assert_eq!(stats.free_bytes, self.free_bytes, "heap free-byte count out of sync");
        stats
    }

    fn verify(&self, block: *mut BlockHeader) {
        let addr = block as usize;
        if addr < self.start || addr + HEADER_SIZE > self.end {
            panic!("heap block link {addr:#x} points outside the kernel heap");
        }
        // SAFETY: the header lies inside the heap region.
        let magic = unsafe { (*block).magic };
        if magic & !USED != MAGIC {
            panic!("corrupted heap block header at {addr:#x} (magic {magic:#x})");
        }
    }

    fn is_free(&self, block: *mut BlockHeader) -> bool {
        self.verify(block);
        // SAFETY: verified above.
        unsafe { !(*block).is_used() }
    }

    /// Cuts `block` down to `size` payload bytes, turning the rest into a new
    /// free block right after it.
    fn split(&mut self, block: *mut BlockHeader, size: usize) {
        // SAFETY: `block` is a verified free block with room for the split.
        unsafe {
            let rest = BlockHeader::payload(block).add(size).cast::<BlockHeader>();
            let next = (*block).next;
            rest.write(BlockHeader {
                magic: MAGIC,
                _reserved: 0,
                size: (*block).size - size - HEADER_SIZE,
                prev: block,
                next,
            });
            if !next.is_null() {
                (*next).prev = rest;
            }
            (*block).next = rest;
            (*block).size = size;
        }
    }

    /// Absorbs `second` (which directly follows `first`) into `first`.
    fn merge(&mut self, first: *mut BlockHeader, second: *mut BlockHeader) {
        // SAFETY: both are verified, adjacent, free blocks of this heap.
        unsafe {
            let after = (*second).next;
            (*first).size += HEADER_SIZE + (*second).size;
            (*first).next = after;
            if !after.is_null() {
                (*after).prev = first;
            }
            (*second).magic = 0;
        }
        self.free_bytes += HEADER_SIZE;
    }
}

/// The kernel heap behind an interrupt-safe lock, usable as `#[global_allocator]`.
pub struct LockedHeap {
    heap: IrqSpinlock<Option<KernelHeap>>,
}

impl LockedHeap {
    pub const fn empty() -> Self {
        Self {
            heap: IrqSpinlock::new(None),
        }
    }

    /// # Safety
    ///
    /// See [`KernelHeap::new`].
    ///
    /// # Panics
    ///
    /// Panics if the heap was already initialized.
    pub unsafe fn init(&self, start: VirtualAddress, size: usize) {
        let mut heap = self.heap.lock();
        assert!(heap.is_none(), "kernel heap already initialized");
        *heap = Some(unsafe { KernelHeap::new(start, size) });
    }

    pub fn lock(&self) -> IrqSpinlockGuard<'_, Option<KernelHeap>> {
        self.heap.lock()
    }
}

unsafe impl GlobalAlloc for LockedHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let mut guard = self.heap.lock();
        let Some(heap) = guard.as_mut() else {
            return ptr::null_mut();
        };
        if layout.align() <= HEAP_ALIGN {
            return heap.alloc(layout.size()).map_or(ptr::null_mut(), NonNull::as_ptr);
        }
        // Over-allocate and keep the block pointer just below the aligned address.
        let Some(block) = layout
            .size()
            .checked_add(layout.align())
            .and_then(|size| heap.alloc(size))
        else {
            return ptr::null_mut();
        };
        let raw = block.as_ptr() as usize;
        let aligned = (raw + layout.align()) & !(layout.align() - 1);
        // SAFETY: `aligned - 8 >= raw + 8`, inside the block.
        unsafe { ((aligned - 8) as *mut usize).write(raw) };
        aligned as *mut u8
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let mut guard = self.heap.lock();
        let Some(heap) = guard.as_mut() else {
            panic!("dealloc before the kernel heap was initialized");
        };
        let block = if layout.align() <= HEAP_ALIGN {
            ptr
        } else {
            // SAFETY: written by `alloc` for over-aligned layouts.
            unsafe { ((ptr as usize - 8) as *const usize).read() as *mut u8 }
        };
        match NonNull::new(block) {
            Some(block) => heap.free(block),
            None => panic!("dealloc of a null pointer"),
        }
    }
}
