//! Four-level address spaces.
//!
//! An [`AddressSpace`] owns a PML4 from the page-table pool. The upper half
//! (top-level entries 256..512) is the kernel's mapping prefix: every space
//! copies those entries from the kernel space, so lower-level kernel tables
//! are shared and kernel code stays mapped after any CR3 switch. The lower half
//! belongs to the process.
//!
//! Every mutation takes the space's own lock. Mutations of kernel addresses
//! also take the kernel-half lock, because the tables below the top level are
//! shared by all spaces.

use bitflags::bitflags;
use ksync::IrqSpinlock;

use crate::{
    AddressTranslator, FrameError, FrameUsage, MemoryManager, PAGE_SIZE, PageEntry, PageFlags,
    PageTable, PhysicalAddress, PoolError, VirtualAddress,
    arch::{self, ENTRIES_PER_TABLE, KERNEL_HALF_START, PAGE_TABLE_LEVELS, level_span},
};

/// Lowest address handed out to user mappings; page zero stays unmapped.
pub const USER_SPACE_START: VirtualAddress = VirtualAddress::new(0x1000);

/// Exclusive upper bound of user mappings (the last user page is a guard).
pub const USER_SPACE_END: VirtualAddress = VirtualAddress::new(0x0000_7FFF_FFFF_F000);

bitflags! {
    /// Which halves of the top-level table [`AddressSpace::clone_from`] copies.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct CloneFlags: u32 {
        const KERNEL = 1;
        const USER = 1 << 1;
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    #[error("page-table pool exhausted")]
    OutOfTables,
    #[error("physical memory exhausted")]
    OutOfFrames,
    #[error("no free virtual range of {0} pages")]
    NoFreeRange(usize),
    #[error("{0} is not mapped")]
    NotMapped(VirtualAddress),
}

impl From<PoolError> for MapError {
    fn from(_: PoolError) -> Self {
        Self::OutOfTables
    }
}

impl From<FrameError> for MapError {
    fn from(_: FrameError) -> Self {
        Self::OutOfFrames
    }
}

/// Outcome of walking towards the leaf for one address without creating tables.
enum Walk<'t> {
    Leaf(&'t mut PageEntry),
    Huge { entry: PageEntry, level: usize },
    Missing { level: usize },
}

/// # Safety
///
/// `phys` must be a live page-table node and the caller must hold the lock
/// that protects it.
unsafe fn table_mut<'t>(phys: PhysicalAddress) -> &'t mut PageTable {
    unsafe { &mut *AddressTranslator::current().phys_to_ptr::<PageTable>(phys) }
}

fn present_address(entry: &PageEntry) -> PhysicalAddress {
    match entry.address() {
        Some(address) => address,
        None => unreachable!("entry checked present"),
    }
}

pub struct AddressSpace {
    root: PhysicalAddress,
    /// Whether the lower-half tables belong to this space (false when they are
    /// shared with another space or owned by the loader).
    owns_user: bool,
    lock: IrqSpinlock<()>,
}

impl AddressSpace {
    /// Creates an empty address space with a fresh root from the pool.
    pub fn new(mm: &MemoryManager) -> Result<Self, MapError> {
        let root = mm.pool().pool_alloc()?;
        Ok(Self {
            root,
            owns_user: true,
            lock: IrqSpinlock::new(()),
        })
    }

    /// Adopts page tables built by someone else, such as the boot loader.
    ///
    /// The adopted space never frees anything in [`destroy`](Self::destroy)
    /// except a pool-owned root.
    ///
    /// # Safety
    ///
    /// `root` must be a valid PML4 reachable through the direct map.
    pub unsafe fn from_root(root: PhysicalAddress) -> Self {
        Self {
            root,
            owns_user: false,
            lock: IrqSpinlock::new(()),
        }
    }

    /// The value loaded into CR3 when this space is active.
    pub fn root(&self) -> PhysicalAddress {
        self.root
    }

    /// # Safety
    ///
    /// The space must map the currently executing code, stack and the direct map.
    pub unsafe fn activate(&self) {
        unsafe { arch::activate(self.root) };
    }

    pub fn is_active(&self) -> bool {
        arch::active_root() == self.root
    }

    /// Maps one 4 KiB page, creating intermediate tables from the pool.
    ///
    /// # Panics
    ///
    /// Panics if either address is not page-aligned, if `virt` is already
    /// mapped, or if a new top-level kernel entry would be needed after the
    /// kernel half was sealed.
    pub fn map_single(
        &self,
        mm: &MemoryManager,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        flags: PageFlags,
        usage: FrameUsage,
    ) -> Result<(), MapError> {
        assert!(virt.is_page_aligned(), "virtual address {virt} is not page-aligned");
        assert!(phys.is_page_aligned(), "physical address {phys} is not page-aligned");

        let _space = self.lock.lock();
        let kernel = virt.is_kernel().then(|| mm.kernel_half());
        let sealed = kernel.as_ref().is_some_and(|k| k.sealed);

        let entry = self.leaf_or_create(mm, virt, sealed)?;
        if entry.is_present() {
            panic!("{virt} is already mapped to {:?}", entry.address());
        }
        *entry = PageEntry::leaf(phys, flags, usage);
        log::trace!("map {virt} -> {phys} ({usage:?})");
        Ok(())
    }

    /// Allocates fresh frames and maps them at `virt..virt + pages * PAGE_SIZE`.
    ///
    /// On failure the pages mapped so far are unmapped and freed again.
    pub fn map_anonymous(
        &self,
        mm: &MemoryManager,
        virt: VirtualAddress,
        pages: usize,
        flags: PageFlags,
        usage: FrameUsage,
    ) -> Result<(), MapError> {
        for page in 0..pages {
            let frame = match mm.alloc_frame() {
                Ok(frame) => frame,
                Err(err) => {
                    self.unmap_range(mm, virt, page * PAGE_SIZE);
                    return Err(err.into());
                }
            };
            // Zero-fill; user pages must not leak previous contents.
            // SAFETY: the frame was just allocated and is reachable through the direct map.
            unsafe {
                AddressTranslator::current()
                    .phys_to_ptr::<u8>(frame)
                    .write_bytes(0, PAGE_SIZE)
            };
            if let Err(err) = self.map_single(mm, virt + page * PAGE_SIZE, frame, flags, usage) {
                mm.free_frame(frame);
                self.unmap_range(mm, virt, page * PAGE_SIZE);
                return Err(err);
            }
        }
        Ok(())
    }

    /// Clears the leaf for `virt`, invalidates its TLB entry and returns the
    /// frame that was mapped. The caller decides whether to free it.
    ///
    /// # Panics
    ///
    /// Panics if `virt` lies inside a huge-page mapping.
    pub fn unmap_single(&self, mm: &MemoryManager, virt: VirtualAddress) -> Option<PhysicalAddress> {
        self.unmap_entry(mm, virt).and_then(|entry| entry.address())
    }

    /// Unmaps every page in `virt..virt + size`, freeing frames the mappings
    /// own. Returns the number of pages that were mapped.
    pub fn unmap_range(&self, mm: &MemoryManager, virt: VirtualAddress, size: usize) -> usize {
        let mut unmapped = 0;
        for offset in (0..size).step_by(PAGE_SIZE) {
            let Some(entry) = self.unmap_entry(mm, virt + offset) else {
                continue;
            };
            unmapped += 1;
            if entry.usage().owns_frame() {
                mm.free_frame(present_address(&entry));
            }
        }
        unmapped
    }

    fn unmap_entry(&self, mm: &MemoryManager, virt: VirtualAddress) -> Option<PageEntry> {
        assert!(virt.is_page_aligned(), "virtual address {virt} is not page-aligned");
        let _space = self.lock.lock();
        let _kernel = virt.is_kernel().then(|| mm.kernel_half());

        match self.walk(virt) {
            Walk::Leaf(entry) if entry.is_present() => {
                let old = *entry;
                entry.clear();
                arch::flush(virt);
                log::trace!("unmap {virt}");
                Some(old)
            }
            Walk::Huge { .. } => panic!("cannot unmap {virt} inside a huge page"),
            _ => None,
        }
    }

    /// Performs the MMU walk for `virt`.
    pub fn translate(&self, virt: VirtualAddress) -> Option<PhysicalAddress> {
        let _space = self.lock.lock();
        match self.walk(virt.align_down(PAGE_SIZE)) {
            Walk::Leaf(entry) => entry.address().map(|frame| frame + virt.page_offset()),
            Walk::Huge { entry, level } => entry
                .address()
                .map(|frame| frame + (virt.as_usize() & (level_span(level) - 1))),
            Walk::Missing { .. } => None,
        }
    }

    /// Returns the leaf entry for a page, if it is mapped.
    pub fn lookup(&self, virt: VirtualAddress) -> Option<PageEntry> {
        let _space = self.lock.lock();
        match self.walk(virt.align_down(PAGE_SIZE)) {
            Walk::Leaf(entry) if entry.is_present() => Some(*entry),
            Walk::Huge { entry, .. } => Some(entry),
            _ => None,
        }
    }

    /// Finds the lowest run of `pages` unmapped pages inside `[low, high)`.
    ///
    /// Unpopulated subtrees are skipped whole, so scanning a sparse half of
    /// the address space costs a handful of walks.
    ///
    /// # Panics
    ///
    /// Panics if `pages` is zero.
    pub fn find_free_range(
        &self,
        low: VirtualAddress,
        high: VirtualAddress,
        pages: usize,
    ) -> Result<VirtualAddress, MapError> {
        assert!(pages > 0, "cannot search for an empty range");
        let needed = pages
            .checked_mul(PAGE_SIZE)
            .ok_or(MapError::NoFreeRange(pages))?;
        let high = high.as_usize();
        let _space = self.lock.lock();

        let mut cursor = low.align_up(PAGE_SIZE).as_usize();
        let mut run_start = cursor;
        while cursor < high {
            if cursor - run_start >= needed {
                break;
            }
            if !arch::validate_virtual(cursor) {
                // Jump the non-canonical hole; a run cannot span it.
                cursor = arch::canonicalize_virtual(1 << 47);
                run_start = cursor;
                continue;
            }
            let (mapped, span) = match self.walk(VirtualAddress::new(cursor)) {
                Walk::Leaf(entry) => (entry.is_present(), PAGE_SIZE),
                Walk::Huge { level, .. } => (true, level_span(level)),
                Walk::Missing { level } => (false, level_span(level)),
            };
            cursor = (cursor & !(span - 1)).checked_add(span).unwrap_or(usize::MAX);
            if mapped {
                run_start = cursor;
            }
        }

        if cursor.min(high).saturating_sub(run_start) >= needed {
            Ok(VirtualAddress::new(run_start))
        } else {
            Err(MapError::NoFreeRange(pages))
        }
    }

    /// Creates a new space whose top-level table copies the halves of `src`
    /// selected by `flags`. Lower-level tables are shared, not copied.
    pub fn clone_from(
        mm: &MemoryManager,
        src: &AddressSpace,
        flags: CloneFlags,
    ) -> Result<Self, MapError> {
        let root = mm.pool().pool_alloc()?;
        let _src = src.lock.lock();
        // SAFETY: `root` is a fresh pool page and `src` is locked.
        let (dst_table, src_table) = unsafe { (table_mut(root), table_mut(src.root)) };
        if flags.contains(CloneFlags::KERNEL) {
            for index in KERNEL_HALF_START..ENTRIES_PER_TABLE {
                dst_table[index] = src_table[index];
            }
        }
        if flags.contains(CloneFlags::USER) {
            for index in 0..KERNEL_HALF_START {
                dst_table[index] = src_table[index];
            }
        }
        Ok(Self {
            root,
            owns_user: !flags.contains(CloneFlags::USER),
            lock: IrqSpinlock::new(()),
        })
    }

    /// Duplicates `src` for a forked process: the kernel half is shared, the
    /// user half is copied table by table, and every private frame is copied
    /// into a new frame. Shared and device frames stay shared.
    ///
    /// On exhaustion everything allocated for the child is released again.
    pub fn fork(mm: &MemoryManager, src: &AddressSpace) -> Result<Self, MapError> {
        let child = Self::clone_from(mm, src, CloneFlags::KERNEL)?;
        let result = {
            let _src = src.lock.lock();
            // SAFETY: both roots are live; `src` is locked and `child` is not
            // yet visible to anyone else.
            let (src_root, child_root) = unsafe { (table_mut(src.root), table_mut(child.root)) };
            copy_user_tables(mm, src_root, child_root, PAGE_TABLE_LEVELS - 1, KERNEL_HALF_START)
        };
        match result {
            Ok(()) => Ok(child),
            Err(err) => {
                child.destroy(mm);
                Err(err)
            }
        }
    }

    /// Releases the space: user-half tables and the frames they own go back
    /// to the allocators, then the root returns to the pool. Kernel-half
    /// tables are shared and never freed here.
    pub fn destroy(self, mm: &MemoryManager) {
        let _space = self.lock.lock();
        if self.owns_user {
            // SAFETY: the space is being consumed and is locked.
            let root = unsafe { table_mut(self.root) };
            for index in 0..KERNEL_HALF_START {
                let entry = root[index];
                if entry.is_present() && !entry.is_huge() {
                    free_tables(mm, present_address(&entry), PAGE_TABLE_LEVELS - 2);
                }
                root[index].clear();
            }
        }
        let mut pool = mm.pool();
        if pool.contains(self.root) {
            pool.pool_free(self.root);
        }
    }

    /// Copies `data` into this space at `virt`, page by page through the direct map.
    pub fn write_bytes(&self, virt: VirtualAddress, data: &[u8]) -> Result<(), MapError> {
        self.copy_pages(virt, data.len(), |phys, offset, len| {
            let dst = AddressTranslator::current().phys_to_ptr::<u8>(phys);
            // SAFETY: `phys..phys + len` lies within one mapped frame.
            unsafe { dst.copy_from_nonoverlapping(data[offset..].as_ptr(), len) };
        })
    }

    /// Copies bytes out of this space at `virt` into `buf`.
    pub fn read_bytes(&self, virt: VirtualAddress, buf: &mut [u8]) -> Result<(), MapError> {
        let len = buf.len();
        self.copy_pages(virt, len, |phys, offset, chunk| {
            let src = AddressTranslator::current().phys_to_ptr::<u8>(phys);
            // SAFETY: `phys..phys + chunk` lies within one mapped frame.
            unsafe { src.copy_to_nonoverlapping(buf[offset..].as_mut_ptr(), chunk) };
        })
    }

    fn copy_pages(
        &self,
        virt: VirtualAddress,
        len: usize,
        mut copy: impl FnMut(PhysicalAddress, usize, usize),
    ) -> Result<(), MapError> {
        // Validate the whole range first so a failed copy has no partial effect.
        let mut offset = 0;
        let mut chunks = alloc::vec::Vec::new();
        while offset < len {
            let here = virt.checked_add(offset).ok_or(MapError::NotMapped(virt))?;
            let chunk = (PAGE_SIZE - here.page_offset()).min(len - offset);
            let phys = self.translate(here).ok_or(MapError::NotMapped(here))?;
            chunks.push((phys, offset, chunk));
            offset += chunk;
        }
        for (phys, offset, chunk) in chunks {
            copy(phys, offset, chunk);
        }
        Ok(())
    }

    fn walk(&self, virt: VirtualAddress) -> Walk<'_> {
        // SAFETY: callers hold `self.lock`.
        let mut table = unsafe { table_mut(self.root) };
        for level in (1..PAGE_TABLE_LEVELS).rev() {
            let entry = table[virt.page_index(level)];
            if !entry.is_present() {
                return Walk::Missing { level };
            }
            if entry.is_huge() {
                return Walk::Huge { entry, level };
            }
            // SAFETY: present non-huge entries point at page-table nodes.
            table = unsafe { table_mut(present_address(&entry)) };
        }
        Walk::Leaf(&mut table[virt.page_index(0)])
    }

    fn leaf_or_create(
        &self,
        mm: &MemoryManager,
        virt: VirtualAddress,
        kernel_sealed: bool,
    ) -> Result<&mut PageEntry, MapError> {
        // SAFETY: callers hold `self.lock` (and the kernel-half lock for kernel addresses).
        let mut table = unsafe { table_mut(self.root) };
        for level in (1..PAGE_TABLE_LEVELS).rev() {
            let entry = &mut table[virt.page_index(level)];
            if !entry.is_present() {
                if level == PAGE_TABLE_LEVELS - 1 && virt.is_kernel() && kernel_sealed {
                    panic!("new top-level kernel table needed for {virt} after the kernel half was sealed");
                }
                let page = mm.pool().pool_alloc()?;
                *entry = PageEntry::table(page, virt.is_user());
            } else if entry.is_huge() {
                panic!("{virt} lies inside a huge page mapping");
            }
            // SAFETY: the entry points at a page-table node, possibly just created.
            table = unsafe { table_mut(present_address(entry)) };
        }
        Ok(&mut table[virt.page_index(0)])
    }
}

impl core::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("root", &self.root)
            .field("owns_user", &self.owns_user)
            .finish()
    }
}

/// Copies entries `0..limit` of `src` (a table at `level`) into `dst`.
///
/// New child tables are linked into `dst` before being filled, so a failure
/// part-way leaves everything reachable for the caller's teardown.
fn copy_user_tables(
    mm: &MemoryManager,
    src: &PageTable,
    dst: &mut PageTable,
    level: usize,
    limit: usize,
) -> Result<(), MapError> {
    for index in 0..limit {
        let entry = src[index];
        if !entry.is_present() {
            continue;
        }
        if level == 0 {
            dst[index] = copy_leaf(mm, entry)?;
        } else if entry.is_huge() {
            dst[index] = entry;
        } else {
            let table = mm.pool().pool_alloc()?;
            dst[index] = PageEntry::table(table, true);
            // SAFETY: `entry` is a live table of the locked source; `table`
            // is a fresh pool page owned by the child.
            let (src_child, dst_child) =
                unsafe { (table_mut(present_address(&entry)), table_mut(table)) };
            copy_user_tables(mm, src_child, dst_child, level - 1, ENTRIES_PER_TABLE)?;
        }
    }
    Ok(())
}

fn copy_leaf(mm: &MemoryManager, entry: PageEntry) -> Result<PageEntry, MapError> {
    let usage = entry.usage();
    if !usage.copied_on_fork() {
        return Ok(entry);
    }
    let source = present_address(&entry);
    let frame = mm.alloc_frame()?;
    let translator = AddressTranslator::current();
    // SAFETY: both frames are distinct, fully mapped through the direct map.
    unsafe {
        translator
            .phys_to_ptr::<u8>(frame)
            .copy_from_nonoverlapping(translator.phys_to_ptr::<u8>(source), PAGE_SIZE);
    }
    let flags = entry.flags() - PageFlags::ACCESSED - PageFlags::DIRTY;
    Ok(PageEntry::leaf(frame, flags, usage))
}

/// Frees the table at `table` (one level below the PML4 at `level + 1`) and
/// everything below it.
fn free_tables(mm: &MemoryManager, table: PhysicalAddress, level: usize) {
    // SAFETY: the owning space is locked and being destroyed.
    let node = unsafe { table_mut(table) };
    for (_, entry) in node.iter() {
        if !entry.is_present() {
            continue;
        }
        if level == 0 {
            if entry.usage().owns_frame() {
                mm.free_frame(present_address(&entry));
            }
        } else if !entry.is_huge() {
            free_tables(mm, present_address(&entry), level - 1);
        }
    }
    mm.pool().pool_free(table);
}
