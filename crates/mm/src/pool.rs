//! Page-table pool.
//!
//! A small pre-mapped region reserved for MMU nodes. It uses the same bitmap
//! policy as the frame allocator and zero-fills every page it hands out, since
//! the MMU would interpret stale bytes as live mappings.

use crate::{AddressTranslator, PAGE_SIZE, PhysicalAddress, bitmap::PageBitmap};

#[derive(Debug, Copy, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("page-table pool exhausted")]
    Exhausted,
}

#[derive(Debug)]
pub struct PageTablePool {
    bitmap: PageBitmap,
    base: PhysicalAddress,
}

impl PageTablePool {
    /// Manages the `pages` pages starting at `base`.
    ///
    /// # Panics
    ///
    /// Panics if `base` is not page-aligned.
    pub fn new(base: PhysicalAddress, pages: usize) -> Self {
        assert!(base.is_page_aligned(), "page-table pool must be page-aligned");
        log::debug!("page-table pool: {} pages at {}", pages, base);
        Self {
            bitmap: PageBitmap::new_free(pages),
            base,
        }
    }

    /// Allocates one zeroed page.
    pub fn pool_alloc(&mut self) -> Result<PhysicalAddress, PoolError> {
        let index = self.bitmap.claim_one().ok_or(PoolError::Exhausted)?;
        let page = self.base + index * PAGE_SIZE;
        let ptr = AddressTranslator::current().phys_to_ptr::<u8>(page);
        // SAFETY: the page lies in the pool region, which is mapped and owned
        // by the pool, and was just claimed so nothing else references it.
        unsafe { ptr.write_bytes(0, PAGE_SIZE) };
        Ok(page)
    }

    /// Returns a page to the pool.
    ///
    /// # Panics
    ///
    /// Panics if `page` is not a pool page or is not currently allocated.
    pub fn pool_free(&mut self, page: PhysicalAddress) {
        if !self.contains(page) || !page.is_page_aligned() {
            panic!("page {page} does not belong to the page-table pool");
        }
        if !self.bitmap.clear((page - self.base) / PAGE_SIZE) {
            panic!("double free of page-table page {page}");
        }
    }

    pub fn contains(&self, page: PhysicalAddress) -> bool {
        page >= self.base && page < self.end()
    }

    pub fn base(&self) -> PhysicalAddress {
        self.base
    }

    pub fn end(&self) -> PhysicalAddress {
        self.base + self.bitmap.len() * PAGE_SIZE
    }

    pub fn free_pages(&self) -> usize {
        self.bitmap.free()
    }

    pub fn capacity(&self) -> usize {
        self.bitmap.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(pages: usize) -> PageTablePool {
        AddressTranslator::set_current(AddressTranslator::emulated((pages + 1) * PAGE_SIZE));
        let base = AddressTranslator::current()
            .allocate(pages * PAGE_SIZE, PAGE_SIZE)
            .unwrap();
        PageTablePool::new(base, pages)
    }

    #[test]
    fn pages_are_zero_filled() {
        let mut pool = pool(1);
        let page = pool.pool_alloc().unwrap();
        let ptr = AddressTranslator::current().phys_to_ptr::<u8>(page);
        unsafe { ptr.write_bytes(0xAB, PAGE_SIZE) };
        pool.pool_free(page);

        let again = pool.pool_alloc().unwrap();
        assert_eq!(again, page);
        let bytes = unsafe { core::slice::from_raw_parts(ptr, PAGE_SIZE) };
        assert!(bytes.iter().all(|b| *b == 0));
    }

    #[test]
    fn exhaustion_is_reported() {
        let mut pool = pool(2);
        pool.pool_alloc().unwrap();
        pool.pool_alloc().unwrap();
        assert_eq!(pool.pool_alloc(), Err(PoolError::Exhausted));
    }

    #[test]
    #[should_panic(expected = "double free of page-table page")]
    fn double_free_panics() {
        let mut pool = pool(2);
        let page = pool.pool_alloc().unwrap();
        pool.pool_free(page);
        pool.pool_free(page);
    }

    #[test]
    #[should_panic(expected = "does not belong to the page-table pool")]
    fn foreign_page_panics() {
        let mut pool = pool(2);
        let end = pool.end();
        pool.pool_free(end);
    }
}
