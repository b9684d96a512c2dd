//! The interrupt vector map and the bitmap allocator for device vectors.

/// Legacy 8259 IRQs 0..16 land on fixed vectors starting here.
pub const LEGACY_VECTOR_BASE: u8 = 0x20;
pub const LEGACY_VECTORS: usize = 16;

/// Vectors handed out to I/O APIC routed lines.
pub const IRQ_VECTOR_BASE: u8 = 0x30;
pub const IRQ_VECTORS: usize = 32;

/// Vectors handed out to message-signalled interrupts.
pub const MSI_VECTOR_BASE: u8 = 0x50;
pub const MSI_VECTORS: usize = 16;

/// `int 0x80`, callable from ring 3.
pub const SYSCALL_VECTOR: u8 = 0x80;
/// `int 0x81`, ring 0 only: a thread giving up the CPU from kernel code.
pub const YIELD_VECTOR: u8 = 0x81;
pub const TIMER_VECTOR: u8 = 0xEF;
pub const SPURIOUS_VECTOR: u8 = 0xFF;

/// A free-bit map over at most 32 consecutive vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectorAllocator {
    base: u8,
    count: usize,
    used: u32,
}

impl VectorAllocator {
    pub const fn new(base: u8, count: usize) -> Self {
        assert!(count > 0 && count <= 32, "vector range must hold 1..=32 vectors");
        assert!(base as usize + count <= 256, "vector range exceeds the IDT");
        Self {
            base,
            count,
            used: 0,
        }
    }

    pub const fn base(&self) -> u8 {
        self.base
    }

    pub const fn contains(&self, vector: u8) -> bool {
        vector >= self.base && ((vector - self.base) as usize) < self.count
    }

    /// Lowest free vector, or `None` once all are taken.
    pub fn allocate(&mut self) -> Option<u8> {
        let free = !self.used & self.mask();
        if free == 0 {
            return None;
        }
        let bit = free.trailing_zeros();
        self.used |= 1 << bit;
        Some(self.base + bit as u8)
    }

    /// # Panics
    ///
    /// Panics if `vector` is outside the range or already free.
    pub fn free(&mut self, vector: u8) {
        assert!(self.contains(vector), "vector {vector:#x} is not managed by this allocator");
        let bit = 1 << (vector - self.base);
        assert!(self.used & bit != 0, "double free of interrupt vector {vector:#x}");
        self.used &= !bit;
    }

    pub fn is_allocated(&self, vector: u8) -> bool {
        self.contains(vector) && self.used & (1 << (vector - self.base)) != 0
    }

    pub fn available(&self) -> usize {
        (!self.used & self.mask()).count_ones() as usize
    }

    fn mask(&self) -> u32 {
        if self.count == 32 { u32::MAX } else { (1 << self.count) - 1 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranges_do_not_overlap() {
        assert_eq!(LEGACY_VECTOR_BASE as usize + LEGACY_VECTORS, IRQ_VECTOR_BASE as usize);
        assert_eq!(IRQ_VECTOR_BASE as usize + IRQ_VECTORS, MSI_VECTOR_BASE as usize);
        assert!(MSI_VECTOR_BASE as usize + MSI_VECTORS <= SYSCALL_VECTOR as usize);
    }

    #[test]
    fn allocates_lowest_first_until_exhausted() {
        let mut vectors = VectorAllocator::new(IRQ_VECTOR_BASE, IRQ_VECTORS);
        for i in 0..IRQ_VECTORS {
            assert_eq!(vectors.allocate(), Some(IRQ_VECTOR_BASE + i as u8));
        }
        assert_eq!(vectors.allocate(), None);
        assert_eq!(vectors.available(), 0);

        vectors.free(0x35);
        assert_eq!(vectors.allocate(), Some(0x35));
    }

    #[test]
    fn partial_ranges_respect_their_size() {
        let mut vectors = VectorAllocator::new(MSI_VECTOR_BASE, 3);
        assert_eq!(vectors.available(), 3);
        vectors.allocate();
        vectors.allocate();
        vectors.allocate();
        assert_eq!(vectors.allocate(), None);
        assert!(!vectors.contains(MSI_VECTOR_BASE + 3));
    }

    #[test]
    #[should_panic(expected = "double free of interrupt vector")]
    fn double_free_panics() {
        let mut vectors = VectorAllocator::new(IRQ_VECTOR_BASE, IRQ_VECTORS);
        let v = vectors.allocate().unwrap();
        vectors.free(v);
        vectors.free(v);
    }

    #[test]
    #[should_panic(expected = "not managed by this allocator")]
    fn foreign_vector_panics() {
        let mut vectors = VectorAllocator::new(IRQ_VECTOR_BASE, IRQ_VECTORS);
        vectors.free(0x20);
    }
}
