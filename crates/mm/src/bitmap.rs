//! One-bit-per-page allocation bitmap.
//!
//! This is the shared core of the physical frame allocator and the page-table
//! pool. A set bit means "allocated". Allocation policy is part of the
//! contract because tests and boot logs depend on a reproducible order:
//!
//! - single pages are taken by scanning forward from a hint (one past the last
//!   page handed out) to the end, then wrapping to the start;
//! - runs are found by a linear scan from the start that, on hitting a set bit
//!   inside a candidate run, resumes immediately past that bit.
//!
//! Scans step over fully-allocated 64-bit words at once.

use alloc::boxed::Box;
use alloc::vec;

const WORD_BITS: usize = u64::BITS as usize;

pub struct PageBitmap {
    words: Box<[u64]>,
    len: usize,
    allocated: usize,
    hint: usize,
}

impl PageBitmap {
    /// Creates a bitmap of `len` pages, all free.
    pub fn new_free(len: usize) -> Self {
        let mut bitmap = Self {
            words: vec![0u64; len.div_ceil(WORD_BITS)].into_boxed_slice(),
            len,
            allocated: 0,
            hint: 0,
        };
        bitmap.seal_tail();
        bitmap
    }

    /// Creates a bitmap of `len` pages, all allocated.
    pub fn new_allocated(len: usize) -> Self {
        Self {
            words: vec![u64::MAX; len.div_ceil(WORD_BITS)].into_boxed_slice(),
            len,
            allocated: len,
            hint: 0,
        }
    }

    // Bits past `len` in the last word stay set so scans never return them.
    fn seal_tail(&mut self) {
        let tail = self.len % WORD_BITS;
        if tail != 0 {
            if let Some(last) = self.words.last_mut() {
                *last |= !((1u64 << tail) - 1);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn allocated(&self) -> usize {
        self.allocated
    }

    pub fn free(&self) -> usize {
        self.len - self.allocated
    }

    pub fn hint(&self) -> usize {
        self.hint
    }

    pub fn is_set(&self, index: usize) -> bool {
        assert!(index < self.len, "bitmap index {index} out of range");
        self.words[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }

    /// Marks `index` allocated. Returns `false` if it already was.
    pub fn set(&mut self, index: usize) -> bool {
        if self.is_set(index) {
            return false;
        }
        self.words[index / WORD_BITS] |= 1 << (index % WORD_BITS);
        self.allocated += 1;
        true
    }

    /// Marks `index` free. Returns `false` if it already was.
    pub fn clear(&mut self, index: usize) -> bool {
        if !self.is_set(index) {
            return false;
        }
        self.words[index / WORD_BITS] &= !(1 << (index % WORD_BITS));
        self.allocated -= 1;
        true
    }

    pub fn set_range(&mut self, start: usize, count: usize) {
        for index in start..(start + count).min(self.len) {
            self.set(index);
        }
    }

    pub fn clear_range(&mut self, start: usize, count: usize) {
        for index in start..(start + count).min(self.len) {
            self.clear(index);
        }
    }

    /// First clear bit in `from..end`.
    fn next_clear(&self, from: usize, end: usize) -> Option<usize> {
        let mut index = from;
        while index < end {
            let word = index / WORD_BITS;
            let below = (1u64 << (index % WORD_BITS)) - 1;
            let bits = self.words[word] | below;
            if bits == u64::MAX {
                index = (word + 1) * WORD_BITS;
                continue;
            }
            let found = word * WORD_BITS + bits.trailing_ones() as usize;
            return (found < end).then_some(found);
        }
        None
    }

    /// First set bit in `from..end`.
    fn next_set(&self, from: usize, end: usize) -> Option<usize> {
        let mut index = from;
        while index < end {
            let word = index / WORD_BITS;
            let below = (1u64 << (index % WORD_BITS)) - 1;
            let bits = self.words[word] & !below;
            if bits == 0 {
                index = (word + 1) * WORD_BITS;
                continue;
            }
            let found = word * WORD_BITS + bits.trailing_zeros() as usize;
            return (found < end).then_some(found);
        }
        None
    }

    /// Allocates one page, scanning from the hint and wrapping around.
    pub fn claim_one(&mut self) -> Option<usize> {
        let start = self.hint.min(self.len);
        let index = self
            .next_clear(start, self.len)
            .or_else(|| self.next_clear(0, start))?;
        self.set(index);
        self.hint = if index + 1 == self.len { 0 } else { index + 1 };
        Some(index)
    }

    /// Allocates `count` consecutive pages, returning the first index.
    ///
    /// # Panics
    ///
    /// Panics if `count` is zero.
    pub fn claim_run(&mut self, count: usize) -> Option<usize> {
        assert!(count > 0, "cannot allocate an empty run");
        let mut cursor = 0;
        while let Some(start) = self.next_clear(cursor, self.len) {
            let end = start.checked_add(count)?;
            if end > self.len {
                return None;
            }
            match self.next_set(start, end) {
                // Nothing before `blocker` can start a long enough run.
                Some(blocker) => cursor = blocker + 1,
                None => {
                    self.set_range(start, count);
                    return Some(start);
                }
            }
        }
        None
    }
}

impl core::fmt::Debug for PageBitmap {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageBitmap")
            .field("len", &self.len)
            .field("allocated", &self.allocated)
            .field("hint", &self.hint)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claims_in_ascending_order_from_hint() {
        let mut bitmap = PageBitmap::new_free(8);
        assert_eq!(bitmap.claim_one(), Some(0));
        assert_eq!(bitmap.claim_one(), Some(1));
        assert_eq!(bitmap.hint(), 2);
    }

    #[test]
    fn wraps_around_to_freed_pages() {
        let mut bitmap = PageBitmap::new_free(4);
        for expected in 0..4 {
            assert_eq!(bitmap.claim_one(), Some(expected));
        }
        assert_eq!(bitmap.claim_one(), None);
        bitmap.clear(1);
        assert_eq!(bitmap.claim_one(), Some(1));
    }

    #[test]
    fn hint_skips_earlier_free_pages_until_wrap() {
        let mut bitmap = PageBitmap::new_free(6);
        for _ in 0..3 {
            bitmap.claim_one();
        }
        bitmap.clear(0);
        assert_eq!(bitmap.claim_one(), Some(3));
        assert_eq!(bitmap.claim_one(), Some(4));
        assert_eq!(bitmap.claim_one(), Some(5));
        assert_eq!(bitmap.claim_one(), Some(0));
    }

    #[test]
    fn tail_bits_are_never_returned() {
        let mut bitmap = PageBitmap::new_free(70);
        let claimed: Vec<_> = core::iter::from_fn(|| bitmap.claim_one()).collect();
        assert_eq!(claimed.len(), 70);
        assert_eq!(bitmap.free(), 0);
    }

    #[test]
    fn run_restarts_past_blocking_bit() {
        let mut bitmap = PageBitmap::new_free(16);
        bitmap.set(2);
        bitmap.set(6);
        assert_eq!(bitmap.claim_run(4), Some(7));
        assert!((7..11).all(|i| bitmap.is_set(i)));
        assert_eq!(bitmap.claim_run(2), Some(0));
        assert_eq!(bitmap.claim_run(3), Some(3));
    }

    #[test]
    fn run_crossing_word_boundary() {
        let mut bitmap = PageBitmap::new_free(200);
        bitmap.set_range(0, 60);
        assert_eq!(bitmap.claim_run(10), Some(60));
        assert_eq!(bitmap.allocated(), 70);
    }

    #[test]
    fn run_too_long_fails() {
        let mut bitmap = PageBitmap::new_free(8);
        bitmap.set(4);
        assert_eq!(bitmap.claim_run(5), None);
        assert_eq!(bitmap.allocated(), 1);
    }

    #[test]
    fn set_and_clear_report_state_changes() {
        let mut bitmap = PageBitmap::new_allocated(10);
        assert!(bitmap.clear(3));
        assert!(!bitmap.clear(3));
        assert!(bitmap.set(3));
        assert!(!bitmap.set(3));
        assert_eq!(bitmap.allocated(), 10);
    }
}
