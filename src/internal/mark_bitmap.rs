use core::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use memmap2::MmapMut;

use crate::{error::ConfigError, shenandoah::oop::HEAP_WORD_SIZE};

const BITS_PER_WORD: usize = usize::BITS as usize;

/// One mark bit per heap word over the whole reserved heap.
///
/// Bits are only ever set with a CAS loop, so concurrent markers racing for the same object agree
/// on a single winner. Clearing is done either at a safepoint or on ranges no marker looks at.
pub struct MarkBitmap {
    #[allow(dead_code)]
    mem_map: MmapMut,
    bitmap_begin: *const AtomicUsize,
    bitmap_words: usize,
    heap_begin: usize,
    heap_limit: usize,
    name: &'static str,
}

unsafe impl Send for MarkBitmap {}
unsafe impl Sync for MarkBitmap {}

impl MarkBitmap {
    pub fn create(
        name: &'static str,
        heap_begin: usize,
        heap_capacity: usize,
    ) -> Result<Self, ConfigError> {
        let bitmap_size = Self::compute_bitmap_size(heap_capacity);
        let mut mem_map =
            MmapMut::map_anon(bitmap_size).map_err(|_| ConfigError::ReserveFailed(bitmap_size))?;
        let bitmap_begin = mem_map.as_mut_ptr() as *const AtomicUsize;
        Ok(Self {
            mem_map,
            bitmap_begin,
            bitmap_words: bitmap_size / std::mem::size_of::<usize>(),
            heap_begin,
            heap_limit: heap_begin + heap_capacity,
            name,
        })
    }

    pub fn compute_bitmap_size(capacity: usize) -> usize {
        let bytes_covered_per_word = HEAP_WORD_SIZE * BITS_PER_WORD;
        crate::utils::align_usize(capacity, bytes_covered_per_word) / bytes_covered_per_word
            * std::mem::size_of::<usize>()
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[inline]
    pub fn heap_begin(&self) -> usize {
        self.heap_begin
    }

    #[inline]
    pub fn heap_limit(&self) -> usize {
        self.heap_limit
    }

    #[inline]
    pub fn has_address(&self, addr: usize) -> bool {
        addr >= self.heap_begin && addr < self.heap_limit
    }

    #[inline]
    fn word(&self, index: usize) -> &AtomicUsize {
        debug_assert!(index < self.bitmap_words, "bitmap index {} out of bounds", index);
        // The mapping is page aligned and lives as long as `self`.
        unsafe { &*self.bitmap_begin.add(index) }
    }

    #[inline]
    fn bit_offset(&self, addr: usize) -> usize {
        debug_assert!(self.has_address(addr), "Invalid heap address: {:#x}", addr);
        (addr - self.heap_begin) / HEAP_WORD_SIZE
    }

    #[inline]
    fn addr_of(&self, bit: usize) -> usize {
        self.heap_begin + bit * HEAP_WORD_SIZE
    }

    /// Sets the bit for `addr`. Returns the previous value of the bit.
    #[inline]
    pub fn atomic_test_and_set(&self, addr: usize) -> bool {
        let bit = self.bit_offset(addr);
        let entry = self.word(bit / BITS_PER_WORD);
        let mask = 1usize << (bit % BITS_PER_WORD);
        let mut old_word = entry.load(Ordering::Relaxed);
        loop {
            if (old_word & mask) != 0 {
                return true;
            }
            match entry.compare_exchange_weak(
                old_word,
                old_word | mask,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return false,
                Err(current) => old_word = current,
            }
        }
    }

    #[inline]
    pub fn test(&self, addr: usize) -> bool {
        let bit = self.bit_offset(addr);
        let mask = 1usize << (bit % BITS_PER_WORD);
        (self.word(bit / BITS_PER_WORD).load(Ordering::Acquire) & mask) != 0
    }

    #[inline]
    pub fn clear(&self, addr: usize) {
        let bit = self.bit_offset(addr);
        let mask = 1usize << (bit % BITS_PER_WORD);
        self.word(bit / BITS_PER_WORD)
            .fetch_and(!mask, Ordering::Relaxed);
    }

    /// Clears all bits for `[begin, end)`.
    pub fn clear_range(&self, begin: usize, end: usize) {
        if begin >= end {
            return;
        }
        let mut bit = self.bit_offset(begin);
        let end_bit = (end - self.heap_begin) / HEAP_WORD_SIZE;
        while bit < end_bit && bit % BITS_PER_WORD != 0 {
            self.word(bit / BITS_PER_WORD)
                .fetch_and(!(1usize << (bit % BITS_PER_WORD)), Ordering::Relaxed);
            bit += 1;
        }
        while bit + BITS_PER_WORD <= end_bit {
            self.word(bit / BITS_PER_WORD).store(0, Ordering::Relaxed);
            bit += BITS_PER_WORD;
        }
        while bit < end_bit {
            self.word(bit / BITS_PER_WORD)
                .fetch_and(!(1usize << (bit % BITS_PER_WORD)), Ordering::Relaxed);
            bit += 1;
        }
    }

    pub fn is_clear_range(&self, begin: usize, end: usize) -> bool {
        self.next_marked_addr(begin, end) >= end
    }

    /// Returns the first marked address in `[start, limit)`, or `limit` when there is none.
    pub fn next_marked_addr(&self, start: usize, limit: usize) -> usize {
        if start >= limit {
            return limit;
        }
        let mut bit = self.bit_offset(start);
        let end_bit = (limit - self.heap_begin + HEAP_WORD_SIZE - 1) / HEAP_WORD_SIZE;
        while bit < end_bit {
            let index = bit / BITS_PER_WORD;
            let shift = bit % BITS_PER_WORD;
            let word = self.word(index).load(Ordering::Acquire) >> shift;
            if word != 0 {
                let found = bit + word.trailing_zeros() as usize;
                return if found < end_bit {
                    self.addr_of(found).min(limit)
                } else {
                    limit
                };
            }
            bit = (index + 1) * BITS_PER_WORD;
        }
        limit
    }

    /// Visit marked bits in `[visit_begin, visit_end)`.
    ///
    /// NOTE: bits may change during the visit; each bitmap word is loaded once and then its set
    /// bits are reported.
    pub fn visit_marked_range(
        &self,
        visit_begin: usize,
        visit_end: usize,
        mut visitor: impl FnMut(usize),
    ) {
        if visit_begin >= visit_end {
            return;
        }
        let bit_start = self.bit_offset(visit_begin);
        let bit_end = (visit_end - self.heap_begin) / HEAP_WORD_SIZE;
        let index_start = bit_start / BITS_PER_WORD;
        let index_end = (bit_end + BITS_PER_WORD - 1) / BITS_PER_WORD;
        // Index(begin)  ...    Index(end)
        // [xxxxx???][........][????yyyy]
        //      ^                   ^
        //      |                   #---- Bit of visit_end
        //      #---- Bit of visit_begin
        for index in index_start..index_end {
            let mut w = self.word(index).load(Ordering::Acquire);
            if index == index_start {
                w &= !((1usize << (bit_start % BITS_PER_WORD)) - 1);
            }
            if index == index_end - 1 && bit_end % BITS_PER_WORD != 0 {
                w &= (1usize << (bit_end % BITS_PER_WORD)) - 1;
            }
            while w != 0 {
                let shift = w.trailing_zeros() as usize;
                visitor(self.addr_of(index * BITS_PER_WORD + shift));
                w ^= 1usize << shift;
            }
        }
    }
}

impl fmt::Debug for MarkBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[begin={:#x},end={:#x}]",
            self.name, self.heap_begin, self.heap_limit
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: usize = 0x1000_0000;

    #[test]
    fn test_mark_and_visit() {
        let bitmap = MarkBitmap::create("test", BASE, 1 << 20).unwrap();
        let addrs = [BASE + 8, BASE + 64 * 8, BASE + 64 * 8 + 8, BASE + 4096];
        for addr in addrs.iter() {
            assert!(!bitmap.atomic_test_and_set(*addr));
        }
        assert!(bitmap.atomic_test_and_set(BASE + 8));
        let mut seen = vec![];
        bitmap.visit_marked_range(BASE, BASE + 8192, |a| seen.push(a));
        assert_eq!(seen, addrs.to_vec());

        let mut partial = vec![];
        bitmap.visit_marked_range(BASE + 16, BASE + 64 * 8 + 8, |a| partial.push(a));
        assert_eq!(partial, vec![BASE + 64 * 8]);
    }

    #[test]
    fn test_next_marked_addr() {
        let bitmap = MarkBitmap::create("test", BASE, 1 << 20).unwrap();
        assert_eq!(bitmap.next_marked_addr(BASE, BASE + 4096), BASE + 4096);
        bitmap.atomic_test_and_set(BASE + 1000 * 8);
        assert_eq!(bitmap.next_marked_addr(BASE, BASE + 16384), BASE + 1000 * 8);
        assert_eq!(
            bitmap.next_marked_addr(BASE + 1001 * 8, BASE + 16384),
            BASE + 16384
        );
        assert_eq!(bitmap.next_marked_addr(BASE, BASE + 1000 * 8), BASE + 1000 * 8);
    }

    #[test]
    fn test_clear_range() {
        let bitmap = MarkBitmap::create("test", BASE, 1 << 20).unwrap();
        let mut addr = BASE;
        while addr < BASE + 2048 * 8 {
            bitmap.atomic_test_and_set(addr);
            addr += 8;
        }
        bitmap.clear_range(BASE + 8, BASE + 2000 * 8);
        assert!(bitmap.test(BASE));
        assert!(bitmap.is_clear_range(BASE + 8, BASE + 2000 * 8));
        assert!(bitmap.test(BASE + 2000 * 8));
        bitmap.clear(BASE);
        assert!(!bitmap.test(BASE));
    }
}
