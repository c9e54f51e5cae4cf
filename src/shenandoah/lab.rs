use super::{
    alloc_request::AllocKind,
    oop::{fill_with_filler, HEAP_WORD_SIZE, MIN_OBJECT_WORDS},
};

/// Thread local allocation buffer. Mutators allocate new objects from a TLAB, collector threads
/// and mutators evacuating through the write barrier copy into a GCLAB.
///
/// The buffer is a plain bump range carved out of one region. A retired buffer leaves a filler
/// object behind so that the region stays parseable.
pub struct ShenandoahLab {
    lab_start: usize,
    lab_cursor: usize,
    lab_end: usize,
    kind: AllocKind,
}

impl ShenandoahLab {
    pub const fn new(kind: AllocKind) -> Self {
        Self {
            lab_start: 0,
            lab_cursor: 0,
            lab_end: 0,
            kind,
        }
    }

    pub fn kind(&self) -> AllocKind {
        self.kind
    }

    pub fn is_active(&self) -> bool {
        self.lab_start != 0
    }

    pub fn start(&self) -> usize {
        self.lab_start
    }

    pub fn top(&self) -> usize {
        self.lab_cursor
    }

    pub fn end(&self) -> usize {
        self.lab_end
    }

    /// Remaining space in words.
    pub fn remaining(&self) -> usize {
        (self.lab_end - self.lab_cursor) / HEAP_WORD_SIZE
    }

    #[inline]
    pub fn allocate(&mut self, size_words: usize) -> Option<usize> {
        if self.lab_cursor == 0 {
            return None;
        }
        let size = size_words * HEAP_WORD_SIZE;
        let result = self.lab_cursor;
        if self.lab_end - result < size {
            return None;
        }
        self.lab_cursor = result + size;
        Some(result)
    }

    /// Rolls back the most recent allocation. Returns false if `addr` was not the last object
    /// bumped out of this buffer.
    pub fn undo_allocation(&mut self, addr: usize, size_words: usize) -> bool {
        if self.lab_cursor != 0 && addr + size_words * HEAP_WORD_SIZE == self.lab_cursor {
            self.lab_cursor = addr;
            true
        } else {
            false
        }
    }

    /// Starts bumping in `[start, start + size_words)`.
    pub fn fill(&mut self, start: usize, size_words: usize) {
        debug_assert!(!self.is_active(), "retire {} before refilling", self.kind.name());
        self.lab_start = start;
        self.lab_cursor = start;
        self.lab_end = start + size_words * HEAP_WORD_SIZE;
    }

    /// Plugs the unused tail with a filler object. With `retire` the buffer is dropped,
    /// otherwise it stays usable and the filler is overwritten by later allocations.
    pub fn make_parsable(&mut self, retire: bool) {
        if !self.is_active() {
            return;
        }
        let words = self.remaining();
        if words >= MIN_OBJECT_WORDS {
            unsafe {
                fill_with_filler(self.lab_cursor, words);
            }
        }
        if retire {
            self.reset();
        }
    }

    pub fn retire(&mut self) {
        self.make_parsable(true);
    }

    pub fn reset(&mut self) {
        self.lab_start = 0;
        self.lab_cursor = 0;
        self.lab_end = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shenandoah::oop::Oop;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_bump_and_undo() {
        let backing: Vec<AtomicUsize> = (0..64).map(|_| AtomicUsize::new(0)).collect();
        let start = backing.as_ptr() as usize;
        let mut lab = ShenandoahLab::new(AllocKind::Gclab);
        assert!(lab.allocate(2).is_none());
        lab.fill(start, 64);
        let a = lab.allocate(4).unwrap();
        let b = lab.allocate(8).unwrap();
        assert_eq!(a, start);
        assert_eq!(b, start + 4 * HEAP_WORD_SIZE);
        assert!(!lab.undo_allocation(a, 4));
        assert!(lab.undo_allocation(b, 8));
        assert_eq!(lab.remaining(), 60);
        assert!(lab.allocate(61).is_none());

        lab.retire();
        assert!(!lab.is_active());
        let filler = Oop::from_object_start(start + 4 * HEAP_WORD_SIZE);
        assert!(filler.is_filler());
        assert_eq!(filler.size_words(), 60);
    }
}
