//! Heap object layout.
//!
//! ```text
//!  object start                     Oop
//!  v                                v
//!  +--------------------------------+------------------+-------------+-------------+
//!  | forwarding pointer (1 word)    | header (1 word)  | ref slots.. | data words..|
//!  +--------------------------------+------------------+-------------+-------------+
//! ```
//!
//! An [Oop] points at the header word. The forwarding word lives one word below it and
//! initially points back at the object itself. Sizes are counted in heap words and include the
//! forwarding word.
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use modular_bitfield::prelude::*;

use crate::utils::align_usize;

pub const HEAP_WORD_SIZE: usize = 8;
pub const LOG_HEAP_WORD_SIZE: usize = 3;
/// Objects start and end on this many words.
pub const OBJECT_ALIGNMENT_WORDS: usize = 2;
/// Forwarding word plus header word.
pub const OBJECT_HEADER_WORDS: usize = 2;
pub const MIN_OBJECT_WORDS: usize = OBJECT_HEADER_WORDS;
pub const MAX_REFS: usize = (1 << 24) - 1;

#[bitfield(bits = 64)]
#[derive(Clone, Copy)]
pub struct ObjectHeader {
    pub size: B32,
    pub refs: B24,
    pub filler: bool,
    #[skip]
    __: B7,
}

impl ObjectHeader {
    #[inline]
    fn to_word(self) -> usize {
        u64::from_le_bytes(self.into_bytes()) as usize
    }

    #[inline]
    fn from_word(word: usize) -> Self {
        Self::from_bytes((word as u64).to_le_bytes())
    }
}

/// Returns the heap word at `addr`.
///
/// Heap memory stays mapped for the lifetime of the heap, and every address reaching this
/// function has been produced by the allocator.
#[inline(always)]
pub(crate) fn word_at(addr: usize) -> &'static AtomicUsize {
    debug_assert!(
        addr != 0 && addr % HEAP_WORD_SIZE == 0,
        "misaligned heap word {:#x}",
        addr
    );
    unsafe { &*(addr as *const AtomicUsize) }
}

/// Size in words of an object with `refs` reference slots and `data` raw words.
pub fn object_size(refs: usize, data: usize) -> usize {
    align_usize(OBJECT_HEADER_WORDS + refs + data, OBJECT_ALIGNMENT_WORDS)
}

/// Reference to a heap object.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Oop(usize);

impl Oop {
    #[inline(always)]
    pub(crate) const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    #[inline(always)]
    pub fn from_raw_opt(raw: usize) -> Option<Self> {
        if raw == 0 {
            None
        } else {
            Some(Self(raw))
        }
    }

    #[inline(always)]
    pub fn from_object_start(start: usize) -> Self {
        Self(start + HEAP_WORD_SIZE)
    }

    #[inline(always)]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline(always)]
    pub fn object_start(self) -> usize {
        self.0 - HEAP_WORD_SIZE
    }

    #[inline]
    pub fn header(self) -> ObjectHeader {
        ObjectHeader::from_word(word_at(self.0).load(Ordering::Acquire))
    }

    #[inline]
    pub fn size_words(self) -> usize {
        self.header().size() as usize
    }

    #[inline]
    pub fn size_bytes(self) -> usize {
        self.size_words() * HEAP_WORD_SIZE
    }

    /// First address past the object.
    #[inline]
    pub fn end(self) -> usize {
        self.object_start() + self.size_bytes()
    }

    #[inline]
    pub fn num_refs(self) -> usize {
        self.header().refs() as usize
    }

    #[inline]
    pub fn is_filler(self) -> bool {
        self.header().filler()
    }

    /// Raw data words, alignment padding included.
    pub fn data_words(self) -> usize {
        let header = self.header();
        header.size() as usize - OBJECT_HEADER_WORDS - header.refs() as usize
    }

    #[inline]
    pub fn ref_slot(self, index: usize) -> &'static AtomicUsize {
        debug_assert!(index < self.num_refs(), "ref slot {} out of bounds", index);
        word_at(self.0 + HEAP_WORD_SIZE * (1 + index))
    }

    #[inline]
    pub fn data_slot(self, index: usize) -> &'static AtomicUsize {
        debug_assert!(index < self.data_words(), "data slot {} out of bounds", index);
        word_at(self.0 + HEAP_WORD_SIZE * (1 + self.num_refs() + index))
    }

    /// Visits every reference slot of the object.
    #[inline]
    pub fn oop_iterate(self, mut f: impl FnMut(&'static AtomicUsize)) {
        for i in 0..self.num_refs() {
            f(self.ref_slot(i));
        }
    }
}

impl fmt::Debug for Oop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Oop({:#x})", self.0)
    }
}

impl fmt::Pointer for Oop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Formats `[start, start + size_words)` as a fresh object with zeroed slots.
///
/// # Safety
/// The range must be freshly allocated heap memory owned by the caller.
pub(crate) unsafe fn initialize_object(start: usize, size_words: usize, refs: usize) -> Oop {
    debug_assert!(size_words >= OBJECT_HEADER_WORDS + refs);
    let obj = Oop::from_object_start(start);
    for i in OBJECT_HEADER_WORDS..size_words {
        word_at(start + i * HEAP_WORD_SIZE).store(0, Ordering::Relaxed);
    }
    let header = ObjectHeader::new()
        .with_size(size_words as u32)
        .with_refs(refs as u32)
        .with_filler(false);
    word_at(obj.raw()).store(header.to_word(), Ordering::Release);
    ShenandoahForwarding::initialize(obj);
    obj
}

/// Turns `[start, start + size_words)` into a dead filler object so that heap walks can step
/// over it.
///
/// # Safety
/// The range must not contain objects reachable by anybody.
pub(crate) unsafe fn fill_with_filler(start: usize, size_words: usize) {
    debug_assert!(size_words >= MIN_OBJECT_WORDS);
    debug_assert!(size_words % OBJECT_ALIGNMENT_WORDS == 0);
    let obj = Oop::from_object_start(start);
    let header = ObjectHeader::new()
        .with_size(size_words as u32)
        .with_refs(0)
        .with_filler(true);
    word_at(obj.raw()).store(header.to_word(), Ordering::Release);
    ShenandoahForwarding::initialize(obj);
}

/// Copies `src` into `dst_start` and returns the copy, which forwards to itself.
///
/// # Safety
/// `dst_start` must point at `src.size_words()` words of memory owned by the caller.
pub(crate) unsafe fn copy_object(src: Oop, dst_start: usize) -> Oop {
    let words = src.size_words();
    let from = src.object_start();
    for i in 1..words {
        let value = word_at(from + i * HEAP_WORD_SIZE).load(Ordering::Relaxed);
        word_at(dst_start + i * HEAP_WORD_SIZE).store(value, Ordering::Relaxed);
    }
    let copy = Oop::from_object_start(dst_start);
    ShenandoahForwarding::initialize(copy);
    copy
}

/// Forwarding pointer protocol. Every object owns one forwarding word, written only through
/// [ShenandoahForwarding::try_update_forwardee] while the mutator runs.
pub struct ShenandoahForwarding;

impl ShenandoahForwarding {
    /// Offset of the forwarding word relative to an [Oop].
    pub const BYTE_OFFSET: isize = -(HEAP_WORD_SIZE as isize);

    #[inline(always)]
    fn slot(obj: Oop) -> &'static AtomicUsize {
        word_at(obj.raw() - HEAP_WORD_SIZE)
    }

    #[inline]
    pub fn initialize(obj: Oop) {
        Self::slot(obj).store(obj.raw(), Ordering::Release);
    }

    #[inline]
    pub fn get_forwardee(obj: Oop) -> Oop {
        Oop(Self::slot(obj).load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_forwarded(obj: Oop) -> bool {
        Self::get_forwardee(obj) != obj
    }

    /// Installs `update` as the forwardee of `obj` unless somebody else won the race.
    /// Returns the forwardee every thread observes afterwards.
    #[inline]
    pub fn try_update_forwardee(obj: Oop, update: Oop) -> Oop {
        match Self::slot(obj).compare_exchange(
            obj.raw(),
            update.raw(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => update,
            Err(current) => Oop(current),
        }
    }

    /// Stores the forwarding word without synchronization. Only used by full GC, which owns
    /// the whole heap.
    #[inline]
    pub(crate) fn set_forwardee_unchecked(obj: Oop, to: usize) {
        Self::slot(obj).store(to, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn raw_forwardee(obj: Oop) -> usize {
        Self::slot(obj).load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(words: usize) -> Vec<AtomicUsize> {
        (0..words).map(|_| AtomicUsize::new(0xdead)).collect()
    }

    #[test]
    fn test_object_size_alignment() {
        assert_eq!(object_size(0, 0), 2);
        assert_eq!(object_size(1, 0), 4);
        assert_eq!(object_size(2, 3), 8);
    }

    #[test]
    fn test_initialize_layout() {
        let mem = buffer(8);
        let start = mem.as_ptr() as usize;
        let obj = unsafe { initialize_object(start, 8, 2) };
        assert_eq!(obj.raw(), start + HEAP_WORD_SIZE);
        assert_eq!(obj.size_words(), 8);
        assert_eq!(obj.num_refs(), 2);
        assert_eq!(obj.data_words(), 4);
        assert!(!obj.is_filler());
        assert_eq!(obj.ref_slot(1).load(Ordering::Relaxed), 0);
        assert_eq!(obj.end(), start + 64);
        assert_eq!(ShenandoahForwarding::get_forwardee(obj), obj);
    }

    #[test]
    fn test_forwarding_is_idempotent() {
        let mem = buffer(8);
        let start = mem.as_ptr() as usize;
        let obj = unsafe { initialize_object(start, 4, 1) };
        let copy = unsafe { copy_object(obj, start + 32) };
        assert_eq!(ShenandoahForwarding::try_update_forwardee(obj, copy), copy);
        let once = ShenandoahForwarding::get_forwardee(obj);
        assert_eq!(once, copy);
        assert_eq!(ShenandoahForwarding::get_forwardee(once), once);
        assert!(!ShenandoahForwarding::is_forwarded(copy));
    }

    #[test]
    fn test_single_forwarding_winner() {
        let mem = buffer(2 + 4 * 2);
        let start = mem.as_ptr() as usize;
        let obj = unsafe { initialize_object(start, 2, 0) };
        let winners = parking_lot::Mutex::new(vec![]);
        crossbeam_utils::thread::scope(|s| {
            for t in 0..4 {
                let winners = &winners;
                s.spawn(move |_| {
                    let copy = unsafe { copy_object(obj, start + 16 + t * 16) };
                    let result = ShenandoahForwarding::try_update_forwardee(obj, copy);
                    winners.lock().push(result);
                });
            }
        })
        .unwrap();
        let winners = winners.into_inner();
        assert!(winners.iter().all(|w| *w == winners[0]));
        assert_eq!(ShenandoahForwarding::get_forwardee(obj), winners[0]);
    }

    #[test]
    fn test_filler() {
        let mem = buffer(6);
        let start = mem.as_ptr() as usize;
        unsafe { fill_with_filler(start, 6) };
        let obj = Oop::from_object_start(start);
        assert!(obj.is_filler());
        assert_eq!(obj.size_words(), 6);
        assert_eq!(obj.num_refs(), 0);
    }
}
