use std::sync::atomic::{AtomicUsize, Ordering};

use crate::{error::ConfigError, internal::mark_bitmap::MarkBitmap};

use super::{oop::Oop, region::ShenandoahHeapRegion};

/// Mark bitmap plus the per-region top-at-mark-start snapshot.
///
/// Anything at or above TAMS was allocated after marking started and counts as live without a
/// mark bit.
pub struct ShenandoahMarkingContext {
    mark_bit_map: MarkBitmap,
    top_at_mark_starts: Box<[AtomicUsize]>,
    heap_begin: usize,
    region_size_bytes_shift: usize,
}

impl ShenandoahMarkingContext {
    pub fn new(
        name: &'static str,
        heap_begin: usize,
        region_count: usize,
        region_size_bytes_shift: usize,
    ) -> Result<Self, ConfigError> {
        let capacity = region_count << region_size_bytes_shift;
        Ok(Self {
            mark_bit_map: MarkBitmap::create(name, heap_begin, capacity)?,
            top_at_mark_starts: (0..region_count)
                .map(|i| AtomicUsize::new(heap_begin + (i << region_size_bytes_shift)))
                .collect(),
            heap_begin,
            region_size_bytes_shift,
        })
    }

    #[inline]
    fn region_index(&self, addr: usize) -> usize {
        (addr - self.heap_begin) >> self.region_size_bytes_shift
    }

    pub fn mark_bit_map(&self) -> &MarkBitmap {
        &self.mark_bit_map
    }

    /// Marks `obj`. Returns true when this call set the bit, false if the object was marked
    /// already or is implicitly live above TAMS.
    #[inline]
    pub fn mark(&self, obj: Oop) -> bool {
        let addr = obj.raw();
        if addr >= self.top_at_mark_start_for(addr) {
            return false;
        }
        !self.mark_bit_map.atomic_test_and_set(addr)
    }

    #[inline]
    pub fn is_marked(&self, obj: Oop) -> bool {
        let addr = obj.raw();
        addr >= self.top_at_mark_start_for(addr) || self.mark_bit_map.test(addr)
    }

    #[inline]
    fn top_at_mark_start_for(&self, addr: usize) -> usize {
        self.top_at_mark_starts[self.region_index(addr)].load(Ordering::Acquire)
    }

    #[inline]
    pub fn top_at_mark_start(&self, region: &ShenandoahHeapRegion) -> usize {
        self.top_at_mark_starts[region.index()].load(Ordering::Acquire)
    }

    pub fn set_top_at_mark_start(&self, region: &ShenandoahHeapRegion, tams: usize) {
        debug_assert!(tams >= region.bottom() && tams <= region.end());
        self.top_at_mark_starts[region.index()].store(tams, Ordering::Release);
    }

    pub fn capture_top_at_mark_start(&self, region: &ShenandoahHeapRegion) {
        self.set_top_at_mark_start(region, region.top());
    }

    pub fn reset_top_at_mark_start(&self, region: &ShenandoahHeapRegion) {
        self.set_top_at_mark_start(region, region.bottom());
    }

    /// Returns the first marked object in `[start, limit)`, or `limit`.
    pub fn get_next_marked_addr(&self, start: usize, limit: usize) -> usize {
        self.mark_bit_map.next_marked_addr(start, limit)
    }

    pub fn clear_bitmap(&self, region: &ShenandoahHeapRegion) {
        self.mark_bit_map.clear_range(region.bottom(), region.end());
    }

    pub fn is_bitmap_clear_range(&self, start: usize, end: usize) -> bool {
        self.mark_bit_map.is_clear_range(start, end)
    }

    /// Visits marked objects in `[region.bottom, TAMS)` and then every object between TAMS and
    /// `limit`, which has to be parseable.
    pub fn marked_object_iterate(
        &self,
        region: &ShenandoahHeapRegion,
        limit: usize,
        mut f: impl FnMut(Oop),
    ) {
        let tams = self.top_at_mark_start(region);
        let bitmap_end = tams.min(limit);
        self.mark_bit_map
            .visit_marked_range(region.bottom(), bitmap_end, |addr| f(Oop::from_raw(addr)));
        let mut cursor = tams;
        while cursor < limit {
            let obj = Oop::from_object_start(cursor);
            let size = obj.size_bytes();
            if !obj.is_filler() {
                f(obj);
            }
            cursor += size;
        }
    }
}

/// The two marking contexts. Marking always writes into `next`; the previous cycle's `complete`
/// stays readable until they are swapped at the end of a successful mark.
pub struct ShenandoahMarkingContexts {
    contexts: [ShenandoahMarkingContext; 2],
    complete: AtomicUsize,
}

impl ShenandoahMarkingContexts {
    pub fn new(
        heap_begin: usize,
        region_count: usize,
        region_size_bytes_shift: usize,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            contexts: [
                ShenandoahMarkingContext::new(
                    "mark-bitmap-0",
                    heap_begin,
                    region_count,
                    region_size_bytes_shift,
                )?,
                ShenandoahMarkingContext::new(
                    "mark-bitmap-1",
                    heap_begin,
                    region_count,
                    region_size_bytes_shift,
                )?,
            ],
            complete: AtomicUsize::new(0),
        })
    }

    #[inline]
    pub fn complete(&self) -> &ShenandoahMarkingContext {
        &self.contexts[self.complete.load(Ordering::Acquire)]
    }

    #[inline]
    pub fn next(&self) -> &ShenandoahMarkingContext {
        &self.contexts[1 - self.complete.load(Ordering::Acquire)]
    }

    /// Must be called at a safepoint.
    pub fn swap(&self) {
        let complete = self.complete.load(Ordering::Relaxed);
        self.complete.store(1 - complete, Ordering::Release);
    }

    /// Clears both bitmaps over the region and resets both TAMS to bottom.
    pub fn reset_region(&self, region: &ShenandoahHeapRegion) {
        for ctx in self.contexts.iter() {
            ctx.clear_bitmap(region);
            ctx.reset_top_at_mark_start(region);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmap::Mmap;

    #[test]
    fn test_tams_makes_new_objects_live() {
        let mem = Mmap::new(4 * 256 * 1024).unwrap();
        let base = mem.aligned(256 * 1024);
        let region = ShenandoahHeapRegion::new(0, base, 256 * 1024, true);
        let contexts = ShenandoahMarkingContexts::new(base, 1, 18).unwrap();
        region.make_regular_allocation();
        let old = region
            .allocate(4, crate::shenandoah::alloc_request::AllocKind::Shared)
            .unwrap();
        contexts.next().capture_top_at_mark_start(&region);
        let young = region
            .allocate(4, crate::shenandoah::alloc_request::AllocKind::Shared)
            .unwrap();

        let next = contexts.next();
        let old = Oop::from_object_start(old);
        let young = Oop::from_object_start(young);
        assert!(!next.is_marked(old));
        assert!(next.is_marked(young));
        assert!(next.mark(old));
        assert!(!next.mark(old));
        assert!(!next.mark(young));

        contexts.swap();
        assert!(contexts.complete().is_marked(old));
        assert!(!contexts.next().is_marked(old));

        contexts.reset_region(&region);
        assert_eq!(contexts.complete().top_at_mark_start(&region), region.bottom());
        assert!(contexts
            .complete()
            .is_bitmap_clear_range(region.bottom(), region.end()));
    }
}
