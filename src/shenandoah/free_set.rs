use bit_vec::BitVec;

use crate::utils::{align_down, formatted_size};

use super::{
    alloc_request::{AllocKind, ShenandoahAllocRequest},
    heap::ShenandoahHeap,
    oop::{LOG_HEAP_WORD_SIZE, OBJECT_ALIGNMENT_WORDS},
    region::ShenandoahHeapRegion,
};

/// Region allocator. Lives behind the heap lock.
///
/// Free regions are split into a mutator view, biased to the low end of the heap, and a
/// collector view reserved at the high end so that evacuation does not starve when mutators
/// exhaust their share.
pub struct ShenandoahFreeSet {
    mutator_free_bitmap: BitVec,
    collector_free_bitmap: BitVec,
    max: usize,

    mutator_leftmost: usize,
    mutator_rightmost: usize,
    collector_leftmost: usize,
    collector_rightmost: usize,

    capacity: usize,
    used: usize,
}

impl ShenandoahFreeSet {
    pub fn new(max_regions: usize) -> Self {
        let mut this = Self {
            mutator_free_bitmap: BitVec::from_elem(max_regions, false),
            collector_free_bitmap: BitVec::from_elem(max_regions, false),
            max: max_regions,
            mutator_leftmost: max_regions,
            mutator_rightmost: 0,
            collector_leftmost: max_regions,
            collector_rightmost: 0,
            capacity: 0,
            used: 0,
        };
        this.clear();
        this
    }

    #[inline]
    pub fn is_mutator_free(&self, idx: usize) -> bool {
        self.mutator_free_bitmap.get(idx).unwrap_or(false)
    }

    #[inline]
    pub fn is_collector_free(&self, idx: usize) -> bool {
        self.collector_free_bitmap.get(idx).unwrap_or(false)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn available(&self) -> usize {
        debug_assert!(self.used <= self.capacity, "must use less than capacity");
        self.capacity - self.used
    }

    pub fn count(&self) -> usize {
        self.mutator_count()
    }

    fn mutator_count(&self) -> usize {
        self.mutator_free_bitmap.iter().filter(|b| *b).count()
    }

    fn increase_used(&mut self, bytes: usize) {
        self.used += bytes;
        debug_assert!(
            self.used <= self.capacity,
            "must not use more than we have: used: {}, capacity: {}, increase: {}",
            self.used,
            self.capacity,
            bytes
        );
    }

    pub fn clear(&mut self) {
        self.mutator_free_bitmap.clear();
        self.collector_free_bitmap.clear();
        self.mutator_leftmost = self.max;
        self.mutator_rightmost = 0;
        self.collector_leftmost = self.max;
        self.collector_rightmost = 0;
        self.capacity = 0;
        self.used = 0;
    }

    fn alloc_capacity(heap: &ShenandoahHeap, r: &ShenandoahHeapRegion) -> usize {
        if r.is_trash() {
            // Recycled on first use.
            heap.options().region_size_bytes
        } else {
            r.free()
        }
    }

    fn has_no_alloc_capacity(heap: &ShenandoahHeap, r: &ShenandoahHeapRegion) -> bool {
        Self::alloc_capacity(heap, r) == 0
    }

    fn can_allocate_from(r: &ShenandoahHeapRegion) -> bool {
        r.is_empty() || r.is_trash()
    }

    /// Recycles `r` if it is trash. Caller holds the heap lock or runs at a safepoint.
    pub fn try_recycle_trashed(heap: &ShenandoahHeap, r: &ShenandoahHeapRegion) {
        if r.is_trash() {
            heap.decrease_used(r.used());
            r.recycle(heap.marking());
        }
    }

    pub fn rebuild(&mut self, heap: &ShenandoahHeap) {
        self.clear();

        for r in heap.regions() {
            if r.is_alloc_allowed() || r.is_trash() {
                debug_assert!(!r.is_cset(), "Shouldn't be adding those to the free set");
                self.mutator_free_bitmap.set(r.index(), true);
                self.capacity += Self::alloc_capacity(heap, r);
            }
        }

        // Collector reserve comes from the high end.
        let to_reserve = heap.config().evac_reserve * heap.max_capacity() / 100;
        let mut reserved = 0;
        for r in heap.regions().iter().rev() {
            if reserved >= to_reserve {
                break;
            }
            let idx = r.index();
            if self.is_mutator_free(idx) && Self::can_allocate_from(r) {
                self.mutator_free_bitmap.set(idx, false);
                self.collector_free_bitmap.set(idx, true);
                let ac = Self::alloc_capacity(heap, r);
                self.capacity -= ac;
                reserved += ac;
            }
        }

        self.recompute_bounds();
        self.assert_bounds();
    }

    pub fn allocate(
        &mut self,
        heap: &ShenandoahHeap,
        req: &mut ShenandoahAllocRequest,
        in_new_region: &mut bool,
    ) -> Option<usize> {
        if req.size() > heap.options().humongous_threshold_words {
            match req.kind() {
                AllocKind::Shared => {
                    *in_new_region = true;
                    self.allocate_contiguous(heap, req)
                }
                // Humongous objects never move, the collector never asks for that much.
                AllocKind::SharedGc => None,
                AllocKind::Tlab | AllocKind::Gclab => {
                    panic!("Cannot allocate humongous {}: {}", req.kind().name(), req.size())
                }
            }
        } else {
            self.allocate_single(heap, req, in_new_region)
        }
    }

    fn allocate_single(
        &mut self,
        heap: &ShenandoahHeap,
        req: &mut ShenandoahAllocRequest,
        in_new_region: &mut bool,
    ) -> Option<usize> {
        // First fit inside the cached bounds. Mutators walk up from the low end, the collector
        // walks down from the high end.
        match req.kind() {
            AllocKind::Tlab | AllocKind::Shared => {
                let mut idx = self.mutator_leftmost;
                while idx <= self.mutator_rightmost && idx < self.max {
                    if self.is_mutator_free(idx) {
                        if let Some(result) = self.try_allocate_in(heap, idx, req, in_new_region)
                        {
                            return Some(result);
                        }
                    }
                    idx += 1;
                }
                // The collector view is off limits for mutators.
            }
            AllocKind::Gclab | AllocKind::SharedGc => {
                let mut c = self.collector_rightmost + 1;
                while c > self.collector_leftmost {
                    let idx = c - 1;
                    if self.is_collector_free(idx) {
                        if let Some(result) = self.try_allocate_in(heap, idx, req, in_new_region)
                        {
                            return Some(result);
                        }
                    }
                    c -= 1;
                }

                if !heap.config().evac_reserve_overflow {
                    return None;
                }

                // Steal an empty mutator region.
                let mut c = self.mutator_rightmost + 1;
                while c > self.mutator_leftmost {
                    let idx = c - 1;
                    if self.is_mutator_free(idx) && Self::can_allocate_from(heap.get_region(idx)) {
                        self.flip_to_gc(heap, idx);
                        if let Some(result) = self.try_allocate_in(heap, idx, req, in_new_region)
                        {
                            tracing::debug!("Flipped region {} to gc for request", idx);
                            return Some(result);
                        }
                    }
                    c -= 1;
                }

                // Last resort: share a partially used mutator region.
                if heap.config().allow_mixed_allocs {
                    let mut c = self.mutator_rightmost + 1;
                    while c > self.mutator_leftmost {
                        let idx = c - 1;
                        if self.is_mutator_free(idx) {
                            if let Some(result) =
                                self.try_allocate_in(heap, idx, req, in_new_region)
                            {
                                return Some(result);
                            }
                        }
                        c -= 1;
                    }
                }
            }
        }
        None
    }

    fn try_allocate_in(
        &mut self,
        heap: &ShenandoahHeap,
        idx: usize,
        req: &mut ShenandoahAllocRequest,
        in_new_region: &mut bool,
    ) -> Option<usize> {
        let r = heap.get_region(idx);
        Self::try_recycle_trashed(heap, r);

        *in_new_region = r.is_empty();
        if r.is_empty() {
            r.make_regular_allocation();
        }

        let mut size = req.size();
        let result = if req.is_lab_alloc() {
            let free = align_down(r.free() >> LOG_HEAP_WORD_SIZE, OBJECT_ALIGNMENT_WORDS);
            if size > free && heap.config().elastic_tlab {
                size = free;
            }
            if size >= req.min_size() && size <= free {
                r.allocate(size, req.kind())
            } else {
                None
            }
        } else {
            r.allocate(size, req.kind())
        };

        if result.is_some() {
            if req.is_mutator_alloc() {
                self.increase_used(size << LOG_HEAP_WORD_SIZE);
            }
            req.set_actual_size(size);
        }

        if result.is_none() || Self::has_no_alloc_capacity(heap, r) {
            // Retire the region. The tail is charged to the mutator as waste.
            if req.is_mutator_alloc() {
                let waste = r.free();
                if waste > 0 {
                    self.increase_used(waste);
                    heap.notify_mutator_alloc_words(waste >> LOG_HEAP_WORD_SIZE, true);
                }
            }
            self.collector_free_bitmap.set(idx, false);
            self.mutator_free_bitmap.set(idx, false);
            if self.touches_bounds(idx) {
                self.adjust_bounds();
            }
            self.assert_bounds();
        }
        result
    }

    fn allocate_contiguous(
        &mut self,
        heap: &ShenandoahHeap,
        req: &mut ShenandoahAllocRequest,
    ) -> Option<usize> {
        let opts = heap.options();
        let words_size = req.size();
        let num = opts.required_regions(words_size << LOG_HEAP_WORD_SIZE);

        if num > self.mutator_count() {
            return None;
        }

        // Lowest run of `num` free regions, [beg; end] inclusive.
        let mut beg = self.mutator_leftmost;
        let mut end = beg;

        loop {
            if end >= self.max {
                return None;
            }

            // Run broken, restart after `end`.
            if !self.is_mutator_free(end) || !Self::can_allocate_from(heap.get_region(end)) {
                end += 1;
                beg = end;
                continue;
            }

            if end - beg + 1 == num {
                break;
            }

            end += 1;
        }

        let remainder = words_size & opts.region_size_words_mask;

        for i in beg..=end {
            let r = heap.get_region(i);
            Self::try_recycle_trashed(heap, r);

            debug_assert!(r.is_empty(), "Should be empty");

            if i == beg {
                r.make_humongous_start();
            } else {
                r.make_humongous_cont();
            }

            let used_words = if i == end && remainder != 0 {
                remainder
            } else {
                opts.region_size_words
            };

            r.set_top(r.bottom() + (used_words << LOG_HEAP_WORD_SIZE));
            r.reset_alloc_metadata_to_shared();

            self.mutator_free_bitmap.set(i, false);
        }

        // The free set charges whole regions, the regions report their true top.
        self.increase_used(opts.region_size_bytes * num);

        if remainder != 0 {
            heap.notify_mutator_alloc_words(opts.region_size_words - remainder, true);
        }

        if beg == self.mutator_leftmost || end == self.mutator_rightmost {
            self.adjust_bounds();
        }
        self.assert_bounds();

        req.set_actual_size(words_size);
        Some(heap.get_region(beg).bottom())
    }

    fn flip_to_gc(&mut self, heap: &ShenandoahHeap, idx: usize) {
        debug_assert!(self.is_mutator_free(idx), "Should be in mutator view");
        debug_assert!(Self::can_allocate_from(heap.get_region(idx)));

        self.mutator_free_bitmap.set(idx, false);
        self.collector_free_bitmap.set(idx, true);
        self.capacity -= Self::alloc_capacity(heap, heap.get_region(idx));

        if self.touches_bounds(idx) {
            self.adjust_bounds();
        }
        self.assert_bounds();
    }

    fn touches_bounds(&self, num: usize) -> bool {
        num == self.mutator_leftmost
            || num == self.mutator_rightmost
            || num == self.collector_leftmost
            || num == self.collector_rightmost
    }

    fn recompute_bounds(&mut self) {
        self.mutator_rightmost = self.max - 1;
        self.mutator_leftmost = 0;
        self.collector_rightmost = self.max - 1;
        self.collector_leftmost = 0;

        self.adjust_bounds();
    }

    fn adjust_bounds(&mut self) {
        while self.mutator_leftmost < self.max && !self.is_mutator_free(self.mutator_leftmost) {
            self.mutator_leftmost += 1;
        }
        while self.mutator_rightmost > 0 && !self.is_mutator_free(self.mutator_rightmost) {
            self.mutator_rightmost -= 1;
        }
        while self.collector_leftmost < self.max && !self.is_collector_free(self.collector_leftmost)
        {
            self.collector_leftmost += 1;
        }
        while self.collector_rightmost > 0 && !self.is_collector_free(self.collector_rightmost) {
            self.collector_rightmost -= 1;
        }
    }

    fn assert_bounds(&self) {
        if cfg!(debug_assertions) {
            if self.mutator_leftmost < self.max {
                assert!(self.is_mutator_free(self.mutator_leftmost), "leftmost region should be free");
                assert!(self.is_mutator_free(self.mutator_rightmost), "rightmost region should be free");
                for i in 0..self.mutator_leftmost {
                    assert!(!self.is_mutator_free(i), "no free regions before leftmost");
                }
            }
            if self.collector_leftmost < self.max {
                assert!(self.is_collector_free(self.collector_leftmost));
                assert!(self.is_collector_free(self.collector_rightmost));
            }
            for i in 0..self.max {
                assert!(
                    !(self.is_mutator_free(i) && self.is_collector_free(i)),
                    "region {} is in both views",
                    i
                );
            }
        }
    }

    /// Mutator-free regions in address order.
    pub fn mutator_regions(&self) -> impl Iterator<Item = usize> + '_ {
        (self.mutator_leftmost..=self.mutator_rightmost.min(self.max.saturating_sub(1)))
            .filter(move |i| self.is_mutator_free(*i))
    }

    /// Fraction of free space lost to partially used regions.
    pub fn internal_fragmentation(&self, heap: &ShenandoahHeap) -> f64 {
        let mut squared = 0.0;
        let mut linear = 0.0;
        let mut count = 0;

        for idx in self.mutator_regions() {
            let used = heap.get_region(idx).used() as f64;
            squared += used * used;
            linear += used;
            count += 1;
        }

        if count > 0 && linear > 0.0 {
            let s = squared / (heap.options().region_size_bytes as f64 * linear);
            1.0 - s
        } else {
            0.0
        }
    }

    /// Fraction of free space not available as one contiguous run of empty regions.
    pub fn external_fragmentation(&self, heap: &ShenandoahHeap) -> f64 {
        let mut last_idx = 0;
        let mut max_contig = 0;
        let mut empty_contig = 0;
        let mut free = 0;

        for index in self.mutator_regions() {
            let r = heap.get_region(index);
            if r.is_empty() {
                free += heap.options().region_size_bytes;
                if last_idx + 1 == index {
                    empty_contig += 1;
                } else {
                    empty_contig = 1;
                }
            } else {
                empty_contig = 0;
            }

            max_contig = max_contig.max(empty_contig);
            last_idx = index;
        }

        if free > 0 {
            1.0 - (max_contig * heap.options().region_size_bytes) as f64 / free as f64
        } else {
            0.0
        }
    }

    pub fn log_status(&self, heap: &ShenandoahHeap) {
        let mut last_idx = 0;
        let mut max = 0;
        let mut max_contig = 0;
        let mut empty_contig = 0;
        let mut total_used = 0;
        let mut total_free = 0;

        for idx in self.mutator_regions() {
            let r = heap.get_region(idx);
            let free = Self::alloc_capacity(heap, r);
            max = max.max(free);

            if r.is_empty() && last_idx + 1 == idx {
                empty_contig += 1;
            } else {
                empty_contig = 0;
            }

            total_used += r.used();
            total_free += free;
            max_contig = max_contig.max(empty_contig);
            last_idx = idx;
        }

        let max_humongous = max_contig * heap.options().region_size_bytes;
        let frag_ext = if total_free > 0 {
            100 - (100 * max_humongous / total_free)
        } else {
            0
        };
        let frag_int = if self.count() > 0 {
            100 * (total_used / self.count()) / heap.options().region_size_bytes
        } else {
            0
        };

        let mut total_reserve = 0;
        for r in heap.regions() {
            if self.is_collector_free(r.index()) {
                total_reserve += r.free();
            }
        }

        tracing::info!(
            "Free: {} ({} regions), Max regular: {}, Max humongous: {}, External frag: {}%, Internal frag: {}%, Reserve: {}",
            formatted_size(total_free),
            self.mutator_count(),
            formatted_size(max),
            formatted_size(max_humongous),
            frag_ext,
            frag_int,
            formatted_size(total_reserve)
        );
    }
}
