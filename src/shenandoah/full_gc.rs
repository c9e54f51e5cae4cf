//! Stop-the-world sliding mark-compact. The last resort when concurrent and degenerated
//! cycles cannot free enough memory, so it relies on nothing but the marking bitmap and the
//! forwarding words.
//!
//! Live objects in regular regions slide towards the bottom of the heap, in address order.
//! Pinned regions and humongous objects stay where they are.
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{
    free_set::ShenandoahFreeSet,
    heap::ShenandoahHeap,
    marking_context::ShenandoahMarkingContext,
    oop::{copy_object, fill_with_filler, Oop, ShenandoahForwarding, LOG_HEAP_WORD_SIZE},
    phase_timings::ShenandoahPhase,
    policy::GcCause,
    region::ShenandoahHeapRegion,
    root_processor::ShenandoahRootProcessor,
    verifier::VerifyOptions,
};

pub(crate) fn do_it(heap: &ShenandoahHeap, cause: GcCause) {
    tracing::debug!("Full GC ({}) started", cause.name());
    heap.set_full_gc_in_progress(true);

    prepare(heap);
    heap.verify_phase("Before Full GC", VerifyOptions::before_full());

    {
        let _phase = heap.phase_scope(ShenandoahPhase::FullGcMark);
        mark(heap);
    }
    {
        let _phase = heap.phase_scope(ShenandoahPhase::FullGcCalculateAddresses);
        calculate_target_addresses(heap);
    }
    {
        let _phase = heap.phase_scope(ShenandoahPhase::FullGcAdjustPointers);
        adjust_pointers(heap);
    }
    let live_words = {
        let _phase = heap.phase_scope(ShenandoahPhase::FullGcCopyObjects);
        compact_objects(heap)
    };

    if heap.config().pacing {
        heap.pacer().report_full(live_words);
    }

    heap.verify_phase("After Full GC", VerifyOptions::after_full());
    heap.set_full_gc_in_progress(false);
}

/// Abandons whatever the concurrent cycle was doing and leaves the heap with no collection set,
/// no trash and a clear marking bitmap.
fn prepare(heap: &ShenandoahHeap) {
    heap.clear_cancelled_gc();
    heap.make_parsable();

    if heap.is_concurrent_mark_in_progress() {
        heap.concurrent_mark().cancel(heap);
        heap.set_concurrent_mark_in_progress(false);
    }
    heap.set_evacuation_in_progress(false);
    heap.set_update_refs_in_progress(false);

    if heap.has_forwarded_objects() {
        // Marking fixes heap slots as it goes, roots have to be right before it starts.
        heap.concurrent_mark().update_roots(heap);
    }

    let cset = heap.collection_set();
    cset.clear_current_index();
    while let Some(index) = cset.next() {
        heap.get_region(index).make_regular_bypass();
    }
    cset.clear();

    let next = heap.marking().next();
    let _lock = heap.lock();
    for r in heap.regions() {
        if r.is_empty_uncommitted() {
            r.make_committed_bypass();
        }
        ShenandoahFreeSet::try_recycle_trashed(heap, r);
        r.clear_live_data();
        next.capture_top_at_mark_start(r);
        next.clear_bitmap(r);
    }
}

fn mark(heap: &ShenandoahHeap) {
    heap.concurrent_mark().mark_stw_update_refs(heap);
    heap.set_has_forwarded_objects(false);

    let next = heap.marking().next();
    let cleared = heap.weak_handles().weak_oops_do(|obj| next.is_marked(obj));
    if cleared > 0 {
        tracing::debug!("Cleared {} weak handles", cleared);
    }
}

/// Slides every live object of a movable region down to the lowest free address in a movable
/// region at or before it. The new address goes to the forwarding word.
fn calculate_target_addresses(heap: &ShenandoahHeap) {
    let ctx = heap.marking().next();
    let movable: Vec<&ShenandoahHeapRegion> =
        heap.regions().iter().filter(|r| r.is_move_allowed()).collect();

    for r in movable.iter() {
        r.set_new_top(r.bottom());
    }

    let mut to = 0;
    let mut compact_point = movable.first().map_or(0, |r| r.bottom());
    for from in movable.iter() {
        ctx.marked_object_iterate(from, from.top(), |obj| {
            let size = obj.size_bytes();
            if compact_point + size > movable[to].end() {
                movable[to].set_new_top(compact_point);
                to += 1;
                compact_point = movable[to].bottom();
            }
            let target = Oop::from_object_start(compact_point);
            debug_assert!(target.raw() <= obj.raw(), "objects only slide down");
            ShenandoahForwarding::set_forwardee_unchecked(obj, target.raw());
            compact_point += size;
        });
    }
    if let Some(last) = movable.get(to) {
        last.set_new_top(compact_point);
    }

    let _lock = heap.lock();
    for r in heap.regions() {
        if r.is_pinned() && !r.is_humongous() {
            fill_dead_objects(ctx, r);
            r.set_new_top(r.top());
        } else if r.is_humongous_start() && !r.is_pinned() {
            let obj = Oop::from_object_start(r.bottom());
            if !ctx.is_marked(obj) {
                heap.trash_humongous_region_at(r);
            }
        }
    }
}

/// Pinned objects stay in place, their dead neighbours become fillers so that no stale
/// reference survives the compaction.
fn fill_dead_objects(ctx: &ShenandoahMarkingContext, r: &ShenandoahHeapRegion) {
    let mut cursor = r.bottom();
    let top = r.top();
    while cursor < top {
        let obj = Oop::from_object_start(cursor);
        let size = obj.size_words();
        if !obj.is_filler() && !ctx.is_marked(obj) {
            unsafe { fill_with_filler(cursor, size) };
        }
        cursor += size << LOG_HEAP_WORD_SIZE;
    }
}

#[inline]
fn adjust_slot(slot: &AtomicUsize) {
    if let Some(obj) = Oop::from_raw_opt(slot.load(Ordering::Relaxed)) {
        let forwardee = ShenandoahForwarding::raw_forwardee(obj);
        if forwardee != obj.raw() {
            slot.store(forwardee, Ordering::Relaxed);
        }
    }
}

/// Points every reference, from live objects and from roots, at the target address.
fn adjust_pointers(heap: &ShenandoahHeap) {
    let n_workers = heap.config().parallel_gc_threads;
    let ctx = heap.marking().next();
    let cursor = AtomicUsize::new(0);
    let rp = ShenandoahRootProcessor::new(heap, n_workers);

    heap.workers().run_task(n_workers, "full gc adjust pointers", |_| {
        loop {
            let index = cursor.fetch_add(1, Ordering::AcqRel);
            if index >= heap.num_regions() {
                break;
            }
            let r = heap.get_region(index);
            if r.is_humongous_start() {
                let obj = Oop::from_object_start(r.bottom());
                if ctx.is_marked(obj) {
                    obj.oop_iterate(adjust_slot);
                }
            } else if r.is_move_allowed() || r.is_pinned() {
                ctx.marked_object_iterate(r, r.top(), |obj| obj.oop_iterate(adjust_slot));
            }
        }
        let mut adjust_root = |slot: &AtomicUsize| adjust_slot(slot);
        rp.process_all_roots(&mut adjust_root);
    });
}

/// Moves the objects, in ascending address order so that a copy never overwrites an object
/// that has not moved yet. Returns the number of live words in the compacted regions.
fn compact_objects(heap: &ShenandoahHeap) -> usize {
    let ctx = heap.marking().next();
    for r in heap.regions().iter().filter(|r| r.is_move_allowed()) {
        ctx.marked_object_iterate(r, r.top(), |obj| {
            let target = ShenandoahForwarding::raw_forwardee(obj);
            if target != obj.raw() {
                unsafe { copy_object(obj, Oop::from_raw(target).object_start()) };
            }
        });
    }

    let mut live_words = 0;
    let mut used = 0;
    {
        let _lock = heap.lock();
        for r in heap.regions() {
            if r.is_move_allowed() {
                r.set_top(r.new_top());
                if r.used() == 0 {
                    r.make_trash();
                } else {
                    r.reset_alloc_metadata_to_shared();
                    r.set_live_data(r.used());
                    live_words += r.used() >> LOG_HEAP_WORD_SIZE;
                }
            }
            if r.is_trash() {
                r.recycle(heap.marking());
            }
            used += r.used();
        }
    }

    // Nothing is marked, everything below top is implicitly live.
    for r in heap.regions() {
        heap.marking().reset_region(r);
        r.set_update_watermark(r.bottom());
    }

    heap.set_used(used);
    heap.lock().rebuild(heap);
    live_words
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmap::Mmap;
    use crate::shenandoah::alloc_request::AllocKind;
    use crate::shenandoah::marking_context::ShenandoahMarkingContexts;
    use crate::shenandoah::oop::{initialize_object, object_size};

    #[test]
    fn test_fill_dead_objects_keeps_marked_ones() {
        let shift = 20;
        let mem = Mmap::new(2 << shift).unwrap();
        let base = mem.aligned(1 << shift);
        let region = ShenandoahHeapRegion::new(0, base, 1 << shift, true);
        let contexts = ShenandoahMarkingContexts::new(base, 1, shift).unwrap();
        let ctx = contexts.next();
        region.make_regular_allocation();

        let size = object_size(1, 1);
        let objs: Vec<Oop> = (0..4)
            .map(|_| {
                let start = region.allocate(size, AllocKind::Shared).unwrap();
                unsafe { initialize_object(start, size, 1) }
            })
            .collect();
        ctx.capture_top_at_mark_start(&region);
        assert!(ctx.mark(objs[1]));
        assert!(ctx.mark(objs[3]));

        fill_dead_objects(ctx, &region);
        assert!(objs[0].is_filler());
        assert!(!objs[1].is_filler());
        assert!(objs[2].is_filler());
        assert!(!objs[3].is_filler());
        assert_eq!(objs[2].size_words(), size);
    }
}
