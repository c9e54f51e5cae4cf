//! Tracing: root marking at the init mark pause, concurrent marking with work stealing, and the
//! final drain of the SATB buffers at the final mark pause.
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{
    heap::ShenandoahHeap,
    marking_context::ShenandoahMarkingContext,
    oop::{Oop, ShenandoahForwarding, LOG_HEAP_WORD_SIZE},
    root_processor::ShenandoahRootProcessor,
    task_queue::{ShenandoahObjToScanQueue, ShenandoahObjToScanQueueSet, ShenandoahTaskTerminator},
};

/// How reference slots are treated while tracing.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum UpdateRefsMode {
    /// Slots are read as they are.
    None,
    /// Slots may point to from-space copies, trace the forwardee.
    Resolve,
    /// Like `Resolve`, and store the forwardee back into the slot.
    Simple,
}

impl UpdateRefsMode {
    fn for_heap(heap: &ShenandoahHeap, update_refs: bool) -> Self {
        if update_refs {
            Self::Simple
        } else if heap.has_forwarded_objects() {
            Self::Resolve
        } else {
            Self::None
        }
    }
}

pub struct ShenandoahConcurrentMark {
    task_queues: ShenandoahObjToScanQueueSet,
}

impl ShenandoahConcurrentMark {
    pub fn new(max_workers: usize) -> Self {
        Self {
            task_queues: ShenandoahObjToScanQueueSet::new(max_workers),
        }
    }

    pub fn task_queues(&self) -> &ShenandoahObjToScanQueueSet {
        &self.task_queues
    }

    /// Marks everything the strong roots point to and queues it for tracing. Runs at a
    /// safepoint.
    pub(crate) fn mark_roots(&self, heap: &ShenandoahHeap, update_refs: bool) {
        let n_workers = heap.config().parallel_gc_threads;
        let mode = UpdateRefsMode::for_heap(heap, update_refs);
        let ctx = heap.marking().next();
        let rp = ShenandoahRootProcessor::new(heap, n_workers);
        heap.workers().run_task(n_workers, "marking roots", |worker_id| {
            let q = self.task_queues.queue(worker_id);
            let mut mark_root = |slot: &AtomicUsize| mark_through_ref(ctx, slot, &q, mode);
            rp.process_strong_roots(&mut mark_root);
        });
    }

    /// Concurrent marking. Stops early when the cycle is cancelled; whatever is left in the
    /// queues is picked up by the final mark or the degenerated pause.
    pub(crate) fn mark_from_roots(&self, heap: &ShenandoahHeap) {
        let n_workers = heap.config().conc_gc_threads;
        let terminator = ShenandoahTaskTerminator::new(n_workers);
        let mode = UpdateRefsMode::for_heap(heap, false);
        heap.workers().run_task(n_workers, "concurrent marking", |worker_id| {
            self.mark_loop(heap, worker_id, n_workers, &terminator, true, mode);
        });
    }

    /// Completes marking at the final mark pause: takes over the mutators' partial SATB
    /// buffers, rescans the roots and traces until every queue is empty.
    pub(crate) fn finish_mark_from_roots(&self, heap: &ShenandoahHeap) {
        let satb = heap.satb_queue_set();
        for mutator in heap.mutators_snapshot() {
            mutator.flush_satb(satb);
        }

        self.mark_roots(heap, false);

        let n_workers = heap.config().parallel_gc_threads;
        let terminator = ShenandoahTaskTerminator::new(n_workers);
        let mode = UpdateRefsMode::for_heap(heap, false);
        heap.workers().run_task(n_workers, "final marking", |worker_id| {
            self.mark_loop(heap, worker_id, n_workers, &terminator, false, mode);
        });

        debug_assert!(self.task_queues.is_empty(), "queues must be drained");
        debug_assert_eq!(satb.completed_buffers_num(), 0, "SATB buffers must be drained");
    }

    /// Marks the whole heap in a pause, fixing every slot that still points to a from-space
    /// copy. Used by the full GC.
    pub(crate) fn mark_stw_update_refs(&self, heap: &ShenandoahHeap) {
        self.mark_roots(heap, true);

        let n_workers = heap.config().parallel_gc_threads;
        let terminator = ShenandoahTaskTerminator::new(n_workers);
        heap.workers().run_task(n_workers, "full marking", |worker_id| {
            self.mark_loop(
                heap,
                worker_id,
                n_workers,
                &terminator,
                false,
                UpdateRefsMode::Simple,
            );
        });
    }

    /// Drops the work of a cancelled marking.
    pub(crate) fn cancel(&self, heap: &ShenandoahHeap) {
        self.task_queues.clear();
        heap.satb_queue_set().abandon_partial_marking();
        for mutator in heap.mutators_snapshot() {
            mutator.clear_satb();
        }
    }

    /// Points every root at the to-space copy of its object.
    pub(crate) fn update_roots(&self, heap: &ShenandoahHeap) {
        let n_workers = heap.config().parallel_gc_threads;
        let rp = ShenandoahRootProcessor::new(heap, n_workers);
        heap.workers().run_task(n_workers, "update roots", |_| {
            let mut update_root = |slot: &AtomicUsize| {
                if let Some(obj) = Oop::from_raw_opt(slot.load(Ordering::Acquire)) {
                    let forwardee = ShenandoahForwarding::get_forwardee(obj);
                    if forwardee != obj {
                        slot.store(forwardee.raw(), Ordering::Release);
                    }
                }
            };
            rp.process_all_roots(&mut update_root);
        });
    }

    fn mark_loop(
        &self,
        heap: &ShenandoahHeap,
        worker_id: usize,
        n_workers: usize,
        terminator: &ShenandoahTaskTerminator,
        cancellable: bool,
        mode: UpdateRefsMode,
    ) {
        let ctx = heap.marking().next();
        let satb = heap.satb_queue_set();
        let stride = heap.config().mark_loop_stride.max(1);
        let pacing = heap.config().pacing;
        let q = self.task_queues.queue(worker_id);

        // Per worker liveness, flushed to the regions once at the end.
        let mut live_data = vec![0usize; heap.num_regions()];

        loop {
            if cancellable && heap.cancelled_gc() {
                break;
            }

            while satb.apply_closure_to_completed_buffer(|obj| {
                let obj = resolve(obj, mode);
                if ctx.mark(obj) {
                    q.push(obj);
                }
            }) {}

            let mut work = 0;
            let mut words = 0;
            for _ in 0..stride {
                let task = match q.pop() {
                    Some(obj) => Some(obj),
                    None => self.task_queues.steal(worker_id, n_workers, &q),
                };
                match task {
                    Some(obj) => {
                        words += self.do_task(heap, ctx, &q, obj, mode, &mut live_data);
                        work += 1;
                    }
                    None => break,
                }
            }

            if pacing && words > 0 {
                heap.pacer().report_mark(words);
            }

            if work == 0 {
                let terminated = terminator.offer_termination(
                    || cancellable && heap.cancelled_gc(),
                    || !self.task_queues.is_empty() || satb.completed_buffers_num() > 0,
                );
                if terminated {
                    break;
                }
            }
        }

        for (index, words) in live_data.into_iter().enumerate() {
            if words > 0 {
                heap.get_region(index).increase_live_data_words(words);
            }
        }
    }

    /// Traces one object and returns its size in words.
    fn do_task(
        &self,
        heap: &ShenandoahHeap,
        ctx: &ShenandoahMarkingContext,
        q: &ShenandoahObjToScanQueue,
        obj: Oop,
        mode: UpdateRefsMode,
        live_data: &mut [usize],
    ) -> usize {
        let size = obj.size_words();
        let r = heap.heap_region_containing(obj.raw());
        if r.is_humongous_start() {
            // The whole chain is live, including the unused tail of the last region.
            let regions = heap.options().required_regions(obj.size_bytes());
            for index in r.index()..r.index() + regions {
                let chain = heap.get_region(index);
                chain.increase_live_data_words(chain.used() >> LOG_HEAP_WORD_SIZE);
            }
        } else {
            debug_assert!(!r.is_humongous(), "humongous objects start at a region bottom");
            live_data[r.index()] += size;
        }

        obj.oop_iterate(|slot| mark_through_ref(ctx, slot, q, mode));
        size
    }
}

#[inline]
fn resolve(obj: Oop, mode: UpdateRefsMode) -> Oop {
    match mode {
        UpdateRefsMode::None => obj,
        _ => ShenandoahForwarding::get_forwardee(obj),
    }
}

#[inline]
fn mark_through_ref(
    ctx: &ShenandoahMarkingContext,
    slot: &AtomicUsize,
    q: &ShenandoahObjToScanQueue,
    mode: UpdateRefsMode,
) {
    let value = slot.load(Ordering::Acquire);
    let obj = match Oop::from_raw_opt(value) {
        Some(obj) => obj,
        None => return,
    };
    let forwardee = resolve(obj, mode);
    if mode == UpdateRefsMode::Simple && forwardee != obj {
        // Mutators only race with us outside of pauses, and this mode runs in one.
        slot.store(forwardee.raw(), Ordering::Release);
    }
    if ctx.mark(forwardee) {
        q.push(forwardee);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmap::Mmap;
    use crate::shenandoah::alloc_request::AllocKind;
    use crate::shenandoah::marking_context::ShenandoahMarkingContexts;
    use crate::shenandoah::oop::{initialize_object, object_size};
    use crate::shenandoah::region::ShenandoahHeapRegion;

    #[test]
    fn test_mark_through_ref_resolves_forwarded_slots() {
        let shift = 20;
        let mem = Mmap::new(2 << shift).unwrap();
        let base = mem.aligned(1 << shift);
        let region = ShenandoahHeapRegion::new(0, base, 1 << shift, true);
        let contexts = ShenandoahMarkingContexts::new(base, 1, shift).unwrap();
        let ctx = contexts.next();
        region.make_regular_allocation();

        let size = object_size(0, 2);
        let from = region.allocate(size, AllocKind::Shared).unwrap();
        let to = region.allocate(size, AllocKind::Shared).unwrap();
        ctx.capture_top_at_mark_start(&region);
        let (from, to) = unsafe { (initialize_object(from, size, 0), initialize_object(to, size, 0)) };
        ShenandoahForwarding::try_update_forwardee(from, to);

        let q = ShenandoahObjToScanQueue::new_lifo();
        let slot = AtomicUsize::new(from.raw());
        mark_through_ref(ctx, &slot, &q, UpdateRefsMode::Resolve);
        assert_eq!(slot.load(Ordering::Relaxed), from.raw());
        assert_eq!(q.pop(), Some(to));
        assert!(ctx.is_marked(to));
        assert!(!ctx.is_marked(from));

        mark_through_ref(ctx, &slot, &q, UpdateRefsMode::Simple);
        assert_eq!(slot.load(Ordering::Relaxed), to.raw());
        // Already marked, not queued twice.
        assert!(q.pop().is_none());

        let null = AtomicUsize::new(0);
        mark_through_ref(ctx, &null, &q, UpdateRefsMode::None);
        assert!(q.pop().is_none());
    }
}
