use std::sync::atomic::{AtomicUsize, Ordering};

use crate::Config;

use super::{
    evac_oom::ShenandoahEvacOOMScope,
    gc_state::GcState,
    heap::ShenandoahHeap,
    lab::ShenandoahLab,
    oop::{Oop, ShenandoahForwarding},
    satb::ShenandoahSatbQueue,
};

/// Everything a compiled fast path needs to implement the barriers without calling into the
/// heap: the gc state byte, the collection set map biased by the heap base, the location of the
/// forwarding word and the region size.
///
/// An address `a` is in the collection set when
/// `*(cset_map_address + (a >> region_size_bytes_shift)) != 0`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BarrierAbi {
    pub gc_state_address: usize,
    pub cset_map_address: usize,
    pub forwarding_offset: isize,
    pub region_size_bytes_shift: usize,
}

/// Mutator side of the collector. Each barrier can be switched off for experiments, which is
/// only safe when the matching collector phase never runs concurrently.
pub struct ShenandoahBarrierSet {
    read_barrier: bool,
    write_barrier: bool,
    satb_barrier: bool,
    storeval_read_barrier: bool,
    acmp_barrier: bool,
}

impl ShenandoahBarrierSet {
    pub fn new(config: &Config) -> Self {
        Self {
            read_barrier: config.read_barrier,
            write_barrier: config.write_barrier,
            satb_barrier: config.satb_barrier,
            storeval_read_barrier: config.storeval_read_barrier,
            acmp_barrier: config.acmp_barrier,
        }
    }

    /// Resolves `obj` to its current copy for reading.
    #[inline]
    pub fn read_barrier(&self, obj: Oop) -> Oop {
        if self.read_barrier {
            ShenandoahForwarding::get_forwardee(obj)
        } else {
            obj
        }
    }

    /// Resolves `obj` for writing. During evacuation an object still in the collection set is
    /// copied first, so writes never land in from-space. After an evacuation failure the
    /// from-space copy is returned, and the failing cycle is already cancelled.
    pub(crate) fn write_barrier(&self, heap: &ShenandoahHeap, obj: Oop, gclab: &mut ShenandoahLab) -> Oop {
        if !self.write_barrier {
            return obj;
        }
        let state = heap.gc_state().load();
        if state.contains(GcState::EVACUATION) && heap.in_collection_set(obj) {
            let forwardee = ShenandoahForwarding::get_forwardee(obj);
            if forwardee != obj {
                return forwardee;
            }
            let scope = heap.evac_oom().enter();
            return self.evacuate_in_scope(heap, obj, &scope, gclab);
        }
        if state.contains(GcState::HAS_FORWARDED) {
            ShenandoahForwarding::get_forwardee(obj)
        } else {
            obj
        }
    }

    fn evacuate_in_scope(
        &self,
        heap: &ShenandoahHeap,
        obj: Oop,
        scope: &ShenandoahEvacOOMScope<'_>,
        gclab: &mut ShenandoahLab,
    ) -> Oop {
        // Somebody may have copied it while we waited to enter.
        let forwardee = ShenandoahForwarding::get_forwardee(obj);
        if forwardee != obj {
            return forwardee;
        }
        heap.evacuate_object(obj, scope, gclab)
    }

    /// Records the value a store is about to overwrite while marking is running.
    #[inline]
    pub(crate) fn satb_enqueue(&self, heap: &ShenandoahHeap, previous: usize, satb: &mut ShenandoahSatbQueue) {
        if !self.satb_barrier || previous == 0 {
            return;
        }
        let qset = heap.satb_queue_set();
        if qset.is_active() {
            satb.enqueue(qset, Oop::from_raw(previous));
        }
    }

    /// Stores `value` into `slot` with the pre-write barrier applied. The swap makes sure every
    /// overwritten value is seen by exactly one storing thread.
    #[inline]
    pub(crate) fn store_reference(
        &self,
        heap: &ShenandoahHeap,
        slot: &AtomicUsize,
        value: Option<Oop>,
        satb: &mut ShenandoahSatbQueue,
    ) {
        let value = value.map(|v| self.storeval_barrier(heap, v));
        let raw = value.map_or(0, Oop::raw);
        if heap.is_concurrent_mark_in_progress() {
            let previous = slot.swap(raw, Ordering::AcqRel);
            self.satb_enqueue(heap, previous, satb);
        } else {
            slot.store(raw, Ordering::Release);
        }
    }

    /// Keeps from-space references from being stored into the heap while forwarded objects
    /// exist.
    #[inline]
    pub fn storeval_barrier(&self, heap: &ShenandoahHeap, value: Oop) -> Oop {
        if self.storeval_read_barrier && heap.has_forwarded_objects() {
            ShenandoahForwarding::get_forwardee(value)
        } else {
            value
        }
    }

    /// Reference equality. Two different addresses may still be copies of the same object.
    #[inline]
    pub fn acmp_barrier(&self, heap: &ShenandoahHeap, a: Oop, b: Oop) -> bool {
        if a == b {
            return true;
        }
        if self.acmp_barrier && heap.has_forwarded_objects() {
            ShenandoahForwarding::get_forwardee(a) == ShenandoahForwarding::get_forwardee(b)
        } else {
            false
        }
    }

    /// Makes an object read from a weak reference reachable for the running marking.
    #[inline]
    pub(crate) fn keep_alive_barrier(&self, heap: &ShenandoahHeap, obj: Oop, satb: &mut ShenandoahSatbQueue) {
        self.satb_enqueue(heap, obj.raw(), satb);
    }
}
