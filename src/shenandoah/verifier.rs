//! Heap verification. Runs at a safepoint with parsable regions and reports the first
//! inconsistency it finds.
use std::sync::atomic::{AtomicUsize, Ordering};

use hashbrown::HashSet;

use crate::error::VerifyError;

use super::{
    gc_state::GcState,
    heap::ShenandoahHeap,
    marking_context::ShenandoahMarkingContext,
    oop::{Oop, ShenandoahForwarding, HEAP_WORD_SIZE, MIN_OBJECT_WORDS, OBJECT_ALIGNMENT_WORDS},
    region::ShenandoahHeapRegion,
};

/// Whether reachable objects may have a forwarding pointer to another copy.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum VerifyForwarded {
    None,
    /// Forwarded once at most, into a region outside of the collection set.
    Allow,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum VerifyMarked {
    Disable,
    /// Every reachable object is marked in the complete marking context.
    Complete,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum VerifyCollectionSet {
    Disable,
    /// No reachable object is in the collection set.
    None,
    /// Reachable objects in the collection set are already evacuated.
    Forwarded,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum VerifyLiveness {
    Disable,
    /// Region live data matches the complete marking exactly.
    Complete,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum VerifyRegions {
    Disable,
    NoCSet,
    NoTrashNoCSet,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum VerifyGcState {
    Disable,
    Stable,
    Forwarded,
}

/// What the heap is expected to look like at a given point of the cycle.
#[derive(Clone, Copy, Debug)]
pub struct VerifyOptions {
    pub forwarded: VerifyForwarded,
    pub marked: VerifyMarked,
    pub cset: VerifyCollectionSet,
    pub liveness: VerifyLiveness,
    pub regions: VerifyRegions,
    pub gc_state: VerifyGcState,
    pub next_bitmap_clear: bool,
}

impl VerifyOptions {
    pub fn before_marking() -> Self {
        Self {
            forwarded: VerifyForwarded::None,
            marked: VerifyMarked::Disable,
            cset: VerifyCollectionSet::None,
            liveness: VerifyLiveness::Disable,
            regions: VerifyRegions::NoCSet,
            gc_state: VerifyGcState::Stable,
            next_bitmap_clear: true,
        }
    }

    pub fn after_marking() -> Self {
        Self {
            forwarded: VerifyForwarded::None,
            marked: VerifyMarked::Complete,
            cset: VerifyCollectionSet::None,
            liveness: VerifyLiveness::Complete,
            regions: VerifyRegions::NoCSet,
            gc_state: VerifyGcState::Stable,
            next_bitmap_clear: false,
        }
    }

    pub fn before_evacuation() -> Self {
        Self {
            forwarded: VerifyForwarded::None,
            marked: VerifyMarked::Complete,
            cset: VerifyCollectionSet::Disable,
            liveness: VerifyLiveness::Disable,
            regions: VerifyRegions::Disable,
            gc_state: VerifyGcState::Stable,
            next_bitmap_clear: false,
        }
    }

    pub fn before_updaterefs() -> Self {
        Self {
            forwarded: VerifyForwarded::Allow,
            marked: VerifyMarked::Disable,
            cset: VerifyCollectionSet::Forwarded,
            liveness: VerifyLiveness::Disable,
            regions: VerifyRegions::Disable,
            gc_state: VerifyGcState::Forwarded,
            next_bitmap_clear: false,
        }
    }

    pub fn after_updaterefs() -> Self {
        Self {
            forwarded: VerifyForwarded::None,
            marked: VerifyMarked::Disable,
            cset: VerifyCollectionSet::None,
            liveness: VerifyLiveness::Disable,
            regions: VerifyRegions::NoCSet,
            gc_state: VerifyGcState::Stable,
            next_bitmap_clear: false,
        }
    }

    pub fn after_degenerated() -> Self {
        Self {
            forwarded: VerifyForwarded::None,
            marked: VerifyMarked::Disable,
            cset: VerifyCollectionSet::None,
            liveness: VerifyLiveness::Disable,
            regions: VerifyRegions::NoTrashNoCSet,
            gc_state: VerifyGcState::Stable,
            next_bitmap_clear: false,
        }
    }

    pub fn before_full() -> Self {
        Self {
            forwarded: VerifyForwarded::Allow,
            marked: VerifyMarked::Disable,
            cset: VerifyCollectionSet::None,
            liveness: VerifyLiveness::Disable,
            regions: VerifyRegions::NoTrashNoCSet,
            gc_state: VerifyGcState::Disable,
            next_bitmap_clear: true,
        }
    }

    pub fn after_full() -> Self {
        Self {
            forwarded: VerifyForwarded::None,
            marked: VerifyMarked::Complete,
            cset: VerifyCollectionSet::None,
            liveness: VerifyLiveness::Disable,
            regions: VerifyRegions::NoTrashNoCSet,
            gc_state: VerifyGcState::Stable,
            next_bitmap_clear: false,
        }
    }

    /// The strictest checks that hold wherever the cycle currently is.
    pub fn for_current_state(heap: &ShenandoahHeap) -> Self {
        let state = heap.gc_state().load();
        if state.is_empty() {
            return Self {
                forwarded: VerifyForwarded::None,
                marked: VerifyMarked::Disable,
                cset: VerifyCollectionSet::Disable,
                liveness: VerifyLiveness::Disable,
                regions: VerifyRegions::Disable,
                gc_state: VerifyGcState::Stable,
                next_bitmap_clear: false,
            };
        }
        Self {
            forwarded: VerifyForwarded::Allow,
            marked: VerifyMarked::Disable,
            cset: VerifyCollectionSet::Disable,
            liveness: VerifyLiveness::Disable,
            regions: VerifyRegions::Disable,
            gc_state: VerifyGcState::Disable,
            next_bitmap_clear: false,
        }
    }
}

/// Checks the heap against `options`. The caller guarantees a safepoint and retired labs.
pub fn verify(
    heap: &ShenandoahHeap,
    label: &'static str,
    options: &VerifyOptions,
) -> Result<(), VerifyError> {
    let started = std::time::Instant::now();

    verify_gc_state(heap, label, options)?;
    verify_regions(heap, label, options)?;
    verify_used(heap, label)?;
    verify_parsable(heap, label)?;
    if options.next_bitmap_clear {
        verify_next_bitmap_clear(heap, label)?;
    }
    if options.liveness == VerifyLiveness::Complete {
        verify_liveness(heap, label)?;
    }
    let reachable = Reachability::new(heap, label, options).verify()?;

    tracing::debug!(
        "Verify {}: {} regions, {} reachable objects, {:.3}ms",
        label,
        heap.num_regions(),
        reachable,
        started.elapsed().as_secs_f64() * 1000.0
    );
    Ok(())
}

fn region_error(label: &'static str, r: &ShenandoahHeapRegion, message: String) -> VerifyError {
    VerifyError::Region {
        label,
        index: r.index(),
        message,
    }
}

fn verify_gc_state(
    heap: &ShenandoahHeap,
    label: &'static str,
    options: &VerifyOptions,
) -> Result<(), VerifyError> {
    let expected = match options.gc_state {
        VerifyGcState::Disable => return Ok(()),
        VerifyGcState::Stable => GcState::empty(),
        VerifyGcState::Forwarded => GcState::HAS_FORWARDED,
    };
    let actual = heap.gc_state().load();
    if actual != expected {
        return Err(VerifyError::Heap {
            label,
            message: format!("gc state should be {:?}, is {:?}", expected, actual),
        });
    }
    Ok(())
}

fn verify_regions(
    heap: &ShenandoahHeap,
    label: &'static str,
    options: &VerifyOptions,
) -> Result<(), VerifyError> {
    let cset = heap.collection_set();
    for r in heap.regions() {
        if r.top() < r.bottom() || r.top() > r.end() {
            return Err(region_error(label, r, format!("top out of bounds\n{}", r)));
        }
        if r.is_empty() && r.used() != 0 {
            return Err(region_error(label, r, format!("empty region is used\n{}", r)));
        }
        if r.is_cset() != cset.is_in(r.index()) {
            return Err(region_error(
                label,
                r,
                format!("state disagrees with the collection set\n{}", r),
            ));
        }
        if r.is_pinned() != (r.pin_count() > 0) {
            return Err(region_error(
                label,
                r,
                format!("pin count disagrees with the state\n{}", r),
            ));
        }
        if r.live_data_bytes() > r.used() {
            return Err(region_error(label, r, format!("more live data than used\n{}", r)));
        }
        if r.is_humongous_continuation() {
            let previous = r.index().checked_sub(1).map(|i| heap.get_region(i));
            if !previous.map_or(false, |p| p.is_humongous()) {
                return Err(region_error(
                    label,
                    r,
                    format!("humongous continuation without a start\n{}", r),
                ));
            }
        }
        match options.regions {
            VerifyRegions::Disable => {}
            VerifyRegions::NoCSet if r.is_cset() => {
                return Err(region_error(label, r, format!("unexpected cset region\n{}", r)));
            }
            VerifyRegions::NoTrashNoCSet if r.is_cset() || r.is_trash() => {
                return Err(region_error(
                    label,
                    r,
                    format!("unexpected cset or trash region\n{}", r),
                ));
            }
            _ => {}
        }
    }
    Ok(())
}

fn verify_used(heap: &ShenandoahHeap, label: &'static str) -> Result<(), VerifyError> {
    let regions: usize = heap.regions().iter().map(|r| r.used()).sum();
    let used = heap.used();
    if regions != used {
        return Err(VerifyError::Heap {
            label,
            message: format!("heap used is {} bytes, regions use {} bytes", used, regions),
        });
    }
    Ok(())
}

fn check_header(label: &'static str, obj: Oop, limit: usize) -> Result<(), VerifyError> {
    let size = obj.size_words();
    let message = if size < MIN_OBJECT_WORDS || size % OBJECT_ALIGNMENT_WORDS != 0 {
        format!("bad size {}", size)
    } else if obj.object_start() + size * HEAP_WORD_SIZE > limit {
        format!("extends past {:#x}", limit)
    } else if obj.num_refs() + super::oop::OBJECT_HEADER_WORDS > size {
        format!("{} refs do not fit in {} words", obj.num_refs(), size)
    } else {
        return Ok(());
    };
    Err(VerifyError::Object {
        label,
        addr: obj.raw(),
        message,
    })
}

/// Walks every region object by object.
fn verify_parsable(heap: &ShenandoahHeap, label: &'static str) -> Result<(), VerifyError> {
    let opts = heap.options();
    for r in heap.regions() {
        if r.is_humongous_start() {
            let obj = Oop::from_object_start(r.bottom());
            let regions = opts.required_regions(obj.size_bytes());
            let limit = r.bottom() + regions * opts.region_size_bytes;
            if r.index() + regions > heap.num_regions() {
                return Err(region_error(label, r, "humongous object past the heap end".into()));
            }
            check_header(label, obj, limit)?;
            for index in r.index() + 1..r.index() + regions {
                if !heap.get_region(index).is_humongous_continuation() {
                    return Err(region_error(
                        label,
                        r,
                        format!("region {} should continue the humongous object", index),
                    ));
                }
            }
        } else if r.is_active() && !r.is_humongous() {
            let mut cursor = r.bottom();
            let top = r.top();
            while cursor < top {
                let obj = Oop::from_object_start(cursor);
                check_header(label, obj, top)?;
                cursor += obj.size_bytes();
            }
        }
    }
    Ok(())
}

fn verify_next_bitmap_clear(heap: &ShenandoahHeap, label: &'static str) -> Result<(), VerifyError> {
    let next = heap.marking().next();
    for r in heap.regions().iter().filter(|r| r.is_committed()) {
        if !next.is_bitmap_clear_range(r.bottom(), r.end()) {
            return Err(region_error(label, r, "next mark bitmap is not clear".into()));
        }
    }
    Ok(())
}

fn verify_liveness(heap: &ShenandoahHeap, label: &'static str) -> Result<(), VerifyError> {
    let complete = heap.marking().complete();
    for r in heap.regions() {
        if !r.is_active() || r.is_humongous() {
            continue;
        }
        let tams = complete.top_at_mark_start(r);
        let mut live = r.top().saturating_sub(tams);
        complete.marked_object_iterate(r, tams, |obj| live += obj.size_bytes());
        if live != r.live_data_bytes() {
            return Err(region_error(
                label,
                r,
                format!("live data should be {} bytes\n{}", live, r),
            ));
        }
    }
    Ok(())
}

/// Transitive walk from every root category.
struct Reachability<'a> {
    heap: &'a ShenandoahHeap,
    label: &'static str,
    options: &'a VerifyOptions,
    complete: &'a ShenandoahMarkingContext,
    visited: HashSet<usize>,
    stack: Vec<Oop>,
}

impl<'a> Reachability<'a> {
    fn new(heap: &'a ShenandoahHeap, label: &'static str, options: &'a VerifyOptions) -> Self {
        Self {
            heap,
            label,
            options,
            complete: heap.marking().complete(),
            visited: HashSet::new(),
            stack: Vec::new(),
        }
    }

    fn collect_roots(&self) -> Vec<(&'static str, usize)> {
        let mut roots = Vec::new();
        for mutator in self.heap.mutators_snapshot() {
            mutator.oops_do(&mut |slot: &AtomicUsize| {
                roots.push(("thread", slot.load(Ordering::Acquire)))
            });
        }
        self.heap
            .global_handles()
            .oops_do(&mut |slot: &AtomicUsize| roots.push(("global handles", slot.load(Ordering::Acquire))));
        self.heap
            .weak_handles()
            .oops_do(&mut |slot: &AtomicUsize| roots.push(("weak handles", slot.load(Ordering::Acquire))));
        self.heap
            .code_roots()
            .iterator()
            .possibly_parallel_blobs_do(self.heap.collection_set(), |blob| {
                blob.oops_do(&mut |slot: &AtomicUsize| {
                    roots.push(("code", slot.load(Ordering::Acquire)))
                })
            });
        roots
    }

    fn verify(mut self) -> Result<usize, VerifyError> {
        for (root, raw) in self.collect_roots() {
            if raw == 0 {
                continue;
            }
            if let Err(message) = self.visit(raw) {
                return Err(VerifyError::Root {
                    label: self.label,
                    root,
                    message,
                });
            }
        }
        while let Some(obj) = self.stack.pop() {
            let mut failure = None;
            obj.oop_iterate(|slot| {
                if failure.is_some() {
                    return;
                }
                let raw = slot.load(Ordering::Acquire);
                if raw != 0 {
                    if let Err(message) = self.visit(raw) {
                        failure = Some(message);
                    }
                }
            });
            if let Some(message) = failure {
                return Err(VerifyError::Object {
                    label: self.label,
                    addr: obj.raw(),
                    message,
                });
            }
        }
        Ok(self.visited.len())
    }

    /// Checks the reference `raw` and queues the object it resolves to.
    fn visit(&mut self, raw: usize) -> Result<(), String> {
        let obj = self.check_reference(raw)?;
        let r = self.heap.heap_region_containing(obj.raw());

        let forwardee = ShenandoahForwarding::get_forwardee(obj);
        let resolved = if forwardee != obj {
            if self.options.forwarded == VerifyForwarded::None {
                return Err(format!("{:#x} is forwarded to {:#x}", raw, forwardee.raw()));
            }
            let target = self.check_reference(forwardee.raw())?;
            if ShenandoahForwarding::is_forwarded(target) {
                return Err(format!("{:#x} is forwarded more than once", raw));
            }
            if self.heap.in_collection_set(target) {
                return Err(format!("{:#x} is forwarded into the collection set", raw));
            }
            target
        } else {
            obj
        };

        match self.options.cset {
            VerifyCollectionSet::None if r.is_cset() => {
                return Err(format!("{:#x} is in the collection set", raw));
            }
            VerifyCollectionSet::Forwarded if r.is_cset() && forwardee == obj => {
                return Err(format!("{:#x} is in the collection set and not evacuated", raw));
            }
            _ => {}
        }

        if self.options.marked == VerifyMarked::Complete && !self.complete.is_marked(resolved) {
            return Err(format!("{:#x} is reachable but not marked", resolved.raw()));
        }

        if self.visited.insert(resolved.raw()) {
            self.stack.push(resolved);
        }
        Ok(())
    }

    fn check_reference(&self, raw: usize) -> Result<Oop, String> {
        if !self.heap.is_in(raw) {
            return Err(format!("{:#x} is outside of the heap", raw));
        }
        if (raw - HEAP_WORD_SIZE) % (OBJECT_ALIGNMENT_WORDS * HEAP_WORD_SIZE) != 0 {
            return Err(format!("{:#x} is misaligned", raw));
        }
        let r = self.heap.heap_region_containing(raw);
        if !r.is_active() {
            return Err(format!("{:#x} points to a {} region", raw, r.state().name()));
        }
        if r.is_humongous_continuation() {
            return Err(format!("{:#x} points into a humongous continuation", raw));
        }
        let obj = Oop::from_raw(raw);
        if raw >= r.top() {
            return Err(format!("{:#x} is above top {:#x}", raw, r.top()));
        }
        if obj.is_filler() {
            return Err(format!("{:#x} is a filler", raw));
        }
        Ok(obj)
    }
}
