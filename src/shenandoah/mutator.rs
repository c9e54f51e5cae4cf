//! Mutator threads: allocation through TLABs, barriered heap access and the local handles that
//! act as the thread's stack roots.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::{error::AllocError, safepoint::ManagedScope};

use super::{
    alloc_request::{AllocKind, ShenandoahAllocRequest},
    code_roots::CodeBlob,
    handles::{GlobalHandle, WeakHandle},
    heap::ShenandoahHeap,
    lab::ShenandoahLab,
    oop::{initialize_object, object_size, Oop, MAX_REFS},
    root_processor::ShenandoahOopClosure,
    satb::{ShenandoahSatbQueue, ShenandoahSatbQueueSet},
};

/// Reference held by a mutator. Indexes the mutator's handle area, which the collector scans
/// and updates, so a `Local` stays valid while objects move.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct Local(usize);

/// Position in the handle area, see [Mutator::handle_mark].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct HandleMark(usize);

struct MutatorLocal {
    tlab: ShenandoahLab,
    gclab: ShenandoahLab,
    satb: ShenandoahSatbQueue,
    handles: Vec<AtomicUsize>,
}

/// Per thread state shared with the collector. The collector only touches it at safepoints.
pub struct MutatorState {
    local: Mutex<MutatorLocal>,
}

impl MutatorState {
    pub(crate) fn new() -> Self {
        Self {
            local: Mutex::new(MutatorLocal {
                tlab: ShenandoahLab::new(AllocKind::Tlab),
                gclab: ShenandoahLab::new(AllocKind::Gclab),
                satb: ShenandoahSatbQueue::new(),
                handles: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MutatorLocal> {
        self.local.lock()
    }

    /// Visits the handle area.
    pub fn oops_do(&self, cl: &mut dyn ShenandoahOopClosure) {
        let local = self.lock();
        for slot in local.handles.iter() {
            cl.do_oop(slot);
        }
    }

    pub(crate) fn retire_labs(&self) {
        let mut local = self.lock();
        local.tlab.retire();
        local.gclab.retire();
    }

    pub(crate) fn flush_satb(&self, qset: &ShenandoahSatbQueueSet) {
        let mut local = self.lock();
        local.satb.flush(qset);
    }

    pub(crate) fn clear_satb(&self) {
        self.lock().satb.clear();
    }

    pub fn handles_count(&self) -> usize {
        self.lock().handles.len()
    }
}

/// A thread attached to the heap.
///
/// Every operation runs in managed state, safepoints wait until it is done. Blocking on the
/// collector, for pacing or after an allocation failure, happens in safe state.
pub struct Mutator {
    heap: Arc<ShenandoahHeap>,
    state: Arc<MutatorState>,
}

impl Mutator {
    pub(crate) fn new(heap: Arc<ShenandoahHeap>, state: Arc<MutatorState>) -> Self {
        Self { heap, state }
    }

    pub fn heap(&self) -> &Arc<ShenandoahHeap> {
        &self.heap
    }

    fn slot_value(local: &MutatorLocal, handle: Local) -> Oop {
        let raw = local.handles[handle.0].load(Ordering::Acquire);
        debug_assert!(raw != 0, "local {} is null", handle.0);
        Oop::from_raw(raw)
    }

    fn push(local: &mut MutatorLocal, obj: Oop) -> Local {
        local.handles.push(AtomicUsize::new(obj.raw()));
        Local(local.handles.len() - 1)
    }

    /// Allocates an object with `refs` null reference slots and `data` zeroed data words.
    pub fn allocate(&mut self, refs: usize, data: usize) -> Result<Local, AllocError> {
        assert!(refs <= MAX_REFS, "too many reference slots: {}", refs);
        let size = object_size(refs, data);
        let heap = self.heap.clone();
        let scope = heap.safepoint().enter_managed();
        let start = self.allocate_memory(&scope, size)?;
        let mut local = self.state.lock();
        let obj = unsafe { initialize_object(start, size, refs) };
        Ok(Self::push(&mut local, obj))
    }

    fn allocate_memory(&self, scope: &ManagedScope<'_>, size: usize) -> Result<usize, AllocError> {
        let heap = &*self.heap;
        let max_tlab = heap.options().max_tlab_size_words;
        if heap.config().use_tlab && size <= max_tlab {
            let mut local = self.state.lock();
            if let Some(addr) = local.tlab.allocate(size) {
                return Ok(addr);
            }
            // Keep a buffer that still has room for smaller objects.
            if local.tlab.remaining() <= max_tlab / 64 {
                local.tlab.retire();
                drop(local);

                let mut req = ShenandoahAllocRequest::for_tlab(size, max_tlab);
                let start = heap.allocate_memory(scope, &mut req)?;

                let mut local = self.state.lock();
                local.tlab.fill(start, req.actual_size());
                return local.tlab.allocate(size).ok_or(AllocError::OutOfMemory {
                    requested_words: size,
                });
            }
        }
        let mut req = ShenandoahAllocRequest::for_shared(size);
        heap.allocate_memory(scope, &mut req)
    }

    /// Loads reference slot `index` of `obj`.
    pub fn load(&mut self, obj: Local, index: usize) -> Option<Local> {
        let _scope = self.heap.safepoint().enter_managed();
        let mut local = self.state.lock();
        let target = self.heap.barrier_set().read_barrier(Self::slot_value(&local, obj));
        debug_assert!(index < target.num_refs(), "slot {} out of bounds", index);
        let value = Oop::from_raw_opt(target.ref_slot(index).load(Ordering::Acquire))?;
        Some(Self::push(&mut local, value))
    }

    /// Stores `value` into reference slot `index` of `obj`.
    pub fn store(&mut self, obj: Local, index: usize, value: Option<Local>) {
        let _scope = self.heap.safepoint().enter_managed();
        let mut local = self.state.lock();
        let local = &mut *local;
        let barriers = self.heap.barrier_set();

        let target = Self::slot_value(local, obj);
        let target = barriers.write_barrier(&self.heap, target, &mut local.gclab);
        // The write barrier may have moved the object, keep the handle current.
        local.handles[obj.0].store(target.raw(), Ordering::Release);

        debug_assert!(index < target.num_refs(), "slot {} out of bounds", index);
        let value = value.map(|v| Self::slot_value(local, v));
        barriers.store_reference(&self.heap, target.ref_slot(index), value, &mut local.satb);
    }

    pub fn read_data(&mut self, obj: Local, index: usize) -> usize {
        let _scope = self.heap.safepoint().enter_managed();
        let local = self.state.lock();
        let target = self.heap.barrier_set().read_barrier(Self::slot_value(&local, obj));
        debug_assert!(index < target.data_words(), "data word {} out of bounds", index);
        target.data_slot(index).load(Ordering::Acquire)
    }

    pub fn write_data(&mut self, obj: Local, index: usize, value: usize) {
        let _scope = self.heap.safepoint().enter_managed();
        let mut local = self.state.lock();
        let local = &mut *local;
        let target = Self::slot_value(local, obj);
        let target = self
            .heap
            .barrier_set()
            .write_barrier(&self.heap, target, &mut local.gclab);
        local.handles[obj.0].store(target.raw(), Ordering::Release);
        debug_assert!(index < target.data_words(), "data word {} out of bounds", index);
        target.data_slot(index).store(value, Ordering::Release);
    }

    /// Reference equality that sees through forwarding.
    pub fn same_object(&mut self, a: Local, b: Local) -> bool {
        let _scope = self.heap.safepoint().enter_managed();
        let local = self.state.lock();
        self.heap.barrier_set().acmp_barrier(
            &self.heap,
            Self::slot_value(&local, a),
            Self::slot_value(&local, b),
        )
    }

    pub fn is_null(&self, obj: Local) -> bool {
        self.state.lock().handles[obj.0].load(Ordering::Acquire) == 0
    }

    /// Resolved address of `obj`. Only stable until the next safepoint unless pinned.
    pub fn resolve(&mut self, obj: Local) -> Oop {
        let _scope = self.heap.safepoint().enter_managed();
        let local = self.state.lock();
        self.heap
            .barrier_set()
            .read_barrier(Self::slot_value(&local, obj))
    }

    /// Keeps `obj` at its address until [Mutator::unpin]. Pinned regions are never evacuated
    /// and the full GC does not slide their objects. Fails with [AllocError::ShuttingDown] when
    /// the object is stuck in the collection set of a heap that is stopping.
    pub fn pin(&mut self, obj: Local) -> Result<Oop, AllocError> {
        let heap = self.heap.clone();
        let scope = heap.safepoint().enter_managed();
        loop {
            let target = {
                let mut local = self.state.lock();
                let local = &mut *local;
                let target = Self::slot_value(local, obj);
                let target = heap
                    .barrier_set()
                    .write_barrier(&heap, target, &mut local.gclab);
                local.handles[obj.0].store(target.raw(), Ordering::Release);
                target
            };
            if heap.try_pin_object(target) {
                return Ok(target);
            }
            if heap.policy().is_at_shutdown() {
                return Err(AllocError::ShuttingDown);
            }
            // The object could not be evacuated. Wait for the collector to finish the cycle.
            scope.block(|| {
                heap.control()
                    .handle_alloc_failure(&heap, target.size_words())
            });
        }
    }

    pub fn unpin(&mut self, obj: Local) {
        let _scope = self.heap.safepoint().enter_managed();
        let target = {
            let local = self.state.lock();
            self.heap
                .barrier_set()
                .read_barrier(Self::slot_value(&local, obj))
        };
        self.heap.unpin_object(target);
    }

    pub fn new_global(&mut self, value: Option<Local>) -> GlobalHandle {
        let _scope = self.heap.safepoint().enter_managed();
        let local = self.state.lock();
        let value = value.map(|v| Self::slot_value(&local, v));
        GlobalHandle(self.heap.global_handles().add(value))
    }

    pub fn global(&mut self, handle: GlobalHandle) -> Option<Local> {
        let _scope = self.heap.safepoint().enter_managed();
        let mut local = self.state.lock();
        let value = self.heap.global_handles().get(handle.0)?;
        Some(Self::push(&mut local, value))
    }

    pub fn set_global(&mut self, handle: GlobalHandle, value: Option<Local>) {
        let _scope = self.heap.safepoint().enter_managed();
        let local = self.state.lock();
        let value = value.map(|v| Self::slot_value(&local, v));
        self.heap.global_handles().set(handle.0, value);
    }

    pub fn release_global(&mut self, handle: GlobalHandle) {
        let _scope = self.heap.safepoint().enter_managed();
        self.heap.global_handles().release(handle.0);
    }

    pub fn new_weak(&mut self, value: Local) -> WeakHandle {
        let _scope = self.heap.safepoint().enter_managed();
        let local = self.state.lock();
        let value = Self::slot_value(&local, value);
        WeakHandle(self.heap.weak_handles().add(Some(value)))
    }

    /// Reads a weak handle. Returns `None` once a cycle cleared it.
    pub fn weak(&mut self, handle: WeakHandle) -> Option<Local> {
        let _scope = self.heap.safepoint().enter_managed();
        let mut local = self.state.lock();
        let local = &mut *local;
        let value = self.heap.weak_handles().get(handle.0)?;
        // The running marking may not have seen the referent yet.
        if self.heap.is_concurrent_mark_in_progress() {
            self.heap
                .barrier_set()
                .keep_alive_barrier(&self.heap, value, &mut local.satb);
        }
        Some(Self::push(local, value))
    }

    pub fn release_weak(&mut self, handle: WeakHandle) {
        let _scope = self.heap.safepoint().enter_managed();
        self.heap.weak_handles().release(handle.0);
    }

    /// Registers a code blob referencing `oops`. The collector treats it as a root and updates
    /// it when the referents move.
    pub fn register_code(&mut self, name: &str, oops: &[Local]) -> Arc<CodeBlob> {
        let _scope = self.heap.safepoint().enter_managed();
        let local = self.state.lock();
        let blob = Arc::new(CodeBlob::new(
            name,
            oops.iter().map(|o| Self::slot_value(&local, *o)),
        ));
        self.heap.code_roots().add(blob.clone());
        blob
    }

    pub fn unregister_code(&mut self, blob: &Arc<CodeBlob>) {
        let _scope = self.heap.safepoint().enter_managed();
        self.heap.code_roots().remove(blob);
    }

    /// Pushes the referent `index` of `blob` as a local.
    pub fn code_oop(&mut self, blob: &CodeBlob, index: usize) -> Option<Local> {
        let _scope = self.heap.safepoint().enter_managed();
        let mut local = self.state.lock();
        let value = blob.oop_at(index)?;
        Some(Self::push(&mut local, value))
    }

    pub fn handle_mark(&self) -> HandleMark {
        HandleMark(self.state.lock().handles.len())
    }

    /// Drops every local created after `mark`.
    pub fn reset_handles(&mut self, mark: HandleMark) {
        let _scope = self.heap.safepoint().enter_managed();
        self.state.lock().handles.truncate(mark.0);
    }

    /// Runs an explicit collection and waits for it.
    pub fn collect(&mut self) {
        self.heap.collect();
    }
}

impl Drop for Mutator {
    fn drop(&mut self) {
        self.heap.detach_mutator(&self.state);
    }
}
