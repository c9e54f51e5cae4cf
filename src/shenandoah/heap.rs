use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_utils::CachePadded;
use parking_lot::{Mutex, MutexGuard};
use rand::Rng;

use crate::{
    error::{AllocError, ConfigError, VerifyError},
    mmap::Mmap,
    safepoint::{GlobalSafepoint, ManagedScope},
    statistics::HeapStatistics,
    utils::{formatted_size, ShenandoahSharedFlag, M},
    Config,
};

use super::{
    alloc_request::{AllocKind, ShenandoahAllocRequest},
    barrier::{BarrierAbi, ShenandoahBarrierSet},
    code_roots::ShenandoahCodeRoots,
    collection_set::ShenandoahCollectionSet,
    concurrent_mark::ShenandoahConcurrentMark,
    control::ShenandoahControlThread,
    evac_oom::{ShenandoahEvacOOMHandler, ShenandoahEvacOOMScope},
    free_set::ShenandoahFreeSet,
    full_gc,
    gc_state::{GcState, ShenandoahGcState},
    handles::ShenandoahHandles,
    heuristics::{self, ShenandoahHeuristics},
    lab::ShenandoahLab,
    marking_context::ShenandoahMarkingContexts,
    metrics::ShenandoahMetricsSnapshot,
    mutator::{Mutator, MutatorState},
    oop::{
        copy_object, fill_with_filler, Oop, ShenandoahForwarding, LOG_HEAP_WORD_SIZE,
    },
    pacer::ShenandoahPacer,
    phase_timings::{ShenandoahPhase, ShenandoahPhaseScope, ShenandoahPhaseTimings},
    policy::{GcCause, ShenandoahCollectorPolicy, ShenandoahDegenPoint},
    region::{ShenandoahHeapRegion, ShenandoahOptions},
    root_processor::ShenandoahRootProcessor,
    satb::ShenandoahSatbQueueSet,
    verifier::{self, VerifyOptions},
    workers::ShenandoahWorkGang,
};

/// Region based concurrent mostly-moving heap.
///
/// The heap owns the reserved address range, the region table and every piece of collector
/// state. A control thread drives the cycles; mutators talk to the heap through [Mutator]
/// handles obtained from [ShenandoahHeap::attach_mutator].
///
/// The control thread keeps an `Arc` to the heap, so [ShenandoahHeap::stop] has to be called
/// before the heap can be dropped.
pub struct ShenandoahHeap {
    config: Config,
    options: ShenandoahOptions,
    _reserved: Mmap,
    heap_base: usize,
    regions: Box<[ShenandoahHeapRegion]>,
    marking: ShenandoahMarkingContexts,
    collection_set: ShenandoahCollectionSet,
    /// The heap lock. Guards region state changes and the free set.
    free_set: Mutex<ShenandoahFreeSet>,
    gc_state: ShenandoahGcState,

    cancelled_gc: ShenandoahSharedFlag,
    progress_last_gc: ShenandoahSharedFlag,
    degenerated_gc_in_progress: ShenandoahSharedFlag,
    full_gc_in_progress: ShenandoahSharedFlag,
    inject_alloc_failure: ShenandoahSharedFlag,

    used: CachePadded<AtomicUsize>,
    bytes_allocated_since_gc_start: CachePadded<AtomicUsize>,

    evac_oom: ShenandoahEvacOOMHandler,
    concurrent_mark: ShenandoahConcurrentMark,
    satb: ShenandoahSatbQueueSet,
    barrier_set: ShenandoahBarrierSet,
    workers: ShenandoahWorkGang,
    safepoint: GlobalSafepoint,

    mutators: Mutex<Vec<Arc<MutatorState>>>,
    global_handles: ShenandoahHandles,
    weak_handles: ShenandoahHandles,
    code_roots: ShenandoahCodeRoots,

    heuristics: Mutex<Box<dyn ShenandoahHeuristics>>,
    policy: ShenandoahCollectorPolicy,
    phase_timings: ShenandoahPhaseTimings,
    pacer: ShenandoahPacer,
    control: ShenandoahControlThread,
    control_handle: Mutex<Option<JoinHandle<()>>>,

    update_refs_cursor: CachePadded<AtomicUsize>,
    worker_gclabs: Box<[Mutex<ShenandoahLab>]>,
    /// Evacuations left until an injected failure, `usize::MAX` when off.
    evac_failure_countdown: AtomicUsize,
}

impl ShenandoahHeap {
    /// Creates a heap with the heuristics named in `config` and starts its control thread.
    pub fn create(config: Config) -> Result<Arc<Self>, ConfigError> {
        let heuristics = heuristics::create(config.heuristics);
        Self::create_with_heuristics(config, heuristics)
    }

    /// Creates a heap driven by a custom heuristics implementation.
    pub fn create_with_heuristics(
        config: Config,
        heuristics: Box<dyn ShenandoahHeuristics>,
    ) -> Result<Arc<Self>, ConfigError> {
        config.validate()?;
        let options = ShenandoahHeapRegion::setup_sizes(&config)?;

        let region_size = options.region_size_bytes;
        let shift = options.region_size_bytes_shift;
        let reserved = Mmap::new(options.max_heap_size + region_size)?;
        let heap_base = reserved.aligned(region_size);

        let regions: Box<[ShenandoahHeapRegion]> = (0..options.region_count)
            .map(|index| {
                ShenandoahHeapRegion::new(index, heap_base + (index << shift), region_size, false)
            })
            .collect();
        let marking = ShenandoahMarkingContexts::new(heap_base, options.region_count, shift)?;
        let collection_set = ShenandoahCollectionSet::new(options.region_count, heap_base, shift);

        let max_workers = config.parallel_gc_threads.max(config.conc_gc_threads);
        let max_capacity = options.region_count * region_size;

        tracing::info!(
            "Shenandoah heap: {} reserved, {} regions of {}, {} workers, {} heuristics",
            formatted_size(max_capacity),
            options.region_count,
            formatted_size(region_size),
            max_workers,
            heuristics.name()
        );
        tracing::debug!("{:?}", options);

        let heap = Arc::new(Self {
            pacer: ShenandoahPacer::new(&config, max_capacity),
            barrier_set: ShenandoahBarrierSet::new(&config),
            satb: ShenandoahSatbQueueSet::new(config.satb_buffer_size),
            free_set: Mutex::new(ShenandoahFreeSet::new(options.region_count)),
            options,
            _reserved: reserved,
            heap_base,
            regions,
            marking,
            collection_set,
            gc_state: ShenandoahGcState::new(),
            cancelled_gc: ShenandoahSharedFlag::new(),
            progress_last_gc: ShenandoahSharedFlag::new(),
            degenerated_gc_in_progress: ShenandoahSharedFlag::new(),
            full_gc_in_progress: ShenandoahSharedFlag::new(),
            inject_alloc_failure: ShenandoahSharedFlag::new(),
            used: CachePadded::new(AtomicUsize::new(0)),
            bytes_allocated_since_gc_start: CachePadded::new(AtomicUsize::new(0)),
            evac_oom: ShenandoahEvacOOMHandler::new(),
            concurrent_mark: ShenandoahConcurrentMark::new(max_workers),
            workers: ShenandoahWorkGang::new(max_workers),
            safepoint: GlobalSafepoint::new(),
            mutators: Mutex::new(Vec::new()),
            global_handles: ShenandoahHandles::new(),
            weak_handles: ShenandoahHandles::new(),
            code_roots: ShenandoahCodeRoots::new(),
            heuristics: Mutex::new(heuristics),
            policy: ShenandoahCollectorPolicy::new(),
            phase_timings: ShenandoahPhaseTimings::new(),
            control: ShenandoahControlThread::new(),
            control_handle: Mutex::new(None),
            update_refs_cursor: CachePadded::new(AtomicUsize::new(0)),
            worker_gclabs: (0..max_workers)
                .map(|_| Mutex::new(ShenandoahLab::new(AllocKind::Gclab)))
                .collect(),
            evac_failure_countdown: AtomicUsize::new(usize::MAX),
            config,
        });

        heap.progress_last_gc.set();
        heap.free_set.lock().rebuild(&heap);
        if heap.config.pacing {
            heap.pacer.setup_for_idle();
        }

        let control_heap = heap.clone();
        let handle = std::thread::Builder::new()
            .name("shenandoah-control".to_string())
            .spawn(move || control_heap.control.run_service(&control_heap))?;
        *heap.control_handle.lock() = Some(handle);
        Ok(heap)
    }

    /// Registers the calling thread as a mutator.
    pub fn attach_mutator(self: &Arc<Self>) -> Mutator {
        let state = Arc::new(MutatorState::new());
        {
            let _scope = self.safepoint.enter_managed();
            self.mutators.lock().push(state.clone());
        }
        Mutator::new(self.clone(), state)
    }

    pub(crate) fn detach_mutator(&self, state: &Arc<MutatorState>) {
        let _scope = self.safepoint.enter_managed();
        state.retire_labs();
        state.flush_satb(&self.satb);
        self.mutators.lock().retain(|m| !Arc::ptr_eq(m, state));
    }

    /// Shuts the control thread down and releases every waiting mutator. Allocations fail
    /// with [AllocError::ShuttingDown] afterwards.
    pub fn stop(&self) {
        let handle = self.control_handle.lock().take();
        let handle = match handle {
            Some(handle) => handle,
            None => return,
        };
        self.policy.record_shutdown();
        self.control.prepare_for_graceful_shutdown();
        self.cancel_gc(GcCause::Shutdown);
        if handle.join().is_err() {
            tracing::error!("Control thread panicked");
        }
        self.control.notify_all_waiters();
        self.pacer.notify_waiters();
        if self.config.verbose {
            self.policy.print_gc_stats();
            self.phase_timings.print_summary();
        }
    }

    /// Requests an explicit collection and waits until it finished. Must not be called while
    /// the thread is inside a mutator operation.
    pub fn collect(&self) {
        self.control.handle_requested_gc(GcCause::ExplicitGc);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn options(&self) -> &ShenandoahOptions {
        &self.options
    }

    pub fn regions(&self) -> &[ShenandoahHeapRegion] {
        &self.regions
    }

    pub fn num_regions(&self) -> usize {
        self.regions.len()
    }

    pub fn get_region(&self, index: usize) -> &ShenandoahHeapRegion {
        &self.regions[index]
    }

    pub fn heap_base(&self) -> usize {
        self.heap_base
    }

    #[inline]
    pub fn is_in(&self, addr: usize) -> bool {
        addr >= self.heap_base && addr < self.heap_base + self.max_capacity()
    }

    #[inline]
    pub fn region_index(&self, addr: usize) -> usize {
        (addr - self.heap_base) >> self.options.region_size_bytes_shift
    }

    #[inline]
    pub fn heap_region_containing(&self, addr: usize) -> &ShenandoahHeapRegion {
        &self.regions[self.region_index(addr)]
    }

    pub fn marking(&self) -> &ShenandoahMarkingContexts {
        &self.marking
    }

    pub fn collection_set(&self) -> &ShenandoahCollectionSet {
        &self.collection_set
    }

    #[inline]
    pub fn in_collection_set(&self, obj: Oop) -> bool {
        self.collection_set.is_in_addr(obj.raw())
    }

    pub fn gc_state(&self) -> &ShenandoahGcState {
        &self.gc_state
    }

    pub fn barrier_set(&self) -> &ShenandoahBarrierSet {
        &self.barrier_set
    }

    /// Addresses and constants a compiled barrier needs.
    pub fn barrier_abi(&self) -> BarrierAbi {
        BarrierAbi {
            gc_state_address: self.gc_state.address(),
            cset_map_address: self.collection_set.biased_map_address(),
            forwarding_offset: ShenandoahForwarding::BYTE_OFFSET,
            region_size_bytes_shift: self.options.region_size_bytes_shift,
        }
    }

    pub fn policy(&self) -> &ShenandoahCollectorPolicy {
        &self.policy
    }

    pub fn phase_timings(&self) -> &ShenandoahPhaseTimings {
        &self.phase_timings
    }

    pub fn pacer(&self) -> &ShenandoahPacer {
        &self.pacer
    }

    pub fn heuristics(&self) -> MutexGuard<'_, Box<dyn ShenandoahHeuristics>> {
        self.heuristics.lock()
    }

    pub(crate) fn control(&self) -> &ShenandoahControlThread {
        &self.control
    }

    pub fn safepoint(&self) -> &GlobalSafepoint {
        &self.safepoint
    }

    pub(crate) fn workers(&self) -> &ShenandoahWorkGang {
        &self.workers
    }

    pub(crate) fn concurrent_mark(&self) -> &ShenandoahConcurrentMark {
        &self.concurrent_mark
    }

    pub(crate) fn satb_queue_set(&self) -> &ShenandoahSatbQueueSet {
        &self.satb
    }

    pub(crate) fn evac_oom(&self) -> &ShenandoahEvacOOMHandler {
        &self.evac_oom
    }

    pub fn code_roots(&self) -> &ShenandoahCodeRoots {
        &self.code_roots
    }

    pub fn global_handles(&self) -> &ShenandoahHandles {
        &self.global_handles
    }

    pub fn weak_handles(&self) -> &ShenandoahHandles {
        &self.weak_handles
    }

    pub(crate) fn mutators_snapshot(&self) -> Vec<Arc<MutatorState>> {
        self.mutators.lock().clone()
    }

    /// Takes the heap lock.
    pub(crate) fn lock(&self) -> MutexGuard<'_, ShenandoahFreeSet> {
        self.free_set.lock()
    }

    // State queries

    pub fn is_concurrent_mark_in_progress(&self) -> bool {
        self.gc_state.is_set(GcState::MARKING)
    }

    pub fn is_evacuation_in_progress(&self) -> bool {
        self.gc_state.is_set(GcState::EVACUATION)
    }

    pub fn is_update_refs_in_progress(&self) -> bool {
        self.gc_state.is_set(GcState::UPDATEREFS)
    }

    pub fn has_forwarded_objects(&self) -> bool {
        self.gc_state.is_set(GcState::HAS_FORWARDED)
    }

    pub fn is_full_gc_in_progress(&self) -> bool {
        self.full_gc_in_progress.is_set()
    }

    pub fn is_degenerated_gc_in_progress(&self) -> bool {
        self.degenerated_gc_in_progress.is_set()
    }

    pub fn last_gc_made_progress(&self) -> bool {
        self.progress_last_gc.is_set()
    }

    pub(crate) fn set_concurrent_mark_in_progress(&self, in_progress: bool) {
        self.gc_state.set(GcState::MARKING, in_progress);
        self.satb.set_active(in_progress);
    }

    pub(crate) fn set_evacuation_in_progress(&self, in_progress: bool) {
        self.gc_state.set(GcState::EVACUATION, in_progress);
    }

    pub(crate) fn set_update_refs_in_progress(&self, in_progress: bool) {
        self.gc_state.set(GcState::UPDATEREFS, in_progress);
    }

    pub(crate) fn set_has_forwarded_objects(&self, forwarded: bool) {
        self.gc_state.set(GcState::HAS_FORWARDED, forwarded);
    }

    pub(crate) fn set_full_gc_in_progress(&self, in_progress: bool) {
        if in_progress {
            self.full_gc_in_progress.set();
        } else {
            self.full_gc_in_progress.unset();
        }
    }

    // Cancellation

    #[inline]
    pub fn cancelled_gc(&self) -> bool {
        self.cancelled_gc.is_set()
    }

    /// Asks the running cycle to stop at its next check.
    #[doc(hidden)]
    pub fn cancel_gc(&self, cause: GcCause) {
        if self.cancelled_gc.try_set() {
            tracing::info!("Cancelling GC: {}", cause.name());
        }
    }

    /// Only at a safepoint: the evacuation OOM protocol is reset as well.
    pub(crate) fn clear_cancelled_gc(&self) {
        self.cancelled_gc.unset();
        self.evac_oom.clear();
    }

    // Accounting

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub(crate) fn increase_used(&self, bytes: usize) {
        self.used.fetch_add(bytes, Ordering::AcqRel);
    }

    pub(crate) fn decrease_used(&self, bytes: usize) {
        let previous = self.used.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(previous >= bytes, "used underflow");
    }

    pub(crate) fn set_used(&self, bytes: usize) {
        self.used.store(bytes, Ordering::Release);
    }

    pub fn committed(&self) -> usize {
        self.regions.iter().filter(|r| r.is_committed()).count() * self.options.region_size_bytes
    }

    pub fn max_capacity(&self) -> usize {
        self.regions.len() * self.options.region_size_bytes
    }

    pub fn capacity(&self) -> usize {
        self.max_capacity()
    }

    pub fn free_set_available(&self) -> usize {
        self.free_set.lock().available()
    }

    pub fn bytes_allocated_since_gc_start(&self) -> usize {
        self.bytes_allocated_since_gc_start.load(Ordering::Acquire)
    }

    pub(crate) fn reset_bytes_allocated_since_gc_start(&self) {
        self.bytes_allocated_since_gc_start.store(0, Ordering::Release);
    }

    fn increase_allocated(&self, bytes: usize) {
        self.bytes_allocated_since_gc_start
            .fetch_add(bytes, Ordering::AcqRel);
    }

    /// Accounts a mutator allocation. Waste, the tail of a humongous region or of a retired
    /// region, is charged to the pacer but does not change `used`.
    pub(crate) fn notify_mutator_alloc_words(&self, words: usize, waste: bool) {
        let bytes = words << LOG_HEAP_WORD_SIZE;
        if !waste {
            self.increase_used(bytes);
        }
        self.increase_allocated(bytes);
        if self.config.pacing {
            self.control.pacing_notify_alloc(words);
            if waste {
                self.pacer.claim_for_alloc(words, true);
            }
        }
    }

    pub fn statistics(&self) -> HeapStatistics {
        HeapStatistics::collect(self)
    }

    // Allocation

    /// Mutator allocation with the full retry protocol: pacing first, then allocation
    /// failures are handed to the control thread until the collector stops making progress.
    pub(crate) fn allocate_memory(
        &self,
        scope: &ManagedScope<'_>,
        req: &mut ShenandoahAllocRequest,
    ) -> Result<usize, AllocError> {
        debug_assert!(req.is_mutator_alloc());
        if self.policy.is_at_shutdown() {
            return Err(AllocError::ShuttingDown);
        }
        if self.options.required_regions(req.min_size() << LOG_HEAP_WORD_SIZE) > self.num_regions()
        {
            return Err(AllocError::OutOfMemory {
                requested_words: req.min_size(),
            });
        }

        let pacer_epoch = if self.config.pacing {
            scope.block(|| self.pacer.pace_for_alloc(req.size()));
            Some(self.pacer.epoch())
        } else {
            None
        };

        let mut in_new_region = false;
        let mut result = if self.inject_alloc_failure.try_unset() {
            None
        } else {
            self.allocate_memory_under_lock(req, &mut in_new_region)
        };

        // Block for a collection while it makes progress, then give up after a few full GCs
        // that did not.
        let mut tries = 0;
        while result.is_none() && self.progress_last_gc.is_set() && !self.policy.is_at_shutdown()
        {
            tries += 1;
            scope.block(|| self.control.handle_alloc_failure(self, req.size()));
            result = self.allocate_memory_under_lock(req, &mut in_new_region);
        }
        while result.is_none()
            && tries <= self.config.full_gc_threshold
            && !self.policy.is_at_shutdown()
        {
            tries += 1;
            scope.block(|| self.control.handle_alloc_failure(self, req.size()));
            result = self.allocate_memory_under_lock(req, &mut in_new_region);
        }

        if in_new_region {
            self.control.notify_heap_changed();
        }

        match result {
            Some(addr) => {
                let actual = req.actual_size();
                self.notify_mutator_alloc_words(actual, false);
                if let Some(epoch) = pacer_epoch {
                    // Elastic labs may come back smaller than paced for.
                    if actual < req.size() {
                        self.pacer.unpace_for_alloc(epoch, req.size() - actual);
                    }
                }
                Ok(addr)
            }
            None if self.policy.is_at_shutdown() => Err(AllocError::ShuttingDown),
            None => Err(AllocError::OutOfMemory {
                requested_words: req.min_size(),
            }),
        }
    }

    fn allocate_memory_under_lock(
        &self,
        req: &mut ShenandoahAllocRequest,
        in_new_region: &mut bool,
    ) -> Option<usize> {
        let mut free_set = self.free_set.lock();
        free_set.allocate(self, req, in_new_region)
    }

    /// Collector allocation. Never blocks and never retries.
    fn allocate_memory_gc(&self, req: &mut ShenandoahAllocRequest) -> Option<usize> {
        debug_assert!(req.is_gc_alloc());
        let mut in_new_region = false;
        let result = {
            let mut free_set = self.free_set.lock();
            let result = free_set.allocate(self, req, &mut in_new_region);
            if result.is_some() {
                self.increase_used(req.actual_size() << LOG_HEAP_WORD_SIZE);
            }
            result
        };
        if in_new_region {
            self.control.notify_heap_changed();
        }
        result
    }

    fn allocate_from_gclab(&self, gclab: &mut ShenandoahLab, size: usize) -> Option<usize> {
        if let Some(addr) = gclab.allocate(size) {
            return Some(addr);
        }
        let max_lab = self.options.max_tlab_size_words;
        // Large objects and labs with too much space left go to shared allocation.
        if size > max_lab || gclab.remaining() > max_lab / 64 {
            return None;
        }
        gclab.retire();
        let mut req = ShenandoahAllocRequest::for_gclab(size, max_lab);
        let start = self.allocate_memory_gc(&mut req)?;
        gclab.fill(start, req.actual_size());
        gclab.allocate(size)
    }

    fn allocate_for_evacuation(
        &self,
        gclab: &mut ShenandoahLab,
        size: usize,
    ) -> Option<(usize, bool)> {
        if self.config.use_tlab {
            if let Some(addr) = self.allocate_from_gclab(gclab, size) {
                return Some((addr, true));
            }
        }
        let mut req = ShenandoahAllocRequest::for_shared_gc(size);
        self.allocate_memory_gc(&mut req).map(|addr| (addr, false))
    }

    fn should_fail_evacuation(&self) -> bool {
        if self.config.oom_during_evac_a_lot && rand::thread_rng().gen_bool(0.5) {
            return true;
        }
        let mut countdown = self.evac_failure_countdown.load(Ordering::Acquire);
        while countdown != usize::MAX {
            let next = if countdown == 0 { usize::MAX } else { countdown - 1 };
            match self.evac_failure_countdown.compare_exchange(
                countdown,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return countdown == 0,
                Err(actual) => countdown = actual,
            }
        }
        false
    }

    /// Makes the next evacuations fail after `after` successful ones.
    #[doc(hidden)]
    pub fn inject_evacuation_failure(&self, after: usize) {
        self.evac_failure_countdown
            .store(after.min(usize::MAX - 1), Ordering::Release);
    }

    /// Copies `p` out of the collection set and installs the forwarding pointer. When another
    /// thread wins the race the local copy is rolled back and the winner's copy is returned.
    /// On allocation failure the thread switches to resolve-only mode and the cycle is
    /// cancelled.
    pub(crate) fn evacuate_object(
        &self,
        p: Oop,
        scope: &ShenandoahEvacOOMScope<'_>,
        gclab: &mut ShenandoahLab,
    ) -> Oop {
        if scope.is_oom_during_evac() {
            return ShenandoahForwarding::get_forwardee(p);
        }
        debug_assert!(self.in_collection_set(p), "only evacuate from the collection set");

        let size = p.size_words();
        let copy = if self.should_fail_evacuation() {
            None
        } else {
            self.allocate_for_evacuation(gclab, size)
        };

        let (copy_start, from_gclab) = match copy {
            Some(copy) => copy,
            None => {
                self.control.handle_alloc_failure_evac(self, size);
                scope.handle_oom();
                return ShenandoahForwarding::get_forwardee(p);
            }
        };

        let copy = unsafe { copy_object(p, copy_start) };
        let result = ShenandoahForwarding::try_update_forwardee(p, copy);
        if result == copy {
            copy
        } else {
            if !(from_gclab && gclab.undo_allocation(copy_start, size)) {
                unsafe { fill_with_filler(copy_start, size) };
            }
            result
        }
    }

    // Pinning

    /// Pins the region of `obj` unless it is in the collection set. Returns false in that case,
    /// the caller resolves the object again after the cycle.
    pub(crate) fn try_pin_object(&self, obj: Oop) -> bool {
        let _lock = self.free_set.lock();
        let r = self.heap_region_containing(obj.raw());
        if r.is_cset() {
            return false;
        }
        r.record_pin();
        r.make_pinned();
        true
    }

    pub(crate) fn unpin_object(&self, obj: Oop) {
        let _lock = self.free_set.lock();
        let r = self.heap_region_containing(obj.raw());
        r.record_unpin();
        if r.pin_count() == 0 {
            r.make_unpinned();
        }
    }

    // Region helpers

    /// Trashes a dead humongous object. The caller holds the heap lock.
    pub(crate) fn trash_humongous_region_at(&self, start: &ShenandoahHeapRegion) {
        debug_assert!(start.is_humongous_start(), "must be humongous start");
        let obj = Oop::from_object_start(start.bottom());
        let required = self.options.required_regions(obj.size_bytes());
        // Tail first: continuations stay attached to a valid start until they are gone.
        for index in (start.index()..start.index() + required).rev() {
            let r = self.get_region(index);
            debug_assert!(
                index == start.index() || r.is_humongous_continuation(),
                "must be humongous continuation"
            );
            r.make_trash();
        }
    }

    /// Retires every mutator and worker lab so the heap can be walked linearly.
    pub(crate) fn make_parsable(&self) {
        for mutator in self.mutators.lock().iter() {
            mutator.retire_labs();
        }
        for gclab in self.worker_gclabs.iter() {
            gclab.lock().retire();
        }
    }

    fn trash_cset_regions(&self) {
        let _lock = self.free_set.lock();
        let cset = &self.collection_set;
        cset.clear_current_index();
        while let Some(index) = cset.next() {
            self.get_region(index).make_trash();
        }
        cset.clear();
    }

    fn reset_next_mark_bitmap(&self, n_workers: usize) {
        let cursor = AtomicUsize::new(0);
        let next = self.marking.next();
        self.workers.run_task(n_workers, "reset mark bitmap", |_| loop {
            let index = cursor.fetch_add(1, Ordering::AcqRel);
            if index >= self.num_regions() {
                break;
            }
            let r = self.get_region(index);
            if r.is_committed() {
                next.clear_bitmap(r);
            }
        });
    }

    fn recycle_trash(&self) {
        for r in self.regions.iter() {
            if r.is_trash() {
                let _lock = self.free_set.lock();
                ShenandoahFreeSet::try_recycle_trashed(self, r);
            }
        }
    }

    fn update_object_references(&self, obj: Oop) {
        let cset = &self.collection_set;
        obj.oop_iterate(|slot| {
            let value = slot.load(Ordering::Acquire);
            if value != 0 && cset.is_in_addr(value) {
                let forwardee = ShenandoahForwarding::get_forwardee(Oop::from_raw(value));
                // Mutators may have stored a new value meanwhile, theirs wins.
                let _ = slot.compare_exchange(
                    value,
                    forwardee.raw(),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                );
            }
        });
    }

    // Verification

    pub(crate) fn verify_phase(&self, label: &'static str, options: VerifyOptions) {
        if !self.config.verify {
            return;
        }
        self.make_parsable();
        if let Err(error) = verifier::verify(self, label, &options) {
            self.print_regions();
            panic!("Heap verification failed: {}", error);
        }
    }

    /// Runs the verifier against whatever state the heap is in. The control thread has to be
    /// idle.
    #[doc(hidden)]
    pub fn verify(&self) -> Result<(), VerifyError> {
        let _guard = self.safepoint.synchronize();
        self.make_parsable();
        verifier::verify(self, "Requested", &VerifyOptions::for_current_state(self))
    }

    pub fn print_regions(&self) {
        tracing::error!("Regions:");
        for r in self.regions.iter() {
            tracing::error!("{}", r);
        }
    }

    fn try_inject_alloc_failure(&self) {
        if self.config.alloc_failure_a_lot
            && !self.cancelled_gc()
            && rand::thread_rng().gen_range(0..1000) > 950
        {
            self.inject_alloc_failure.set();
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
    }

    pub(crate) fn phase_scope(&self, phase: ShenandoahPhase) -> ShenandoahPhaseScope<'_> {
        ShenandoahPhaseScope::new(&self.phase_timings, self.control.gc_id(), phase, phase.name())
    }

    // Entry points: pauses take a safepoint, concurrent phases run alongside mutators.

    #[doc(hidden)]
    pub fn vmop_entry_init_mark(&self) {
        self.try_inject_alloc_failure();
        let _guard = self.safepoint.synchronize();
        let _phase = self.phase_scope(ShenandoahPhase::InitMark);
        self.op_init_mark();
    }

    #[doc(hidden)]
    pub fn vmop_entry_final_mark(&self) {
        self.try_inject_alloc_failure();
        let _guard = self.safepoint.synchronize();
        let _phase = self.phase_scope(ShenandoahPhase::FinalMark);
        self.op_final_mark();
    }

    #[doc(hidden)]
    pub fn vmop_entry_init_updaterefs(&self) {
        self.try_inject_alloc_failure();
        let _guard = self.safepoint.synchronize();
        let _phase = self.phase_scope(ShenandoahPhase::InitUpdateRefs);
        self.op_init_updaterefs();
    }

    #[doc(hidden)]
    pub fn vmop_entry_final_updaterefs(&self) {
        self.try_inject_alloc_failure();
        let _guard = self.safepoint.synchronize();
        let _phase = self.phase_scope(ShenandoahPhase::FinalUpdateRefs);
        self.op_final_updaterefs();
    }

    #[doc(hidden)]
    pub fn vmop_entry_full(&self, cause: GcCause) {
        let _guard = self.safepoint.synchronize();
        let _phase = ShenandoahPhaseScope::new(
            &self.phase_timings,
            self.control.gc_id(),
            ShenandoahPhase::FullGc,
            format!("Pause Full ({})", cause.name()),
        );
        self.op_full(cause);
    }

    #[doc(hidden)]
    pub fn vmop_degenerated(&self, point: ShenandoahDegenPoint) {
        let _guard = self.safepoint.synchronize();
        let _phase = ShenandoahPhaseScope::new(
            &self.phase_timings,
            self.control.gc_id(),
            ShenandoahPhase::DegenGc,
            format!("Pause Degenerated GC ({})", point.name()),
        );
        self.op_degenerated(point);
    }

    #[doc(hidden)]
    pub fn entry_reset(&self) {
        let _phase = self.phase_scope(ShenandoahPhase::ConcReset);
        self.try_inject_alloc_failure();
        self.reset_next_mark_bitmap(self.config.conc_gc_threads);
    }

    #[doc(hidden)]
    pub fn entry_mark(&self) {
        let _phase = self.phase_scope(ShenandoahPhase::ConcMark);
        self.try_inject_alloc_failure();
        self.concurrent_mark.mark_from_roots(self);
    }

    #[doc(hidden)]
    pub fn entry_evac(&self) {
        let _phase = self.phase_scope(ShenandoahPhase::ConcEvac);
        self.try_inject_alloc_failure();
        self.op_evac(self.config.conc_gc_threads);
    }

    #[doc(hidden)]
    pub fn entry_updaterefs(&self) {
        let _phase = self.phase_scope(ShenandoahPhase::ConcUpdateRefs);
        self.try_inject_alloc_failure();
        self.update_heap_references(self.config.conc_gc_threads, true);
    }

    #[doc(hidden)]
    pub fn entry_cleanup(&self) {
        let _phase = self.phase_scope(ShenandoahPhase::ConcCleanup);
        self.try_inject_alloc_failure();
        self.recycle_trash();
    }

    pub(crate) fn entry_uncommit(&self, shrink_before: f64) {
        let _phase = self.phase_scope(ShenandoahPhase::ConcUncommit);
        self.op_uncommit(shrink_before);
    }

    // Operations

    fn op_init_mark(&self) {
        debug_assert!(!self.is_concurrent_mark_in_progress(), "should not be marking yet");
        self.verify_phase("Before Mark", VerifyOptions::before_marking());

        self.make_parsable();
        let next = self.marking.next();
        for r in self.regions.iter() {
            r.clear_live_data();
            next.capture_top_at_mark_start(r);
        }

        self.set_concurrent_mark_in_progress(true);
        self.concurrent_mark.mark_roots(self, false);

        if self.config.pacing {
            self.pacer.setup_for_mark(self.free_set_available());
        }
    }

    fn op_final_mark(&self) {
        debug_assert!(self.is_concurrent_mark_in_progress(), "should be marking");

        if self.cancelled_gc() {
            self.concurrent_mark.cancel(self);
            self.stop_concurrent_marking();
            return;
        }

        self.concurrent_mark.finish_mark_from_roots(self);

        let next = self.marking.next();
        let cleared = self.weak_handles.weak_oops_do(|obj| next.is_marked(obj));
        if cleared > 0 {
            tracing::debug!("Cleared {} weak handles", cleared);
        }

        self.stop_concurrent_marking();

        // Everything allocated during marking is implicitly live.
        let complete = self.marking.complete();
        for r in self.regions.iter().filter(|r| r.is_active()) {
            let tams = complete.top_at_mark_start(r);
            let top = r.top();
            if top > tams {
                r.increase_live_data_words((top - tams) >> LOG_HEAP_WORD_SIZE);
            }
        }

        self.prepare_for_concurrent_evacuation();

        if !self.collection_set.is_empty() {
            self.evac_oom.clear();
            self.set_evacuation_in_progress(true);
            self.set_has_forwarded_objects(true);
            self.evacuate_and_update_roots();
        }

        if self.config.pacing {
            self.pacer
                .setup_for_evac(self.collection_set.used(), self.free_set_available());
        }
    }

    fn stop_concurrent_marking(&self) {
        if !self.cancelled_gc() {
            // Forwarded objects were resolved during marking, and the fresh marking becomes
            // the complete one.
            self.set_has_forwarded_objects(false);
            self.marking.swap();
        }
        self.set_concurrent_mark_in_progress(false);
    }

    fn prepare_for_concurrent_evacuation(&self) {
        self.make_parsable();
        self.verify_phase("After Mark", VerifyOptions::after_marking());

        self.trash_cset_regions();

        // Collection set changes must not race with mutators resolving through it.
        {
            let mut heuristics = self.heuristics.lock();
            let mut free_set = self.free_set.lock();
            self.collection_set.clear();
            free_set.clear();
            heuristics.choose_collection_set(self, &self.collection_set);
            free_set.rebuild(self);
        }

        self.verify_phase("Before Evacuation", VerifyOptions::before_evacuation());
    }

    fn evacuate_and_update_roots(&self) {
        let n_workers = self.config.parallel_gc_threads;
        {
            let rp = ShenandoahRootProcessor::for_evacuation(self, n_workers);
            self.workers.run_task(n_workers, "root evacuation", |worker_id| {
                let scope = self.evac_oom.enter();
                let mut gclab = self.worker_gclabs[worker_id].lock();
                let mut evacuate_root = |slot: &AtomicUsize| {
                    if let Some(obj) = Oop::from_raw_opt(slot.load(Ordering::Acquire)) {
                        if self.in_collection_set(obj) {
                            let mut resolved = ShenandoahForwarding::get_forwardee(obj);
                            if resolved == obj {
                                resolved = self.evacuate_object(obj, &scope, &mut gclab);
                            }
                            slot.store(resolved.raw(), Ordering::Release);
                        }
                    }
                };
                rp.process_evacuate_roots(&mut evacuate_root);
            });
        }

        if self.cancelled_gc() {
            // Some roots may still point to from-space copies that did get evacuated.
            self.concurrent_mark.update_roots(self);
        }
    }

    fn op_evac(&self, n_workers: usize) {
        let complete = self.marking.complete();
        self.workers.run_task(n_workers, "evacuation", |worker_id| {
            let scope = self.evac_oom.enter();
            let mut gclab = self.worker_gclabs[worker_id].lock();
            while !self.cancelled_gc() {
                let index = match self.collection_set.claim_next() {
                    Some(index) => index,
                    None => break,
                };
                let r = self.get_region(index);
                complete.marked_object_iterate(r, r.top(), |obj| {
                    if !ShenandoahForwarding::is_forwarded(obj) {
                        self.evacuate_object(obj, &scope, &mut gclab);
                    }
                });
                if self.config.pacing {
                    self.pacer.report_evac(r.used() >> LOG_HEAP_WORD_SIZE);
                }
            }
        });
    }

    fn op_init_updaterefs(&self) {
        self.set_evacuation_in_progress(false);
        self.verify_phase("Before Updating References", VerifyOptions::before_updaterefs());

        self.set_update_refs_in_progress(true);
        self.make_parsable();
        for r in self.regions.iter() {
            r.set_update_watermark(r.top());
        }
        self.update_refs_cursor.store(0, Ordering::Release);

        if self.config.pacing {
            self.pacer
                .setup_for_updaterefs(self.used(), self.free_set_available());
        }
    }

    fn update_heap_references(&self, n_workers: usize, concurrent: bool) {
        let name = if concurrent {
            "concurrent reference update"
        } else {
            "reference update"
        };
        let complete = self.marking.complete();
        self.workers.run_task(n_workers, name, |_| loop {
            let index = self.update_refs_cursor.fetch_add(1, Ordering::AcqRel);
            if index >= self.num_regions() {
                break;
            }
            let r = self.get_region(index);
            if self.collection_set.is_in(index) {
                complete.clear_bitmap(r);
            } else if r.is_active() && !r.is_humongous_continuation() {
                complete.marked_object_iterate(r, r.update_watermark(), |obj| {
                    self.update_object_references(obj)
                });
            }
            if self.config.pacing {
                self.pacer.report_updaterefs(
                    (r.update_watermark().saturating_sub(r.bottom())) >> LOG_HEAP_WORD_SIZE,
                );
            }
            if self.cancelled_gc() {
                break;
            }
        });
    }

    fn op_final_updaterefs(&self) {
        // Finish what a cancelled concurrent phase left over.
        if self.update_refs_cursor.load(Ordering::Acquire) < self.num_regions() {
            self.clear_cancelled_gc();
            self.update_heap_references(self.config.parallel_gc_threads, false);
        }
        if self.cancelled_gc() {
            self.clear_cancelled_gc();
        }

        self.concurrent_mark.update_roots(self);
        self.trash_cset_regions();
        self.set_has_forwarded_objects(false);
        self.set_update_refs_in_progress(false);

        self.verify_phase("After Updating References", VerifyOptions::after_updaterefs());

        self.free_set.lock().rebuild(self);
    }

    fn op_cleanup_bitmaps(&self) {
        self.recycle_trash();
        self.reset_next_mark_bitmap(self.config.parallel_gc_threads);
    }

    fn op_uncommit(&self, shrink_before: f64) {
        let mut count = 0;
        for r in self.regions.iter() {
            if r.is_empty_committed() && r.empty_time() < shrink_before {
                // Mutators own the lock when they are short on memory, do not compete.
                if let Some(_lock) = self.free_set.try_lock() {
                    if r.is_empty_committed() {
                        r.make_uncommitted();
                        count += 1;
                    }
                }
            }
        }
        if count > 0 {
            tracing::info!(
                "Uncommitted {}M. Heap: {}M reserved, {}M committed, {}M used",
                count * self.options.region_size_bytes / M,
                self.max_capacity() / M,
                self.committed() / M,
                self.used() / M
            );
            self.control.notify_heap_changed();
        }
    }

    fn op_full(&self, cause: GcCause) {
        let mut metrics = ShenandoahMetricsSnapshot::new();
        metrics.snap_before(self);

        full_gc::do_it(self, cause);

        metrics.snap_after(self);
        if metrics.is_good_progress(self, "Full GC") {
            self.progress_last_gc.set();
        } else {
            // Nothing else to try. Allocation retries will give up.
            self.progress_last_gc.unset();
        }
    }

    fn op_degenerated(&self, point: ShenandoahDegenPoint) {
        self.degenerated_gc_in_progress.set();
        // Cancellation is what brought us here, and the phases below would trip over it.
        self.clear_cancelled_gc();

        let mut metrics = ShenandoahMetricsSnapshot::new();
        metrics.snap_before(self);

        if !self.degenerated_cycle(point) {
            self.degenerated_gc_in_progress.unset();
            self.op_degenerated_fail();
            return;
        }

        self.verify_phase("After Degenerated GC", VerifyOptions::after_degenerated());

        metrics.snap_after(self);
        self.degenerated_gc_in_progress.unset();

        if !metrics.is_good_progress(self, "Degenerated GC") {
            self.progress_last_gc.unset();
            self.cancel_gc(GcCause::UpgradeToFullGc);
            self.policy.record_degenerated_upgrade_to_full();
            self.op_full(GcCause::UpgradeToFullGc);
        } else {
            self.progress_last_gc.set();
        }
    }

    /// Finishes the cycle from `point` in the pause. Returns false when a phase got cancelled.
    fn degenerated_cycle(&self, point: ShenandoahDegenPoint) -> bool {
        let parallel = self.config.parallel_gc_threads;
        let mut point = point;
        loop {
            match point {
                ShenandoahDegenPoint::OutsideCycle => {
                    // The previous marking left its bits behind.
                    self.reset_next_mark_bitmap(parallel);
                    self.op_init_mark();
                    if self.cancelled_gc() {
                        return false;
                    }
                    point = ShenandoahDegenPoint::Mark;
                }
                ShenandoahDegenPoint::Mark => {
                    self.op_final_mark();
                    if self.cancelled_gc() {
                        return false;
                    }
                    self.recycle_trash();
                    point = ShenandoahDegenPoint::Evac;
                }
                ShenandoahDegenPoint::Evac => {
                    if self.is_evacuation_in_progress() {
                        self.collection_set.clear_current_index();
                        self.op_evac(parallel);
                        if self.cancelled_gc() {
                            return false;
                        }
                    }
                    if self.has_forwarded_objects() {
                        self.op_init_updaterefs();
                        if self.cancelled_gc() {
                            return false;
                        }
                    }
                    point = ShenandoahDegenPoint::UpdateRefs;
                }
                ShenandoahDegenPoint::UpdateRefs => {
                    if self.has_forwarded_objects() {
                        self.op_final_updaterefs();
                        if self.cancelled_gc() {
                            return false;
                        }
                    }
                    self.op_cleanup_bitmaps();
                    return true;
                }
            }
        }
    }

    fn op_degenerated_fail(&self) {
        tracing::info!("Cannot finish degeneration, upgrading to Full GC");
        self.policy.record_degenerated_upgrade_to_full();
        self.op_full(GcCause::UpgradeToFullGc);
    }
}

impl std::fmt::Debug for ShenandoahHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShenandoahHeap")
            .field("regions", &self.regions.len())
            .field("used", &self.used())
            .field("gc_state", &self.gc_state.load())
            .finish()
    }
}
