use std::sync::atomic::{AtomicUsize, Ordering};

use atomic::Atomic;
use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};

use crate::utils::{formatted_size, os_elapsed_time, ShenandoahSharedFlag};

use super::{
    heap::ShenandoahHeap,
    oop::LOG_HEAP_WORD_SIZE,
    policy::{GcCause, ShenandoahDegenPoint},
};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum GcMode {
    None,
    ConcurrentNormal,
    StwDegenerated,
    StwFull,
}

/// State of the collector thread: pending requests, the degeneration point of the last
/// cancelled cycle, and the monitors mutators block on.
///
/// The thread itself runs [ShenandoahControlThread::run_service] with the heap it belongs to.
pub struct ShenandoahControlThread {
    alloc_failure_gc: ShenandoahSharedFlag,
    gc_requested: ShenandoahSharedFlag,
    graceful_shutdown: ShenandoahSharedFlag,
    heap_changed: ShenandoahSharedFlag,
    requested_gc_cause: Atomic<GcCause>,
    degen_point: Atomic<ShenandoahDegenPoint>,
    allocs_seen: CachePadded<AtomicUsize>,
    gc_id: AtomicUsize,

    alloc_failure_waiters: Mutex<()>,
    alloc_failure_cv: Condvar,
    /// Id of the last finished cycle.
    gc_waiters: Mutex<usize>,
    gc_cv: Condvar,
}

impl ShenandoahControlThread {
    pub fn new() -> Self {
        Self {
            alloc_failure_gc: ShenandoahSharedFlag::new(),
            gc_requested: ShenandoahSharedFlag::new(),
            graceful_shutdown: ShenandoahSharedFlag::new(),
            heap_changed: ShenandoahSharedFlag::new(),
            requested_gc_cause: Atomic::new(GcCause::ConcurrentGc),
            degen_point: Atomic::new(ShenandoahDegenPoint::OutsideCycle),
            allocs_seen: CachePadded::new(AtomicUsize::new(0)),
            gc_id: AtomicUsize::new(0),
            alloc_failure_waiters: Mutex::new(()),
            alloc_failure_cv: Condvar::new(),
            gc_waiters: Mutex::new(0),
            gc_cv: Condvar::new(),
        }
    }

    /// Id of the current or last cycle. Starts at 1 with the first cycle.
    pub fn gc_id(&self) -> usize {
        self.gc_id.load(Ordering::Acquire)
    }

    pub fn in_graceful_shutdown(&self) -> bool {
        self.graceful_shutdown.is_set()
    }

    pub fn prepare_for_graceful_shutdown(&self) {
        self.graceful_shutdown.set();
    }

    pub fn is_alloc_failure_gc(&self) -> bool {
        self.alloc_failure_gc.is_set()
    }

    pub(crate) fn run_service(&self, heap: &ShenandoahHeap) {
        let config = heap.config();
        let mut sleep = config.control_interval_min;

        let mut last_shrink_time = os_elapsed_time();
        let mut last_sleep_adjust_time = os_elapsed_time();

        // Uncommit checks run often enough to honor the delay within a tenth of it.
        let shrink_period = config.uncommit_delay.as_secs_f64() / 10.0;

        while !self.in_graceful_shutdown() {
            let alloc_failure_pending = self.alloc_failure_gc.is_set();
            let explicit_gc_requested = self.gc_requested.try_unset();

            let mut mode = GcMode::None;
            let mut cause = GcCause::ConcurrentGc;
            let mut degen_point = ShenandoahDegenPoint::OutsideCycle;

            if alloc_failure_pending {
                tracing::info!("Trigger: Handle Allocation Failure");
                cause = GcCause::AllocationFailure;

                degen_point = self
                    .degen_point
                    .swap(ShenandoahDegenPoint::OutsideCycle, Ordering::AcqRel);

                let mut heuristics = heap.heuristics();
                heuristics.record_allocation_failure_gc();
                if config.degenerated_gc && heuristics.should_degenerate_cycle(heap) {
                    heap.policy().record_alloc_failure_to_degenerated(degen_point);
                    mode = GcMode::StwDegenerated;
                } else {
                    heap.policy().record_alloc_failure_to_full();
                    mode = GcMode::StwFull;
                }
            } else if explicit_gc_requested {
                cause = self.requested_gc_cause.load(Ordering::Acquire);
                tracing::info!("Trigger: Explicit GC request ({})", cause.name());

                heap.heuristics().record_requested_gc();
                if config.explicit_gc_invokes_concurrent {
                    heap.policy().record_explicit_to_concurrent();
                    mode = GcMode::ConcurrentNormal;
                } else {
                    heap.policy().record_explicit_to_full();
                    mode = GcMode::StwFull;
                }
            } else if heap.heuristics().should_start_gc(heap) {
                mode = GcMode::ConcurrentNormal;
            }

            let gc_requested = mode != GcMode::None;
            if gc_requested {
                self.gc_id.fetch_add(1, Ordering::AcqRel);
                heap.reset_bytes_allocated_since_gc_start();
                self.allocs_seen.store(0, Ordering::Relaxed);
                heap.lock().log_status(heap);
            }

            match mode {
                GcMode::None => {}
                GcMode::ConcurrentNormal => self.service_concurrent_normal_cycle(heap),
                GcMode::StwDegenerated => self.service_stw_degenerated_cycle(heap, degen_point),
                GcMode::StwFull => self.service_stw_full_cycle(heap, cause),
            }

            if gc_requested {
                self.notify_gc_waiters();
                if alloc_failure_pending {
                    self.notify_alloc_failure_waiters();
                }
                heap.lock().log_status(heap);
                if config.pacing {
                    heap.pacer().setup_for_idle();
                }
            } else {
                // Let the pacer know the allocations the idle budget absorbed.
                let allocs_seen = self.allocs_seen.swap(0, Ordering::Relaxed);
                if config.pacing && allocs_seen > 0 {
                    heap.pacer().report_alloc(allocs_seen);
                }
            }

            let current = os_elapsed_time();
            if config.uncommit
                && (explicit_gc_requested || current - last_shrink_time > shrink_period)
            {
                // Explicit GC tries to uncommit everything, periodic checks only stale regions.
                let shrink_before = if explicit_gc_requested {
                    current
                } else {
                    current - config.uncommit_delay.as_secs_f64()
                };
                heap.entry_uncommit(shrink_before);
                last_shrink_time = current;
            }

            if config.pacing {
                heap.pacer().notify_waiters();
            }

            // Allocations shorten the sleep so heuristics see fresh conditions, idle loops back
            // off exponentially.
            if self.heap_changed.try_unset() {
                sleep = config.control_interval_min;
            } else if (current - last_sleep_adjust_time)
                > config.control_interval_adjust_period.as_secs_f64()
            {
                sleep = (sleep * 2).min(config.control_interval_max);
                last_sleep_adjust_time = current;
            }
            std::thread::sleep(sleep);
        }

        tracing::debug!("Control thread stopped after {} cycles", self.gc_id());
    }

    /// Returns true if the cycle has to stop. Records where it stopped, unless the heap is
    /// shutting down and nobody will pick the work up.
    fn check_cancellation_or_degen(&self, heap: &ShenandoahHeap, point: ShenandoahDegenPoint) -> bool {
        if heap.cancelled_gc() {
            if !self.in_graceful_shutdown() {
                self.degen_point.store(point, Ordering::Release);
            }
            return true;
        }
        false
    }

    fn service_concurrent_normal_cycle(&self, heap: &ShenandoahHeap) {
        // A cancelled phase leaves the rest of the cycle to the degenerated pause, which in
        // turn upgrades to a full GC when it fails as well.
        if self.check_cancellation_or_degen(heap, ShenandoahDegenPoint::OutsideCycle) {
            return;
        }

        heap.heuristics().record_cycle_start();
        heap.policy().record_cycle_start();

        heap.entry_reset();
        heap.vmop_entry_init_mark();
        heap.entry_mark();
        if self.check_cancellation_or_degen(heap, ShenandoahDegenPoint::Mark) {
            return;
        }

        heap.vmop_entry_final_mark();
        // Final mark may have trashed regions without live data.
        heap.entry_cleanup();
        heap.lock().log_status(heap);

        if heap.is_evacuation_in_progress() {
            heap.entry_evac();
            if self.check_cancellation_or_degen(heap, ShenandoahDegenPoint::Evac) {
                return;
            }

            heap.vmop_entry_init_updaterefs();
            heap.entry_updaterefs();
            if self.check_cancellation_or_degen(heap, ShenandoahDegenPoint::UpdateRefs) {
                return;
            }

            heap.vmop_entry_final_updaterefs();
            heap.entry_cleanup();
        } else if self.check_cancellation_or_degen(heap, ShenandoahDegenPoint::OutsideCycle) {
            // Final mark saw the cancellation before it got to evacuation.
            return;
        }

        let mut heuristics = heap.heuristics();
        heuristics.record_success_concurrent();
        heuristics.record_cycle_end();
        heap.policy().record_success_concurrent();
    }

    fn service_stw_degenerated_cycle(&self, heap: &ShenandoahHeap, point: ShenandoahDegenPoint) {
        heap.heuristics().record_cycle_start();
        heap.policy().record_cycle_start();

        heap.vmop_degenerated(point);

        let mut heuristics = heap.heuristics();
        heuristics.record_success_degenerated();
        heuristics.record_cycle_end();
        heap.policy().record_success_degenerated();
    }

    fn service_stw_full_cycle(&self, heap: &ShenandoahHeap, cause: GcCause) {
        heap.heuristics().record_cycle_start();
        heap.policy().record_cycle_start();

        heap.vmop_entry_full(cause);

        let mut heuristics = heap.heuristics();
        heuristics.record_success_full();
        heuristics.record_cycle_end();
        heap.policy().record_success_full();
    }

    /// Blocks until a cycle that started after this call has finished.
    pub(crate) fn handle_requested_gc(&self, cause: GcCause) {
        let mut finished = self.gc_waiters.lock();
        let required = self.gc_id() + 1;
        self.requested_gc_cause.store(cause, Ordering::Release);
        self.gc_requested.set();
        while *finished < required && !self.in_graceful_shutdown() {
            self.gc_cv.wait(&mut finished);
        }
    }

    /// Called by a mutator that could not allocate `words`. Cancels the running cycle and
    /// blocks until the collector handled the failure.
    pub(crate) fn handle_alloc_failure(&self, heap: &ShenandoahHeap, words: usize) {
        if self.alloc_failure_gc.try_set() {
            tracing::info!(
                "Failed to allocate {}",
                formatted_size(words << LOG_HEAP_WORD_SIZE)
            );
            heap.cancel_gc(GcCause::AllocationFailure);
        }

        let mut guard = self.alloc_failure_waiters.lock();
        while self.alloc_failure_gc.is_set() && !self.in_graceful_shutdown() {
            self.alloc_failure_cv.wait(&mut guard);
        }
    }

    /// Called by a thread that could not allocate a to-space copy. Never blocks: the
    /// evacuation protocol takes care of the thread.
    pub(crate) fn handle_alloc_failure_evac(&self, heap: &ShenandoahHeap, words: usize) {
        if self.alloc_failure_gc.try_set() {
            tracing::info!(
                "Failed to allocate {} for evacuation",
                formatted_size(words << LOG_HEAP_WORD_SIZE)
            );
        }
        heap.cancel_gc(GcCause::AllocationFailureEvac);
    }

    fn notify_alloc_failure_waiters(&self) {
        let _guard = self.alloc_failure_waiters.lock();
        self.alloc_failure_gc.unset();
        self.alloc_failure_cv.notify_all();
    }

    fn notify_gc_waiters(&self) {
        let mut finished = self.gc_waiters.lock();
        *finished = self.gc_id();
        self.gc_cv.notify_all();
    }

    /// Wakes everybody blocked on the collector. Used at shutdown.
    pub(crate) fn notify_all_waiters(&self) {
        {
            let _guard = self.alloc_failure_waiters.lock();
            self.alloc_failure_cv.notify_all();
        }
        let _guard = self.gc_waiters.lock();
        self.gc_cv.notify_all();
    }

    pub(crate) fn notify_heap_changed(&self) {
        // Only one of many allocating threads has to succeed.
        if self.heap_changed.is_unset() {
            self.heap_changed.set();
        }
    }

    pub(crate) fn pacing_notify_alloc(&self, words: usize) {
        self.allocs_seen.fetch_add(words, Ordering::Relaxed);
    }
}

impl Default for ShenandoahControlThread {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requests_do_not_block_after_shutdown() {
        let control = ShenandoahControlThread::new();
        control.prepare_for_graceful_shutdown();
        assert!(control.in_graceful_shutdown());
        control.handle_requested_gc(GcCause::ExplicitGc);
        assert!(control.gc_requested.is_set());
        assert_eq!(
            control.requested_gc_cause.load(Ordering::Acquire),
            GcCause::ExplicitGc
        );
    }

    #[test]
    fn test_gc_waiters_see_finished_cycles() {
        let control = ShenandoahControlThread::new();
        crossbeam_utils::thread::scope(|s| {
            s.spawn(|_| control.handle_requested_gc(GcCause::ExplicitGc));
            while !control.gc_requested.try_unset() {
                std::thread::yield_now();
            }
            control.gc_id.fetch_add(1, Ordering::AcqRel);
            control.notify_gc_waiters();
        })
        .unwrap();
        assert_eq!(*control.gc_waiters.lock(), 1);
    }
}
