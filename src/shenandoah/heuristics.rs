//! Cycle triggers and collection set selection.
//!
//! Heuristics only run on the control thread, and `choose_collection_set` runs at the final mark
//! pause with the heap lock held.
use crate::{
    utils::{formatted_size, os_elapsed_time, TruncatedSeq},
    HeuristicsKind,
};

use super::{collection_set::ShenandoahCollectionSet, heap::ShenandoahHeap};

mod adaptive;
mod aggressive;
mod compact;
mod passive;
mod static_;

pub use adaptive::ShenandoahAdaptiveHeuristics;
pub use aggressive::ShenandoahAggressiveHeuristics;
pub use compact::ShenandoahCompactHeuristics;
pub use passive::ShenandoahPassiveHeuristics;
pub use static_::ShenandoahStaticHeuristics;

/// Recover from penalties.
pub const CONCURRENT_ADJUST: isize = -1;
/// How much to penalize average GC duration history on Degenerated GC.
pub const DEGENERATE_PENALTY: isize = 10;
/// How much to penalize average GC duration history on Full GC.
pub const FULL_PENALTY: isize = 20;

/// Candidate region for the collection set.
#[derive(Clone, Copy, Debug)]
pub struct RegionData {
    pub index: usize,
    pub garbage: usize,
}

/// Bookkeeping shared by every strategy.
#[derive(Clone, Debug)]
pub struct HeuristicsState {
    pub degenerated_cycles_in_a_row: usize,
    pub successful_cycles_in_a_row: usize,
    pub cycle_start: f64,
    pub last_cycle_end: f64,
    pub gc_times_learned: usize,
    pub gc_time_penalties: isize,
    pub gc_time_history: TruncatedSeq,
}

impl HeuristicsState {
    pub fn new() -> Self {
        let now = os_elapsed_time();
        Self {
            degenerated_cycles_in_a_row: 0,
            successful_cycles_in_a_row: 0,
            cycle_start: now,
            last_cycle_end: now,
            gc_times_learned: 0,
            gc_time_penalties: 0,
            gc_time_history: TruncatedSeq::new(10),
        }
    }

    fn adjust_penalty(&mut self, step: isize) {
        self.gc_time_penalties = (self.gc_time_penalties + step).max(0).min(100);
    }
}

impl Default for HeuristicsState {
    fn default() -> Self {
        Self::new()
    }
}

pub trait ShenandoahHeuristics: Send {
    fn name(&self) -> &'static str;

    fn state(&self) -> &HeuristicsState;
    fn state_mut(&mut self) -> &mut HeuristicsState;

    /// Picks collection set regions out of `data`. `actual_free` is the free space the cycle
    /// starts from, immediate garbage included.
    fn choose_collection_set_from_regiondata(
        &mut self,
        heap: &ShenandoahHeap,
        cset: &ShenandoahCollectionSet,
        data: &mut [RegionData],
        actual_free: usize,
    );

    fn should_start_gc(&mut self, heap: &ShenandoahHeap) -> bool {
        guaranteed_interval_expired(self.state(), heap)
    }

    fn should_degenerate_cycle(&self, heap: &ShenandoahHeap) -> bool {
        self.state().degenerated_cycles_in_a_row <= heap.config().full_gc_threshold
    }

    fn record_cycle_start(&mut self) {
        self.state_mut().cycle_start = os_elapsed_time();
    }

    fn record_cycle_end(&mut self) {
        self.state_mut().last_cycle_end = os_elapsed_time();
    }

    fn time_since_last_gc(&self) -> f64 {
        os_elapsed_time() - self.state().cycle_start
    }

    fn record_success_concurrent(&mut self) {
        let state = self.state_mut();
        state.degenerated_cycles_in_a_row = 0;
        state.successful_cycles_in_a_row += 1;

        let elapsed = os_elapsed_time() - state.cycle_start;
        state.gc_time_history.add(elapsed);
        state.gc_times_learned += 1;

        state.adjust_penalty(CONCURRENT_ADJUST);
    }

    fn record_success_degenerated(&mut self) {
        let state = self.state_mut();
        state.degenerated_cycles_in_a_row += 1;
        state.successful_cycles_in_a_row = 0;
        state.adjust_penalty(DEGENERATE_PENALTY);
    }

    fn record_success_full(&mut self) {
        let state = self.state_mut();
        state.degenerated_cycles_in_a_row = 0;
        state.successful_cycles_in_a_row += 1;
        state.adjust_penalty(FULL_PENALTY);
    }

    fn record_allocation_failure_gc(&mut self) {}

    fn record_requested_gc(&mut self) {
        // Assume users call explicit GC when they expect the heap to change a lot: start learning
        // from scratch.
        self.state_mut().gc_times_learned = 0;
    }

    /// Selects the collection set. Empty regions count as free, regular regions without live
    /// data and dead humongous objects are trashed right away, and when immediate garbage is a
    /// large enough share of all garbage no evacuation is attempted.
    fn choose_collection_set(&mut self, heap: &ShenandoahHeap, cset: &ShenandoahCollectionSet) {
        debug_assert!(cset.is_empty(), "Must be empty");

        let region_size = heap.options().region_size_bytes;
        let mut candidates = Vec::with_capacity(heap.num_regions());

        let mut total_garbage = 0;
        let mut immediate_garbage = 0;
        let mut immediate_regions = 0;
        let mut free = 0;
        let mut free_regions = 0;

        for region in heap.regions() {
            let garbage = region.garbage();
            total_garbage += garbage;

            if region.is_empty() {
                free_regions += 1;
                free += region_size;
            } else if region.is_regular() {
                if !region.has_live() {
                    immediate_regions += 1;
                    immediate_garbage += garbage;
                    region.make_trash();
                } else {
                    candidates.push(RegionData {
                        index: region.index(),
                        garbage,
                    });
                }
            } else if region.is_humongous_start() && !region.is_pinned() {
                if !region.has_live() {
                    heap.trash_humongous_region_at(region);
                    // Continuations are counted on the trash path below.
                    immediate_regions += 1;
                    immediate_garbage += garbage;
                }
            } else if region.is_trash() {
                immediate_regions += 1;
                immediate_garbage += garbage;
            }
        }

        debug_assert!(immediate_garbage <= total_garbage);

        let immediate_percent = if total_garbage == 0 {
            0
        } else {
            immediate_garbage * 100 / total_garbage
        };

        if immediate_percent <= heap.config().immediate_threshold {
            self.choose_collection_set_from_regiondata(
                heap,
                cset,
                &mut candidates,
                immediate_garbage + free,
            );
        }

        let cset_percent = if total_garbage == 0 {
            0
        } else {
            cset.garbage() * 100 / total_garbage
        };
        let collectable_garbage = cset.garbage() + immediate_garbage;
        let collectable_garbage_percent = if total_garbage == 0 {
            0
        } else {
            collectable_garbage * 100 / total_garbage
        };

        tracing::info!(
            "Collectable Garbage: {} ({}%), Immediate: {} ({}%), CSet: {} ({}%)",
            formatted_size(collectable_garbage),
            collectable_garbage_percent,
            formatted_size(immediate_garbage),
            immediate_percent,
            formatted_size(cset.garbage()),
            cset_percent
        );
        tracing::debug!(
            "Free regions: {}, immediate regions: {}, candidates: {}",
            free_regions,
            immediate_regions,
            candidates.len()
        );
    }
}

/// Fires when no cycle ran for longer than the guaranteed interval.
pub(crate) fn guaranteed_interval_expired(state: &HeuristicsState, heap: &ShenandoahHeap) -> bool {
    let interval = heap.config().guaranteed_gc_interval;
    if interval.as_millis() > 0 {
        let last_time_ms = (os_elapsed_time() - state.last_cycle_end) * 1000.0;
        if last_time_ms > interval.as_millis() as f64 {
            tracing::info!(
                "Trigger: Time since last GC ({:.0} ms) is larger than guaranteed interval ({} ms)",
                last_time_ms,
                interval.as_millis()
            );
            return true;
        }
    }
    false
}

/// Sorts candidates by garbage, most garbage first.
pub(crate) fn sort_by_garbage(data: &mut [RegionData]) {
    data.sort_by(|a, b| b.garbage.cmp(&a.garbage));
}

pub fn create(kind: HeuristicsKind) -> Box<dyn ShenandoahHeuristics> {
    match kind {
        HeuristicsKind::Adaptive => Box::new(ShenandoahAdaptiveHeuristics::new()),
        HeuristicsKind::Static => Box::new(ShenandoahStaticHeuristics::new()),
        HeuristicsKind::Passive => Box::new(ShenandoahPassiveHeuristics::new()),
        HeuristicsKind::Aggressive => Box::new(ShenandoahAggressiveHeuristics::new()),
        HeuristicsKind::Compact => Box::new(ShenandoahCompactHeuristics::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_penalties_are_clamped() {
        let mut heuristics = ShenandoahPassiveHeuristics::new();
        for _ in 0..10 {
            heuristics.record_success_full();
        }
        assert_eq!(heuristics.state().gc_time_penalties, 100);
        heuristics.record_success_degenerated();
        assert_eq!(heuristics.state().degenerated_cycles_in_a_row, 1);
        assert_eq!(heuristics.state().successful_cycles_in_a_row, 0);
        for _ in 0..200 {
            heuristics.record_success_concurrent();
        }
        assert_eq!(heuristics.state().gc_time_penalties, 0);
        assert_eq!(heuristics.state().degenerated_cycles_in_a_row, 0);
        assert_eq!(heuristics.state().gc_times_learned, 200);
        heuristics.record_requested_gc();
        assert_eq!(heuristics.state().gc_times_learned, 0);
    }

    #[test]
    fn test_sort_by_garbage() {
        let mut data = vec![
            RegionData { index: 0, garbage: 10 },
            RegionData { index: 1, garbage: 30 },
            RegionData { index: 2, garbage: 20 },
        ];
        sort_by_garbage(&mut data);
        let order: Vec<_> = data.iter().map(|d| d.index).collect();
        assert_eq!(order, vec![1, 2, 0]);
    }
}
