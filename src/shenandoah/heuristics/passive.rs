use crate::utils::formatted_size;

use super::{
    sort_by_garbage, HeuristicsState, RegionData, ShenandoahCollectionSet, ShenandoahHeap,
    ShenandoahHeuristics,
};

/// Never starts a concurrent cycle. Collections only happen on allocation failure or explicit
/// request, as degenerated or full pauses.
pub struct ShenandoahPassiveHeuristics {
    state: HeuristicsState,
}

impl ShenandoahPassiveHeuristics {
    pub fn new() -> Self {
        Self {
            state: HeuristicsState::new(),
        }
    }
}

impl Default for ShenandoahPassiveHeuristics {
    fn default() -> Self {
        Self::new()
    }
}

impl ShenandoahHeuristics for ShenandoahPassiveHeuristics {
    fn name(&self) -> &'static str {
        "passive"
    }

    fn state(&self) -> &HeuristicsState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut HeuristicsState {
        &mut self.state
    }

    fn should_start_gc(&mut self, _heap: &ShenandoahHeap) -> bool {
        false
    }

    fn should_degenerate_cycle(&self, heap: &ShenandoahHeap) -> bool {
        heap.config().degenerated_gc
    }

    fn choose_collection_set_from_regiondata(
        &mut self,
        heap: &ShenandoahHeap,
        cset: &ShenandoahCollectionSet,
        data: &mut [RegionData],
        actual_free: usize,
    ) {
        let config = heap.config();
        let threshold = heap.options().region_size_bytes * config.garbage_threshold / 100;

        // Evacuation runs in a pause, so it may use the whole free space, not only the reserve.
        let available = (heap.max_capacity() / 100 * config.evac_reserve).max(actual_free);
        let max_cset = (available as f64 / config.evac_waste) as usize;

        tracing::info!(
            "CSet Selection. Actual Free: {}, Max CSet: {}",
            formatted_size(actual_free),
            formatted_size(max_cset)
        );

        sort_by_garbage(data);

        let mut live_cset = 0;
        for candidate in data.iter() {
            let r = heap.get_region(candidate.index);
            let new_cset = live_cset + r.live_data_bytes();
            if new_cset <= max_cset && r.garbage() > threshold {
                live_cset = new_cset;
                cset.add_region(r);
            }
        }
    }
}
