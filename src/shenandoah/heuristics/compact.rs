use crate::utils::formatted_size;

use super::{
    guaranteed_interval_expired, sort_by_garbage, HeuristicsState, RegionData,
    ShenandoahCollectionSet, ShenandoahHeap, ShenandoahHeuristics,
};

/// Keeps the footprint low: cycles start after a fixed amount of allocation, and the
/// collection set may use most of the free space.
pub struct ShenandoahCompactHeuristics {
    state: HeuristicsState,
}

impl ShenandoahCompactHeuristics {
    pub fn new() -> Self {
        Self {
            state: HeuristicsState::new(),
        }
    }
}

impl Default for ShenandoahCompactHeuristics {
    fn default() -> Self {
        Self::new()
    }
}

impl ShenandoahHeuristics for ShenandoahCompactHeuristics {
    fn name(&self) -> &'static str {
        "compact"
    }

    fn state(&self) -> &HeuristicsState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut HeuristicsState {
        &mut self.state
    }

    fn should_start_gc(&mut self, heap: &ShenandoahHeap) -> bool {
        let config = heap.config();
        let capacity = heap.max_capacity();
        let available = heap.free_set_available();

        let threshold_bytes_allocated = capacity / 100 * config.allocation_threshold;
        let min_threshold = capacity / 100 * config.min_free_threshold;

        if available < min_threshold {
            tracing::info!(
                "Trigger: Free ({}) is below minimum threshold ({})",
                formatted_size(available),
                formatted_size(min_threshold)
            );
            return true;
        }

        let bytes_allocated = heap.bytes_allocated_since_gc_start();
        if threshold_bytes_allocated > 0 && bytes_allocated > threshold_bytes_allocated {
            tracing::info!(
                "Trigger: Allocated since last cycle ({}) is larger than allocation threshold ({})",
                formatted_size(bytes_allocated),
                formatted_size(threshold_bytes_allocated)
            );
            return true;
        }

        guaranteed_interval_expired(&self.state, heap)
    }

    fn choose_collection_set_from_regiondata(
        &mut self,
        heap: &ShenandoahHeap,
        cset: &ShenandoahCollectionSet,
        data: &mut [RegionData],
        actual_free: usize,
    ) {
        let threshold = heap.options().region_size_bytes * heap.config().garbage_threshold / 100;
        let max_cset = actual_free * 3 / 4;

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
