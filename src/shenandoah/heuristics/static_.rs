use crate::utils::formatted_size;

use super::{
    guaranteed_interval_expired, HeuristicsState, RegionData, ShenandoahCollectionSet,
    ShenandoahHeap, ShenandoahHeuristics,
};

/// Starts a cycle when free space drops below a fixed threshold and collects every region
/// above the garbage threshold.
pub struct ShenandoahStaticHeuristics {
    state: HeuristicsState,
}

impl ShenandoahStaticHeuristics {
    pub fn new() -> Self {
        Self {
            state: HeuristicsState::new(),
        }
    }
}

impl Default for ShenandoahStaticHeuristics {
    fn default() -> Self {
        Self::new()
    }
}

impl ShenandoahHeuristics for ShenandoahStaticHeuristics {
    fn name(&self) -> &'static str {
        "static"
    }

    fn state(&self) -> &HeuristicsState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut HeuristicsState {
        &mut self.state
    }

    fn choose_collection_set_from_regiondata(
        &mut self,
        heap: &ShenandoahHeap,
        cset: &ShenandoahCollectionSet,
        data: &mut [RegionData],
        _actual_free: usize,
    ) {
        let threshold = heap.options().region_size_bytes * heap.config().garbage_threshold / 100;
        for candidate in data.iter() {
            if candidate.garbage > threshold {
                cset.add_region(heap.get_region(candidate.index));
            }
        }
    }

    fn should_start_gc(&mut self, heap: &ShenandoahHeap) -> bool {
        let available = heap.free_set_available();
        let threshold = heap.max_capacity() / 100 * heap.config().min_free_threshold;

        if available < threshold {
            tracing::info!(
                "Trigger: Free ({}) is below minimum threshold ({})",
                formatted_size(available),
                formatted_size(threshold)
            );
            return true;
        }
        guaranteed_interval_expired(&self.state, heap)
    }
}
