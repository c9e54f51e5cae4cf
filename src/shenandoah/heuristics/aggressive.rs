use super::{
    HeuristicsState, RegionData, ShenandoahCollectionSet, ShenandoahHeap, ShenandoahHeuristics,
};

/// Back-to-back cycles that evacuate every region with any garbage. Stresses barriers and
/// evacuation paths.
pub struct ShenandoahAggressiveHeuristics {
    state: HeuristicsState,
}

impl ShenandoahAggressiveHeuristics {
    pub fn new() -> Self {
        Self {
            state: HeuristicsState::new(),
        }
    }
}

impl Default for ShenandoahAggressiveHeuristics {
    fn default() -> Self {
        Self::new()
    }
}

impl ShenandoahHeuristics for ShenandoahAggressiveHeuristics {
    fn name(&self) -> &'static str {
        "aggressive"
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
        for candidate in data.iter() {
            if candidate.garbage > 0 {
                cset.add_region(heap.get_region(candidate.index));
            }
        }
    }

    fn should_start_gc(&mut self, _heap: &ShenandoahHeap) -> bool {
        tracing::info!("Trigger: Start next cycle immediately");
        true
    }
}
