use crate::utils::formatted_size;

use super::{
    guaranteed_interval_expired, sort_by_garbage, HeuristicsState, RegionData, ShenandoahCollectionSet, ShenandoahHeap,
    ShenandoahHeuristics,
};

/// Learns the GC time and the allocation rate, and starts the cycle early enough to finish it
/// before the allocations deplete free space.
pub struct ShenandoahAdaptiveHeuristics {
    state: HeuristicsState,
}

impl ShenandoahAdaptiveHeuristics {
    pub fn new() -> Self {
        Self {
            state: HeuristicsState::new(),
        }
    }
}

impl Default for ShenandoahAdaptiveHeuristics {
    fn default() -> Self {
        Self::new()
    }
}

impl ShenandoahHeuristics for ShenandoahAdaptiveHeuristics {
    fn name(&self) -> &'static str {
        "adaptive"
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
        actual_free: usize,
    ) {
        let config = heap.config();
        let garbage_threshold = heap.options().region_size_bytes * config.garbage_threshold / 100;

        // The collection set may not be larger than the evacuation reserve, otherwise
        // evacuation is guaranteed to run out of memory. It should not be so small that the
        // free threshold is missed right after the cycle either: the best candidates are added
        // unconditionally until min_garbage is reached, then only those above the garbage
        // threshold.
        let capacity = heap.max_capacity();
        let max_cset =
            ((capacity as f64 / 100.0 * config.evac_reserve as f64) / config.evac_waste) as usize;
        let free_target = capacity / 100 * config.min_free_threshold + max_cset;
        let min_garbage = free_target.saturating_sub(actual_free);

        tracing::info!(
            "Adaptive CSet Selection. Target Free: {}, Actual Free: {}, Max CSet: {}, Min Garbage: {}",
            formatted_size(free_target),
            formatted_size(actual_free),
            formatted_size(max_cset),
            formatted_size(min_garbage)
        );

        sort_by_garbage(data);

        let mut cur_cset = 0;
        let mut cur_garbage = 0;

        for candidate in data.iter() {
            let r = heap.get_region(candidate.index);

            let new_cset = cur_cset + r.live_data_bytes();
            let new_garbage = cur_garbage + r.garbage();

            if new_cset > max_cset {
                break;
            }

            if new_garbage < min_garbage || r.garbage() > garbage_threshold {
                cset.add_region(r);
                cur_cset = new_cset;
                cur_garbage = new_garbage;
            }
        }
    }

    fn should_start_gc(&mut self, heap: &ShenandoahHeap) -> bool {
        let config = heap.config();
        let capacity = heap.max_capacity();
        let available = heap.free_set_available();

        let min_threshold = capacity / 100 * config.min_free_threshold;
        if available < min_threshold {
            tracing::info!(
                "Trigger: Free ({}) is below minimum threshold ({})",
                formatted_size(available),
                formatted_size(min_threshold)
            );
            return true;
        }

        let max_learn = config.learning_steps;
        if self.state.gc_times_learned < max_learn {
            let init_threshold = capacity / 100 * config.init_free_threshold;
            if available < init_threshold {
                tracing::info!(
                    "Trigger: Learning {} of {}. Free ({}) is below initial threshold ({})",
                    self.state.gc_times_learned + 1,
                    max_learn,
                    formatted_size(available),
                    formatted_size(init_threshold)
                );
                return true;
            }
        }

        // Headroom leaves room for allocation spikes and for the penalties of recent degenerated
        // and full cycles.
        let mut allocation_headroom = available;
        let spike_headroom = capacity / 100 * config.alloc_spike_factor;
        let penalties = capacity / 100 * self.state.gc_time_penalties.max(0) as usize;
        allocation_headroom -= allocation_headroom.min(spike_headroom);
        allocation_headroom -= allocation_headroom.min(penalties);

        let average_gc = self.state.gc_time_history.avg();
        let time_since_last = self.time_since_last_gc().max(1e-3);
        let allocation_rate = heap.bytes_allocated_since_gc_start() as f64 / time_since_last;

        if allocation_rate > 0.0 && average_gc > allocation_headroom as f64 / allocation_rate {
            tracing::info!(
                "Trigger: Average GC time ({:.2} ms) is above the time for allocation rate ({:.0} B/s) to deplete free headroom ({})",
                average_gc * 1000.0,
                allocation_rate,
                formatted_size(allocation_headroom)
            );
            tracing::info!(
                "Free headroom: {} (free) - {} (spike) - {} (penalties) = {}",
                formatted_size(available),
                formatted_size(spike_headroom),
                formatted_size(penalties),
                formatted_size(allocation_headroom)
            );
            return true;
        }

        guaranteed_interval_expired(&self.state, heap)
    }
}
