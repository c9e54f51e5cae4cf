use crate::utils::formatted_size;

use super::heap::ShenandoahHeap;

/// Heap occupancy before and after a pause, used to decide whether the pause reclaimed
/// enough to keep going without a heavier collection.
#[derive(Default, Debug)]
pub struct ShenandoahMetricsSnapshot {
    used_before: usize,
    used_after: usize,
    if_before: f64,
    if_after: f64,
    ef_before: f64,
    ef_after: f64,
}

impl ShenandoahMetricsSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snap_before(&mut self, heap: &ShenandoahHeap) {
        let free_set = heap.lock();
        self.used_before = heap.used();
        self.if_before = free_set.internal_fragmentation(heap);
        self.ef_before = free_set.external_fragmentation(heap);
    }

    pub fn snap_after(&mut self, heap: &ShenandoahHeap) {
        let free_set = heap.lock();
        self.used_after = heap.used();
        self.if_after = free_set.internal_fragmentation(heap);
        self.ef_after = free_set.external_fragmentation(heap);
    }

    /// Progress means enough free space is left, and the pause either freed at least one
    /// region or reduced fragmentation.
    pub fn is_good_progress(&self, heap: &ShenandoahHeap, label: &str) -> bool {
        let free_actual = heap.free_set_available();
        let free_expected = heap.max_capacity() / 100 * heap.config().critical_free_threshold;
        if free_actual < free_expected {
            tracing::info!(
                "{}: no progress. Free space: {}, need at least {}",
                label,
                formatted_size(free_actual),
                formatted_size(free_expected)
            );
            return false;
        }

        let progress_actual = self.used_before.saturating_sub(self.used_after);
        let progress_expected = heap.options().region_size_bytes;
        if progress_actual >= progress_expected {
            return true;
        }
        tracing::debug!(
            "{}: used reduced by {}, need at least {}",
            label,
            formatted_size(progress_actual),
            formatted_size(progress_expected)
        );

        let if_diff = self.if_before - self.if_after;
        if if_diff > 0.01 {
            return true;
        }
        let ef_diff = self.ef_before - self.ef_after;
        if ef_diff > 0.01 {
            return true;
        }
        tracing::info!(
            "{}: no progress. Internal fragmentation {:.1}% -> {:.1}%, external {:.1}% -> {:.1}%",
            label,
            self.if_before * 100.0,
            self.if_after * 100.0,
            self.ef_before * 100.0,
            self.ef_after * 100.0
        );
        false
    }
}
