use crate::shenandoah::{heap::ShenandoahHeap, region::RegionState};
use crate::utils::formatted_size;

/// Point-in-time snapshot of the heap.
#[derive(Clone, Debug, Default)]
pub struct HeapStatistics {
    pub capacity: usize,
    pub committed: usize,
    pub used: usize,
    pub free: usize,
    pub region_size: usize,
    pub empty_uncommitted_regions: usize,
    pub empty_committed_regions: usize,
    pub regular_regions: usize,
    pub humongous_regions: usize,
    pub pinned_regions: usize,
    pub cset_regions: usize,
    pub trash_regions: usize,
    pub total_gc_cycles_count: usize,
    pub concurrent_cycles: usize,
    pub degenerated_cycles: usize,
    pub full_cycles: usize,
}

impl HeapStatistics {
    pub fn collect(heap: &ShenandoahHeap) -> Self {
        let mut stats = Self {
            capacity: heap.capacity(),
            committed: heap.committed(),
            used: heap.used(),
            free: heap.free_set_available(),
            region_size: heap.options().region_size_bytes,
            ..Default::default()
        };
        for r in heap.regions() {
            match r.state() {
                RegionState::EmptyUncommitted => stats.empty_uncommitted_regions += 1,
                RegionState::EmptyCommitted => stats.empty_committed_regions += 1,
                RegionState::Regular => stats.regular_regions += 1,
                RegionState::HumongousStart | RegionState::HumongousCont => {
                    stats.humongous_regions += 1
                }
                RegionState::PinnedHumongousStart => {
                    stats.humongous_regions += 1;
                    stats.pinned_regions += 1;
                }
                RegionState::Pinned => stats.pinned_regions += 1,
                RegionState::CSet => stats.cset_regions += 1,
                RegionState::Trash => stats.trash_regions += 1,
            }
        }
        let policy = heap.policy();
        stats.concurrent_cycles = policy.success_concurrent_gcs();
        stats.degenerated_cycles = policy.success_degenerated_gcs();
        stats.full_cycles = policy.success_full_gcs();
        stats.total_gc_cycles_count = policy.cycle_counter();
        stats
    }
}

impl std::fmt::Display for HeapStatistics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Heap statistics:")?;
        writeln!(
            f,
            "  Capacity: {}, committed: {}, used: {}, free: {}",
            formatted_size(self.capacity),
            formatted_size(self.committed),
            formatted_size(self.used),
            formatted_size(self.free)
        )?;
        writeln!(f, "  Region size: {}", formatted_size(self.region_size))?;
        writeln!(
            f,
            "  Regions: {} empty ({} uncommitted), {} regular, {} humongous, {} pinned, {} cset, {} trash",
            self.empty_committed_regions + self.empty_uncommitted_regions,
            self.empty_uncommitted_regions,
            self.regular_regions,
            self.humongous_regions,
            self.pinned_regions,
            self.cset_regions,
            self.trash_regions
        )?;
        writeln!(f, "  Total GC cycles count: {}", self.total_gc_cycles_count)?;
        writeln!(
            f,
            "  Completed: {} concurrent, {} degenerated, {} full",
            self.concurrent_cycles, self.degenerated_cycles, self.full_cycles
        )?;
        Ok(())
    }
}
