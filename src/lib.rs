//! Region-based concurrent mostly-moving garbage collector for implementing VMs in Rust.
//!
//! The heap is split into equally sized regions. A cycle marks live objects concurrently with
//! the mutators, picks the regions with the most garbage as the collection set, evacuates their
//! live objects concurrently and then updates references to the evacuated objects. Every object
//! carries a forwarding word, and barriers resolve it, so mutators keep running while objects
//! move. When a concurrent cycle cannot keep up with allocation it degenerates into a pause
//! that finishes the work, and when that does not reclaim enough memory either a full
//! sliding mark-compact runs.
//!
//! ```no_run
//! use comet_shenandoah::{Config, ShenandoahHeap};
//!
//! let heap = ShenandoahHeap::create(Config::default()).unwrap();
//! {
//!     let mut mutator = heap.attach_mutator();
//!     let obj = mutator.allocate(1, 2).unwrap();
//!     let other = mutator.allocate(0, 4).unwrap();
//!     mutator.store(obj, 0, Some(other));
//! }
//! heap.stop();
//! ```
use std::time::Duration;

macro_rules! logln_if {
    ($cond: expr, $($t:tt)*) => {
        if $cond {
            tracing::info!($($t)*);
        }
    };
}

pub mod error;
pub mod internal;
pub mod mmap;
pub mod safepoint;
pub mod shenandoah;
pub mod statistics;
pub mod utils;

#[cfg(test)]
mod tests;

pub use error::{AllocError, ConfigError, VerifyError};
pub use shenandoah::{
    barrier::BarrierAbi,
    code_roots::CodeBlob,
    handles::{GlobalHandle, WeakHandle},
    heap::ShenandoahHeap,
    heuristics::ShenandoahHeuristics,
    mutator::{HandleMark, Local, Mutator},
    oop::Oop,
    phase_timings::{PhaseEvent, ShenandoahPhase},
    policy::{GcCause, ShenandoahDegenPoint},
};
pub use statistics::HeapStatistics;

/// Strategy deciding when a cycle starts and which regions it evacuates.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HeuristicsKind {
    /// Learns the GC time and allocation rate, starts cycles just in time.
    Adaptive,
    /// Fixed free space threshold.
    Static,
    /// Never starts concurrent cycles, only degenerated and full pauses.
    Passive,
    /// Back-to-back cycles evacuating everything with garbage.
    Aggressive,
    /// Low footprint: cycles every `allocation_threshold` percent of allocation.
    Compact,
}

fn default_parallel_gc_threads() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
        .min(8)
}

/// Configuration for heap constructor.
///
/// Percentages are of the maximum heap size unless noted otherwise.
#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum heap size. The whole range is reserved up front and committed lazily.
    pub max_heap_size: usize,
    /// Explicit region size. Computed from `target_num_regions` when not set.
    pub region_size: Option<usize>,
    pub min_region_size: usize,
    pub max_region_size: usize,
    /// Number of regions to aim for when the region size is computed.
    pub target_num_regions: usize,
    /// Objects larger than this percentage of a region are humongous.
    pub humongous_threshold: usize,
    pub heuristics: HeuristicsKind,
    /// Workers for pauses.
    pub parallel_gc_threads: usize,
    /// Workers for concurrent phases.
    pub conc_gc_threads: usize,
    /// Regions with more garbage than this percentage of the region size are collection set
    /// candidates.
    pub garbage_threshold: usize,
    /// Start a cycle when free space drops below this.
    pub min_free_threshold: usize,
    /// Free space threshold for the learning cycles.
    pub init_free_threshold: usize,
    /// Compact heuristics start a cycle after this much allocation. Zero disables it.
    pub allocation_threshold: usize,
    /// Skip evacuation when immediate garbage is more than this percentage of all garbage.
    pub immediate_threshold: usize,
    /// Free space kept for allocation spikes, adaptive heuristics.
    pub alloc_spike_factor: usize,
    /// Cycles to learn from before adaptive heuristics trust their statistics.
    pub learning_steps: usize,
    /// Space reserved for evacuation.
    pub evac_reserve: usize,
    /// How much more space evacuation needs than the live data it copies.
    pub evac_waste: f64,
    /// Allow evacuation to take empty mutator regions once the reserve is exhausted.
    pub evac_reserve_overflow: bool,
    /// Allow evacuation to copy into partially used mutator regions.
    pub allow_mixed_allocs: bool,
    /// Start a cycle at least this often. Zero disables it.
    pub guaranteed_gc_interval: Duration,
    pub uncommit: bool,
    /// Empty regions are uncommitted after staying empty this long.
    pub uncommit_delay: Duration,
    pub control_interval_min: Duration,
    pub control_interval_max: Duration,
    /// The control loop sleep is adjusted this often.
    pub control_interval_adjust_period: Duration,
    /// Objects traced between cancellation checks.
    pub mark_loop_stride: usize,
    pub satb_buffer_size: usize,
    /// Degenerated cycles in a row before a full GC is preferred.
    pub full_gc_threshold: usize,
    /// Free space a pause has to leave behind to count as progress.
    pub critical_free_threshold: usize,
    /// Degenerate cancelled cycles instead of going straight to full GC.
    pub degenerated_gc: bool,
    pub pacing: bool,
    /// Longest a single allocation waits for the pacer.
    pub pacing_max_delay: Duration,
    /// Non-taxable allocation between cycles.
    pub pacing_idle_slack: usize,
    /// Share of the free space that is not taxed during a cycle.
    pub pacing_cycle_slack: usize,
    /// Multiplier over the computed tax rate.
    pub pacing_surcharge: f64,
    pub use_tlab: bool,
    /// Shrink lab requests to the space left in a region instead of retiring it.
    pub elastic_tlab: bool,
    /// Largest TLAB in words. Defaults to an eighth of a region.
    pub tlab_size_words: Option<usize>,
    pub read_barrier: bool,
    pub write_barrier: bool,
    pub satb_barrier: bool,
    pub storeval_read_barrier: bool,
    pub acmp_barrier: bool,
    /// Explicit collections run a concurrent cycle instead of a full GC.
    pub explicit_gc_invokes_concurrent: bool,
    /// Randomly fail mutator allocations during concurrent phases.
    pub alloc_failure_a_lot: bool,
    /// Randomly fail to-space allocations during evacuation.
    pub oom_during_evac_a_lot: bool,
    /// Verify the heap before and after phases.
    pub verify: bool,
    /// Enables printing of collector statistics on shutdown.
    pub verbose: bool,
}

impl Default for Config {
    fn default() -> Self {
        let parallel_gc_threads = default_parallel_gc_threads();
        Self {
            max_heap_size: 256 * 1024 * 1024,
            region_size: None,
            min_region_size: 256 * 1024,
            max_region_size: 32 * 1024 * 1024,
            target_num_regions: 2048,
            humongous_threshold: 100,
            heuristics: HeuristicsKind::Adaptive,
            parallel_gc_threads,
            conc_gc_threads: ((parallel_gc_threads + 3) / 4).max(1),
            garbage_threshold: 60,
            min_free_threshold: 10,
            init_free_threshold: 70,
            allocation_threshold: 0,
            immediate_threshold: 90,
            alloc_spike_factor: 5,
            learning_steps: 5,
            evac_reserve: 5,
            evac_waste: 1.2,
            evac_reserve_overflow: true,
            allow_mixed_allocs: true,
            guaranteed_gc_interval: Duration::from_secs(5 * 60),
            uncommit: true,
            uncommit_delay: Duration::from_secs(5 * 60),
            control_interval_min: Duration::from_millis(1),
            control_interval_max: Duration::from_millis(10),
            control_interval_adjust_period: Duration::from_millis(1000),
            mark_loop_stride: 1000,
            satb_buffer_size: 1024,
            full_gc_threshold: 3,
            critical_free_threshold: 1,
            degenerated_gc: true,
            pacing: true,
            pacing_max_delay: Duration::from_millis(10),
            pacing_idle_slack: 2,
            pacing_cycle_slack: 10,
            pacing_surcharge: 1.1,
            use_tlab: true,
            elastic_tlab: true,
            tlab_size_words: None,
            read_barrier: true,
            write_barrier: true,
            satb_barrier: true,
            storeval_read_barrier: true,
            acmp_barrier: true,
            explicit_gc_invokes_concurrent: false,
            alloc_failure_a_lot: false,
            oom_during_evac_a_lot: false,
            verify: false,
            verbose: false,
        }
    }
}

impl Config {
    /// Rejects settings the collector cannot run with. Region geometry is checked separately
    /// when the sizes are set up.
    pub fn validate(&self) -> Result<(), error::ConfigError> {
        let percentages = [
            ("garbage_threshold", self.garbage_threshold),
            ("min_free_threshold", self.min_free_threshold),
            ("init_free_threshold", self.init_free_threshold),
            ("allocation_threshold", self.allocation_threshold),
            ("immediate_threshold", self.immediate_threshold),
            ("alloc_spike_factor", self.alloc_spike_factor),
            ("evac_reserve", self.evac_reserve),
            ("critical_free_threshold", self.critical_free_threshold),
            ("pacing_idle_slack", self.pacing_idle_slack),
            ("pacing_cycle_slack", self.pacing_cycle_slack),
        ];
        for (name, value) in percentages.iter() {
            if *value > 100 {
                return Err(error::ConfigError::BadPercentage {
                    name: *name,
                    value: *value,
                });
            }
        }
        if self.parallel_gc_threads == 0 {
            return Err(error::ConfigError::NoWorkers("parallel_gc_threads"));
        }
        if self.conc_gc_threads == 0 {
            return Err(error::ConfigError::NoWorkers("conc_gc_threads"));
        }
        Ok(())
    }
}
