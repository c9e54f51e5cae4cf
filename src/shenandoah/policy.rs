use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Why a collection was requested.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GcCause {
    AllocationFailure,
    AllocationFailureEvac,
    ExplicitGc,
    ConcurrentGc,
    UpgradeToFullGc,
    Shutdown,
}

impl GcCause {
    pub fn name(self) -> &'static str {
        match self {
            Self::AllocationFailure => "Allocation Failure",
            Self::AllocationFailureEvac => "Allocation Failure During Evacuation",
            Self::ExplicitGc => "Explicit GC",
            Self::ConcurrentGc => "Concurrent GC",
            Self::UpgradeToFullGc => "Upgrade To Full GC",
            Self::Shutdown => "Shutdown",
        }
    }
}

/// Point of the concurrent cycle where the degenerated pause picks the work up.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(usize)]
pub enum ShenandoahDegenPoint {
    OutsideCycle,
    Mark,
    Evac,
    UpdateRefs,
}

impl ShenandoahDegenPoint {
    pub const COUNT: usize = 4;

    pub const ALL: [ShenandoahDegenPoint; Self::COUNT] = [
        ShenandoahDegenPoint::OutsideCycle,
        ShenandoahDegenPoint::Mark,
        ShenandoahDegenPoint::Evac,
        ShenandoahDegenPoint::UpdateRefs,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::OutsideCycle => "Outside of Cycle",
            Self::Mark => "Mark",
            Self::Evac => "Evacuation",
            Self::UpdateRefs => "Update Refs",
        }
    }
}

/// Outcome counters over the heap lifetime.
pub struct ShenandoahCollectorPolicy {
    success_concurrent_gcs: AtomicUsize,
    success_degenerated_gcs: AtomicUsize,
    success_full_gcs: AtomicUsize,
    alloc_failure_degenerated: AtomicUsize,
    alloc_failure_degenerated_upgrade_to_full: AtomicUsize,
    alloc_failure_full: AtomicUsize,
    explicit_concurrent: AtomicUsize,
    explicit_full: AtomicUsize,
    degen_points: [AtomicUsize; ShenandoahDegenPoint::COUNT],
    in_shutdown: AtomicBool,
    cycle_counter: AtomicUsize,
}

impl ShenandoahCollectorPolicy {
    pub fn new() -> Self {
        Self {
            success_concurrent_gcs: AtomicUsize::new(0),
            success_degenerated_gcs: AtomicUsize::new(0),
            success_full_gcs: AtomicUsize::new(0),
            alloc_failure_degenerated: AtomicUsize::new(0),
            alloc_failure_degenerated_upgrade_to_full: AtomicUsize::new(0),
            alloc_failure_full: AtomicUsize::new(0),
            explicit_concurrent: AtomicUsize::new(0),
            explicit_full: AtomicUsize::new(0),
            degen_points: Default::default(),
            in_shutdown: AtomicBool::new(false),
            cycle_counter: AtomicUsize::new(0),
        }
    }

    pub fn record_explicit_to_concurrent(&self) {
        self.explicit_concurrent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_explicit_to_full(&self) {
        self.explicit_full.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_alloc_failure_to_full(&self) {
        self.alloc_failure_full.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_alloc_failure_to_degenerated(&self, point: ShenandoahDegenPoint) {
        self.alloc_failure_degenerated.fetch_add(1, Ordering::Relaxed);
        self.degen_points[point as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_degenerated_upgrade_to_full(&self) {
        self.alloc_failure_degenerated_upgrade_to_full
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success_concurrent(&self) {
        self.success_concurrent_gcs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success_degenerated(&self) {
        self.success_degenerated_gcs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success_full(&self) {
        self.success_full_gcs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cycle_start(&self) {
        self.cycle_counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_shutdown(&self) {
        self.in_shutdown.store(true, Ordering::Release);
    }

    pub fn is_at_shutdown(&self) -> bool {
        self.in_shutdown.load(Ordering::Acquire)
    }

    pub fn cycle_counter(&self) -> usize {
        self.cycle_counter.load(Ordering::Relaxed)
    }

    pub fn success_concurrent_gcs(&self) -> usize {
        self.success_concurrent_gcs.load(Ordering::Relaxed)
    }

    pub fn success_degenerated_gcs(&self) -> usize {
        self.success_degenerated_gcs.load(Ordering::Relaxed)
    }

    pub fn success_full_gcs(&self) -> usize {
        self.success_full_gcs.load(Ordering::Relaxed)
    }

    pub fn degenerated_at(&self, point: ShenandoahDegenPoint) -> usize {
        self.degen_points[point as usize].load(Ordering::Relaxed)
    }

    pub fn upgrades_to_full(&self) -> usize {
        self.alloc_failure_degenerated_upgrade_to_full
            .load(Ordering::Relaxed)
    }

    pub fn print_gc_stats(&self) {
        tracing::info!("Under allocation pressure, concurrent cycles may cancel, and either continue cycle");
        tracing::info!("under stop-the-world pause or result in stop-the-world Full GC. Increase heap size,");
        tracing::info!("tune GC heuristics, set more aggressive pacing delay, or lower allocation rate");
        tracing::info!("to avoid Degenerated and Full GC cycles.");
        tracing::info!("");

        tracing::info!(
            "{:5} successful concurrent GCs",
            self.success_concurrent_gcs()
        );
        tracing::info!(
            "  {:5} invoked explicitly",
            self.explicit_concurrent.load(Ordering::Relaxed)
        );
        tracing::info!("");

        tracing::info!("{:5} Degenerated GCs", self.success_degenerated_gcs());
        tracing::info!(
            "  {:5} caused by allocation failure",
            self.alloc_failure_degenerated.load(Ordering::Relaxed)
        );
        for point in ShenandoahDegenPoint::ALL.iter() {
            let count = self.degenerated_at(*point);
            if count > 0 {
                tracing::info!("    {:5} happened at {}", count, point.name());
            }
        }
        tracing::info!(
            "  {:5} upgraded to Full GC",
            self.upgrades_to_full()
        );
        tracing::info!("");

        tracing::info!(
            "{:5} Full GCs",
            self.success_full_gcs() + self.upgrades_to_full()
        );
        tracing::info!(
            "  {:5} invoked explicitly",
            self.explicit_full.load(Ordering::Relaxed)
        );
        tracing::info!(
            "  {:5} caused by allocation failure",
            self.alloc_failure_full.load(Ordering::Relaxed)
        );
        tracing::info!(
            "  {:5} upgraded from Degenerated GC",
            self.upgrades_to_full()
        );
    }
}

impl Default for ShenandoahCollectorPolicy {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degen_points_are_counted_separately() {
        let policy = ShenandoahCollectorPolicy::new();
        policy.record_alloc_failure_to_degenerated(ShenandoahDegenPoint::Evac);
        policy.record_alloc_failure_to_degenerated(ShenandoahDegenPoint::Evac);
        policy.record_alloc_failure_to_degenerated(ShenandoahDegenPoint::Mark);
        assert_eq!(policy.degenerated_at(ShenandoahDegenPoint::Evac), 2);
        assert_eq!(policy.degenerated_at(ShenandoahDegenPoint::Mark), 1);
        assert_eq!(policy.degenerated_at(ShenandoahDegenPoint::UpdateRefs), 0);
    }
}
