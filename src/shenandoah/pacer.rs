use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use atomic::Atomic;
use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};

use crate::{
    utils::{formatted_size, ShenandoahSharedFlag, TruncatedSeq},
    Config,
};

use super::oop::LOG_HEAP_WORD_SIZE;

const PACING_PROGRESS_UNINIT: isize = -1;
const PACING_PROGRESS_ZERO: isize = 0;

/// Allocation pacer.
///
/// Each phase gets a budget of words mutators may allocate, derived from the work the phase has
/// to do and the free space left. Collector threads replenish the budget as they make progress;
/// a mutator that finds the budget depleted claims it anyway, driving it negative, and waits
/// until the collector catches up or its time budget runs out.
pub struct ShenandoahPacer {
    max_capacity: usize,
    max_delay_ms: u64,
    idle_slack: usize,
    cycle_slack: usize,
    surcharge: f64,

    budget: CachePadded<AtomicIsize>,
    tax_rate: Atomic<f64>,
    epoch: AtomicUsize,
    progress: CachePadded<AtomicIsize>,
    progress_history: Mutex<TruncatedSeq>,

    need_notify_waiters: ShenandoahSharedFlag,
    wait_lock: Mutex<()>,
    wait_cv: Condvar,
}

impl ShenandoahPacer {
    pub fn new(config: &Config, max_capacity: usize) -> Self {
        Self {
            max_capacity,
            max_delay_ms: config.pacing_max_delay.as_millis() as u64,
            idle_slack: config.pacing_idle_slack,
            cycle_slack: config.pacing_cycle_slack,
            surcharge: config.pacing_surcharge,
            budget: CachePadded::new(AtomicIsize::new(0)),
            tax_rate: Atomic::new(1.0),
            epoch: AtomicUsize::new(0),
            progress: CachePadded::new(AtomicIsize::new(PACING_PROGRESS_UNINIT)),
            progress_history: Mutex::new(TruncatedSeq::new(5)),
            need_notify_waiters: ShenandoahSharedFlag::new(),
            wait_lock: Mutex::new(()),
            wait_cv: Condvar::new(),
        }
    }

    /// Live data marked by the previous cycles, in bytes. The very first cycle assumes a tenth
    /// of the heap.
    fn update_and_get_progress_history(&self) -> usize {
        let progress = self.progress.swap(PACING_PROGRESS_ZERO, Ordering::AcqRel);
        if progress == PACING_PROGRESS_UNINIT {
            self.max_capacity / 10
        } else {
            let mut history = self.progress_history.lock();
            history.add(progress as f64);
            (history.avg() as usize) << LOG_HEAP_WORD_SIZE
        }
    }

    fn split_free(&self, free: usize) -> (usize, usize) {
        let non_taxable = free * self.cycle_slack / 100;
        let taxable = (free - non_taxable).max(1);
        (non_taxable, taxable)
    }

    pub fn setup_for_mark(&self, free: usize) {
        let live = self.update_and_get_progress_history();
        let (non_taxable, taxable) = self.split_free(free);

        let mut tax = live as f64 / taxable as f64;
        tax *= self.surcharge;

        self.restart_with(non_taxable, tax);

        tracing::info!(
            "Pacer for Mark. Expected Live: {}, Free: {}, Non-Taxable: {}, Alloc Tax Rate: {:.1}x",
            formatted_size(live),
            formatted_size(free),
            formatted_size(non_taxable),
            tax
        );
    }

    pub fn setup_for_evac(&self, cset_used: usize, free: usize) {
        let (non_taxable, taxable) = self.split_free(free);

        // Update refs follow, claim half of the remaining free space.
        let mut tax = cset_used as f64 / taxable as f64 * 2.0;
        tax = tax.max(1.0);
        tax *= self.surcharge;

        self.restart_with(non_taxable, tax);

        tracing::info!(
            "Pacer for Evacuation. Used CSet: {}, Free: {}, Non-Taxable: {}, Alloc Tax Rate: {:.1}x",
            formatted_size(cset_used),
            formatted_size(free),
            formatted_size(non_taxable),
            tax
        );
    }

    pub fn setup_for_updaterefs(&self, used: usize, free: usize) {
        let (non_taxable, taxable) = self.split_free(free);

        let mut tax = used as f64 / taxable as f64;
        tax = tax.max(1.0);
        tax *= self.surcharge;

        self.restart_with(non_taxable, tax);

        tracing::info!(
            "Pacer for Update Refs. Used: {}, Free: {}, Non-Taxable: {}, Alloc Tax Rate: {:.1}x",
            formatted_size(used),
            formatted_size(free),
            formatted_size(non_taxable),
            tax
        );
    }

    /// Between cycles only a small slack is available without pacing. The control thread
    /// replenishes it with the allocations it observes.
    pub fn setup_for_idle(&self) {
        let initial = self.max_capacity / 100 * self.idle_slack;
        let tax = 1.0;

        self.restart_with(initial, tax);

        tracing::info!(
            "Pacer for Idle. Initial: {}, Alloc Tax Rate: {:.1}x",
            formatted_size(initial),
            tax
        );
    }

    fn restart_with(&self, non_taxable_bytes: usize, tax_rate: f64) {
        let initial = ((non_taxable_bytes as f64 * tax_rate) as usize) >> LOG_HEAP_WORD_SIZE;
        self.budget.store(initial as isize, Ordering::Release);
        self.tax_rate.store(tax_rate, Ordering::Release);
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.need_notify_waiters.try_set();
    }

    pub fn epoch(&self) -> usize {
        self.epoch.load(Ordering::Acquire)
    }

    pub fn budget(&self) -> isize {
        self.budget.load(Ordering::Acquire)
    }

    pub fn tax_rate(&self) -> f64 {
        self.tax_rate.load(Ordering::Acquire)
    }

    fn tax_for(&self, words: usize) -> isize {
        ((words as f64 * self.tax_rate()) as isize).max(1)
    }

    /// Takes the tax for `words` out of the budget. Without `force` the claim fails when the
    /// budget cannot cover it.
    pub fn claim_for_alloc(&self, words: usize, force: bool) -> bool {
        let tax = self.tax_for(words);
        let mut cur = self.budget.load(Ordering::Acquire);
        loop {
            if cur < tax && !force {
                return false;
            }
            match self.budget.compare_exchange_weak(
                cur,
                cur - tax,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Returns the tax for words that were claimed but not allocated. Claims from an earlier
    /// epoch are ignored, the budget has been reset since.
    pub fn unpace_for_alloc(&self, epoch: usize, words: usize) {
        if self.epoch() != epoch {
            return;
        }
        let tax = self.tax_for(words);
        self.add_budget(tax);
    }

    /// Milliseconds to wait next, given `total_ms` already waited. Never above the maximum
    /// delay.
    pub fn next_wait_ms(&self, total_ms: u64) -> u64 {
        if self.max_delay_ms > total_ms {
            self.max_delay_ms - total_ms
        } else {
            1u64.min(self.max_delay_ms)
        }
    }

    /// Paces an allocation of `words`. Returns the time spent waiting, which never exceeds
    /// the maximum delay by more than one wakeup.
    pub fn pace_for_alloc(&self, words: usize) -> Duration {
        if self.claim_for_alloc(words, false) {
            return Duration::from_millis(0);
        }

        // Claim anyway, the budget goes negative until the collector replenishes it.
        self.claim_for_alloc(words, true);

        let start = Instant::now();
        let max_ms = self.max_delay_ms;
        let mut total_ms = 0;
        loop {
            let cur_ms = self.next_wait_ms(total_ms);
            if cur_ms == 0 {
                break;
            }
            self.wait(cur_ms);
            total_ms = start.elapsed().as_millis() as u64;
            if total_ms >= max_ms || self.budget() >= 0 {
                break;
            }
        }
        start.elapsed()
    }

    fn wait(&self, ms: u64) {
        let mut guard = self.wait_lock.lock();
        self.wait_cv
            .wait_for(&mut guard, Duration::from_millis(ms));
    }

    pub fn notify_waiters(&self) {
        if self.need_notify_waiters.try_unset() {
            let _guard = self.wait_lock.lock();
            self.wait_cv.notify_all();
        }
    }

    fn add_budget(&self, words: isize) {
        let new_budget = self.budget.fetch_add(words, Ordering::AcqRel) + words;
        // Crossed zero: every outstanding claim is satisfied.
        if new_budget >= 0 && new_budget - words < 0 {
            self.need_notify_waiters.try_set();
        }
    }

    pub fn report_mark(&self, words: usize) {
        self.add_budget(words as isize);
        self.progress.fetch_add(words as isize, Ordering::AcqRel);
    }

    pub fn report_evac(&self, words: usize) {
        self.add_budget(words as isize);
    }

    pub fn report_updaterefs(&self, words: usize) {
        self.add_budget(words as isize);
    }

    pub fn report_alloc(&self, words: usize) {
        self.add_budget(words as isize);
    }

    pub fn report_full(&self, words: usize) {
        self.add_budget(words as isize);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pacer(max_delay_ms: u64) -> ShenandoahPacer {
        let config = Config {
            pacing_max_delay: Duration::from_millis(max_delay_ms),
            ..Default::default()
        };
        ShenandoahPacer::new(&config, 64 * 1024 * 1024)
    }

    #[test]
    fn test_claims_within_budget_do_not_wait() {
        let pacer = pacer(10);
        pacer.setup_for_idle();
        let budget = pacer.budget();
        assert!(budget > 0);
        assert_eq!(pacer.pace_for_alloc(16), Duration::from_millis(0));
        assert_eq!(pacer.budget(), budget - 16);
    }

    #[test]
    fn test_next_wait_is_bounded_by_max_delay() {
        let pacer = pacer(10);
        for total in 0..30 {
            let wait = pacer.next_wait_ms(total);
            assert!(wait <= 10);
            assert!(wait >= 1);
        }
    }

    #[test]
    fn test_depleted_budget_waits_at_most_max_delay() {
        let pacer = pacer(20);
        pacer.setup_for_mark(1024 * 1024);
        // Far over budget: nothing replenishes, the wait is cut by the time budget.
        let over = (pacer.budget().max(0) as usize) * 4 + 1024 * 1024;
        let waited = pacer.pace_for_alloc(over);
        assert!(pacer.budget() < 0);
        assert!(waited >= Duration::from_millis(20));
        assert!(waited < Duration::from_millis(20 + 200));
    }

    #[test]
    fn test_unpace_ignores_stale_epoch() {
        let pacer = pacer(10);
        pacer.setup_for_idle();
        let epoch = pacer.epoch();
        assert!(pacer.claim_for_alloc(100, false));
        let after_claim = pacer.budget();
        pacer.unpace_for_alloc(epoch, 100);
        assert_eq!(pacer.budget(), after_claim + 100);

        pacer.setup_for_idle();
        let reset = pacer.budget();
        pacer.unpace_for_alloc(epoch, 100);
        assert_eq!(pacer.budget(), reset);
    }

    #[test]
    fn test_progress_feeds_next_mark() {
        let pacer = pacer(10);
        pacer.setup_for_mark(32 * 1024 * 1024);
        pacer.report_mark(1024);
        assert_eq!(pacer.update_and_get_progress_history(), 1024 * 8);
    }
}
