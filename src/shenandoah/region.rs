use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use atomic::Atomic;

use crate::{
    error::ConfigError,
    mmap::Mmap,
    utils::{align_down, align_up, align_usize, formatted_size, os_elapsed_time},
    Config,
};

use super::{
    alloc_request::AllocKind,
    marking_context::ShenandoahMarkingContexts,
    oop::{HEAP_WORD_SIZE, LOG_HEAP_WORD_SIZE, OBJECT_ALIGNMENT_WORDS},
};

/// Region lifecycle. All transitions happen under the heap lock or at a safepoint.
///
/// Empty regions become active on first allocation, either regular or humongous. Collection set
/// regions and dead regular or humongous regions are trashed; recycling takes trash back to
/// empty-committed, and uncommitting takes idle empty regions back to empty-uncommitted. Pinned
/// regions never join the collection set and are never trashed; humongous regions never move
/// and never serve regular allocations.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
#[repr(u8)]
pub enum RegionState {
    EmptyUncommitted,
    EmptyCommitted,
    Regular,
    HumongousStart,
    HumongousCont,
    PinnedHumongousStart,
    CSet,
    Pinned,
    Trash,
}

impl RegionState {
    pub fn name(self) -> &'static str {
        match self {
            Self::EmptyUncommitted => "Empty Uncommitted",
            Self::EmptyCommitted => "Empty Committed",
            Self::Regular => "Regular",
            Self::HumongousStart => "Humongous Start",
            Self::HumongousCont => "Humongous Continuation",
            Self::PinnedHumongousStart => "Humongous Start, Pinned",
            Self::CSet => "Collection Set",
            Self::Pinned => "Pinned",
            Self::Trash => "Trash",
        }
    }

    fn short_name(self) -> &'static str {
        match self {
            Self::EmptyUncommitted => "EU",
            Self::EmptyCommitted => "EC",
            Self::Regular => "R",
            Self::HumongousStart => "H",
            Self::HumongousCont => "HC",
            Self::PinnedHumongousStart => "HP",
            Self::CSet => "CS",
            Self::Pinned => "P",
            Self::Trash => "T",
        }
    }
}

pub struct ShenandoahHeapRegion {
    index: usize,
    bottom: usize,
    end: usize,

    state: Atomic<RegionState>,
    top: AtomicUsize,
    /// Compaction target computed by full GC.
    new_top: AtomicUsize,
    empty_time: Atomic<f64>,

    tlab_allocs: AtomicUsize,
    gclab_allocs: AtomicUsize,
    shared_allocs: AtomicUsize,

    live_data: AtomicUsize,
    critical_pins: AtomicUsize,
    update_watermark: AtomicUsize,
}

#[derive(Default, Clone, Copy)]
pub struct ShenandoahOptions {
    pub region_size_bytes: usize,
    pub region_size_words: usize,
    pub region_size_bytes_shift: usize,
    pub region_size_words_shift: usize,
    pub region_size_bytes_mask: usize,
    pub region_size_words_mask: usize,
    pub region_count: usize,
    pub humongous_threshold_words: usize,
    pub humongous_threshold_bytes: usize,
    pub max_tlab_size_words: usize,
    pub max_tlab_size_bytes: usize,
    pub max_heap_size: usize,
}

impl ShenandoahOptions {
    /// Number of regions needed to hold `bytes`.
    pub fn required_regions(&self, bytes: usize) -> usize {
        align_up(bytes, self.region_size_bytes) >> self.region_size_bytes_shift
    }
}

impl fmt::Debug for ShenandoahOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "ShenandoahOptions:")?;
        writeln!(
            f,
            "\tregion_size_bytes: {}",
            formatted_size(self.region_size_bytes)
        )?;
        writeln!(f, "\tregion_size_words: {}", self.region_size_words)?;
        writeln!(
            f,
            "\tregion_size_bytes_shift: {}",
            self.region_size_bytes_shift
        )?;
        writeln!(f, "\tregion_count: {}", self.region_count)?;
        writeln!(
            f,
            "\thumongous_threshold_bytes: {}",
            formatted_size(self.humongous_threshold_bytes)
        )?;
        writeln!(
            f,
            "\tmax_tlab_size_bytes: {}",
            formatted_size(self.max_tlab_size_bytes)
        )?;
        writeln!(f, "\tmax_heap_size: {}", formatted_size(self.max_heap_size))
    }
}

impl ShenandoahHeapRegion {
    pub const MIN_REGION_SIZE: usize = 256 * 1024;
    pub const MIN_NUM_REGIONS: usize = 8;
    pub const MAX_REGION_SIZE: usize = 32 * 1024 * 1024;

    pub fn setup_sizes(config: &Config) -> Result<ShenandoahOptions, ConfigError> {
        let mut opts = ShenandoahOptions::default();
        let mut max_heap_size = config.max_heap_size;
        let min_region_size = config.min_region_size.max(Self::MIN_REGION_SIZE);
        let max_region_size = config.max_region_size;
        if config.humongous_threshold == 0 || config.humongous_threshold > 100 {
            return Err(ConfigError::BadPercentage {
                name: "humongous_threshold",
                value: config.humongous_threshold,
            });
        }

        let mut region_size = match config.region_size {
            Some(size) => {
                if size < Self::MIN_REGION_SIZE {
                    return Err(ConfigError::RegionTooSmall {
                        size,
                        min: Self::MIN_REGION_SIZE,
                    });
                }
                if size > Self::MAX_REGION_SIZE {
                    return Err(ConfigError::RegionTooLarge {
                        size,
                        max: Self::MAX_REGION_SIZE,
                    });
                }
                if size > max_heap_size / Self::MIN_NUM_REGIONS {
                    return Err(ConfigError::HeapTooSmall {
                        max_heap_size,
                        min_regions: Self::MIN_NUM_REGIONS,
                        region_size: size,
                    });
                }
                size
            }
            None => {
                if min_region_size > max_heap_size / Self::MIN_NUM_REGIONS {
                    return Err(ConfigError::HeapTooSmall {
                        max_heap_size,
                        min_regions: Self::MIN_NUM_REGIONS,
                        region_size: min_region_size,
                    });
                }
                if max_region_size < min_region_size {
                    return Err(ConfigError::RegionTooLarge {
                        size: min_region_size,
                        max: max_region_size,
                    });
                }
                let mut size = max_heap_size / config.target_num_regions.max(1);
                size = size.max(min_region_size);
                max_region_size.min(size)
            }
        };

        let page_size = 4096;

        region_size = align_usize(region_size, page_size);

        max_heap_size = align_up(max_heap_size, page_size);

        let region_size_log = (region_size as f64).log2() as usize;
        region_size = 1 << region_size_log;
        opts.region_size_bytes_shift = region_size_log;
        opts.region_size_bytes = region_size;
        opts.region_size_words = region_size >> LOG_HEAP_WORD_SIZE;
        opts.region_size_words_mask = opts.region_size_words - 1;
        opts.region_size_bytes_mask = opts.region_size_bytes - 1;
        opts.region_size_words_shift = opts.region_size_bytes_shift - LOG_HEAP_WORD_SIZE;
        opts.region_count =
            align_up(max_heap_size, opts.region_size_bytes) / opts.region_size_bytes;
        opts.humongous_threshold_words =
            opts.region_size_words * config.humongous_threshold / 100;
        opts.humongous_threshold_words =
            align_down(opts.humongous_threshold_words, OBJECT_ALIGNMENT_WORDS);
        opts.humongous_threshold_bytes = opts.humongous_threshold_words * HEAP_WORD_SIZE;
        let max_tlab = config
            .tlab_size_words
            .unwrap_or(opts.region_size_words / 8)
            .min(opts.humongous_threshold_words);
        opts.max_tlab_size_words = align_down(max_tlab, OBJECT_ALIGNMENT_WORDS);
        opts.max_tlab_size_bytes = opts.max_tlab_size_words * HEAP_WORD_SIZE;
        opts.max_heap_size = opts.region_count * opts.region_size_bytes;
        Ok(opts)
    }

    pub fn new(index: usize, bottom: usize, size_bytes: usize, committed: bool) -> Self {
        Self {
            index,
            bottom,
            end: bottom + size_bytes,
            state: Atomic::new(if committed {
                RegionState::EmptyCommitted
            } else {
                RegionState::EmptyUncommitted
            }),
            top: AtomicUsize::new(bottom),
            new_top: AtomicUsize::new(bottom),
            empty_time: Atomic::new(os_elapsed_time()),
            tlab_allocs: AtomicUsize::new(0),
            gclab_allocs: AtomicUsize::new(0),
            shared_allocs: AtomicUsize::new(0),
            live_data: AtomicUsize::new(0),
            critical_pins: AtomicUsize::new(0),
            update_watermark: AtomicUsize::new(bottom),
        }
    }

    #[inline]
    pub fn index(&self) -> usize {
        self.index
    }

    #[inline]
    pub fn bottom(&self) -> usize {
        self.bottom
    }

    #[inline]
    pub fn end(&self) -> usize {
        self.end
    }

    #[inline]
    pub fn top(&self) -> usize {
        self.top.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_top(&self, top: usize) {
        debug_assert!(top >= self.bottom && top <= self.end);
        self.top.store(top, Ordering::Release);
    }

    #[inline]
    pub fn new_top(&self) -> usize {
        self.new_top.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_new_top(&self, new_top: usize) {
        debug_assert!(new_top >= self.bottom && new_top <= self.end);
        self.new_top.store(new_top, Ordering::Relaxed);
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.end - self.bottom
    }

    #[inline]
    pub fn used(&self) -> usize {
        self.top() - self.bottom
    }

    #[inline]
    pub fn free(&self) -> usize {
        self.end - self.top()
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.bottom && addr < self.end
    }

    #[inline]
    pub fn state(&self) -> RegionState {
        self.state.load(Ordering::Acquire)
    }

    #[inline]
    fn set_state(&self, state: RegionState) {
        self.state.store(state, Ordering::Release);
    }

    pub fn is_empty_uncommitted(&self) -> bool {
        self.state() == RegionState::EmptyUncommitted
    }

    pub fn is_empty_committed(&self) -> bool {
        self.state() == RegionState::EmptyCommitted
    }

    pub fn is_empty(&self) -> bool {
        matches!(
            self.state(),
            RegionState::EmptyCommitted | RegionState::EmptyUncommitted
        )
    }

    pub fn is_active(&self) -> bool {
        !self.is_empty() && !self.is_trash()
    }

    pub fn is_trash(&self) -> bool {
        self.state() == RegionState::Trash
    }

    pub fn is_regular(&self) -> bool {
        self.state() == RegionState::Regular
    }

    pub fn is_humongous_start(&self) -> bool {
        matches!(
            self.state(),
            RegionState::HumongousStart | RegionState::PinnedHumongousStart
        )
    }

    pub fn is_humongous_continuation(&self) -> bool {
        self.state() == RegionState::HumongousCont
    }

    pub fn is_humongous(&self) -> bool {
        self.is_humongous_start() || self.is_humongous_continuation()
    }

    pub fn is_committed(&self) -> bool {
        !self.is_empty_uncommitted()
    }

    pub fn is_cset(&self) -> bool {
        self.state() == RegionState::CSet
    }

    pub fn is_pinned(&self) -> bool {
        matches!(
            self.state(),
            RegionState::Pinned | RegionState::PinnedHumongousStart
        )
    }

    pub fn is_alloc_allowed(&self) -> bool {
        matches!(
            self.state(),
            RegionState::EmptyUncommitted
                | RegionState::EmptyCommitted
                | RegionState::Regular
                | RegionState::Pinned
        )
    }

    /// Regions full GC may slide objects out of and into.
    pub fn is_move_allowed(&self) -> bool {
        matches!(self.state(), RegionState::Regular | RegionState::CSet)
    }

    #[cold]
    fn report_illegal_transition(&self, to: &str) -> ! {
        panic!(
            "Illegal region state transition from \"{}\" to \"{}\"\n{}",
            self.state().name(),
            to,
            self
        );
    }

    fn do_commit(&self) {
        Mmap::commit(self.bottom, self.capacity());
    }

    fn do_uncommit(&self) {
        Mmap::dontneed(self.bottom, self.capacity());
    }

    pub fn make_regular_allocation(&self) {
        match self.state() {
            RegionState::EmptyUncommitted => {
                self.do_commit();
                self.set_state(RegionState::Regular);
            }
            RegionState::EmptyCommitted => self.set_state(RegionState::Regular),
            RegionState::Regular | RegionState::Pinned => {}
            _ => self.report_illegal_transition("regular allocation"),
        }
    }

    /// Forces the region into the regular state. Only full and degenerated GC do this, at a
    /// safepoint.
    pub fn make_regular_bypass(&self) {
        match self.state() {
            RegionState::EmptyUncommitted => {
                self.do_commit();
                self.set_state(RegionState::Regular);
            }
            RegionState::EmptyCommitted
            | RegionState::CSet
            | RegionState::HumongousStart
            | RegionState::HumongousCont => self.set_state(RegionState::Regular),
            RegionState::PinnedHumongousStart => self.set_state(RegionState::Pinned),
            RegionState::Regular | RegionState::Pinned => {}
            _ => self.report_illegal_transition("regular bypass"),
        }
    }

    pub fn make_humongous_start(&self) {
        match self.state() {
            RegionState::EmptyUncommitted => {
                self.do_commit();
                self.set_state(RegionState::HumongousStart);
            }
            RegionState::EmptyCommitted => self.set_state(RegionState::HumongousStart),
            _ => self.report_illegal_transition("humongous start allocation"),
        }
    }

    pub fn make_humongous_cont(&self) {
        match self.state() {
            RegionState::EmptyUncommitted => {
                self.do_commit();
                self.set_state(RegionState::HumongousCont);
            }
            RegionState::EmptyCommitted => self.set_state(RegionState::HumongousCont),
            _ => self.report_illegal_transition("humongous continuation allocation"),
        }
    }

    pub fn make_pinned(&self) {
        match self.state() {
            RegionState::Regular => {
                debug_assert!(self.pin_count() > 0, "Should have pins: {}", self.pin_count());
                self.set_state(RegionState::Pinned);
            }
            RegionState::HumongousStart => {
                debug_assert!(self.pin_count() > 0, "Should have pins: {}", self.pin_count());
                self.set_state(RegionState::PinnedHumongousStart);
            }
            RegionState::Pinned | RegionState::PinnedHumongousStart => {}
            _ => self.report_illegal_transition("pinning"),
        }
    }

    pub fn make_unpinned(&self) {
        match self.state() {
            RegionState::Pinned => {
                debug_assert_eq!(self.pin_count(), 0);
                self.set_state(RegionState::Regular);
            }
            RegionState::PinnedHumongousStart => {
                debug_assert_eq!(self.pin_count(), 0);
                self.set_state(RegionState::HumongousStart);
            }
            RegionState::Regular | RegionState::HumongousStart => {}
            _ => self.report_illegal_transition("unpinning"),
        }
    }

    pub fn make_cset(&self) {
        match self.state() {
            RegionState::Regular => self.set_state(RegionState::CSet),
            _ => self.report_illegal_transition("cset"),
        }
    }

    pub fn make_trash(&self) {
        match self.state() {
            RegionState::CSet
            | RegionState::Regular
            | RegionState::HumongousStart
            | RegionState::HumongousCont => {
                // Reclaiming humongous regions and immediate garbage.
                self.reset_alloc_metadata();
                self.set_state(RegionState::Trash);
            }
            _ => self.report_illegal_transition("trashing"),
        }
    }

    pub fn make_empty(&self) {
        match self.state() {
            RegionState::Trash => {
                self.set_state(RegionState::EmptyCommitted);
                self.empty_time.store(os_elapsed_time(), Ordering::Relaxed);
            }
            _ => self.report_illegal_transition("emptying"),
        }
    }

    pub fn make_uncommitted(&self) {
        match self.state() {
            RegionState::EmptyCommitted => {
                self.do_uncommit();
                self.set_state(RegionState::EmptyUncommitted);
            }
            _ => self.report_illegal_transition("uncommiting"),
        }
    }

    /// Commits an empty region without allocating in it. Full GC does this at a safepoint so
    /// that every region has a usable bitmap.
    pub fn make_committed_bypass(&self) {
        match self.state() {
            RegionState::EmptyUncommitted => {
                self.do_commit();
                self.set_state(RegionState::EmptyCommitted);
            }
            _ => self.report_illegal_transition("commit bypass"),
        }
    }

    /// Returns a trash region to the empty state, clearing its metadata and both marking
    /// contexts over its range.
    pub fn recycle(&self, marking: &ShenandoahMarkingContexts) {
        self.set_top(self.bottom);
        self.clear_live_data();
        self.reset_alloc_metadata();
        self.critical_pins.store(0, Ordering::Relaxed);
        self.set_update_watermark(self.bottom);
        marking.reset_region(self);
        self.make_empty();
    }

    /// Bump allocation. Must be called under the heap lock.
    pub fn allocate(&self, size_words: usize, kind: AllocKind) -> Option<usize> {
        debug_assert!(self.is_alloc_allowed(), "Is alloc allowed: {}", self);
        let size = size_words * HEAP_WORD_SIZE;
        let obj = self.top();
        if self.end - obj >= size {
            self.set_top(obj + size);
            self.adjust_alloc_metadata(kind, size);
            debug_assert!(obj % (OBJECT_ALIGNMENT_WORDS * HEAP_WORD_SIZE) == 0);
            Some(obj)
        } else {
            None
        }
    }

    fn adjust_alloc_metadata(&self, kind: AllocKind, size: usize) {
        let counter = match kind {
            AllocKind::Shared | AllocKind::SharedGc => &self.shared_allocs,
            AllocKind::Tlab => &self.tlab_allocs,
            AllocKind::Gclab => &self.gclab_allocs,
        };
        counter.fetch_add(size, Ordering::Relaxed);
    }

    pub fn reset_alloc_metadata(&self) {
        self.tlab_allocs.store(0, Ordering::Relaxed);
        self.gclab_allocs.store(0, Ordering::Relaxed);
        self.shared_allocs.store(0, Ordering::Relaxed);
    }

    /// Humongous regions account everything as shared allocations.
    pub fn reset_alloc_metadata_to_shared(&self) {
        self.tlab_allocs.store(0, Ordering::Relaxed);
        self.gclab_allocs.store(0, Ordering::Relaxed);
        self.shared_allocs.store(self.used(), Ordering::Relaxed);
    }

    pub fn tlab_allocs(&self) -> usize {
        self.tlab_allocs.load(Ordering::Relaxed)
    }

    pub fn gclab_allocs(&self) -> usize {
        self.gclab_allocs.load(Ordering::Relaxed)
    }

    pub fn shared_allocs(&self) -> usize {
        self.shared_allocs.load(Ordering::Relaxed)
    }

    pub fn clear_live_data(&self) {
        self.live_data.store(0, Ordering::Release);
    }

    pub fn set_live_data(&self, bytes: usize) {
        self.live_data
            .store(bytes >> LOG_HEAP_WORD_SIZE, Ordering::Release);
    }

    #[inline]
    pub fn increase_live_data_words(&self, words: usize) {
        self.live_data.fetch_add(words, Ordering::Relaxed);
    }

    pub fn live_data_words(&self) -> usize {
        self.live_data.load(Ordering::Acquire)
    }

    pub fn live_data_bytes(&self) -> usize {
        self.live_data_words() * HEAP_WORD_SIZE
    }

    pub fn has_live(&self) -> bool {
        self.live_data_words() != 0
    }

    pub fn garbage(&self) -> usize {
        let used = self.used();
        let live = self.live_data_bytes();
        debug_assert!(
            live <= used,
            "Live data must be within used: live {}, used {}, region {}",
            live,
            used,
            self.index
        );
        used.saturating_sub(live)
    }

    pub fn record_pin(&self) {
        self.critical_pins.fetch_add(1, Ordering::AcqRel);
    }

    pub fn record_unpin(&self) {
        let previous = self.critical_pins.fetch_sub(1, Ordering::AcqRel);
        assert!(previous > 0, "Region {} should have non-zero pins", self.index);
    }

    pub fn pin_count(&self) -> usize {
        self.critical_pins.load(Ordering::Acquire)
    }

    pub fn empty_time(&self) -> f64 {
        self.empty_time.load(Ordering::Relaxed)
    }

    pub fn update_watermark(&self) -> usize {
        self.update_watermark.load(Ordering::Acquire)
    }

    pub fn set_update_watermark(&self, watermark: usize) {
        debug_assert!(watermark >= self.bottom && watermark <= self.end);
        self.update_watermark.store(watermark, Ordering::Release);
    }
}

impl fmt::Display for ShenandoahHeapRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "|{:5}|{:<2}|BTE {:#x}, {:#x}, {:#x}|UWM {:#x}|U {:>6}|T {:>6}|G {:>6}|S {:>6}|L {:>6}|CP {:3}",
            self.index,
            self.state().short_name(),
            self.bottom,
            self.top(),
            self.end,
            self.update_watermark(),
            formatted_size(self.used()),
            formatted_size(self.tlab_allocs()),
            formatted_size(self.gclab_allocs()),
            formatted_size(self.shared_allocs()),
            formatted_size(self.live_data_bytes()),
            self.pin_count()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_heap_size: usize, region_size: Option<usize>) -> Config {
        Config {
            max_heap_size,
            region_size,
            ..Default::default()
        }
    }

    #[test]
    fn test_setup_sizes_explicit_region() {
        let opts =
            ShenandoahHeapRegion::setup_sizes(&config(8 * 1024 * 1024, Some(1024 * 1024))).unwrap();
        assert_eq!(opts.region_count, 8);
        assert_eq!(opts.region_size_bytes, 1024 * 1024);
        assert_eq!(opts.region_size_words, 128 * 1024);
        assert_eq!(opts.region_size_bytes_shift, 20);
        assert_eq!(opts.humongous_threshold_words, opts.region_size_words);
        assert_eq!(opts.max_tlab_size_words, opts.region_size_words / 8);
        assert_eq!(opts.required_regions(1024 * 1024 + 1), 2);
    }

    #[test]
    fn test_setup_sizes_errors() {
        assert!(matches!(
            ShenandoahHeapRegion::setup_sizes(&config(1024 * 1024, None)),
            Err(ConfigError::HeapTooSmall { .. })
        ));
        assert!(matches!(
            ShenandoahHeapRegion::setup_sizes(&config(64 * 1024 * 1024, Some(4096))),
            Err(ConfigError::RegionTooSmall { .. })
        ));
    }

    #[test]
    fn test_setup_sizes_targets_region_count() {
        let opts = ShenandoahHeapRegion::setup_sizes(&config(1024 * 1024 * 1024, None)).unwrap();
        assert_eq!(opts.region_size_bytes, 512 * 1024);
        assert_eq!(opts.region_count, 2048);
    }

    fn region(mem: &Mmap) -> ShenandoahHeapRegion {
        ShenandoahHeapRegion::new(0, mem.aligned(4096), 256 * 1024, true)
    }

    #[test]
    fn test_allocate_is_monotonic() {
        let mem = Mmap::new(512 * 1024).unwrap();
        let r = region(&mem);
        r.make_regular_allocation();
        let mut last = r.top();
        while let Some(addr) = r.allocate(34, AllocKind::Shared) {
            assert_eq!(addr, last);
            assert_eq!(r.top(), last + 34 * HEAP_WORD_SIZE);
            assert!(r.top() <= r.end());
            last = r.top();
        }
        assert!(r.free() < 34 * HEAP_WORD_SIZE);
        assert_eq!(r.shared_allocs(), r.used());
    }

    #[test]
    fn test_pinned_transitions() {
        let mem = Mmap::new(512 * 1024).unwrap();
        let r = region(&mem);
        r.make_regular_allocation();
        r.record_pin();
        r.make_pinned();
        assert!(r.is_pinned());
        assert!(!r.is_cset());
        r.record_unpin();
        r.make_unpinned();
        assert!(r.is_regular());
        r.make_cset();
        assert!(r.is_cset() && !r.is_pinned());
        r.make_trash();
        assert!(r.is_trash());
    }

    #[test]
    #[should_panic(expected = "Illegal region state transition")]
    fn test_pinned_cannot_go_cset() {
        let mem = Mmap::new(512 * 1024).unwrap();
        let r = region(&mem);
        r.make_regular_allocation();
        r.record_pin();
        r.make_pinned();
        r.make_cset();
    }

    #[test]
    #[should_panic(expected = "Illegal region state transition")]
    fn test_empty_cannot_go_trash() {
        let mem = Mmap::new(512 * 1024).unwrap();
        region(&mem).make_trash();
    }
}
