use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use super::region::ShenandoahHeapRegion;

/// Regions selected for evacuation in the current cycle.
///
/// Membership is kept in a byte-per-region map. Generated code tests an address with
/// `*(biased_map_address() + (addr >> region_size_bytes_shift)) != 0`.
pub struct ShenandoahCollectionSet {
    cset_map: Box<[AtomicU8]>,
    heap_base: usize,
    region_size_bytes_shift: usize,

    garbage: AtomicUsize,
    live_data: AtomicUsize,
    used: AtomicUsize,
    region_count: AtomicUsize,

    current_index: CachePadded<AtomicUsize>,
}

impl ShenandoahCollectionSet {
    pub fn new(num_regions: usize, heap_base: usize, region_size_bytes_shift: usize) -> Self {
        Self {
            cset_map: (0..num_regions).map(|_| AtomicU8::new(0)).collect(),
            heap_base,
            region_size_bytes_shift,
            garbage: AtomicUsize::new(0),
            live_data: AtomicUsize::new(0),
            used: AtomicUsize::new(0),
            region_count: AtomicUsize::new(0),
            current_index: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Adds a regular region. Must be called at a safepoint, under the heap lock.
    pub fn add_region(&self, r: &ShenandoahHeapRegion) {
        assert!(!self.is_in(r.index()), "Already in collection set");
        assert!(
            r.is_regular(),
            "Only regular regions can be in the collection set: {}",
            r
        );
        self.cset_map[r.index()].store(1, Ordering::Release);
        self.region_count.fetch_add(1, Ordering::Relaxed);
        self.garbage.fetch_add(r.garbage(), Ordering::Relaxed);
        self.live_data.fetch_add(r.live_data_bytes(), Ordering::Relaxed);
        self.used.fetch_add(r.used(), Ordering::Relaxed);
        r.make_cset();
    }

    /// Takes a region back out and returns it to the regular state. Same locking as
    /// [ShenandoahCollectionSet::add_region].
    pub fn remove_region(&self, r: &ShenandoahHeapRegion) {
        assert!(self.is_in(r.index()), "Not in collection set");
        self.cset_map[r.index()].store(0, Ordering::Release);
        self.region_count.fetch_sub(1, Ordering::Relaxed);
        self.garbage.fetch_sub(r.garbage(), Ordering::Relaxed);
        self.live_data.fetch_sub(r.live_data_bytes(), Ordering::Relaxed);
        self.used.fetch_sub(r.used(), Ordering::Relaxed);
        r.make_regular_bypass();
    }

    /// Empties the set. Must be called at a safepoint.
    pub fn clear(&self) {
        for entry in self.cset_map.iter() {
            entry.store(0, Ordering::Relaxed);
        }
        self.garbage.store(0, Ordering::Relaxed);
        self.live_data.store(0, Ordering::Relaxed);
        self.used.store(0, Ordering::Relaxed);
        self.region_count.store(0, Ordering::Release);
        self.current_index.store(0, Ordering::Release);
    }

    /// Returns the next region to evacuate. Lock-free and safe to call from many workers:
    /// every region is handed out once.
    pub fn claim_next(&self) -> Option<usize> {
        let num_regions = self.cset_map.len();
        let mut saved_current = self.current_index.load(Ordering::Acquire);
        let mut index = saved_current;
        while index < num_regions {
            if self.is_in(index) {
                match self.current_index.compare_exchange(
                    saved_current,
                    index + 1,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return Some(index),
                    Err(current) => {
                        debug_assert!(current >= saved_current, "Must move forward");
                        index = current;
                        saved_current = current;
                    }
                }
            } else {
                index += 1;
            }
        }
        None
    }

    /// Single threaded variant of [ShenandoahCollectionSet::claim_next], for safepoints.
    pub fn next(&self) -> Option<usize> {
        let num_regions = self.cset_map.len();
        let mut index = self.current_index.load(Ordering::Relaxed);
        while index < num_regions {
            if self.is_in(index) {
                self.current_index.store(index + 1, Ordering::Relaxed);
                return Some(index);
            }
            index += 1;
        }
        None
    }

    pub fn clear_current_index(&self) {
        self.current_index.store(0, Ordering::Release);
    }

    #[inline]
    pub fn is_in(&self, region_index: usize) -> bool {
        self.cset_map[region_index].load(Ordering::Acquire) == 1
    }

    #[inline]
    pub fn is_in_addr(&self, addr: usize) -> bool {
        let index = addr.wrapping_sub(self.heap_base) >> self.region_size_bytes_shift;
        index < self.cset_map.len() && self.is_in(index)
    }

    /// Indices of the regions in the set, in address order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.cset_map.len()).filter(move |i| self.is_in(*i))
    }

    pub fn biased_map_address(&self) -> usize {
        (self.cset_map.as_ptr() as usize)
            .wrapping_sub(self.heap_base >> self.region_size_bytes_shift)
    }

    pub fn count(&self) -> usize {
        self.region_count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn garbage(&self) -> usize {
        self.garbage.load(Ordering::Relaxed)
    }

    pub fn live_data(&self) -> usize {
        self.live_data.load(Ordering::Relaxed)
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmap::Mmap;
    use crate::shenandoah::alloc_request::AllocKind;

    const REGION: usize = 256 * 1024;

    fn setup(n: usize) -> (Mmap, Vec<ShenandoahHeapRegion>, usize) {
        let mem = Mmap::new((n + 1) * REGION).unwrap();
        let base = mem.aligned(REGION);
        let regions = (0..n)
            .map(|i| ShenandoahHeapRegion::new(i, base + i * REGION, REGION, true))
            .collect();
        (mem, regions, base)
    }

    #[test]
    fn test_biased_map_lookup() {
        let (_mem, regions, base) = setup(4);
        let cset = ShenandoahCollectionSet::new(4, base, 18);
        regions[2].make_regular_allocation();
        regions[2].allocate(16, AllocKind::Shared);
        cset.add_region(&regions[2]);
        assert!(regions[2].is_cset());
        assert!(cset.is_in_addr(base + 2 * REGION + 64));
        assert!(!cset.is_in_addr(base + REGION));
        let biased = cset.biased_map_address();
        let probe = (base + 2 * REGION + 8) >> 18;
        let entry = unsafe { *(biased.wrapping_add(probe) as *const u8) };
        assert_eq!(entry, 1);
        assert_eq!(cset.used(), 128);
    }

    #[test]
    fn test_remove_region_restores_totals() {
        let (_mem, regions, base) = setup(4);
        let cset = ShenandoahCollectionSet::new(4, base, 18);
        for r in &regions[1..3] {
            r.make_regular_allocation();
            r.allocate(6, AllocKind::Shared);
        }
        regions[2].increase_live_data_words(2);
        cset.add_region(&regions[1]);
        cset.add_region(&regions[2]);
        assert_eq!(cset.used(), 96);
        assert_eq!(cset.live_data(), 16);

        cset.remove_region(&regions[2]);
        assert!(!cset.is_in(2));
        assert!(regions[2].is_regular());
        assert!(!regions[2].is_cset());
        assert_eq!(cset.count(), 1);
        assert_eq!(cset.used(), 48);
        assert_eq!(cset.garbage(), 48);
        assert_eq!(cset.live_data(), 0);

        cset.remove_region(&regions[1]);
        assert!(cset.is_empty());
        assert_eq!((cset.used(), cset.garbage(), cset.live_data()), (0, 0, 0));
        assert!(!cset.is_in_addr(base + REGION));
    }

    #[test]
    fn test_claim_next_hands_out_each_region_once() {
        let n = 64;
        let (_mem, regions, base) = setup(n);
        let cset = ShenandoahCollectionSet::new(n, base, 18);
        for r in regions.iter().filter(|r| r.index() % 3 != 0) {
            r.make_regular_allocation();
            cset.add_region(r);
        }
        let expected = cset.count();
        let claimed = parking_lot::Mutex::new(Vec::new());
        crossbeam_utils::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|_| {
                    let mut mine = vec![];
                    while let Some(index) = cset.claim_next() {
                        mine.push(index);
                    }
                    claimed.lock().extend(mine);
                });
            }
        })
        .unwrap();
        let mut claimed = claimed.into_inner();
        claimed.sort_unstable();
        let all: Vec<usize> = cset.iter().collect();
        assert_eq!(claimed.len(), expected);
        assert_eq!(claimed, all);

        cset.clear_current_index();
        assert_eq!(cset.next(), Some(1));
    }
}
