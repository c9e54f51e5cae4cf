use std::time::{Duration, Instant};

use crate::{
    shenandoah::{
        collection_set::ShenandoahCollectionSet,
        heuristics::{sort_by_garbage, HeuristicsState, RegionData},
        oop::ShenandoahForwarding,
    },
    utils::{K, M},
    AllocError, Config, ConfigError, GlobalHandle, HeuristicsKind, Mutator, ShenandoahDegenPoint,
    ShenandoahHeap, ShenandoahHeuristics,
};

/// Data words of a list node. With one reference slot the node takes exactly 1K.
const NODE_DATA: usize = 125;
const NODE_BYTES: usize = K;

fn test_config(regions: usize, region_size: usize) -> Config {
    Config {
        max_heap_size: regions * region_size,
        region_size: Some(region_size),
        heuristics: HeuristicsKind::Passive,
        parallel_gc_threads: 2,
        conc_gc_threads: 1,
        uncommit: false,
        pacing: false,
        use_tlab: false,
        verify: true,
        ..Default::default()
    }
}

struct Filled {
    root: GlobalHandle,
    /// Payloads of the surviving nodes in allocation order.
    kept: Vec<usize>,
    kept_per_region: Vec<usize>,
}

/// Fills `regions` regions with 1K nodes. Nodes accepted by `keep(region, i)` are linked into a
/// list rooted at a global handle, everything else is garbage.
fn fill(m: &mut Mutator, regions: usize, keep: impl Fn(usize, usize) -> bool) -> Filled {
    let heap = m.heap().clone();
    let per_region = heap.options().region_size_bytes / NODE_BYTES;
    let root = m.new_global(None);
    let mut filled = Filled {
        root,
        kept: Vec::new(),
        kept_per_region: vec![0; heap.num_regions()],
    };

    let mark = m.handle_mark();
    for i in 0..regions * per_region {
        let node = m.allocate(1, NODE_DATA).unwrap();
        let region = heap.region_index(m.resolve(node).raw());
        if keep(region, i) {
            m.write_data(node, 0, i);
            let head = m.global(root);
            m.store(node, 0, head);
            m.set_global(root, Some(node));
            filled.kept.push(i);
            filled.kept_per_region[region] += 1;
        }
        m.reset_handles(mark);
    }
    filled
}

/// Payload and address of every node reachable from `root`, head first.
fn walk(m: &mut Mutator, root: GlobalHandle) -> Vec<(usize, usize)> {
    let mark = m.handle_mark();
    let mut nodes = Vec::new();
    let mut cursor = m.global(root);
    while let Some(node) = cursor {
        let addr = m.resolve(node).raw();
        nodes.push((m.read_data(node, 0), addr));
        cursor = m.load(node, 0);
    }
    m.reset_handles(mark);
    nodes
}

fn assert_list_intact(m: &mut Mutator, filled: &Filled) {
    let payloads: Vec<usize> = walk(m, filled.root).iter().map(|n| n.0).collect();
    let expected: Vec<usize> = filled.kept.iter().rev().copied().collect();
    assert_eq!(payloads, expected);
}

fn finish_cycle(heap: &ShenandoahHeap) {
    heap.entry_cleanup();
    if heap.is_evacuation_in_progress() {
        heap.entry_evac();
        heap.vmop_entry_init_updaterefs();
        heap.entry_updaterefs();
        heap.vmop_entry_final_updaterefs();
        heap.entry_cleanup();
    }
}

fn run_concurrent_cycle(heap: &ShenandoahHeap) {
    heap.entry_reset();
    heap.vmop_entry_init_mark();
    heap.entry_mark();
    heap.vmop_entry_final_mark();
    finish_cycle(heap);
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        std::thread::sleep(Duration::from_millis(1));
    }
}

/// Evacuates the regions with the most garbage, at most `count` of them.
struct MostGarbageFirst {
    state: HeuristicsState,
    count: usize,
}

impl ShenandoahHeuristics for MostGarbageFirst {
    fn name(&self) -> &'static str {
        "most-garbage-first"
    }

    fn state(&self) -> &HeuristicsState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut HeuristicsState {
        &mut self.state
    }

    fn should_start_gc(&mut self, _heap: &ShenandoahHeap) -> bool {
        false
    }

    fn choose_collection_set_from_regiondata(
        &mut self,
        heap: &ShenandoahHeap,
        cset: &ShenandoahCollectionSet,
        data: &mut [RegionData],
        _actual_free: usize,
    ) {
        sort_by_garbage(data);
        for candidate in data.iter().take(self.count) {
            cset.add_region(heap.get_region(candidate.index));
        }
    }
}

#[test]
fn test_collection_set_regions_are_reclaimed() {
    let heuristics = Box::new(MostGarbageFirst {
        state: HeuristicsState::new(),
        count: 3,
    });
    let heap = ShenandoahHeap::create_with_heuristics(test_config(8, M), heuristics).unwrap();
    let mut m = heap.attach_mutator();

    // Even regions keep a tenth of their nodes, odd regions nine tenths.
    let filled = fill(&mut m, 6, |region, i| {
        if region % 2 == 0 {
            i % 10 == 0
        } else {
            i % 10 != 0
        }
    });
    let before = walk(&mut m, filled.root);
    let used_before = heap.used();
    assert_eq!(used_before, 6 * M);

    heap.entry_reset();
    heap.vmop_entry_init_mark();
    heap.entry_mark();
    heap.vmop_entry_final_mark();

    for index in 0..6 {
        let r = heap.get_region(index);
        assert_eq!(r.live_data_bytes(), filled.kept_per_region[index] * NODE_BYTES);
    }
    let cset: Vec<usize> = heap.collection_set().iter().collect();
    assert_eq!(cset, vec![0, 2, 4]);
    let evacuated: usize = cset.iter().map(|i| filled.kept_per_region[*i]).sum();

    heap.entry_cleanup();
    heap.entry_evac();
    let complete = heap.marking().complete();
    for index in cset.iter() {
        let r = heap.get_region(*index);
        complete.marked_object_iterate(r, r.top(), |obj| {
            assert!(ShenandoahForwarding::is_forwarded(obj));
        });
    }

    heap.vmop_entry_init_updaterefs();
    heap.entry_updaterefs();
    heap.vmop_entry_final_updaterefs();
    heap.entry_cleanup();

    for index in cset.iter() {
        assert!(heap.get_region(*index).is_empty());
    }
    assert!(heap.gc_state().is_stable());
    assert_eq!(heap.used(), used_before - 3 * M + evacuated * NODE_BYTES);

    let after = walk(&mut m, filled.root);
    assert_eq!(before.len(), after.len());
    for ((payload, old), (payload_after, new)) in before.iter().zip(after.iter()) {
        assert_eq!(payload, payload_after);
        if cset.contains(&heap.region_index(*old)) {
            assert_ne!(old, new);
            assert!(!cset.contains(&heap.region_index(*new)));
        } else {
            assert_eq!(old, new);
        }
    }
    heap.verify().unwrap();

    drop(m);
    heap.stop();
}

#[test]
fn test_evacuation_failure_degenerates_at_evac() {
    let config = Config {
        explicit_gc_invokes_concurrent: true,
        parallel_gc_threads: 1,
        ..test_config(8, M)
    };
    let keep = |_region: usize, i: usize| i % 10 == 0;

    // Same heap shape without the failure, as a reference for the used bytes.
    let reference = ShenandoahHeap::create(config.clone()).unwrap();
    let expected_used = {
        let mut m = reference.attach_mutator();
        let filled = fill(&mut m, 4, keep);
        m.collect();
        assert_list_intact(&mut m, &filled);
        reference.used()
    };
    assert_eq!(reference.policy().success_concurrent_gcs(), 1);
    reference.stop();

    let heap = ShenandoahHeap::create(config).unwrap();
    let mut m = heap.attach_mutator();
    let filled = fill(&mut m, 4, keep);
    let used_before = heap.used();

    heap.inject_evacuation_failure(10);
    m.collect();
    wait_until("degenerated cycle", || {
        heap.policy().success_degenerated_gcs() == 1
    });

    let policy = heap.policy();
    assert_eq!(policy.degenerated_at(ShenandoahDegenPoint::Evac), 1);
    assert_eq!(policy.success_concurrent_gcs(), 0);
    assert_eq!(policy.success_full_gcs(), 0);

    assert_list_intact(&mut m, &filled);
    assert!(heap.used() < used_before);
    assert_eq!(heap.used(), expected_used);
    heap.verify().unwrap();

    drop(m);
    heap.stop();
}

#[test]
fn test_degenerated_cycle_from_every_point() {
    for point in ShenandoahDegenPoint::ALL.iter().copied() {
        let heap = ShenandoahHeap::create(test_config(8, M)).unwrap();
        let mut m = heap.attach_mutator();
        let filled = fill(&mut m, 4, |_, i| i % 10 == 0);
        let used_before = heap.used();

        if point != ShenandoahDegenPoint::OutsideCycle {
            heap.entry_reset();
            heap.vmop_entry_init_mark();
        }
        if point == ShenandoahDegenPoint::Evac || point == ShenandoahDegenPoint::UpdateRefs {
            heap.entry_mark();
            heap.vmop_entry_final_mark();
            assert!(!heap.collection_set().is_empty());
        }
        if point == ShenandoahDegenPoint::UpdateRefs {
            heap.entry_evac();
            heap.vmop_entry_init_updaterefs();
        }
        heap.vmop_degenerated(point);

        assert!(heap.gc_state().is_stable(), "{:?}", point);
        assert!(heap.collection_set().is_empty(), "{:?}", point);
        assert!(heap.used() < used_before, "{:?}", point);
        assert_list_intact(&mut m, &filled);
        heap.verify().unwrap();

        drop(m);
        heap.stop();
    }
}

#[test]
fn test_snapshot_keeps_objects_unlinked_during_marking() {
    let heap = ShenandoahHeap::create(test_config(8, M)).unwrap();
    let mut m = heap.attach_mutator();
    let mark = m.handle_mark();

    let a = m.allocate(1, 1).unwrap();
    let b = m.allocate(0, 1).unwrap();
    m.write_data(b, 0, 42);
    m.store(a, 0, Some(b));
    let root = m.new_global(Some(a));
    m.reset_handles(mark);

    heap.entry_reset();
    heap.vmop_entry_init_mark();

    // Unlink b while marking runs, only a local keeps it.
    let a = m.global(root).unwrap();
    let b = m.load(a, 0).unwrap();
    m.store(a, 0, None);
    let c = m.allocate(0, 1).unwrap();

    heap.entry_mark();
    heap.vmop_entry_final_mark();

    let complete = heap.marking().complete();
    assert!(complete.is_marked(m.resolve(b)));
    assert!(complete.is_marked(m.resolve(c)));

    finish_cycle(&heap);
    assert_eq!(m.read_data(b, 0), 42);
    heap.verify().unwrap();

    drop(m);
    heap.stop();
}

#[test]
fn test_write_barrier_evacuates_cset_objects() {
    let heap = ShenandoahHeap::create(test_config(8, M)).unwrap();
    let mut m = heap.attach_mutator();
    let filled = fill(&mut m, 2, |_, i| i % 10 == 0);

    heap.entry_reset();
    heap.vmop_entry_init_mark();
    heap.entry_mark();
    heap.vmop_entry_final_mark();
    assert!(heap.is_evacuation_in_progress());

    // Roots were evacuated at the pause, the rest of the list was not.
    let head = m.global(filled.root).unwrap();
    assert!(!heap.in_collection_set(m.resolve(head)));
    let second = m.load(head, 0).unwrap();
    let from = m.resolve(second);
    assert!(heap.in_collection_set(from));

    m.write_data(second, 1, 4242);
    let to = m.resolve(second);
    assert_ne!(from, to);
    assert!(!heap.in_collection_set(to));
    let again = m.load(head, 0).unwrap();
    assert!(m.same_object(second, again));

    finish_cycle(&heap);
    assert_eq!(m.read_data(second, 1), 4242);
    assert_list_intact(&mut m, &filled);
    heap.verify().unwrap();

    drop(m);
    heap.stop();
}

#[test]
fn test_explicit_gc_runs_full_gc() {
    let heap = ShenandoahHeap::create(test_config(8, M)).unwrap();
    let mut m = heap.attach_mutator();
    let filled = fill(&mut m, 4, |_, i| i % 4 == 0);
    let used_before = heap.used();

    m.collect();

    let stats = heap.statistics();
    assert_eq!(stats.full_cycles, 1);
    assert_eq!(stats.total_gc_cycles_count, 1);
    assert_eq!(stats.used, filled.kept.len() * NODE_BYTES);
    assert!(stats.used < used_before);
    assert_eq!(stats.cset_regions, 0);
    assert_eq!(stats.trash_regions, 0);
    assert!(stats.to_string().contains("0 concurrent, 0 degenerated, 1 full"));

    // Survivors slid to the bottom of the heap, in allocation order.
    let nodes = walk(&mut m, filled.root);
    let mut addrs: Vec<usize> = nodes.iter().map(|n| n.1).collect();
    addrs.reverse();
    assert_eq!(addrs[0], heap.heap_base() + 8);
    assert!(addrs.windows(2).all(|w| w[1] == w[0] + NODE_BYTES));
    assert_list_intact(&mut m, &filled);
    heap.verify().unwrap();

    drop(m);
    heap.stop();
}

#[test]
fn test_weak_handles_are_cleared() {
    let heap = ShenandoahHeap::create(test_config(8, M)).unwrap();
    let mut m = heap.attach_mutator();
    let mark = m.handle_mark();

    let live = m.allocate(0, 1).unwrap();
    m.write_data(live, 0, 7);
    let dead = m.allocate(0, 1).unwrap();
    let root = m.new_global(Some(live));
    let weak_live = m.new_weak(live);
    let weak_dead = m.new_weak(dead);
    m.reset_handles(mark);

    run_concurrent_cycle(&heap);
    assert!(m.weak(weak_dead).is_none());
    let live = m.weak(weak_live).unwrap();
    assert_eq!(m.read_data(live, 0), 7);
    let strong = m.global(root).unwrap();
    assert!(m.same_object(live, strong));

    m.release_global(root);
    m.reset_handles(mark);
    m.collect();
    assert!(m.weak(weak_live).is_none());
    m.release_weak(weak_live);
    m.release_weak(weak_dead);

    drop(m);
    heap.stop();
}

#[test]
fn test_pinned_objects_stay_in_place() {
    let heap = ShenandoahHeap::create(test_config(8, M)).unwrap();
    let mut m = heap.attach_mutator();
    let filled = fill(&mut m, 2, |_, i| i == 500);

    let obj = m.global(filled.root).unwrap();
    let pinned = m.pin(obj).unwrap();
    let region = heap.region_index(pinned.raw());
    assert!(heap.get_region(region).is_pinned());

    m.collect();
    assert_eq!(m.resolve(obj), pinned);
    assert_eq!(heap.statistics().pinned_regions, 1);

    heap.vmop_degenerated(ShenandoahDegenPoint::OutsideCycle);
    assert_eq!(m.resolve(obj), pinned);
    assert_list_intact(&mut m, &filled);
    heap.verify().unwrap();

    m.unpin(obj);
    assert!(!heap.get_region(region).is_pinned());
    m.collect();
    assert_list_intact(&mut m, &filled);

    drop(m);
    heap.stop();
}

#[test]
fn test_code_roots_follow_evacuated_objects() {
    let heap = ShenandoahHeap::create(test_config(8, M)).unwrap();
    let mut m = heap.attach_mutator();
    let mark = m.handle_mark();

    for _ in 0..500 {
        m.allocate(1, NODE_DATA).unwrap();
        m.reset_handles(mark);
    }
    let obj = m.allocate(1, NODE_DATA).unwrap();
    m.write_data(obj, 0, 77);
    let old = m.resolve(obj);
    let blob = m.register_code("stub", &[obj]);
    m.reset_handles(mark);
    for _ in 0..1500 {
        m.allocate(1, NODE_DATA).unwrap();
        m.reset_handles(mark);
    }

    heap.vmop_degenerated(ShenandoahDegenPoint::OutsideCycle);

    assert_eq!(blob.num_oops(), 1);
    let obj = m.code_oop(&blob, 0).unwrap();
    assert_eq!(m.read_data(obj, 0), 77);
    assert_ne!(m.resolve(obj), old);
    heap.verify().unwrap();

    m.unregister_code(&blob);
    assert!(heap.code_roots().is_empty());

    drop(m);
    heap.stop();
}

#[test]
fn test_humongous_objects_are_reclaimed() {
    let heap = ShenandoahHeap::create(test_config(8, 256 * K)).unwrap();
    let mut m = heap.attach_mutator();
    let mark = m.handle_mark();

    let live = m.allocate(0, 40_000).unwrap();
    m.write_data(live, 39_999, 13);
    let addr = m.resolve(live);
    let root = m.new_global(Some(live));
    m.allocate(0, 40_000).unwrap();
    assert_eq!(heap.statistics().humongous_regions, 4);

    m.reset_handles(mark);
    m.collect();

    assert_eq!(heap.statistics().humongous_regions, 2);
    let live = m.global(root).unwrap();
    assert_eq!(m.resolve(live), addr);
    assert_eq!(m.read_data(live, 39_999), 13);
    heap.verify().unwrap();

    drop(m);
    heap.stop();
}

#[test]
fn test_out_of_memory_after_full_gc() {
    let heap = ShenandoahHeap::create(test_config(8, 256 * K)).unwrap();
    let mut m = heap.attach_mutator();
    let root = m.new_global(None);
    let mark = m.handle_mark();

    let mut error = None;
    for _ in 0..10_000 {
        match m.allocate(1, NODE_DATA) {
            Ok(node) => {
                let head = m.global(root);
                m.store(node, 0, head);
                m.set_global(root, Some(node));
                m.reset_handles(mark);
            }
            Err(e) => {
                error = Some(e);
                break;
            }
        }
    }
    assert!(matches!(error, Some(AllocError::OutOfMemory { .. })));
    assert!(heap.policy().success_full_gcs() >= 1);
    assert!(!heap.last_gc_made_progress());

    m.set_global(root, None);
    m.collect();
    assert!(heap.last_gc_made_progress());
    assert!(m.allocate(1, NODE_DATA).is_ok());

    drop(m);
    heap.stop();
}

#[test]
fn test_allocation_fails_after_stop() {
    let heap = ShenandoahHeap::create(test_config(8, 256 * K)).unwrap();
    let mut m = heap.attach_mutator();
    heap.stop();
    assert_eq!(m.allocate(0, 1).unwrap_err(), AllocError::ShuttingDown);
}

#[test]
fn test_pin_fails_for_cset_object_after_stop() {
    let heap = ShenandoahHeap::create(test_config(8, 256 * K)).unwrap();
    let mut m = heap.attach_mutator();
    let obj = m.allocate(0, 4).unwrap();
    let region = heap.region_index(m.resolve(obj).raw());
    {
        let _lock = heap.lock();
        heap.collection_set().add_region(heap.get_region(region));
    }
    heap.stop();
    assert_eq!(m.pin(obj).unwrap_err(), AllocError::ShuttingDown);
    assert!(!heap.get_region(region).is_pinned());
}

#[test]
fn test_concurrent_mutators_with_aggressive_cycles() {
    let config = Config {
        heuristics: HeuristicsKind::Aggressive,
        conc_gc_threads: 2,
        use_tlab: true,
        pacing: true,
        verify: false,
        ..test_config(16, M)
    };
    let heap = ShenandoahHeap::create(config).unwrap();

    crossbeam_utils::thread::scope(|s| {
        for t in 0..4 {
            let heap = &heap;
            s.spawn(move |_| {
                let mut m = heap.attach_mutator();
                let root = m.new_global(None);
                for round in 0..100 {
                    let base = (t * 1000 + round) * 1000;
                    let mark = m.handle_mark();
                    let mut head = None;
                    for i in 0..64 {
                        let node = m.allocate(1, 3).unwrap();
                        m.write_data(node, 0, base + i);
                        m.store(node, 0, head);
                        head = Some(node);
                        m.allocate(0, 30).unwrap();
                    }
                    m.set_global(root, head);
                    m.reset_handles(mark);

                    let nodes = walk(&mut m, root);
                    let payloads: Vec<usize> = nodes.iter().map(|n| n.0).collect();
                    let expected: Vec<usize> = (0..64).rev().map(|i| base + i).collect();
                    assert_eq!(payloads, expected);
                }
                m.release_global(root);
            });
        }
    })
    .unwrap();

    wait_until("a concurrent cycle", || {
        heap.policy().success_concurrent_gcs() > 0
    });
    heap.stop();
    assert!(heap.policy().cycle_counter() > 0);
}

#[test]
fn test_config_is_validated() {
    let too_small = Config {
        max_heap_size: 4 * M,
        region_size: Some(M),
        ..Default::default()
    };
    assert!(matches!(
        ShenandoahHeap::create(too_small),
        Err(ConfigError::HeapTooSmall { .. })
    ));

    let bad_threshold = Config {
        garbage_threshold: 150,
        ..test_config(8, M)
    };
    assert!(matches!(
        ShenandoahHeap::create(bad_threshold),
        Err(ConfigError::BadPercentage {
            name: "garbage_threshold",
            ..
        })
    ));
}
