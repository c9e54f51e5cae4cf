use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use super::{
    code_roots::ShenandoahCodeRootsIterator, heap::ShenandoahHeap, mutator::MutatorState,
};

/// Visitor over reference slots. Slots hold raw object addresses, 0 is null.
pub trait ShenandoahOopClosure {
    fn do_oop(&mut self, slot: &AtomicUsize);
}

impl<F> ShenandoahOopClosure for F
where
    F: FnMut(&AtomicUsize),
{
    #[inline]
    fn do_oop(&mut self, slot: &AtomicUsize) {
        self(slot)
    }
}

/// Set of single-shot tasks shared by a gang. The first worker to claim a task runs it, the
/// last worker to finish resets the claims for the next round.
pub struct SubTasksDone {
    tasks: Box<[AtomicBool]>,
    n_threads: AtomicUsize,
    threads_completed: AtomicUsize,
}

impl SubTasksDone {
    pub fn new(n: usize) -> Self {
        Self {
            tasks: (0..n).map(|_| AtomicBool::new(false)).collect(),
            n_threads: AtomicUsize::new(1),
            threads_completed: AtomicUsize::new(0),
        }
    }

    pub fn set_n_threads(&self, n: usize) {
        self.n_threads.store(n.max(1), Ordering::Release);
    }

    /// Returns true if somebody claimed `task` before.
    pub fn is_task_claimed(&self, task: usize) -> bool {
        self.tasks[task].swap(true, Ordering::AcqRel)
    }

    pub fn all_tasks_completed(&self) {
        let observed = self.threads_completed.fetch_add(1, Ordering::AcqRel) + 1;
        if observed >= self.n_threads.load(Ordering::Acquire) {
            for task in self.tasks.iter() {
                task.store(false, Ordering::Release);
            }
            self.threads_completed.store(0, Ordering::Release);
        }
    }

    pub fn valid(&self) -> bool {
        self.threads_completed.load(Ordering::Acquire) == 0
            && self.tasks.iter().all(|t| !t.load(Ordering::Acquire))
    }
}

const RP_PS_GLOBAL_HANDLES: usize = 0;
const RP_PS_WEAK_HANDLES: usize = 1;
const RP_PS_NUM_ELEMENTS: usize = 2;

/// Parallel root scanning. Every root category is visited by exactly one worker: handle tables
/// are single tasks, mutator stacks are claimed one at a time, code blobs are claimed in strides.
///
/// Built at a safepoint; the mutator list is snapshotted on construction.
pub struct ShenandoahRootProcessor<'a> {
    heap: &'a ShenandoahHeap,
    process_strong_tasks: SubTasksDone,
    threads: Vec<Arc<MutatorState>>,
    threads_claimed: AtomicUsize,
    code_roots: ShenandoahCodeRootsIterator<'a>,
    evacuation: bool,
}

impl<'a> ShenandoahRootProcessor<'a> {
    pub fn new(heap: &'a ShenandoahHeap, n_workers: usize) -> Self {
        let process_strong_tasks = SubTasksDone::new(RP_PS_NUM_ELEMENTS);
        process_strong_tasks.set_n_threads(n_workers);
        Self {
            heap,
            process_strong_tasks,
            threads: heap.mutators_snapshot(),
            threads_claimed: AtomicUsize::new(0),
            code_roots: heap.code_roots().iterator(),
            evacuation: false,
        }
    }

    /// Root processor for the evacuation pause: code blobs without collection set references
    /// are skipped.
    pub fn for_evacuation(heap: &'a ShenandoahHeap, n_workers: usize) -> Self {
        let process_strong_tasks = SubTasksDone::new(RP_PS_NUM_ELEMENTS);
        process_strong_tasks.set_n_threads(n_workers);
        Self {
            heap,
            process_strong_tasks,
            threads: heap.mutators_snapshot(),
            threads_claimed: AtomicUsize::new(0),
            code_roots: heap.code_roots().cset_iterator(),
            evacuation: true,
        }
    }

    /// Roots that keep objects alive: stacks, globals and code. Weak handles are left out.
    pub fn process_strong_roots(&self, oops: &mut dyn ShenandoahOopClosure) {
        self.process_thread_roots(oops);
        self.process_vm_roots(oops);
        self.process_code_roots(oops);
        self.process_strong_tasks.all_tasks_completed();
    }

    /// Every root, weak handles included.
    pub fn process_all_roots(&self, oops: &mut dyn ShenandoahOopClosure) {
        self.process_thread_roots(oops);
        self.process_all_vm_roots(oops);
        self.process_code_roots(oops);
        self.process_strong_tasks.all_tasks_completed();
    }

    pub fn process_evacuate_roots(&self, oops: &mut dyn ShenandoahOopClosure) {
        debug_assert!(self.evacuation, "only for the evacuation pause");
        debug_assert!(self.heap.is_evacuation_in_progress(), "only when evacuating");
        self.process_all_roots(oops);
    }

    /// Claims mutators one by one until none is left.
    pub fn process_thread_roots(&self, oops: &mut dyn ShenandoahOopClosure) {
        loop {
            let index = self.threads_claimed.fetch_add(1, Ordering::AcqRel);
            match self.threads.get(index) {
                Some(thread) => thread.oops_do(oops),
                None => break,
            }
        }
    }

    fn process_all_vm_roots(&self, oops: &mut dyn ShenandoahOopClosure) {
        if !self.process_strong_tasks.is_task_claimed(RP_PS_GLOBAL_HANDLES) {
            self.heap.global_handles().oops_do(oops);
        }
        if !self.process_strong_tasks.is_task_claimed(RP_PS_WEAK_HANDLES) {
            self.heap.weak_handles().oops_do(oops);
        }
    }

    fn process_vm_roots(&self, strong: &mut dyn ShenandoahOopClosure) {
        if !self.process_strong_tasks.is_task_claimed(RP_PS_GLOBAL_HANDLES) {
            self.heap.global_handles().oops_do(strong);
        }
    }

    fn process_code_roots(&self, oops: &mut dyn ShenandoahOopClosure) {
        self.code_roots
            .possibly_parallel_blobs_do(self.heap.collection_set(), |blob| blob.oops_do(oops));
    }

    pub fn threads_count(&self) -> usize {
        self.threads.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_each_task_runs_once_per_round() {
        let n = 4;
        let tasks = SubTasksDone::new(3);
        tasks.set_n_threads(n);
        for _round in 0..2 {
            let ran = AtomicUsize::new(0);
            crossbeam_utils::thread::scope(|s| {
                for _ in 0..n {
                    s.spawn(|_| {
                        for t in 0..3 {
                            if !tasks.is_task_claimed(t) {
                                ran.fetch_add(1, Ordering::Relaxed);
                            }
                        }
                        tasks.all_tasks_completed();
                    });
                }
            })
            .unwrap();
            assert_eq!(ran.load(Ordering::Relaxed), 3);
            assert!(tasks.valid());
        }
    }
}
