use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam::deque::{Steal, Stealer, Worker};
use parking_lot::{Mutex, MutexGuard};
use rand::distributions::{Distribution, Uniform};
use rand::thread_rng;

use super::oop::Oop;

pub type ShenandoahObjToScanQueue = Worker<Oop>;

/// One marking queue per worker plus the stealers of all of them.
///
/// The queues outlive a single marking phase: when concurrent marking is cancelled and the cycle
/// degenerates, the pause continues from whatever is left in them.
pub struct ShenandoahObjToScanQueueSet {
    queues: Vec<Mutex<ShenandoahObjToScanQueue>>,
    stealers: Vec<Stealer<Oop>>,
}

impl ShenandoahObjToScanQueueSet {
    pub fn new(n_queues: usize) -> Self {
        let mut queues = Vec::with_capacity(n_queues);
        let mut stealers = Vec::with_capacity(n_queues);
        for _ in 0..n_queues {
            let w = Worker::new_lifo();
            stealers.push(w.stealer());
            queues.push(Mutex::new(w));
        }
        Self { queues, stealers }
    }

    pub fn size(&self) -> usize {
        self.queues.len()
    }

    /// Locks the queue owned by `worker_id`. Workers hold it for the whole task.
    pub fn queue(&self, worker_id: usize) -> MutexGuard<'_, ShenandoahObjToScanQueue> {
        self.queues[worker_id].lock()
    }

    pub fn is_empty(&self) -> bool {
        self.stealers.iter().all(|s| s.is_empty())
    }

    pub fn clear(&self) {
        for q in self.queues.iter() {
            let q = q.lock();
            while q.pop().is_some() {}
        }
    }

    /// Steals a batch from a random peer into `into`. Peers are the first `active` queues.
    pub fn steal(&self, worker_id: usize, active: usize, into: &ShenandoahObjToScanQueue) -> Option<Oop> {
        let active = active.min(self.stealers.len());
        if active <= 1 {
            // A single worker may still inherit work left in other queues by a wider phase.
            return self.steal_any(worker_id, into);
        }

        let mut rng = thread_rng();
        let range = Uniform::new(0, active);

        for _ in 0..2 * active {
            let mut stealer_id = worker_id;

            while stealer_id == worker_id {
                stealer_id = range.sample(&mut rng);
            }

            let stealer = &self.stealers[stealer_id];

            loop {
                match stealer.steal_batch_and_pop(into) {
                    Steal::Empty => break,
                    Steal::Success(obj) => return Some(obj),
                    Steal::Retry => continue,
                }
            }
        }

        self.steal_any(worker_id, into)
    }

    fn steal_any(&self, worker_id: usize, into: &ShenandoahObjToScanQueue) -> Option<Oop> {
        for (id, stealer) in self.stealers.iter().enumerate() {
            if id == worker_id {
                continue;
            }
            loop {
                match stealer.steal_batch_and_pop(into) {
                    Steal::Empty => break,
                    Steal::Success(obj) => return Some(obj),
                    Steal::Retry => continue,
                }
            }
        }
        None
    }
}

/// Work-stealing termination protocol.
///
/// A worker out of work offers termination. The phase ends when every worker has offered without
/// anyone finding new work in between; a worker that wakes up with work rejoins.
pub struct ShenandoahTaskTerminator {
    const_nworkers: usize,
    nworkers: AtomicUsize,
}

impl ShenandoahTaskTerminator {
    pub fn new(number_workers: usize) -> Self {
        Self {
            const_nworkers: number_workers,
            nworkers: AtomicUsize::new(number_workers),
        }
    }

    /// Returns true when the phase is over, either terminated or cancelled.
    pub fn offer_termination(&self, cancelled: impl Fn() -> bool, has_work: impl Fn() -> bool) -> bool {
        if self.const_nworkers == 1 {
            return true;
        }

        if self.decrease_workers() {
            // reached 0, no need to wait
            return true;
        }

        loop {
            thread::sleep(Duration::from_micros(1));
            if cancelled() {
                return true;
            }
            if self.nworkers.load(Ordering::Acquire) == 0 {
                return true;
            }
            if has_work() {
                if self.zero_or_increase_workers() {
                    return true;
                }
                return false;
            }
        }
    }

    fn decrease_workers(&self) -> bool {
        self.nworkers.fetch_sub(1, Ordering::AcqRel) == 1
    }

    fn zero_or_increase_workers(&self) -> bool {
        let mut nworkers = self.nworkers.load(Ordering::Acquire);

        loop {
            if nworkers == 0 {
                return true;
            }

            match self.nworkers.compare_exchange(
                nworkers,
                nworkers + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                // Rejoined, there is still work left.
                Ok(_) => return false,
                Err(prev_nworkers) => nworkers = prev_nworkers,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_steal_moves_work_between_queues() {
        let set = ShenandoahObjToScanQueueSet::new(2);
        {
            let q = set.queue(0);
            for i in 0..8 {
                q.push(Oop::from_raw(16 * i + 8));
            }
        }
        let mine = set.queue(1);
        let stolen = set.steal(1, 2, &mine);
        assert!(stolen.is_some());
        drop(mine);
        assert!(!set.is_empty());
        set.clear();
        assert!(set.is_empty());
    }

    #[test]
    fn test_all_workers_terminate() {
        let n = 4;
        let terminator = ShenandoahTaskTerminator::new(n);
        let done = AtomicUsize::new(0);
        crossbeam_utils::thread::scope(|s| {
            for _ in 0..n {
                s.spawn(|_| {
                    while !terminator.offer_termination(|| false, || false) {}
                    done.fetch_add(1, Ordering::Relaxed);
                });
            }
        })
        .unwrap();
        assert_eq!(done.load(Ordering::Relaxed), n);
    }
}
