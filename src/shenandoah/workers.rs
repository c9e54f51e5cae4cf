use parking_lot::Mutex;
use scoped_threadpool::Pool;

/// Gang of collector threads shared by pauses and concurrent phases.
///
/// Only the control thread submits tasks, one at a time. Tasks must not submit nested tasks.
pub struct ShenandoahWorkGang {
    pool: Mutex<Pool>,
    total_workers: usize,
}

impl ShenandoahWorkGang {
    pub fn new(total_workers: usize) -> Self {
        let total_workers = total_workers.max(1);
        Self {
            pool: Mutex::new(Pool::new(total_workers as u32)),
            total_workers,
        }
    }

    pub fn total_workers(&self) -> usize {
        self.total_workers
    }

    /// Runs `task(worker_id)` on `n_workers` threads and waits for all of them.
    pub fn run_task<F>(&self, n_workers: usize, name: &str, task: F)
    where
        F: Fn(usize) + Sync,
    {
        let n_workers = n_workers.max(1).min(self.total_workers);
        tracing::info!(
            "Using {} of {} workers for {}",
            n_workers,
            self.total_workers,
            name
        );

        if n_workers == 1 {
            task(0);
            return;
        }

        let mut pool = self.pool.lock();
        pool.scoped(|scoped| {
            for worker_id in 0..n_workers {
                let task = &task;
                scoped.execute(move || task(worker_id));
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_every_worker_runs_once() {
        let gang = ShenandoahWorkGang::new(4);
        let mask = AtomicUsize::new(0);
        gang.run_task(3, "test", |id| {
            mask.fetch_or(1 << id, Ordering::Relaxed);
        });
        assert_eq!(mask.load(Ordering::Relaxed), 0b111);

        let count = AtomicUsize::new(0);
        gang.run_task(16, "clamped", |_| {
            count.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(count.load(Ordering::Relaxed), 4);
    }
}
