use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Condvar, Mutex, MutexGuard};

/// Used to bring all threads with heap access to a safepoint such that e.g. a
/// garbage collection phase can be performed.
///
/// Mutator threads are "managed" while they run a heap operation and "safe" otherwise. A
/// safepoint arms the barrier, waits until no thread is managed, and keeps new operations from
/// starting until the guard is dropped.
pub struct GlobalSafepoint {
    barrier: Barrier,
    operation: Mutex<()>,
}

struct BarrierState {
    armed: bool,
    running: usize,
}

struct Barrier {
    armed: AtomicBool,
    state: Mutex<BarrierState>,
    cv_resume: Condvar,
    cv_stopped: Condvar,
}

impl Barrier {
    fn new() -> Self {
        Self {
            armed: AtomicBool::new(false),
            state: Mutex::new(BarrierState {
                armed: false,
                running: 0,
            }),
            cv_resume: Condvar::new(),
            cv_stopped: Condvar::new(),
        }
    }

    fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    fn arm(&self) {
        let mut state = self.state.lock();
        debug_assert!(!state.armed);
        state.armed = true;
        self.armed.store(true, Ordering::SeqCst);
        while state.running > 0 {
            self.cv_stopped.wait(&mut state);
        }
    }

    fn disarm(&self) {
        let mut state = self.state.lock();
        state.armed = false;
        self.armed.store(false, Ordering::SeqCst);
        self.cv_resume.notify_all();
    }

    fn enter(&self) {
        let mut state = self.state.lock();
        while state.armed {
            self.cv_resume.wait(&mut state);
        }
        state.running += 1;
    }

    fn leave(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.running > 0, "thread was not running");
        state.running -= 1;
        if state.armed && state.running == 0 {
            self.cv_stopped.notify_all();
        }
    }
}

impl GlobalSafepoint {
    pub fn new() -> Self {
        Self {
            barrier: Barrier::new(),
            operation: Mutex::new(()),
        }
    }

    pub fn is_armed(&self) -> bool {
        self.barrier.is_armed()
    }

    /// Starts a heap operation. Waits while a safepoint is in progress.
    pub fn enter_managed(&self) -> ManagedScope<'_> {
        self.barrier.enter();
        ManagedScope { safepoint: self }
    }

    /// Stops the world. Operations are serialized: a second caller waits until the first
    /// guard is dropped.
    pub fn synchronize(&self) -> SafepointGuard<'_> {
        let operation = self.operation.lock();
        self.barrier.arm();
        SafepointGuard {
            safepoint: self,
            _operation: operation,
        }
    }
}

impl Default for GlobalSafepoint {
    fn default() -> Self {
        Self::new()
    }
}

/// A thread in managed state. Safepoints wait for it to drop.
pub struct ManagedScope<'a> {
    safepoint: &'a GlobalSafepoint,
}

impl ManagedScope<'_> {
    /// Runs `f` in safe state, e.g. to wait for the collector.
    pub fn block<R>(&self, f: impl FnOnce() -> R) -> R {
        self.safepoint.barrier.leave();
        let result = f();
        self.safepoint.barrier.enter();
        result
    }
}

impl Drop for ManagedScope<'_> {
    fn drop(&mut self) {
        self.safepoint.barrier.leave();
    }
}

/// The world is stopped while this guard lives.
pub struct SafepointGuard<'a> {
    safepoint: &'a GlobalSafepoint,
    _operation: MutexGuard<'a, ()>,
}

impl Drop for SafepointGuard<'_> {
    fn drop(&mut self) {
        self.safepoint.barrier.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_safepoint_waits_for_managed_threads() {
        let safepoint = GlobalSafepoint::new();
        let inside = AtomicUsize::new(0);
        crossbeam_utils::thread::scope(|s| {
            let scope = safepoint.enter_managed();
            s.spawn(|_| {
                let _guard = safepoint.synchronize();
                assert_eq!(inside.load(Ordering::Acquire), 1);
            });
            std::thread::sleep(Duration::from_millis(20));
            inside.store(1, Ordering::Release);
            drop(scope);
        })
        .unwrap();
        assert!(!safepoint.is_armed());
    }

    #[test]
    fn test_blocked_threads_do_not_hold_safepoints() {
        let safepoint = GlobalSafepoint::new();
        let scope = safepoint.enter_managed();
        let stopped = scope.block(|| {
            let guard = safepoint.synchronize();
            let armed = safepoint.is_armed();
            drop(guard);
            armed
        });
        assert!(stopped);
        drop(scope);
    }
}
