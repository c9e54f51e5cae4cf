use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use crossbeam_utils::{Backoff, CachePadded};

const OOM_MARKER_MASK: usize = 1 << (usize::BITS - 1);

/// Coordinates threads that evacuate objects when to-space runs out.
///
/// Every evacuating thread registers in a counter. A thread that fails to allocate a copy sets
/// the OOM marker bit, deregisters and waits until all other evacuating threads left. From then
/// on no thread copies anything: everybody only resolves forwarding pointers, so all of them
/// agree on the same copy of every object.
pub struct ShenandoahEvacOOMHandler {
    threads_in_evac: CachePadded<AtomicUsize>,
}

/// Registration of the current thread in the evacuation protocol. Dropping it leaves.
pub struct ShenandoahEvacOOMScope<'a> {
    handler: &'a ShenandoahEvacOOMHandler,
    oom_during_evac: Cell<bool>,
}

impl ShenandoahEvacOOMHandler {
    pub fn new() -> Self {
        Self {
            threads_in_evac: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    pub fn enter(&self) -> ShenandoahEvacOOMScope<'_> {
        let scope = ShenandoahEvacOOMScope {
            handler: self,
            oom_during_evac: Cell::new(false),
        };
        let mut threads_in_evac = self.threads_in_evac.load(Ordering::Acquire);
        loop {
            if threads_in_evac & OOM_MARKER_MASK != 0 {
                self.wait_for_no_evac_threads(&scope);
                return scope;
            }
            match self.threads_in_evac.compare_exchange(
                threads_in_evac,
                threads_in_evac + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return scope,
                Err(other) => threads_in_evac = other,
            }
        }
    }

    fn wait_for_no_evac_threads(&self, scope: &ShenandoahEvacOOMScope<'_>) {
        let backoff = Backoff::new();
        while self.threads_in_evac.load(Ordering::Acquire) & !OOM_MARKER_MASK != 0 {
            if backoff.is_completed() {
                std::thread::sleep(Duration::from_millis(1));
            } else {
                backoff.snooze();
            }
        }
        scope.oom_during_evac.set(true);
    }

    /// Called by a registered thread that failed to allocate a to-space copy.
    pub fn handle_out_of_memory_during_evacuation(&self, scope: &ShenandoahEvacOOMScope<'_>) {
        debug_assert!(!scope.is_oom_during_evac(), "already left evacuation");
        let mut threads_in_evac = self.threads_in_evac.load(Ordering::Acquire);
        loop {
            match self.threads_in_evac.compare_exchange(
                threads_in_evac,
                (threads_in_evac - 1) | OOM_MARKER_MASK,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(other) => threads_in_evac = other,
            }
        }
        self.wait_for_no_evac_threads(scope);
    }

    /// Resets the protocol. Only at a safepoint, when nobody evacuates.
    pub fn clear(&self) {
        debug_assert_eq!(
            self.threads_in_evac.load(Ordering::Acquire) & !OOM_MARKER_MASK,
            0,
            "sanity"
        );
        self.threads_in_evac.store(0, Ordering::SeqCst);
    }

    pub fn is_oom_marked(&self) -> bool {
        self.threads_in_evac.load(Ordering::Acquire) & OOM_MARKER_MASK != 0
    }

    fn leave(&self, scope: &ShenandoahEvacOOMScope<'_>) {
        if !scope.oom_during_evac.get() {
            self.threads_in_evac.fetch_sub(1, Ordering::AcqRel);
        } else {
            scope.oom_during_evac.set(false);
        }
    }
}

impl Default for ShenandoahEvacOOMHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a> ShenandoahEvacOOMScope<'a> {
    /// True once the protocol switched this thread to resolve-only mode.
    pub fn is_oom_during_evac(&self) -> bool {
        self.oom_during_evac.get()
    }

    pub fn handle_oom(&self) {
        self.handler.handle_out_of_memory_during_evacuation(self);
    }
}

impl Drop for ShenandoahEvacOOMScope<'_> {
    fn drop(&mut self) {
        self.handler.leave(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oom_switches_everybody_to_resolve_only() {
        let handler = ShenandoahEvacOOMHandler::new();
        {
            let a = handler.enter();
            let b = handler.enter();
            assert!(!a.is_oom_during_evac());
            drop(b);
            a.handle_oom();
            assert!(a.is_oom_during_evac());
            assert!(handler.is_oom_marked());
            let late = handler.enter();
            assert!(late.is_oom_during_evac());
        }
        handler.clear();
        assert!(!handler.is_oom_marked());
        let fresh = handler.enter();
        assert!(!fresh.is_oom_during_evac());
    }

    #[test]
    fn test_oom_waits_for_other_evacuators() {
        let handler = ShenandoahEvacOOMHandler::new();
        let left = AtomicUsize::new(0);
        crossbeam_utils::thread::scope(|s| {
            let other = handler.enter();
            s.spawn(|_| {
                let scope = handler.enter();
                scope.handle_oom();
                assert_eq!(left.load(Ordering::Acquire), 1);
            });
            std::thread::sleep(Duration::from_millis(20));
            left.store(1, Ordering::Release);
            drop(other);
        })
        .unwrap();
    }
}
