use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::oop::Oop;

/// Snapshot-at-the-beginning buffers handed over from mutators to markers.
///
/// Mutators collect the previous values of overwritten reference slots in a local
/// [ShenandoahSatbQueue]. Full buffers are published here and drained by the mark loop.
pub struct ShenandoahSatbQueueSet {
    completed: Mutex<Vec<Vec<usize>>>,
    completed_count: AtomicUsize,
    buffer_size: usize,
    active: AtomicBool,
}

impl ShenandoahSatbQueueSet {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            completed: Mutex::new(Vec::new()),
            completed_count: AtomicUsize::new(0),
            buffer_size: buffer_size.max(1),
            active: AtomicBool::new(false),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    #[inline]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Switched at safepoints together with the marking bit.
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    pub fn enqueue_completed(&self, buffer: Vec<usize>) {
        if buffer.is_empty() {
            return;
        }
        let mut completed = self.completed.lock();
        completed.push(buffer);
        self.completed_count.fetch_add(1, Ordering::Release);
    }

    pub fn completed_buffers_num(&self) -> usize {
        self.completed_count.load(Ordering::Acquire)
    }

    /// Takes one completed buffer and applies `f` to each entry. Returns false when there was
    /// nothing to take.
    pub fn apply_closure_to_completed_buffer(&self, mut f: impl FnMut(Oop)) -> bool {
        if self.completed_buffers_num() == 0 {
            return false;
        }
        let buffer = {
            let mut completed = self.completed.lock();
            match completed.pop() {
                Some(buffer) => {
                    self.completed_count.fetch_sub(1, Ordering::Release);
                    buffer
                }
                None => return false,
            }
        };
        for raw in buffer {
            f(Oop::from_raw(raw));
        }
        true
    }

    /// Drops every completed buffer. Used when marking is cancelled.
    pub fn abandon_partial_marking(&self) {
        let mut completed = self.completed.lock();
        completed.clear();
        self.completed_count.store(0, Ordering::Release);
    }
}

/// Per-thread SATB buffer.
pub struct ShenandoahSatbQueue {
    buffer: Vec<usize>,
}

impl ShenandoahSatbQueue {
    pub const fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    #[inline]
    pub fn enqueue(&mut self, qset: &ShenandoahSatbQueueSet, obj: Oop) {
        if self.buffer.capacity() == 0 {
            self.buffer.reserve_exact(qset.buffer_size());
        }
        self.buffer.push(obj.raw());
        if self.buffer.len() >= qset.buffer_size() {
            self.flush(qset);
        }
    }

    pub fn flush(&mut self, qset: &ShenandoahSatbQueueSet) {
        if !self.buffer.is_empty() {
            let buffer = std::mem::take(&mut self.buffer);
            qset.enqueue_completed(buffer);
        }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for ShenandoahSatbQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_buffers_are_published() {
        let qset = ShenandoahSatbQueueSet::new(4);
        let mut queue = ShenandoahSatbQueue::new();
        for i in 1..=9 {
            queue.enqueue(&qset, Oop::from_raw(i * 16 + 8));
        }
        assert_eq!(qset.completed_buffers_num(), 2);
        assert_eq!(queue.len(), 1);
        queue.flush(&qset);
        assert!(queue.is_empty());

        let mut seen = Vec::new();
        while qset.apply_closure_to_completed_buffer(|obj| seen.push(obj.raw())) {}
        seen.sort_unstable();
        assert_eq!(seen, (1..=9).map(|i| i * 16 + 8).collect::<Vec<_>>());
        assert_eq!(qset.completed_buffers_num(), 0);
    }
}
