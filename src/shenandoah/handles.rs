use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::{oop::Oop, root_processor::ShenandoahOopClosure};

/// Strong reference owned by the runtime rather than by a thread. Globals are roots.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct GlobalHandle(pub(crate) usize);

/// Reference that does not keep its referent alive. Cleared when a cycle finds the referent dead.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct WeakHandle(pub(crate) usize);

struct HandleTable {
    slots: Vec<AtomicUsize>,
    free: Vec<usize>,
    live: Vec<bool>,
}

/// Table of handle slots. Slot indices are stable, released slots are reused.
pub struct ShenandoahHandles {
    table: Mutex<HandleTable>,
}

impl ShenandoahHandles {
    pub fn new() -> Self {
        Self {
            table: Mutex::new(HandleTable {
                slots: Vec::new(),
                free: Vec::new(),
                live: Vec::new(),
            }),
        }
    }

    pub fn add(&self, value: Option<Oop>) -> usize {
        let raw = value.map_or(0, Oop::raw);
        let mut table = self.table.lock();
        match table.free.pop() {
            Some(index) => {
                table.slots[index].store(raw, Ordering::Release);
                table.live[index] = true;
                index
            }
            None => {
                table.slots.push(AtomicUsize::new(raw));
                table.live.push(true);
                table.slots.len() - 1
            }
        }
    }

    pub fn release(&self, index: usize) {
        let mut table = self.table.lock();
        assert!(table.live[index], "handle {} released twice", index);
        table.slots[index].store(0, Ordering::Release);
        table.live[index] = false;
        table.free.push(index);
    }

    pub fn get(&self, index: usize) -> Option<Oop> {
        let table = self.table.lock();
        debug_assert!(table.live[index], "stale handle {}", index);
        Oop::from_raw_opt(table.slots[index].load(Ordering::Acquire))
    }

    pub fn set(&self, index: usize, value: Option<Oop>) {
        let table = self.table.lock();
        debug_assert!(table.live[index], "stale handle {}", index);
        table.slots[index].store(value.map_or(0, Oop::raw), Ordering::Release);
    }

    /// Applies `cl` to every live slot.
    pub fn oops_do(&self, cl: &mut dyn ShenandoahOopClosure) {
        let table = self.table.lock();
        for (slot, live) in table.slots.iter().zip(table.live.iter()) {
            if *live {
                cl.do_oop(slot);
            }
        }
    }

    /// Clears slots whose referent `is_alive` rejects. Returns the number of cleared slots.
    pub fn weak_oops_do(&self, mut is_alive: impl FnMut(Oop) -> bool) -> usize {
        let table = self.table.lock();
        let mut cleared = 0;
        for (slot, live) in table.slots.iter().zip(table.live.iter()) {
            if !*live {
                continue;
            }
            if let Some(obj) = Oop::from_raw_opt(slot.load(Ordering::Acquire)) {
                if !is_alive(obj) {
                    slot.store(0, Ordering::Release);
                    cleared += 1;
                }
            }
        }
        cleared
    }

    pub fn len(&self) -> usize {
        let table = self.table.lock();
        table.live.iter().filter(|l| **l).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ShenandoahHandles {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slots_are_reused() {
        let handles = ShenandoahHandles::new();
        let a = handles.add(Some(Oop::from_raw(0x1008)));
        let b = handles.add(None);
        assert_eq!(handles.get(a), Some(Oop::from_raw(0x1008)));
        assert_eq!(handles.get(b), None);
        handles.release(a);
        assert_eq!(handles.len(), 1);
        let c = handles.add(Some(Oop::from_raw(0x2008)));
        assert_eq!(c, a);

        let cleared = handles.weak_oops_do(|obj| obj.raw() != 0x2008);
        assert_eq!(cleared, 1);
        assert_eq!(handles.get(c), None);

        let mut visited = 0;
        handles.oops_do(&mut |_slot: &AtomicUsize| visited += 1);
        assert_eq!(visited, 2);
    }
}
