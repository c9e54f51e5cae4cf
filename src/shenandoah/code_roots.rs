use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard};

use super::{collection_set::ShenandoahCollectionSet, oop::Oop, root_processor::ShenandoahOopClosure};

/// Compiled code with embedded object references.
///
/// The runtime registers blobs once. After that only the collector writes the slots, when the
/// referents move.
pub struct CodeBlob {
    name: String,
    oops: Box<[AtomicUsize]>,
}

impl CodeBlob {
    pub(crate) fn new(name: impl Into<String>, oops: impl IntoIterator<Item = Oop>) -> Self {
        Self {
            name: name.into(),
            oops: oops.into_iter().map(|o| AtomicUsize::new(o.raw())).collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_oops(&self) -> usize {
        self.oops.len()
    }

    pub(crate) fn oop_at(&self, index: usize) -> Option<Oop> {
        Oop::from_raw_opt(self.oops[index].load(Ordering::Acquire))
    }

    pub fn oops_do(&self, cl: &mut dyn ShenandoahOopClosure) {
        for slot in self.oops.iter() {
            cl.do_oop(slot);
        }
    }

    fn has_cset_oops(&self, cset: &ShenandoahCollectionSet) -> bool {
        self.oops.iter().any(|slot| {
            let raw = slot.load(Ordering::Relaxed);
            raw != 0 && cset.is_in_addr(raw)
        })
    }
}

/// Registry of code blobs, scanned as roots.
pub struct ShenandoahCodeRoots {
    recorded: RwLock<Vec<Arc<CodeBlob>>>,
}

impl ShenandoahCodeRoots {
    pub fn new() -> Self {
        Self {
            recorded: RwLock::new(Vec::new()),
        }
    }

    pub fn add(&self, blob: Arc<CodeBlob>) {
        let mut recorded = self.recorded.write();
        if !recorded.iter().any(|b| Arc::ptr_eq(b, &blob)) {
            recorded.push(blob);
        }
    }

    pub fn remove(&self, blob: &Arc<CodeBlob>) {
        let mut recorded = self.recorded.write();
        let idx = recorded.iter().position(|b| Arc::ptr_eq(b, blob));
        assert!(idx.is_some(), "code blob {} should be registered", blob.name());
        if let Some(idx) = idx {
            recorded.swap_remove(idx);
        }
    }

    pub fn len(&self) -> usize {
        self.recorded.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iterator(&self) -> ShenandoahCodeRootsIterator<'_> {
        ShenandoahCodeRootsIterator {
            recorded: self.recorded.read(),
            claimed: AtomicUsize::new(0),
            cset_only: false,
        }
    }

    /// Only visits blobs that reference the collection set.
    pub fn cset_iterator(&self) -> ShenandoahCodeRootsIterator<'_> {
        ShenandoahCodeRootsIterator {
            recorded: self.recorded.read(),
            claimed: AtomicUsize::new(0),
            cset_only: true,
        }
    }
}

impl Default for ShenandoahCodeRoots {
    fn default() -> Self {
        Self::new()
    }
}

/// Parallel walk over the registry. Workers claim strides of blobs; the registry cannot change
/// while the iterator is alive.
pub struct ShenandoahCodeRootsIterator<'a> {
    recorded: RwLockReadGuard<'a, Vec<Arc<CodeBlob>>>,
    claimed: AtomicUsize,
    cset_only: bool,
}

impl<'a> ShenandoahCodeRootsIterator<'a> {
    const STRIDE: usize = 256;

    pub fn possibly_parallel_blobs_do(
        &self,
        cset: &ShenandoahCollectionSet,
        mut f: impl FnMut(&CodeBlob),
    ) {
        let max = self.recorded.len();
        while self.claimed.load(Ordering::Relaxed) < max {
            let start = self.claimed.fetch_add(Self::STRIDE, Ordering::AcqRel);
            if start >= max {
                break;
            }
            let end = (start + Self::STRIDE).min(max);
            for blob in self.recorded[start..end].iter() {
                if self.cset_only && !blob.has_cset_oops(cset) {
                    continue;
                }
                f(blob);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_parallel_iteration_visits_each_blob_once() {
        let roots = ShenandoahCodeRoots::new();
        for i in 0..1000 {
            roots.add(Arc::new(CodeBlob::new(format!("blob{}", i), vec![Oop::from_raw(0)])));
        }
        let cset = ShenandoahCollectionSet::new(1, 0x1000_0000, 20);
        let seen = Mutex::new(Vec::new());
        let iter = roots.iterator();
        crossbeam_utils::thread::scope(|s| {
            for _ in 0..4 {
                s.spawn(|_| {
                    let mut mine = Vec::new();
                    iter.possibly_parallel_blobs_do(&cset, |b| mine.push(b.name().to_string()));
                    seen.lock().extend(mine);
                });
            }
        })
        .unwrap();
        drop(iter);
        let mut seen = seen.into_inner();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), 1000);
        assert_eq!(roots.cset_iterator().recorded.len(), 1000);
    }
}
