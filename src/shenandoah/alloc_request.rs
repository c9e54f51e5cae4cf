#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AllocKind {
    /// Allocate common, outside of TLAB.
    Shared,
    /// Allocate common, outside of GCLAB.
    SharedGc,
    /// Allocate TLAB.
    Tlab,
    /// Allocate GCLAB.
    Gclab,
}

impl AllocKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Shared => "Shared",
            Self::SharedGc => "Shared GC",
            Self::Tlab => "TLAB",
            Self::Gclab => "GCLAB",
        }
    }
}

/// One allocation request, filled in by the free set.
#[derive(Clone, Copy, Debug)]
pub struct ShenandoahAllocRequest {
    min_size: usize,
    requested_size: usize,
    actual_size: usize,
    kind: AllocKind,
}

impl ShenandoahAllocRequest {
    fn new(min_size: usize, requested_size: usize, kind: AllocKind) -> Self {
        Self {
            min_size,
            requested_size,
            actual_size: 0,
            kind,
        }
    }

    pub fn for_tlab(min_size: usize, requested_size: usize) -> Self {
        Self::new(min_size, requested_size, AllocKind::Tlab)
    }

    pub fn for_gclab(min_size: usize, requested_size: usize) -> Self {
        Self::new(min_size, requested_size, AllocKind::Gclab)
    }

    pub fn for_shared_gc(requested_size: usize) -> Self {
        Self::new(0, requested_size, AllocKind::SharedGc)
    }

    pub fn for_shared(requested_size: usize) -> Self {
        Self::new(0, requested_size, AllocKind::Shared)
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.requested_size
    }

    #[inline]
    pub fn kind(&self) -> AllocKind {
        self.kind
    }

    #[inline]
    pub fn min_size(&self) -> usize {
        debug_assert!(self.is_lab_alloc(), "Only access for LAB allocs");
        self.min_size
    }

    #[inline]
    pub fn actual_size(&self) -> usize {
        self.actual_size
    }

    #[inline]
    pub fn set_actual_size(&mut self, size: usize) {
        self.actual_size = size;
    }

    #[inline]
    pub fn is_mutator_alloc(&self) -> bool {
        matches!(self.kind, AllocKind::Tlab | AllocKind::Shared)
    }

    #[inline]
    pub fn is_gc_alloc(&self) -> bool {
        matches!(self.kind, AllocKind::Gclab | AllocKind::SharedGc)
    }

    #[inline]
    pub fn is_lab_alloc(&self) -> bool {
        matches!(self.kind, AllocKind::Tlab | AllocKind::Gclab)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_kinds() {
        let tlab = ShenandoahAllocRequest::for_tlab(4, 64);
        assert!(tlab.is_mutator_alloc() && tlab.is_lab_alloc() && !tlab.is_gc_alloc());
        assert_eq!(tlab.min_size(), 4);
        let gclab = ShenandoahAllocRequest::for_gclab(2, 32);
        assert!(gclab.is_gc_alloc() && gclab.is_lab_alloc());
        let shared_gc = ShenandoahAllocRequest::for_shared_gc(8);
        assert!(shared_gc.is_gc_alloc() && !shared_gc.is_lab_alloc());
        let mut shared = ShenandoahAllocRequest::for_shared(10);
        assert!(shared.is_mutator_alloc() && !shared.is_lab_alloc());
        shared.set_actual_size(10);
        assert_eq!(shared.actual_size(), shared.size());
    }
}
