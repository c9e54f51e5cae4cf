use std::sync::atomic::{AtomicU8, Ordering};

use bitflags::bitflags;

bitflags! {
    /// Heap-wide collector state read by every barrier. Zero means stable: no barrier has any
    /// work beyond a null check.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct GcState: u8 {
        /// Heap may contain forwarded objects. Barriers have to resolve.
        const HAS_FORWARDED = 1 << 0;
        /// Concurrent marking is running. SATB barriers are on.
        const MARKING = 1 << 1;
        /// Concurrent evacuation is running. Write barriers evacuate.
        const EVACUATION = 1 << 2;
        /// Concurrent reference updating is running.
        const UPDATEREFS = 1 << 3;
    }
}

/// Atomically published [GcState]. Flips happen at safepoints with sequentially consistent
/// stores, so no mutator observes a stale state after the safepoint ends.
pub struct ShenandoahGcState {
    bits: AtomicU8,
}

impl ShenandoahGcState {
    pub const fn new() -> Self {
        Self {
            bits: AtomicU8::new(0),
        }
    }

    #[inline(always)]
    pub fn load(&self) -> GcState {
        GcState::from_bits_truncate(self.bits.load(Ordering::Acquire))
    }

    #[inline(always)]
    pub fn is_stable(&self) -> bool {
        self.bits.load(Ordering::Acquire) == 0
    }

    #[inline(always)]
    pub fn is_set(&self, flags: GcState) -> bool {
        self.load().intersects(flags)
    }

    pub fn set(&self, flags: GcState, value: bool) {
        if value {
            self.bits.fetch_or(flags.bits(), Ordering::SeqCst);
        } else {
            self.bits.fetch_and(!flags.bits(), Ordering::SeqCst);
        }
    }

    /// Address of the state byte, for generated code.
    pub fn address(&self) -> usize {
        &self.bits as *const AtomicU8 as usize
    }
}

impl Default for ShenandoahGcState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_independent_bits() {
        let state = ShenandoahGcState::new();
        assert!(state.is_stable());
        state.set(GcState::MARKING, true);
        state.set(GcState::HAS_FORWARDED, true);
        assert!(state.is_set(GcState::MARKING));
        state.set(GcState::MARKING, false);
        assert_eq!(state.load(), GcState::HAS_FORWARDED);
        assert_eq!(unsafe { *(state.address() as *const u8) }, 1);
        state.set(GcState::HAS_FORWARDED, false);
        assert!(state.is_stable());
    }
}
