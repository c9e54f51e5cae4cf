use std::borrow::Cow;
use std::time::{Duration, Instant};

use flume::{Receiver, Sender};
use parking_lot::Mutex;

/// Named collector phases, pauses and concurrent phases alike.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(usize)]
pub enum ShenandoahPhase {
    InitMark,
    ConcMark,
    FinalMark,
    ConcEvac,
    FinalEvac,
    InitUpdateRefs,
    ConcUpdateRefs,
    FinalUpdateRefs,
    ConcCleanup,
    ConcReset,
    ConcUncommit,
    DegenGc,
    FullGc,
    FullGcMark,
    FullGcCalculateAddresses,
    FullGcAdjustPointers,
    FullGcCopyObjects,
}

impl ShenandoahPhase {
    pub const COUNT: usize = ShenandoahPhase::FullGcCopyObjects as usize + 1;

    pub const ALL: [ShenandoahPhase; Self::COUNT] = [
        ShenandoahPhase::InitMark,
        ShenandoahPhase::ConcMark,
        ShenandoahPhase::FinalMark,
        ShenandoahPhase::ConcEvac,
        ShenandoahPhase::FinalEvac,
        ShenandoahPhase::InitUpdateRefs,
        ShenandoahPhase::ConcUpdateRefs,
        ShenandoahPhase::FinalUpdateRefs,
        ShenandoahPhase::ConcCleanup,
        ShenandoahPhase::ConcReset,
        ShenandoahPhase::ConcUncommit,
        ShenandoahPhase::DegenGc,
        ShenandoahPhase::FullGc,
        ShenandoahPhase::FullGcMark,
        ShenandoahPhase::FullGcCalculateAddresses,
        ShenandoahPhase::FullGcAdjustPointers,
        ShenandoahPhase::FullGcCopyObjects,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::InitMark => "Pause Init Mark",
            Self::ConcMark => "Concurrent Marking",
            Self::FinalMark => "Pause Final Mark",
            Self::ConcEvac => "Concurrent Evacuation",
            Self::FinalEvac => "Pause Final Evac",
            Self::InitUpdateRefs => "Pause Init Update Refs",
            Self::ConcUpdateRefs => "Concurrent Update Refs",
            Self::FinalUpdateRefs => "Pause Final Update Refs",
            Self::ConcCleanup => "Concurrent Cleanup",
            Self::ConcReset => "Concurrent Reset",
            Self::ConcUncommit => "Concurrent Uncommit",
            Self::DegenGc => "Pause Degenerated GC",
            Self::FullGc => "Pause Full GC",
            Self::FullGcMark => "  Mark",
            Self::FullGcCalculateAddresses => "  Calculate Addresses",
            Self::FullGcAdjustPointers => "  Adjust Pointers",
            Self::FullGcCopyObjects => "  Copy Objects",
        }
    }

    pub fn is_sub_phase(self) -> bool {
        matches!(
            self,
            Self::FullGcMark
                | Self::FullGcCalculateAddresses
                | Self::FullGcAdjustPointers
                | Self::FullGcCopyObjects
        )
    }

    pub fn is_pause(self) -> bool {
        matches!(
            self,
            Self::InitMark
                | Self::FinalMark
                | Self::FinalEvac
                | Self::InitUpdateRefs
                | Self::FinalUpdateRefs
                | Self::DegenGc
                | Self::FullGc
        )
    }
}

/// Phase completion delivered to subscribers.
#[derive(Clone, Debug)]
pub struct PhaseEvent {
    pub gc_id: usize,
    pub phase: ShenandoahPhase,
    pub start: Instant,
    pub end: Instant,
}

impl PhaseEvent {
    pub fn duration(&self) -> Duration {
        self.end.duration_since(self.start)
    }
}

#[derive(Clone, Copy, Default, Debug)]
pub struct PhaseStats {
    pub count: usize,
    pub total: Duration,
    pub max: Duration,
}

/// Per-phase count, total and maximum time, plus event subscribers.
pub struct ShenandoahPhaseTimings {
    stats: Mutex<[PhaseStats; ShenandoahPhase::COUNT]>,
    subscribers: Mutex<Vec<Sender<PhaseEvent>>>,
}

impl ShenandoahPhaseTimings {
    pub fn new() -> Self {
        Self {
            stats: Mutex::new([PhaseStats::default(); ShenandoahPhase::COUNT]),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Every phase completed after this call is sent to the returned receiver. Dropping the
    /// receiver unsubscribes.
    pub fn subscribe(&self) -> Receiver<PhaseEvent> {
        let (tx, rx) = flume::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn record(&self, gc_id: usize, phase: ShenandoahPhase, start: Instant, end: Instant) {
        let elapsed = end.duration_since(start);
        {
            let mut stats = self.stats.lock();
            let entry = &mut stats[phase as usize];
            entry.count += 1;
            entry.total += elapsed;
            entry.max = entry.max.max(elapsed);
        }

        let mut subscribers = self.subscribers.lock();
        if !subscribers.is_empty() {
            let event = PhaseEvent {
                gc_id,
                phase,
                start,
                end,
            };
            subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    pub fn stats(&self, phase: ShenandoahPhase) -> PhaseStats {
        self.stats.lock()[phase as usize]
    }

    pub fn print_summary(&self) {
        let stats = self.stats.lock();
        tracing::info!("GC Pause and Phase Times (count, total, avg, max):");
        for phase in ShenandoahPhase::ALL.iter() {
            let s = stats[*phase as usize];
            if s.count == 0 {
                continue;
            }
            tracing::info!(
                "{:<30} {:6} {:10.3}ms {:10.3}ms {:10.3}ms",
                phase.name(),
                s.count,
                s.total.as_secs_f64() * 1000.0,
                s.total.as_secs_f64() * 1000.0 / s.count as f64,
                s.max.as_secs_f64() * 1000.0
            );
        }
    }
}

impl Default for ShenandoahPhaseTimings {
    fn default() -> Self {
        Self::new()
    }
}

/// Times a phase until dropped, then logs `GC(<id>) <message> <ms>ms` and records it.
pub struct ShenandoahPhaseScope<'a> {
    timings: &'a ShenandoahPhaseTimings,
    phase: ShenandoahPhase,
    gc_id: usize,
    message: Cow<'static, str>,
    start: Instant,
}

impl<'a> ShenandoahPhaseScope<'a> {
    pub fn new(
        timings: &'a ShenandoahPhaseTimings,
        gc_id: usize,
        phase: ShenandoahPhase,
        message: impl Into<Cow<'static, str>>,
    ) -> Self {
        let message = message.into();
        tracing::debug!("GC({}) {} start", gc_id, message);
        Self {
            timings,
            phase,
            gc_id,
            message,
            start: Instant::now(),
        }
    }
}

impl Drop for ShenandoahPhaseScope<'_> {
    fn drop(&mut self) {
        let end = Instant::now();
        let ms = end.duration_since(self.start).as_secs_f64() * 1000.0;
        if self.phase.is_sub_phase() {
            tracing::debug!("GC({}) {} {:.3}ms", self.gc_id, self.message, ms);
        } else {
            tracing::info!("GC({}) {} {:.3}ms", self.gc_id, self.message, ms);
        }
        self.timings.record(self.gc_id, self.phase, self.start, end);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribers_receive_events() {
        let timings = ShenandoahPhaseTimings::new();
        let rx = timings.subscribe();
        {
            let _scope =
                ShenandoahPhaseScope::new(&timings, 7, ShenandoahPhase::InitMark, "Pause Init Mark");
        }
        let event = rx.try_recv().unwrap();
        assert_eq!(event.gc_id, 7);
        assert_eq!(event.phase, ShenandoahPhase::InitMark);
        assert_eq!(timings.stats(ShenandoahPhase::InitMark).count, 1);

        drop(rx);
        let start = Instant::now();
        timings.record(8, ShenandoahPhase::ConcMark, start, start);
        assert!(timings.subscribers.lock().is_empty());
    }
}
