//! Cross-thread wake-up of a pump, with failure accounting.
//!
//! A [`WakeHandle`] is the only part of a pump that leaves its thread. It
//! signals the backend's wake primitive and records what happened in the
//! shared [`PumpCounters`]. A failed signal is never fatal: the loop polls
//! again on its next natural iteration, so the failure only costs latency.

use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use tracing::warn;

/// A backend wake primitive: an event, an eventfd, a kqueue user event.
pub(crate) trait WakeSignal: Send + Sync {
    fn signal(&self) -> io::Result<()>;
}

/// Diagnostics shared by a pump and its wake handles.
#[derive(Default)]
pub(crate) struct PumpCounters {
    pub(crate) wakes_issued: AtomicU64,
    pub(crate) delayed_work_programmed: AtomicU64,
    pub(crate) schedule_work_errors: AtomicU64,
    pub(crate) last_schedule_work_error: Mutex<Option<Instant>>,
    pub(crate) native_dispatches: AtomicU64,
    pub(crate) waits: AtomicU64,
    pub(crate) high_resolution_timer_active: AtomicBool,
}

impl PumpCounters {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> PumpStats {
        PumpStats {
            wakes_issued: self.wakes_issued.load(Ordering::Relaxed),
            delayed_work_programmed: self.delayed_work_programmed.load(Ordering::Relaxed),
            schedule_work_errors: self.schedule_work_errors.load(Ordering::Relaxed),
            last_schedule_work_error: *self.last_schedule_work_error.lock(),
            native_dispatches: self.native_dispatches.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            high_resolution_timer_active: self
                .high_resolution_timer_active
                .load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of a pump's counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PumpStats {
    /// Wake primitives actually signalled, successful or not.
    pub wakes_issued: u64,
    /// Times the pump lowered its programmed delayed-work deadline.
    pub delayed_work_programmed: u64,
    pub schedule_work_errors: u64,
    pub last_schedule_work_error: Option<Instant>,
    pub native_dispatches: u64,
    /// Times the pump blocked in its native wait.
    pub waits: u64,
    pub high_resolution_timer_active: bool,
}

/// Thread-safe handle that wakes a pump.
#[derive(Clone)]
pub struct WakeHandle {
    signal: Arc<dyn WakeSignal>,
    counters: Arc<PumpCounters>,
}

impl WakeHandle {
    pub(crate) fn new(signal: Arc<dyn WakeSignal>, counters: Arc<PumpCounters>) -> Self {
        Self { signal, counters }
    }

    /// Makes the pump's current or next wait return promptly.
    ///
    /// Never blocks on the pump thread and never fails; errors are counted.
    pub fn wake(&self) {
        PumpCounters::bump(&self.counters.wakes_issued);

        if let Err(error) = self.signal.signal() {
            PumpCounters::bump(&self.counters.schedule_work_errors);
            *self.counters.last_schedule_work_error.lock() = Some(Instant::now());
            warn!(%error, "failed to signal pump wake-up");
        }
    }

    pub fn stats(&self) -> PumpStats {
        self.counters.snapshot()
    }
}

impl fmt::Debug for WakeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WakeHandle")
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSignal;

    impl WakeSignal for FailingSignal {
        fn signal(&self) -> io::Result<()> {
            Err(io::Error::other("wake pipe full"))
        }
    }

    #[test]
    fn test_failed_wake_is_counted_not_fatal() {
        let counters = Arc::new(PumpCounters::default());
        let handle = WakeHandle::new(Arc::new(FailingSignal), counters);

        handle.wake();
        handle.wake();

        let stats = handle.stats();
        assert_eq!(stats.wakes_issued, 2);
        assert_eq!(stats.schedule_work_errors, 2);
        assert!(stats.last_schedule_work_error.is_some());
    }
}
