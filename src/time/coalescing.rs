//! Wake-up coalescing policies.
//!
//! A pump asks its policy where, inside `[earliest, latest]`, it should
//! actually wake for a delayed task. Moving wake-ups onto a shared grid lets
//! several timers fire from one OS wake.

use std::fmt;
use std::time::{Duration, Instant};

/// Chooses the actual wake time for a delayed deadline.
///
/// Implementations must return a value in `[earliest, latest]`; the pump
/// clamps anything outside that range.
pub trait TimerCoalescing: fmt::Debug {
    fn adjust_delayed_run_time(
        &self,
        earliest: Instant,
        requested: Instant,
        latest: Instant,
    ) -> Instant;
}

/// Wakes exactly at the requested time.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCoalescing;

impl TimerCoalescing for NoCoalescing {
    fn adjust_delayed_run_time(&self, _: Instant, requested: Instant, _: Instant) -> Instant {
        requested
    }
}

/// Rounds wake-ups up to a fixed grid, without exceeding the task's leeway.
#[derive(Clone, Copy, Debug)]
pub struct AlignedCoalescing {
    granularity: Duration,
    origin: Instant,
}

impl AlignedCoalescing {
    pub fn new(granularity: Duration) -> Self {
        Self {
            granularity,
            origin: Instant::now(),
        }
    }

    fn align_up(&self, requested: Instant) -> Option<Instant> {
        let granularity = self.granularity.as_nanos();
        if granularity == 0 {
            return Some(requested);
        }

        let offset = requested.saturating_duration_since(self.origin).as_nanos();
        let slots = offset.div_ceil(granularity);
        let aligned = u64::try_from(slots * granularity).ok()?;

        self.origin.checked_add(Duration::from_nanos(aligned))
    }
}

impl TimerCoalescing for AlignedCoalescing {
    fn adjust_delayed_run_time(
        &self,
        _earliest: Instant,
        requested: Instant,
        latest: Instant,
    ) -> Instant {
        match self.align_up(requested) {
            Some(aligned) if aligned <= latest => aligned.max(requested),
            _ => requested,
        }
    }
}
