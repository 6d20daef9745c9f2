//! Monotonic time primitives used by the run loop.
//!
//! - [`TimeTicks`] is an [`Instant`] extended with the two sentinels the pump
//!   protocol needs: *null* ("run immediately") and *max* ("nothing scheduled").
//! - [`TickClock`] abstracts the clock so controllers can be driven by a
//!   [`TestTickClock`] in tests.
//! - [`LazyNow`] samples a clock at most once per logical operation.
//! - [`TimerCoalescing`] lets a pump batch nearby wake-ups.
//!
//! # Example
//!
//! ```ignore
//! use runloop::time::{LazyNow, SystemTickClock, TimeTicks};
//! use std::time::Duration;
//!
//! let clock = SystemTickClock;
//! let mut now = LazyNow::new(&clock);
//! let deadline = TimeTicks::from(now.now()).saturating_add(Duration::from_millis(50));
//! assert!(deadline < TimeTicks::max());
//! ```

pub mod coalescing;
pub mod lazy_now;

pub use coalescing::{AlignedCoalescing, NoCoalescing, TimerCoalescing};
pub use lazy_now::LazyNow;

use parking_lot::Mutex;
use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum Repr {
    Null,
    At(Instant),
    Max,
}

/// A point on the monotonic clock, or one of the `null`/`max` sentinels.
///
/// Ordering is `null < any instant < max`, so `min`/`max` compose deadlines
/// without special cases.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeTicks(Repr);

impl TimeTicks {
    /// The "immediately" sentinel.
    pub const fn null() -> Self {
        Self(Repr::Null)
    }

    /// The "never" sentinel.
    pub const fn max() -> Self {
        Self(Repr::Max)
    }

    pub fn is_null(&self) -> bool {
        matches!(self.0, Repr::Null)
    }

    pub fn is_max(&self) -> bool {
        matches!(self.0, Repr::Max)
    }

    /// Returns the underlying instant, `None` for either sentinel.
    pub fn instant(&self) -> Option<Instant> {
        match self.0 {
            Repr::At(instant) => Some(instant),
            _ => None,
        }
    }

    /// Adds `delta`, saturating to [`TimeTicks::max`] on overflow.
    ///
    /// Sentinels are returned unchanged.
    pub fn saturating_add(self, delta: Duration) -> Self {
        match self.0 {
            Repr::At(instant) => instant
                .checked_add(delta)
                .map(Self::from)
                .unwrap_or_else(Self::max),
            _ => self,
        }
    }
}

impl From<Instant> for TimeTicks {
    fn from(instant: Instant) -> Self {
        Self(Repr::At(instant))
    }
}

/// Source of monotonic time.
pub trait TickClock: Send + Sync {
    fn now_ticks(&self) -> Instant;
}

/// The process monotonic clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemTickClock;

impl TickClock for SystemTickClock {
    fn now_ticks(&self) -> Instant {
        Instant::now()
    }
}

/// A manually advanced clock for deterministic tests.
///
/// Starts at the real time of construction and only moves on
/// [`TestTickClock::advance`].
#[derive(Debug)]
pub struct TestTickClock {
    now: Mutex<Instant>,
}

impl TestTickClock {
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Instant::now()),
        }
    }

    /// Moves the clock forward by `delta`.
    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.lock();
        *now += delta;
    }
}

impl Default for TestTickClock {
    fn default() -> Self {
        Self::new()
    }
}

impl TickClock for TestTickClock {
    fn now_ticks(&self) -> Instant {
        *self.now.lock()
    }
}
