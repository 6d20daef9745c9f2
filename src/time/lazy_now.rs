use super::TickClock;

use std::time::Instant;

/// Reads a clock on first use and caches the value.
///
/// One `LazyNow` lives for one logical operation (a `do_work` call, a post),
/// so the clock is sampled at most once even when several components ask for
/// the current time. A stale value is always earlier than the real time, so
/// using it can delay a task but never run one early.
pub struct LazyNow<'a> {
    clock: &'a dyn TickClock,
    now: Option<Instant>,
}

impl<'a> LazyNow<'a> {
    pub fn new(clock: &'a dyn TickClock) -> Self {
        Self { clock, now: None }
    }

    pub fn now(&mut self) -> Instant {
        let clock = self.clock;
        *self.now.get_or_insert_with(|| clock.now_ticks())
    }

    /// Whether the clock has been sampled already.
    pub fn has_value(&self) -> bool {
        self.now.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::TestTickClock;
    use std::time::Duration;

    #[test]
    fn test_samples_once() {
        let clock = TestTickClock::new();
        let mut lazy_now = LazyNow::new(&clock);
        assert!(!lazy_now.has_value());

        let first = lazy_now.now();
        clock.advance(Duration::from_secs(1));

        assert!(lazy_now.has_value());
        assert_eq!(lazy_now.now(), first, "LazyNow must not resample");
    }
}
