//! Collapses redundant wake-up requests into at most one pending native wake.
//!
//! The state is a single atomic byte:
//!
//! | bit          | meaning                                        |
//! |--------------|------------------------------------------------|
//! | `BOUND`      | the controller is bound, wakes can be issued   |
//! | `IN_DO_WORK` | the controller is inside `do_work`             |
//! | `PENDING`    | work was requested and a wake is outstanding   |
//!
//! `BOUND` alone is the ready state: the next request must wake the pump.
//! With `PENDING` set a wake is already in flight, and with `IN_DO_WORK` set
//! the controller will look for work before it sleeps, so in both cases a
//! request only records itself. Requests made before binding are remembered
//! and replayed by [`WorkDeduplicator::bind`].

use std::sync::atomic::{AtomicU8, Ordering};

const BOUND: u8 = 0b100;
const IN_DO_WORK: u8 = 0b010;
const PENDING: u8 = 0b001;

/// Whether the caller must issue a native wake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShouldScheduleWork {
    ScheduleImmediate,
    NotNeeded,
}

#[derive(Debug, Default)]
pub struct WorkDeduplicator {
    state: AtomicU8,
}

impl WorkDeduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the controller bound. Schedules if work arrived before binding.
    pub fn bind(&self) -> ShouldScheduleWork {
        let previous = self.state.fetch_or(BOUND, Ordering::SeqCst);
        debug_assert_eq!(previous & BOUND, 0, "deduplicator bound twice");

        if previous & PENDING != 0 {
            ShouldScheduleWork::ScheduleImmediate
        } else {
            ShouldScheduleWork::NotNeeded
        }
    }

    pub fn unbind(&self) {
        self.state.store(0, Ordering::SeqCst);
    }

    pub fn is_bound(&self) -> bool {
        self.state.load(Ordering::SeqCst) & BOUND != 0
    }

    /// Called for every `schedule_work`. Only the first request after the
    /// controller went ready gets `ScheduleImmediate`.
    pub fn on_work_requested(&self) -> ShouldScheduleWork {
        if self.state.fetch_or(PENDING, Ordering::SeqCst) == BOUND {
            ShouldScheduleWork::ScheduleImmediate
        } else {
            ShouldScheduleWork::NotNeeded
        }
    }

    /// Whether a delayed deadline should be forwarded to the pump now.
    ///
    /// Inside `do_work` or with an immediate wake pending, the deadline is
    /// recomputed anyway before the pump sleeps.
    pub fn on_delayed_work_requested(&self) -> bool {
        self.state.load(Ordering::SeqCst) == BOUND
    }

    /// The controller started consuming the pending signal.
    pub fn on_work_started(&self) {
        self.state.store(BOUND | IN_DO_WORK, Ordering::SeqCst);
    }

    /// About to ask the source for the next task's delay. Requests arriving
    /// from here on are caught by [`Self::did_check_for_more_work`].
    pub fn will_check_for_more_work(&self) {
        self.state.store(BOUND | IN_DO_WORK, Ordering::SeqCst);
    }

    /// Leaves `do_work`. Returns `ScheduleImmediate` if work is ready or was
    /// requested since [`Self::will_check_for_more_work`].
    pub fn did_check_for_more_work(&self, has_immediate_work: bool) -> ShouldScheduleWork {
        if has_immediate_work {
            self.state.store(BOUND | PENDING, Ordering::SeqCst);
            return ShouldScheduleWork::ScheduleImmediate;
        }

        match self.state.compare_exchange(
            BOUND | IN_DO_WORK,
            BOUND,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => ShouldScheduleWork::NotNeeded,
            Err(_) => {
                // A request raced the check; keep the loop awake for it.
                self.state.store(BOUND | PENDING, Ordering::SeqCst);
                ShouldScheduleWork::ScheduleImmediate
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn bound() -> WorkDeduplicator {
        let dedup = WorkDeduplicator::new();
        assert_eq!(dedup.bind(), ShouldScheduleWork::NotNeeded);
        dedup
    }

    #[test]
    fn test_only_first_request_schedules() {
        let dedup = bound();
        assert_eq!(dedup.on_work_requested(), ShouldScheduleWork::ScheduleImmediate);
        assert_eq!(dedup.on_work_requested(), ShouldScheduleWork::NotNeeded);
        assert_eq!(dedup.on_work_requested(), ShouldScheduleWork::NotNeeded);
    }

    #[test]
    fn test_request_before_bind_is_replayed() {
        let dedup = WorkDeduplicator::new();
        assert_eq!(dedup.on_work_requested(), ShouldScheduleWork::NotNeeded);
        assert_eq!(dedup.bind(), ShouldScheduleWork::ScheduleImmediate);
    }

    #[test]
    fn test_requests_during_do_work_are_not_forwarded() {
        let dedup = bound();
        dedup.on_work_requested();
        dedup.on_work_started();

        assert_eq!(dedup.on_work_requested(), ShouldScheduleWork::NotNeeded);
        assert!(!dedup.on_delayed_work_requested());

        dedup.will_check_for_more_work();
        assert_eq!(
            dedup.did_check_for_more_work(false),
            ShouldScheduleWork::NotNeeded,
            "request before will_check is covered by the source check"
        );
        assert!(dedup.on_delayed_work_requested());
    }

    #[test]
    fn test_request_after_check_keeps_loop_awake() {
        let dedup = bound();
        dedup.on_work_started();
        dedup.will_check_for_more_work();

        assert_eq!(dedup.on_work_requested(), ShouldScheduleWork::NotNeeded);
        assert_eq!(
            dedup.did_check_for_more_work(false),
            ShouldScheduleWork::ScheduleImmediate
        );
        // The loop does not sleep, so later requests stay deduplicated.
        assert_eq!(dedup.on_work_requested(), ShouldScheduleWork::NotNeeded);
    }

    #[test]
    fn test_unbound_never_schedules() {
        let dedup = bound();
        assert!(dedup.is_bound());
        dedup.unbind();
        assert!(!dedup.is_bound());
        assert_eq!(dedup.on_work_requested(), ShouldScheduleWork::NotNeeded);
    }

    #[derive(Clone, Copy, Debug)]
    enum Step {
        Request,
        DoWork { immediate: bool },
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            Just(Step::Request),
            any::<bool>().prop_map(|immediate| Step::DoWork { immediate }),
        ]
    }

    proptest! {
        // Each time the loop goes idle allows at most one new wake.
        #[test]
        fn prop_at_most_one_wake_per_idle(steps in proptest::collection::vec(step(), 1..128)) {
            let dedup = bound();
            let mut wakes = 0usize;
            let mut idles = 0usize;

            for step in steps {
                match step {
                    Step::Request => {
                        if dedup.on_work_requested() == ShouldScheduleWork::ScheduleImmediate {
                            wakes += 1;
                        }
                    }
                    Step::DoWork { immediate } => {
                        dedup.on_work_started();
                        dedup.will_check_for_more_work();
                        if dedup.did_check_for_more_work(immediate) == ShouldScheduleWork::NotNeeded {
                            idles += 1;
                        }
                    }
                }
            }

            prop_assert!(wakes <= idles + 1, "wakes {} idles {}", wakes, idles);
        }
    }
}
