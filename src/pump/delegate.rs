//! The contract between a [`NativePump`](super::NativePump) and the code it
//! drives.

use crate::time::TimeTicks;

use std::time::Duration;

/// What a delegate reports after a `do_work` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NextWorkInfo {
    /// Null when more work is ready now, max when nothing is scheduled.
    pub delayed_run_time: TimeTicks,
    pub leeway: Duration,
    /// The clock value sampled during `do_work`, null if none was taken.
    pub recent_now: TimeTicks,
    /// Asks the pump to look at native events before calling `do_work` again.
    pub yield_to_native: bool,
}

impl NextWorkInfo {
    pub fn immediate() -> Self {
        Self {
            delayed_run_time: TimeTicks::null(),
            leeway: Duration::ZERO,
            recent_now: TimeTicks::null(),
            yield_to_native: false,
        }
    }

    pub fn none() -> Self {
        Self {
            delayed_run_time: TimeTicks::max(),
            ..Self::immediate()
        }
    }

    pub fn is_immediate(&self) -> bool {
        self.delayed_run_time.is_null()
    }
}

/// Implemented by whatever a pump drives, normally a
/// [`ThreadController`](crate::controller::ThreadController).
pub trait PumpDelegate {
    /// Runs one batch of work and reports when the next batch is due.
    fn do_work(&self) -> NextWorkInfo;

    /// Called right before the pump sleeps, only after a `do_work` that
    /// reported no immediate work.
    fn do_idle_work(&self);

    /// Opens a work-item bracket. Prefer [`ScopedWorkItem::new`].
    fn begin_work_item(&self);

    fn end_work_item(&self);

    /// Number of active `run` invocations on this delegate's thread.
    fn run_depth(&self) -> usize;
}

/// Balanced `begin_work_item`/`end_work_item` pair.
///
/// The end call happens on drop, including when a work item unwinds.
#[must_use = "dropping the guard ends the work item immediately"]
pub struct ScopedWorkItem<'a> {
    delegate: &'a dyn PumpDelegate,
}

impl<'a> ScopedWorkItem<'a> {
    pub fn new(delegate: &'a dyn PumpDelegate) -> Self {
        delegate.begin_work_item();
        Self { delegate }
    }
}

impl Drop for ScopedWorkItem<'_> {
    fn drop(&mut self) {
        self.delegate.end_work_item();
    }
}
