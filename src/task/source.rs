use super::{PendingTask, WakeUp};
use crate::time::LazyNow;

/// Producer of ready-to-run tasks for a [`ThreadController`].
///
/// Posting into a source happens on arbitrary threads, so implementations
/// carry their own synchronization. Everything in this trait is called on the
/// controller's thread only.
///
/// [`ThreadController`]: crate::controller::ThreadController
pub trait SequencedTaskSource {
    /// Removes and returns the next task that is ready at `lazy_now`.
    ///
    /// Tasks with equal run times come out in post order.
    fn select_next_task(&self, lazy_now: &mut LazyNow<'_>) -> Option<PendingTask>;

    /// Bookkeeping after a task returned by `select_next_task` finished.
    fn did_run_task(&self, lazy_now: &mut LazyNow<'_>);

    /// Returns when the source next needs to run.
    ///
    /// `None` means there is no work at all; an immediate [`WakeUp`] means a
    /// task is ready now.
    fn delay_till_next_task(&self, lazy_now: &mut LazyNow<'_>) -> Option<WakeUp>;

    fn has_pending_high_resolution_tasks(&self) -> bool;

    /// Last chance to produce work before the thread sleeps.
    ///
    /// Returns `true` if new immediate work became available.
    fn on_system_idle(&self) -> bool;
}
