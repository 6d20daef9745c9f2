use super::context;
use super::dedup::{ShouldScheduleWork, WorkDeduplicator};
use crate::pump::{PumpStats, WakeHandle};

use std::fmt;
use std::sync::{Arc, OnceLock};
use std::thread::{self, ThreadId};
use tracing::trace;

/// The part of a controller other threads may touch.
pub(crate) struct ControllerShared {
    pub(crate) dedup: WorkDeduplicator,
    pub(crate) waker: OnceLock<WakeHandle>,
    pub(crate) thread: OnceLock<ThreadId>,
}

/// A `Send + Sync` reference to a [`ThreadController`] for waking it from
/// any thread.
///
/// # Example
///
/// ```ignore
/// let handle = controller.handle();
/// std::thread::spawn(move || {
///     queue.push(PendingTask::new(|| println!("hello")));
///     handle.schedule_work();
/// });
/// ```
///
/// [`ThreadController`]: super::ThreadController
#[derive(Clone)]
pub struct ControllerHandle {
    shared: Arc<ControllerShared>,
}

impl ControllerHandle {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(ControllerShared {
                dedup: WorkDeduplicator::new(),
                waker: OnceLock::new(),
                thread: OnceLock::new(),
            }),
        }
    }

    pub(crate) fn shared(&self) -> &ControllerShared {
        &self.shared
    }

    /// The handle of the controller bound to `thread`, if any.
    pub fn for_thread(thread: ThreadId) -> Option<Self> {
        context::handle_for_thread(thread)
    }

    /// Ensures the controller runs `do_work` at least once more.
    ///
    /// Cheap and non-blocking: only the first request since the controller
    /// last went idle signals the native wake primitive.
    pub fn schedule_work(&self) {
        if self.shared.dedup.on_work_requested() != ShouldScheduleWork::ScheduleImmediate {
            return;
        }

        if let Some(waker) = self.shared.waker.get() {
            trace!("waking thread controller");
            waker.wake();
        }
    }

    /// The thread the controller was bound to.
    pub fn thread_id(&self) -> Option<ThreadId> {
        self.shared.thread.get().copied()
    }

    pub fn runs_on_current_thread(&self) -> bool {
        self.thread_id() == Some(thread::current().id())
    }

    /// Statistics of the bound pump.
    pub fn pump_stats(&self) -> Option<PumpStats> {
        self.shared.waker.get().map(WakeHandle::stats)
    }

    pub fn same_controller(&self, other: &ControllerHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl fmt::Debug for ControllerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerHandle")
            .field("thread", &self.thread_id())
            .finish()
    }
}
