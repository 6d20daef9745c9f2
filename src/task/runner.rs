//! Posting handle for a thread's task queue.

use super::queue::Enqueued;
use super::{DelayPolicy, Nestable, PendingTask, TaskQueue};
use crate::controller::{ControllerHandle, ThreadController, context};
use crate::time::TimeTicks;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Posts tasks to one controller's queue from any thread.
///
/// Every post wakes the controller as needed. Posting after the owning
/// executor shut down returns `false` and drops the task.
///
/// # Example
///
/// ```ignore
/// let runner = TaskRunner::current().expect("no executor on this thread");
/// runner.post_task(|| println!("now"));
/// runner.post_delayed_task(|| println!("later"), Duration::from_millis(50));
/// ```
#[derive(Clone)]
pub struct TaskRunner {
    queue: Arc<TaskQueue>,
    handle: ControllerHandle,
}

impl TaskRunner {
    pub fn new(queue: Arc<TaskQueue>, handle: ControllerHandle) -> Self {
        Self { queue, handle }
    }

    /// The default runner of the current thread's executor.
    pub fn current() -> Option<Self> {
        context::current_task_runner()
    }

    #[track_caller]
    pub fn post_task(&self, task: impl FnOnce() + Send + 'static) -> bool {
        self.post_pending_task(PendingTask::new(task))
    }

    /// Posts `task` to run no sooner than `delay` from now.
    #[track_caller]
    pub fn post_delayed_task(&self, task: impl FnOnce() + Send + 'static, delay: Duration) -> bool {
        let task = PendingTask::new(task).with_run_time(self.run_time_after(delay));
        self.post_pending_task(task)
    }

    /// Posts a task that never runs inside a nested run loop.
    #[track_caller]
    pub fn post_non_nestable_task(&self, task: impl FnOnce() + Send + 'static) -> bool {
        self.post_pending_task(PendingTask::new(task).with_nestable(Nestable::NonNestable))
    }

    #[track_caller]
    pub fn post_non_nestable_delayed_task(
        &self,
        task: impl FnOnce() + Send + 'static,
        delay: Duration,
    ) -> bool {
        let task = PendingTask::new(task)
            .with_run_time(self.run_time_after(delay))
            .with_nestable(Nestable::NonNestable);
        self.post_pending_task(task)
    }

    /// Posts a delayed task that asks for a precise, uncoalesced wake-up.
    #[track_caller]
    pub fn post_precise_delayed_task(
        &self,
        task: impl FnOnce() + Send + 'static,
        delay: Duration,
    ) -> bool {
        let task = PendingTask::new(task)
            .with_run_time(self.run_time_after(delay))
            .with_delay_policy(DelayPolicy::Precise)
            .with_leeway(Duration::ZERO);
        self.post_pending_task(task)
    }

    /// Posts a task that runs once the thread has nothing else to do.
    #[track_caller]
    pub fn post_idle_task(&self, task: impl FnOnce() + Send + 'static) -> bool {
        let accepted = self.queue.push_idle(PendingTask::new(task)).accepted();
        if accepted {
            // The loop may already be asleep past its idle step.
            self.handle.schedule_work();
        }
        accepted
    }

    /// Posts a fully described task.
    pub fn post_pending_task(&self, task: PendingTask) -> bool {
        match self.queue.push(task) {
            Enqueued::Rejected => {
                trace!("task posted after shutdown dropped");
                false
            }
            Enqueued::Delayed { new_head: true } => {
                self.on_delayed_head_changed();
                true
            }
            Enqueued::Delayed { new_head: false } => true,
            Enqueued::Immediate | Enqueued::Idle => {
                self.handle.schedule_work();
                true
            }
        }
    }

    /// Whether tasks posted here run on the calling thread.
    pub fn runs_tasks_in_current_sequence(&self) -> bool {
        self.handle.runs_on_current_thread()
    }

    pub fn controller_handle(&self) -> &ControllerHandle {
        &self.handle
    }

    fn run_time_after(&self, delay: Duration) -> TimeTicks {
        if delay.is_zero() {
            return TimeTicks::null();
        }
        TimeTicks::from(self.queue.clock().now_ticks()).saturating_add(delay)
    }

    fn on_delayed_head_changed(&self) {
        // On the loop thread the controller reprograms the pump directly;
        // elsewhere a wake makes the loop recompute its deadline.
        let controller = if self.runs_tasks_in_current_sequence() {
            ThreadController::current().filter(|controller| controller.handle().same_controller(&self.handle))
        } else {
            None
        };

        match controller {
            Some(controller) => controller.on_delayed_head_changed(),
            None => self.handle.schedule_work(),
        }
    }
}

impl fmt::Debug for TaskRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRunner")
            .field("controller", &self.handle)
            .field("queued", &self.queue.len())
            .finish()
    }
}
