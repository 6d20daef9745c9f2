//! A bound controller, its pump and its default task queue, owned together.

use crate::controller::{ThreadController, context};
use crate::pump::{PumpStats, PumpType};
use crate::run_loop::RunLoop;
use crate::task::{SequencedTaskSource, TaskQueue, TaskRunner};

use std::rc::Rc;
use std::sync::Arc;
use tracing::debug;

/// Everything one thread needs to run tasks.
///
/// Creating it binds a [`ThreadController`] to the current thread and makes
/// its [`TaskRunner`] the thread's default. Dropping it shuts the queue down
/// (later posts return `false`) and unbinds the controller.
///
/// Built by [`TaskExecutorBuilder`](crate::TaskExecutorBuilder).
pub struct TaskExecutor {
    queue: Arc<TaskQueue>,
    controller: Rc<ThreadController>,
    runner: TaskRunner,
    pump_type: PumpType,
    previous_runner: Option<TaskRunner>,
}

impl TaskExecutor {
    pub(crate) fn new(
        queue: Arc<TaskQueue>,
        controller: Rc<ThreadController>,
        pump_type: PumpType,
    ) -> Self {
        let source: Arc<dyn SequencedTaskSource> = queue.clone();
        controller.set_sequenced_task_source(Arc::downgrade(&source));

        let runner = TaskRunner::new(queue.clone(), controller.handle());
        let previous_runner = context::replace_current_task_runner(Some(runner.clone()));

        Self {
            queue,
            controller,
            runner,
            pump_type,
            previous_runner,
        }
    }

    pub fn task_runner(&self) -> TaskRunner {
        self.runner.clone()
    }

    pub fn controller(&self) -> &Rc<ThreadController> {
        &self.controller
    }

    pub fn queue(&self) -> &Arc<TaskQueue> {
        &self.queue
    }

    pub fn pump_type(&self) -> PumpType {
        self.pump_type
    }

    pub fn stats(&self) -> PumpStats {
        self.controller.pump_stats().unwrap_or_default()
    }

    /// Runs every task that is ready now, then returns.
    pub fn run_until_idle(&self) {
        RunLoop::new().run_until_idle();
    }
}

impl Drop for TaskExecutor {
    fn drop(&mut self) {
        self.queue.shutdown();
        self.controller.unbind_from_current_thread();
        context::replace_current_task_runner(self.previous_runner.take());
        debug!("task executor shut down");
    }
}
