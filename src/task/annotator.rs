//! Instrumentation around task execution.
//!
//! Every application task runs inside a `run_task` tracing span and between
//! `will_process_task`/`did_process_task` observer notifications. The
//! bracket is closed by a drop guard, so a panicking task still leaves the
//! running-task stack and the observers balanced.

use super::{Nestable, PendingTask};
use crate::time::TimeTicks;

use std::cell::RefCell;
use std::panic::Location;
use std::rc::Rc;
use tracing::trace_span;

/// What observers and `current_task` can learn about a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskInfo {
    pub sequence_num: u64,
    pub posted_from: &'static Location<'static>,
    pub delayed_run_time: TimeTicks,
    pub nestable: Nestable,
}

impl From<&PendingTask> for TaskInfo {
    fn from(task: &PendingTask) -> Self {
        Self {
            sequence_num: task.sequence_num,
            posted_from: task.posted_from,
            delayed_run_time: task.delayed_run_time,
            nestable: task.nestable,
        }
    }
}

/// Notified around every application task run by a controller.
pub trait TaskObserver {
    fn will_process_task(&self, task: &TaskInfo);
    fn did_process_task(&self, task: &TaskInfo);
}

#[derive(Default)]
pub struct TaskAnnotator {
    observers: RefCell<Vec<Rc<dyn TaskObserver>>>,
    running: RefCell<Vec<TaskInfo>>,
}

impl TaskAnnotator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_observer(&self, observer: Rc<dyn TaskObserver>) {
        self.observers.borrow_mut().push(observer);
    }

    pub fn remove_observer(&self, observer: &Rc<dyn TaskObserver>) {
        self.observers
            .borrow_mut()
            .retain(|existing| !Rc::ptr_eq(existing, observer));
    }

    /// The innermost task currently running on this thread.
    pub fn current_task(&self) -> Option<TaskInfo> {
        self.running.borrow().last().copied()
    }

    /// Runs `task` with the span and observer bracket.
    pub fn run_task(&self, task: PendingTask) {
        let info = TaskInfo::from(&task);
        let span = trace_span!(
            "run_task",
            sequence_num = info.sequence_num,
            posted_from = %info.posted_from
        );
        let _entered = span.enter();

        // Observers may be added or removed from inside a task.
        let observers = self.observers.borrow().clone();
        for observer in &observers {
            observer.will_process_task(&info);
        }
        self.running.borrow_mut().push(info);

        let _bracket = RunningTask {
            annotator: self,
            observers,
            info,
        };
        task.run();
    }
}

struct RunningTask<'a> {
    annotator: &'a TaskAnnotator,
    observers: Vec<Rc<dyn TaskObserver>>,
    info: TaskInfo,
}

impl Drop for RunningTask<'_> {
    fn drop(&mut self) {
        self.annotator.running.borrow_mut().pop();
        for observer in &self.observers {
            observer.did_process_task(&self.info);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[derive(Default)]
    struct Counting {
        will: Cell<usize>,
        did: Cell<usize>,
    }

    impl TaskObserver for Counting {
        fn will_process_task(&self, _: &TaskInfo) {
            self.will.set(self.will.get() + 1);
        }

        fn did_process_task(&self, _: &TaskInfo) {
            self.did.set(self.did.get() + 1);
        }
    }

    #[test]
    fn test_bracket_survives_panic() {
        let annotator = TaskAnnotator::new();
        let observer = Rc::new(Counting::default());
        annotator.add_observer(observer.clone());

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            annotator.run_task(PendingTask::new(|| panic!("task failure")));
        }));

        assert!(result.is_err());
        assert_eq!(observer.will.get(), 1);
        assert_eq!(observer.did.get(), 1, "did_process_task must run on unwind");
        assert!(annotator.current_task().is_none());
    }
}
