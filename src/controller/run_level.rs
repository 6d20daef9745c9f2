//! Tracks what each nested run level of a controller is doing.
//!
//! A run level is pushed for every `run` invocation. A work item that starts
//! while the top level is already running a task means something nested a
//! loop without going through `run` (a native modal loop, a watcher callback
//! pumping events), so a level is pushed for it as well and popped when that
//! work item ends.

use std::cell::RefCell;
use tracing::trace;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunLevelState {
    Idle,
    SelectingNextTask,
    RunningTask,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RunLevel {
    pub state: RunLevelState,
    pub depth: usize,
}

#[derive(Debug, Default)]
pub struct RunLevelTracker {
    levels: RefCell<Vec<RunLevel>>,
}

impl RunLevelTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_run_loop_started(&self) {
        self.push(RunLevelState::SelectingNextTask);
    }

    pub fn on_run_loop_ended(&self) {
        let popped = self.levels.borrow_mut().pop();
        debug_assert!(popped.is_some(), "run loop ended without a run level");
    }

    pub fn on_work_started(&self) {
        let top = self.top_state();
        match top {
            // Work outside of any run loop, e.g. a test calling do_work directly.
            None => {}
            Some(RunLevelState::RunningTask) => self.push(RunLevelState::RunningTask),
            Some(_) => self.set_top(RunLevelState::RunningTask),
        }
    }

    pub fn on_work_ended(&self) {
        let num_levels = self.num_run_levels();
        if num_levels == 0 {
            return;
        }

        // A level pushed by `on_work_started` is not running once its item ends.
        if num_levels > 1 && self.top_state() != Some(RunLevelState::RunningTask) {
            self.levels.borrow_mut().pop();
        }
        self.set_top(RunLevelState::SelectingNextTask);
    }

    pub fn on_idle(&self) {
        match self.top_state() {
            None => {}
            Some(RunLevelState::RunningTask) => self.push(RunLevelState::Idle),
            Some(_) => self.set_top(RunLevelState::Idle),
        }
    }

    pub fn num_run_levels(&self) -> usize {
        self.levels.borrow().len()
    }

    pub fn top(&self) -> Option<RunLevel> {
        self.levels.borrow().last().copied()
    }

    fn top_state(&self) -> Option<RunLevelState> {
        self.top().map(|level| level.state)
    }

    fn push(&self, state: RunLevelState) {
        let mut levels = self.levels.borrow_mut();
        let depth = levels.len() + 1;
        trace!(depth, ?state, "run level pushed");
        levels.push(RunLevel { state, depth });
    }

    fn set_top(&self, state: RunLevelState) {
        if let Some(level) = self.levels.borrow_mut().last_mut() {
            level.state = state;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_run_level() {
        let tracker = RunLevelTracker::new();
        tracker.on_run_loop_started();
        assert_eq!(tracker.num_run_levels(), 1);

        tracker.on_work_started();
        assert_eq!(tracker.top().map(|l| l.state), Some(RunLevelState::RunningTask));
        tracker.on_work_ended();
        assert_eq!(tracker.top().map(|l| l.state), Some(RunLevelState::SelectingNextTask));

        tracker.on_idle();
        assert_eq!(tracker.top().map(|l| l.state), Some(RunLevelState::Idle));

        tracker.on_run_loop_ended();
        assert_eq!(tracker.num_run_levels(), 0);
    }

    #[test]
    fn test_native_nesting_pushes_level() {
        let tracker = RunLevelTracker::new();
        tracker.on_run_loop_started();
        tracker.on_work_started();

        // A native loop inside the task runs its own work items.
        tracker.on_work_started();
        assert_eq!(tracker.num_run_levels(), 2);
        tracker.on_work_ended();
        assert_eq!(tracker.num_run_levels(), 2, "nested level stays while it selects");

        tracker.on_idle();
        tracker.on_work_started();
        tracker.on_work_ended();
        assert_eq!(tracker.num_run_levels(), 2);

        // The outer task finishes: the nested level is unwound.
        tracker.on_work_ended();
        assert_eq!(tracker.num_run_levels(), 1);
        assert_eq!(tracker.top().map(|l| l.state), Some(RunLevelState::SelectingNextTask));
    }

    #[test]
    fn test_work_outside_run_loop_is_ignored() {
        let tracker = RunLevelTracker::new();
        tracker.on_work_started();
        tracker.on_work_ended();
        tracker.on_idle();
        assert_eq!(tracker.num_run_levels(), 0);
    }
}
