//! Application-facing run loop on top of the thread's controller.
//!
//! A [`RunLoop`] is a one-shot: it runs once, and a quit that arrives before
//! `run` makes `run` return immediately. Each active `RunLoop` is pushed on
//! the controller's stack, so `quit` on an outer loop while an inner one runs
//! only takes effect once the inner loop returns.
//!
//! Nested loops are a programming hazard: a task that spins a nested loop
//! lets other tasks run in the middle of it. A nested `run` is therefore only
//! accepted from a [`RunLoopType::NestableTasksAllowed`] loop or inside a
//! [`ScopedNestableTaskAllower`]; anything else fails a debug assertion.
//!
//! # Example
//!
//! ```ignore
//! use runloop::{RunLoop, TaskExecutorBuilder};
//!
//! let executor = TaskExecutorBuilder::new().build()?;
//! let run_loop = RunLoop::new();
//! let quit = run_loop.quit_closure();
//!
//! executor.task_runner().post_task(move || {
//!     println!("ran");
//!     quit();
//! });
//! run_loop.run();
//! ```

use crate::controller::ThreadController;
use crate::task::TaskRunner;

use std::fmt;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracing::{trace, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RunLoopType {
    #[default]
    Default,
    /// Runs application tasks even when nested inside another task.
    NestableTasksAllowed,
}

/// State of one `RunLoop`, shared with the controller's stack and with quit
/// closures on other threads.
pub(crate) struct RunLoopState {
    origin: ThreadId,
    kind: RunLoopType,
    running: AtomicBool,
    quit_called: AtomicBool,
    quit_when_idle: AtomicBool,
    runner: Option<TaskRunner>,
}

impl RunLoopState {
    pub(crate) fn quit_when_idle_requested(&self) -> bool {
        self.quit_when_idle.load(Ordering::SeqCst)
    }

    fn on_origin_thread(&self) -> bool {
        thread::current().id() == self.origin
    }

    fn quit(self: &Arc<Self>) {
        if !self.on_origin_thread() {
            let state = self.clone();
            self.post_to_origin("quit", move || state.quit());
            return;
        }

        self.quit_called.store(true, Ordering::SeqCst);
        if !self.running.load(Ordering::SeqCst) {
            return;
        }

        // Only the innermost loop is quit now; outer ones follow as inner
        // loops return.
        if let Some(controller) = ThreadController::current() {
            let is_top = controller
                .top_run_loop()
                .is_some_and(|top| Arc::ptr_eq(&top, self));
            if is_top {
                controller.quit();
            }
        }
    }

    fn quit_when_idle(self: &Arc<Self>) {
        if !self.on_origin_thread() {
            let state = self.clone();
            self.post_to_origin("quit_when_idle", move || state.quit_when_idle());
            return;
        }

        self.quit_when_idle.store(true, Ordering::SeqCst);
    }

    fn post_to_origin(&self, what: &'static str, task: impl FnOnce() + Send + 'static) {
        let posted = self
            .runner
            .as_ref()
            .is_some_and(|runner| runner.post_task(task));
        if !posted {
            warn!(what, "could not reach the run loop's thread");
        }
    }
}

/// Runs the current thread's controller until quit.
#[derive(Clone)]
pub struct RunLoop {
    state: Arc<RunLoopState>,
}

impl RunLoop {
    pub fn new() -> Self {
        Self::with_type(RunLoopType::Default)
    }

    pub fn with_type(kind: RunLoopType) -> Self {
        Self {
            state: Arc::new(RunLoopState {
                origin: thread::current().id(),
                kind,
                running: AtomicBool::new(false),
                quit_called: AtomicBool::new(false),
                quit_when_idle: AtomicBool::new(false),
                runner: TaskRunner::current(),
            }),
        }
    }

    pub fn kind(&self) -> RunLoopType {
        self.state.kind
    }

    /// Runs until [`quit`](Self::quit) is called.
    ///
    /// Returns immediately if quit was already called.
    ///
    /// # Panics
    ///
    /// Panics when called from another thread than the one that created the
    /// loop, when no controller is bound to this thread, or when the loop is
    /// already running.
    pub fn run(&self) {
        self.run_with_timeout(None);
    }

    /// Runs until quit or until `timeout` elapses.
    pub fn run_for(&self, timeout: Duration) {
        self.run_with_timeout(Some(timeout));
    }

    /// Runs until there is nothing left to do right now.
    pub fn run_until_idle(&self) {
        let previous = self.state.quit_when_idle.swap(true, Ordering::SeqCst);
        self.run();
        self.state.quit_when_idle.store(previous, Ordering::SeqCst);
    }

    fn run_with_timeout(&self, timeout: Option<Duration>) {
        let state = &self.state;
        assert!(
            state.on_origin_thread(),
            "RunLoop::run called off the thread that created it"
        );
        let Some(controller) = ThreadController::current() else {
            panic!("RunLoop::run requires a ThreadController bound to this thread");
        };

        if state.quit_called.load(Ordering::SeqCst) {
            return;
        }
        assert!(
            !state.running.swap(true, Ordering::SeqCst),
            "RunLoop::run called on a running loop"
        );

        let depth = controller.push_run_loop(state.clone());
        let _active = ActiveRunLoop {
            controller: &controller,
            state,
        };

        let nested = depth > 1;
        if nested {
            debug_assert!(
                state.kind == RunLoopType::NestableTasksAllowed
                    || controller.task_execution_allowed(),
                "nested RunLoop::run needs RunLoopType::NestableTasksAllowed \
                 or a ScopedNestableTaskAllower"
            );
        }
        trace!(depth, ?timeout, "run loop started");

        let application_tasks_allowed = !nested || state.kind == RunLoopType::NestableTasksAllowed;
        controller.run(application_tasks_allowed, timeout);
    }

    /// Makes `run` return once the current task finishes.
    ///
    /// May be called from any thread; off the origin thread it is posted as
    /// a task.
    pub fn quit(&self) {
        self.state.quit();
    }

    /// Makes `run` return once there is no immediate work left.
    pub fn quit_when_idle(&self) {
        self.state.quit_when_idle();
    }

    /// A `Send` closure calling [`quit`](Self::quit).
    pub fn quit_closure(&self) -> impl Fn() + Send + Sync + Clone + 'static {
        let state = self.state.clone();
        move || state.quit()
    }

    /// A `Send` closure calling [`quit_when_idle`](Self::quit_when_idle).
    pub fn quit_when_idle_closure(&self) -> impl Fn() + Send + Sync + Clone + 'static {
        let state = self.state.clone();
        move || state.quit_when_idle()
    }

    pub fn is_running(&self) -> bool {
        self.state.running.load(Ordering::SeqCst)
    }

    pub fn any_quit_called(&self) -> bool {
        self.state.quit_called.load(Ordering::SeqCst)
    }

    /// Quits the innermost loop running on this thread.
    ///
    /// # Panics
    ///
    /// Panics if no loop is running on this thread.
    pub fn quit_current() {
        Self::innermost().quit();
    }

    /// Quits the innermost loop running on this thread once it is idle.
    pub fn quit_current_when_idle() {
        Self::innermost().quit_when_idle();
    }

    pub fn is_running_on_current_thread() -> bool {
        ThreadController::current().is_some_and(|controller| controller.run_loop_depth() > 0)
    }

    pub fn is_nested_on_current_thread() -> bool {
        ThreadController::current().is_some_and(|controller| controller.run_loop_depth() > 1)
    }

    fn innermost() -> Arc<RunLoopState> {
        match ThreadController::current().and_then(|controller| controller.top_run_loop()) {
            Some(state) => state,
            None => panic!("no RunLoop is running on this thread"),
        }
    }
}

impl Default for RunLoop {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RunLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunLoop")
            .field("kind", &self.state.kind)
            .field("running", &self.is_running())
            .field("quit_called", &self.any_quit_called())
            .finish()
    }
}

// Unregisters a loop when its `run` returns, and hands a pending quit on to
// the loop it was nested in.
struct ActiveRunLoop<'a> {
    controller: &'a Rc<ThreadController>,
    state: &'a Arc<RunLoopState>,
}

impl Drop for ActiveRunLoop<'_> {
    fn drop(&mut self) {
        self.controller.pop_run_loop();
        self.state.running.store(false, Ordering::SeqCst);
        trace!("run loop finished");

        if thread::panicking() {
            return;
        }
        let outer_quit = self
            .controller
            .top_run_loop()
            .is_some_and(|outer| outer.quit_called.load(Ordering::SeqCst));
        if outer_quit {
            self.controller.quit();
        }
    }
}

/// Lets a nested loop started in the current task run application tasks.
///
/// Restores the previous setting on drop.
pub struct ScopedNestableTaskAllower {
    controller: Rc<ThreadController>,
    previous: bool,
}

impl ScopedNestableTaskAllower {
    /// # Panics
    ///
    /// Panics if no controller is bound to this thread.
    pub fn new() -> Self {
        let Some(controller) = ThreadController::current() else {
            panic!("ScopedNestableTaskAllower requires a ThreadController bound to this thread");
        };
        let previous = controller.task_execution_allowed();
        controller.set_task_execution_allowed(true);

        Self {
            controller,
            previous,
        }
    }
}

impl Default for ScopedNestableTaskAllower {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ScopedNestableTaskAllower {
    fn drop(&mut self) {
        self.controller.set_task_execution_allowed(self.previous);
    }
}
