//! The thread controller: the state machine between a pump and a task source.
//!
//! A [`ThreadController`] is created unbound, then bound to the current
//! thread together with the [`NativePump`] it will own. From then on it is
//! the pump's [`PumpDelegate`]:
//!
//! - `do_work` runs up to `work_batch_size` tasks and reports when the next
//!   task is due,
//! - `do_idle_work` gives the source a last chance to produce work and honours
//!   quit-when-idle,
//! - work items are bracketed so nested native loops are detected.
//!
//! Wake requests from any thread go through a [`ControllerHandle`] and the
//! [`WorkDeduplicator`](dedup::WorkDeduplicator), which keeps at most one
//! native wake outstanding.
//!
//! # Example
//!
//! ```ignore
//! use runloop::controller::ThreadController;
//! use runloop::pump::{NativePump, PumpType};
//! use runloop::task::{SequencedTaskSource, TaskQueue};
//! use runloop::time::SystemTickClock;
//! use std::sync::Arc;
//!
//! let clock = Arc::new(SystemTickClock);
//! let queue = Arc::new(TaskQueue::new(clock.clone()));
//! let source: Arc<dyn SequencedTaskSource> = queue.clone();
//!
//! let controller = ThreadController::new(clock);
//! controller.set_sequenced_task_source(Arc::downgrade(&source));
//! controller.bind_to_current_thread(NativePump::new(PumpType::Default)?);
//! ```

pub mod dedup;
pub mod run_level;

pub(crate) mod context;
mod handle;

pub use handle::ControllerHandle;

use self::dedup::ShouldScheduleWork;
use self::run_level::RunLevelTracker;
use crate::error::Result;
use crate::pump::{
    FdWatchController, FdWatcher, NativePump, NextWorkInfo, PumpDelegate, PumpStats,
    ScopedWorkItem, WatchMode,
};
use crate::run_loop::RunLoopState;
use crate::task::{Nestable, PendingTask, SequencedTaskSource, TaskAnnotator, TaskInfo, TaskObserver, WakeUp};
use crate::time::{LazyNow, TickClock, TimeTicks};

use std::cell::{Cell, OnceCell, RefCell};
use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use tracing::{debug, trace};

/// Longest delay ever handed to the pump; longer waits are re-armed.
pub const MAX_DELAYED_WORK_HORIZON: Duration = Duration::from_secs(24 * 60 * 60);

pub struct ThreadController {
    handle: ControllerHandle,
    pump: OnceCell<NativePump>,
    task_source: RefCell<Option<Weak<dyn SequencedTaskSource>>>,
    clock: Arc<dyn TickClock>,
    annotator: TaskAnnotator,
    run_levels: RunLevelTracker,
    work_batch_size: Cell<usize>,
    task_execution_allowed: Cell<bool>,
    quit_pending: Cell<bool>,
    /// Timeout of the innermost `run`, max when it has none.
    quit_runloop_after: Cell<TimeTicks>,
    /// Last delayed deadline reported to the pump.
    next_delayed_do_work: Cell<TimeTicks>,
    nesting_depth: Cell<usize>,
    deferred_non_nestable: RefCell<VecDeque<PendingTask>>,
    run_loops: RefCell<Vec<Arc<RunLoopState>>>,
}

impl ThreadController {
    /// Creates an unbound controller reading time from `clock`.
    pub fn new(clock: Arc<dyn TickClock>) -> Rc<Self> {
        Rc::new(Self {
            handle: ControllerHandle::new(),
            pump: OnceCell::new(),
            task_source: RefCell::new(None),
            clock,
            annotator: TaskAnnotator::new(),
            run_levels: RunLevelTracker::new(),
            work_batch_size: Cell::new(1),
            task_execution_allowed: Cell::new(true),
            quit_pending: Cell::new(false),
            quit_runloop_after: Cell::new(TimeTicks::max()),
            next_delayed_do_work: Cell::new(TimeTicks::max()),
            nesting_depth: Cell::new(0),
            deferred_non_nestable: RefCell::new(VecDeque::new()),
            run_loops: RefCell::new(Vec::new()),
        })
    }

    /// The controller bound to the current thread.
    pub fn current() -> Option<Rc<Self>> {
        context::current_controller()
    }

    /// Takes ownership of `pump` and makes this the thread's controller.
    ///
    /// Work requested before binding is scheduled right away.
    ///
    /// # Panics
    ///
    /// Panics if this controller is already bound, or if another controller
    /// is bound to the current thread.
    pub fn bind_to_current_thread(self: &Rc<Self>, pump: NativePump) {
        assert!(self.pump.get().is_none(), "ThreadController is already bound");
        context::bind_current_controller(self.clone());

        let shared = self.handle.shared();
        let _ = shared.waker.set(pump.wake_handle());
        let _ = shared.thread.set(thread::current().id());
        let pump = self.pump.get_or_init(|| pump);
        debug!(pump_type = ?pump.pump_type(), "thread controller bound");

        if shared.dedup.bind() == ShouldScheduleWork::ScheduleImmediate {
            pump.schedule_work();
        }
    }

    /// Detaches the controller from the current thread.
    ///
    /// Wake requests are ignored from here on.
    ///
    /// # Panics
    ///
    /// Panics if the controller is still running.
    pub fn unbind_from_current_thread(&self) {
        assert_eq!(self.run_depth(), 0, "ThreadController unbound while running");

        self.handle.shared().dedup.unbind();
        context::unbind_current_controller(self);
        debug!("thread controller unbound");
    }

    /// Whether the controller is currently bound to its thread.
    ///
    /// Turns `false` again after [`Self::unbind_from_current_thread`], even
    /// though the pump stays owned by the controller.
    ///
    /// # Example
    /// ```ignore
    /// let controller = ThreadController::new(Arc::new(SystemTickClock));
    /// assert!(!controller.is_bound());
    /// controller.bind_to_current_thread(NativePump::new(PumpType::Default)?);
    /// assert!(controller.is_bound());
    /// ```
    pub fn is_bound(&self) -> bool {
        self.handle.shared().dedup.is_bound()
    }

    /// Wires the source tasks are taken from. One-time.
    ///
    /// # Panics
    ///
    /// Panics if a source is already set.
    ///
    /// # Example
    /// ```ignore
    /// let source: Arc<dyn SequencedTaskSource> = queue.clone();
    /// controller.set_sequenced_task_source(Arc::downgrade(&source));
    /// ```
    pub fn set_sequenced_task_source(&self, source: Weak<dyn SequencedTaskSource>) {
        let mut task_source = self.task_source.borrow_mut();
        assert!(task_source.is_none(), "task source already set");
        *task_source = Some(source);
    }

    /// A thread-safe handle for waking this controller from other threads.
    ///
    /// # Example
    /// ```ignore
    /// let handle = controller.handle();
    /// std::thread::spawn(move || handle.schedule_work());
    /// ```
    pub fn handle(&self) -> ControllerHandle {
        self.handle.clone()
    }

    /// The clock deadlines and timeouts are measured against.
    ///
    /// # Example
    /// ```ignore
    /// let mut lazy_now = LazyNow::new(controller.clock());
    /// let deadline = TimeTicks::from(lazy_now.now()).saturating_add(Duration::from_secs(1));
    /// ```
    pub fn clock(&self) -> &dyn TickClock {
        self.clock.as_ref()
    }

    /// Asks the pump to call `do_work` soon.
    ///
    /// Requests collapse: while a wake is outstanding or `do_work` is running,
    /// no further native wake is issued.
    ///
    /// # Example
    /// ```ignore
    /// controller.schedule_work();
    /// controller.schedule_work(); // no second wake
    /// ```
    pub fn schedule_work(&self) {
        self.handle.schedule_work();
    }

    /// Maximum number of tasks one `do_work` call runs.
    ///
    /// # Example
    /// ```ignore
    /// assert_eq!(ThreadController::new(Arc::new(SystemTickClock)).work_batch_size(), 1);
    /// ```
    pub fn work_batch_size(&self) -> usize {
        self.work_batch_size.get()
    }

    /// Sets how many tasks one `do_work` call may run before yielding.
    ///
    /// # Panics
    ///
    /// Panics if `work_batch_size` is zero.
    ///
    /// # Example
    /// ```ignore
    /// controller.set_work_batch_size(4);
    /// ```
    pub fn set_work_batch_size(&self, work_batch_size: usize) {
        assert!(work_batch_size >= 1, "work batch size must be at least 1");
        self.work_batch_size.set(work_batch_size);
    }

    /// Whether `do_work` may run application tasks right now.
    pub fn task_execution_allowed(&self) -> bool {
        self.task_execution_allowed.get()
    }

    /// Allows or forbids application tasks, e.g. around a native nested loop.
    ///
    /// Re-allowing always wakes the pump: the loop that forbade tasks may
    /// have gone to sleep with work pending.
    pub fn set_task_execution_allowed(&self, allowed: bool) {
        self.task_execution_allowed.set(allowed);
        if allowed {
            self.handle.shared().dedup.on_work_requested();
            if let Some(pump) = self.pump.get() {
                pump.schedule_work();
            }
        }
    }

    /// Runs the pump until quit.
    ///
    /// `application_tasks_allowed` lets a nested run execute tasks even though
    /// the task that started it forbade them. `timeout` quits the run once it
    /// elapses; it only applies to this invocation.
    ///
    /// # Panics
    ///
    /// Panics if the controller is not bound.
    pub fn run(&self, application_tasks_allowed: bool, timeout: Option<Duration>) {
        let pump = self.pump();
        let nested = pump.run_depth() > 0;

        let quit_runloop_after = match timeout {
            Some(timeout) => TimeTicks::from(self.clock.now_ticks()).saturating_add(timeout),
            None => TimeTicks::max(),
        };
        let override_allowed = application_tasks_allowed && !self.task_execution_allowed.get();

        let _scope = RunScope {
            controller: self,
            quit_runloop_after: self.quit_runloop_after.replace(quit_runloop_after),
            override_allowed,
            nested,
        };
        if override_allowed {
            self.task_execution_allowed.set(true);
        }
        if nested {
            self.on_begin_nested_run_loop();
        }
        self.run_levels.on_run_loop_started();

        pump.run(self);
    }

    /// Interrupts the current batch and makes the innermost run return.
    pub fn quit(&self) {
        self.quit_pending.set(true);
        self.pump().quit();
    }

    /// Reports the source's next deadline to the pump, if it needs one.
    ///
    /// Deadlines are capped at [`MAX_DELAYED_WORK_HORIZON`] and at the
    /// current run's timeout. Nothing is forwarded while the controller is in
    /// `do_work` or has an immediate wake pending, since the deadline is
    /// recomputed before the pump sleeps.
    pub fn set_next_delayed_do_work(&self, lazy_now: &mut LazyNow<'_>, wake_up: Option<WakeUp>) {
        let wake_up = match wake_up {
            Some(wake_up) if wake_up.is_immediate() => {
                self.schedule_work();
                return;
            }
            other => other,
        };

        let run_time = self.cap_delayed_run_time(lazy_now, wake_up.map_or(TimeTicks::max(), |w| w.time));
        if !self.handle.shared().dedup.on_delayed_work_requested() {
            return;
        }
        if run_time == self.next_delayed_do_work.replace(run_time) || run_time.is_max() {
            return;
        }

        trace!(?run_time, "forwarding delayed work to pump");
        self.pump().schedule_delayed_work(&NextWorkInfo {
            delayed_run_time: run_time,
            leeway: pump_leeway(wake_up),
            recent_now: TimeTicks::from(lazy_now.now()),
            yield_to_native: false,
        });
    }

    /// Registers an observer notified around every application task.
    ///
    /// # Example
    /// ```ignore
    /// let observer: Rc<dyn TaskObserver> = Rc::new(MyObserver);
    /// controller.add_task_observer(observer.clone());
    /// // ...
    /// controller.remove_task_observer(&observer);
    /// ```
    pub fn add_task_observer(&self, observer: Rc<dyn TaskObserver>) {
        self.annotator.add_observer(observer);
    }

    pub fn remove_task_observer(&self, observer: &Rc<dyn TaskObserver>) {
        self.annotator.remove_observer(observer);
    }

    /// The application task currently running on this controller.
    pub fn current_task(&self) -> Option<TaskInfo> {
        self.annotator.current_task()
    }

    /// Number of nested run loops entered through [`Self::run`].
    pub fn nesting_depth(&self) -> usize {
        self.nesting_depth.get()
    }

    /// Counters of the bound pump, `None` before binding.
    pub fn pump_stats(&self) -> Option<PumpStats> {
        self.pump.get().map(NativePump::stats)
    }

    /// Watches `fd` on the bound pump, which must be an I/O pump.
    pub fn watch_file_descriptor(
        &self,
        fd: RawFd,
        persistent: bool,
        mode: WatchMode,
        watcher: Rc<dyn FdWatcher>,
    ) -> Result<FdWatchController> {
        self.pump().watch_file_descriptor(fd, persistent, mode, watcher)
    }

    /// Re-evaluates the delayed deadline after a post made a new earliest
    /// delayed task, outside of `do_work`.
    pub(crate) fn on_delayed_head_changed(&self) {
        if !self.is_bound() {
            return;
        }
        let Some(source) = self.source() else {
            return;
        };

        let mut lazy_now = LazyNow::new(self.clock.as_ref());
        let wake_up = source.delay_till_next_task(&mut lazy_now);
        self.set_next_delayed_do_work(&mut lazy_now, wake_up);
    }

    pub(crate) fn push_run_loop(&self, run_loop: Arc<RunLoopState>) -> usize {
        let mut run_loops = self.run_loops.borrow_mut();
        run_loops.push(run_loop);
        run_loops.len()
    }

    pub(crate) fn pop_run_loop(&self) {
        self.run_loops.borrow_mut().pop();
    }

    pub(crate) fn top_run_loop(&self) -> Option<Arc<RunLoopState>> {
        self.run_loops.borrow().last().cloned()
    }

    pub(crate) fn run_loop_depth(&self) -> usize {
        self.run_loops.borrow().len()
    }

    fn pump(&self) -> &NativePump {
        match self.pump.get() {
            Some(pump) => pump,
            None => panic!("ThreadController used before bind_to_current_thread"),
        }
    }

    fn source(&self) -> Option<Arc<dyn SequencedTaskSource>> {
        self.task_source.borrow().as_ref().and_then(Weak::upgrade)
    }

    fn on_begin_nested_run_loop(&self) {
        let depth = self.nesting_depth.get() + 1;
        self.nesting_depth.set(depth);
        debug!(depth, "nested run loop started");
    }

    fn on_exit_nested_run_loop(&self) {
        let depth = self.nesting_depth.get().saturating_sub(1);
        self.nesting_depth.set(depth);
        debug!(depth, "nested run loop exited");

        if depth == 0 && !self.deferred_non_nestable.borrow().is_empty() {
            self.schedule_work();
        }
    }

    fn cap_delayed_run_time(&self, lazy_now: &mut LazyNow<'_>, run_time: TimeTicks) -> TimeTicks {
        let quit_runloop_after = self.quit_runloop_after.get();
        if run_time.is_max() && quit_runloop_after.is_max() {
            return run_time;
        }

        let horizon = TimeTicks::from(lazy_now.now()).saturating_add(MAX_DELAYED_WORK_HORIZON);
        run_time.min(horizon).min(quit_runloop_after)
    }

    /// Takes the next runnable task, dropping cancelled ones and deferring
    /// non-nestable ones while nested.
    fn select_task(&self, source: &dyn SequencedTaskSource, lazy_now: &mut LazyNow<'_>) -> Option<PendingTask> {
        let nested = self.nesting_depth.get() > 0;

        loop {
            let deferred = if nested {
                None
            } else {
                self.deferred_non_nestable.borrow_mut().pop_front()
            };
            let task = match deferred {
                Some(task) => task,
                None => source.select_next_task(lazy_now)?,
            };

            if task.is_cancelled() {
                trace!(sequence_num = task.sequence_num, "dropping cancelled task");
                drop(task);
                continue;
            }
            if nested && task.nestable == Nestable::NonNestable {
                trace!(sequence_num = task.sequence_num, "deferring non-nestable task");
                self.deferred_non_nestable.borrow_mut().push_back(task);
                continue;
            }
            return Some(task);
        }
    }

    fn run_task(&self, source: &dyn SequencedTaskSource, task: PendingTask, lazy_now: &mut LazyNow<'_>) {
        let _work_item = ScopedWorkItem::new(self);
        let _completion = TaskCompletion {
            controller: self,
            source,
            lazy_now,
            task_execution_allowed: self.task_execution_allowed.replace(false),
        };

        self.annotator.run_task(task);
    }

    /// Runs one batch. Returns whether the whole batch was used.
    fn run_batch(&self, source: &dyn SequencedTaskSource, lazy_now: &mut LazyNow<'_>) -> bool {
        let work_batch_size = self.work_batch_size.get();

        for _ in 0..work_batch_size {
            let Some(task) = self.select_task(source, lazy_now) else {
                return false;
            };
            self.run_task(source, task, lazy_now);

            // Quit takes effect between tasks, never inside one.
            if self.quit_pending.get() {
                return false;
            }
        }
        true
    }

    fn quit_if_timed_out(&self, lazy_now: &mut LazyNow<'_>) -> bool {
        let quit_runloop_after = self.quit_runloop_after.get();
        if quit_runloop_after.is_max() || TimeTicks::from(lazy_now.now()) < quit_runloop_after {
            return false;
        }

        trace!("run timeout reached");
        self.quit();
        true
    }

    fn should_quit_when_idle(&self) -> bool {
        self.top_run_loop()
            .is_some_and(|run_loop| run_loop.quit_when_idle_requested())
    }
}

impl PumpDelegate for ThreadController {
    fn do_work(&self) -> NextWorkInfo {
        let dedup = &self.handle.shared().dedup;
        dedup.on_work_started();

        let mut lazy_now = LazyNow::new(self.clock.as_ref());
        let source = self.source();

        let mut batch_exhausted = false;
        if let Some(source) = source.as_deref() {
            if self.task_execution_allowed.get() {
                batch_exhausted = self.run_batch(source, &mut lazy_now);
            }
        }

        if self.run_depth() > 0 && !self.quit_pending.get() {
            self.quit_if_timed_out(&mut lazy_now);
        }

        dedup.will_check_for_more_work();

        let nested = self.nesting_depth.get() > 0;
        let mut wake_up = match source.as_deref() {
            Some(source) if self.task_execution_allowed.get() => {
                if !nested && !self.deferred_non_nestable.borrow().is_empty() {
                    Some(WakeUp::immediate())
                } else {
                    source.delay_till_next_task(&mut lazy_now)
                }
            }
            _ => None,
        };
        if let Some(pending) = wake_up {
            if !pending.is_immediate() && pending.time <= TimeTicks::from(lazy_now.now()) {
                wake_up = Some(WakeUp::immediate());
            }
        }

        let immediate = wake_up.is_some_and(|w| w.is_immediate());
        if dedup.did_check_for_more_work(immediate) == ShouldScheduleWork::ScheduleImmediate {
            wake_up = Some(WakeUp::immediate());
        }

        let recent_now = if lazy_now.has_value() {
            TimeTicks::from(lazy_now.now())
        } else {
            TimeTicks::null()
        };

        match wake_up {
            Some(wake_up) if wake_up.is_immediate() => {
                self.next_delayed_do_work.set(TimeTicks::max());
                NextWorkInfo {
                    recent_now,
                    yield_to_native: batch_exhausted,
                    ..NextWorkInfo::immediate()
                }
            }
            wake_up => {
                let run_time = self.cap_delayed_run_time(
                    &mut lazy_now,
                    wake_up.map_or(TimeTicks::max(), |w| w.time),
                );
                self.next_delayed_do_work.set(run_time);
                NextWorkInfo {
                    delayed_run_time: run_time,
                    leeway: pump_leeway(wake_up),
                    recent_now,
                    yield_to_native: false,
                }
            }
        }
    }

    fn do_idle_work(&self) {
        self.run_levels.on_idle();

        if let Some(source) = self.source() {
            self.pump()
                .set_high_resolution_timer(source.has_pending_high_resolution_tasks());

            if source.on_system_idle() {
                self.schedule_work();
                return;
            }
        }

        let mut lazy_now = LazyNow::new(self.clock.as_ref());
        if self.quit_if_timed_out(&mut lazy_now) {
            return;
        }

        if self.should_quit_when_idle() {
            trace!("quitting idle run loop");
            self.quit();
        }
    }

    fn begin_work_item(&self) {
        self.run_levels.on_work_started();
    }

    fn end_work_item(&self) {
        self.run_levels.on_work_ended();
    }

    fn run_depth(&self) -> usize {
        self.pump.get().map_or(0, NativePump::run_depth)
    }
}

// Slack the pump may add to a deadline. Zero for precise wake-ups.
fn pump_leeway(wake_up: Option<WakeUp>) -> Duration {
    wake_up
        .and_then(|w| {
            let time = w.time.instant()?;
            let latest = w.latest_time().instant()?;
            Some(latest.saturating_duration_since(time))
        })
        .unwrap_or(Duration::ZERO)
}

impl std::fmt::Debug for ThreadController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadController")
            .field("bound", &self.is_bound())
            .field("run_depth", &self.run_depth())
            .field("nesting_depth", &self.nesting_depth.get())
            .field("work_batch_size", &self.work_batch_size.get())
            .finish_non_exhaustive()
    }
}

// Restores per-run state when `ThreadController::run` returns or unwinds.
struct RunScope<'a> {
    controller: &'a ThreadController,
    quit_runloop_after: TimeTicks,
    override_allowed: bool,
    nested: bool,
}

impl Drop for RunScope<'_> {
    fn drop(&mut self) {
        let controller = self.controller;

        controller.run_levels.on_run_loop_ended();
        controller.quit_pending.set(false);
        controller.quit_runloop_after.set(self.quit_runloop_after);
        if self.override_allowed {
            controller.task_execution_allowed.set(false);
        }
        if self.nested {
            controller.on_exit_nested_run_loop();
        }
    }
}

// Completes a task's bookkeeping even when the task unwinds.
struct TaskCompletion<'a, 'b, 'c> {
    controller: &'a ThreadController,
    source: &'a dyn SequencedTaskSource,
    lazy_now: &'b mut LazyNow<'c>,
    task_execution_allowed: bool,
}

impl Drop for TaskCompletion<'_, '_, '_> {
    fn drop(&mut self) {
        self.controller
            .task_execution_allowed
            .set(self.task_execution_allowed);
        self.source.did_run_task(self.lazy_now);
    }
}
