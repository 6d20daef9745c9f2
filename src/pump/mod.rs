//! The native pump: one thread's blocking wait, interleaved with software work.
//!
//! A [`NativePump`] drives a [`PumpDelegate`] by repeating, until quit:
//!
//! 1. dispatch at most one ready native event,
//! 2. ask the delegate for a batch of work (`do_work`),
//! 3. if nothing is immediately pending, let the delegate do idle work,
//! 4. block in the native wait until a native event, a wake-up from
//!    [`WakeHandle::wake`], or the next delayed deadline.
//!
//! Quit is checked after every step. Doing a single native dispatch before
//! every `do_work` bounds how long either source can starve the other.
//!
//! Two backends exist, chosen at construction:
//!
//! - [`PumpType::Default`]: software tasks only, waits on a condition variable.
//! - [`PumpType::Io`]: epoll (Linux) or kqueue (macOS, iOS) with file
//!   descriptor watching.
//!
//! `run` is re-entrant: a task or native callback may call it again, and
//! each invocation keeps its own quit flag on an explicit stack.

pub mod delegate;

mod default;
mod io;
mod poller;
mod waker;

pub use delegate::{NextWorkInfo, PumpDelegate, ScopedWorkItem};
pub use io::{FdWatchController, FdWatcher, WatchMode};
pub use waker::{PumpStats, WakeHandle};

use self::default::Event;
use self::io::IoBackend;
use self::waker::PumpCounters;
use crate::error::{Error, Result};
use crate::time::{NoCoalescing, TimeTicks, TimerCoalescing};

use std::cell::{Cell, RefCell};
use std::os::fd::RawFd;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tracing::{debug, trace};

/// Backend selection for [`NativePump::new`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PumpType {
    #[default]
    Default,
    Io,
}

enum Backend {
    Default(Arc<Event>),
    Io(Rc<IoBackend>),
}

#[derive(Debug)]
struct RunState {
    should_quit: bool,
    run_depth: usize,
}

// Pops the run state pushed by `run`, also when a task unwinds through it.
struct RunStateGuard<'a>(&'a RefCell<Vec<RunState>>);

impl Drop for RunStateGuard<'_> {
    fn drop(&mut self) {
        self.0.borrow_mut().pop();
    }
}

pub struct NativePump {
    backend: Backend,
    run_states: RefCell<Vec<RunState>>,
    /// Deadline the native wait currently honours, max when none.
    programmed: Cell<TimeTicks>,
    waker: WakeHandle,
    counters: Arc<PumpCounters>,
    coalescing: Box<dyn TimerCoalescing>,
}

impl NativePump {
    pub fn new(pump_type: PumpType) -> Result<Self> {
        Self::with_coalescing(pump_type, Box::new(NoCoalescing))
    }

    pub fn with_coalescing(
        pump_type: PumpType,
        coalescing: Box<dyn TimerCoalescing>,
    ) -> Result<Self> {
        let counters = Arc::new(PumpCounters::default());

        let (backend, signal) = match pump_type {
            PumpType::Default => {
                let event = Arc::new(Event::default());
                (Backend::Default(event.clone()), event as Arc<dyn waker::WakeSignal>)
            }
            PumpType::Io => {
                let io = Rc::new(IoBackend::new(counters.clone())?);
                let signal = io.wake_signal();
                (Backend::Io(io), signal)
            }
        };
        debug!(?pump_type, ?coalescing, "created native pump");

        Ok(Self {
            backend,
            run_states: RefCell::new(Vec::new()),
            programmed: Cell::new(TimeTicks::max()),
            waker: WakeHandle::new(signal, counters.clone()),
            counters,
            coalescing,
        })
    }

    pub fn pump_type(&self) -> PumpType {
        match self.backend {
            Backend::Default(_) => PumpType::Default,
            Backend::Io(_) => PumpType::Io,
        }
    }

    /// Runs until [`quit`](Self::quit) is called at this nesting level.
    pub fn run(&self, delegate: &dyn PumpDelegate) {
        let run_depth = {
            let mut run_states = self.run_states.borrow_mut();
            let run_depth = run_states.len() + 1;
            run_states.push(RunState {
                should_quit: false,
                run_depth,
            });
            run_depth
        };
        let _run_state = RunStateGuard(&self.run_states);
        trace!(run_depth, "pump run started");

        loop {
            let did_native_work = self.dispatch_native(delegate);
            if self.should_quit() {
                break;
            }

            let next = delegate.do_work();
            if self.should_quit() {
                break;
            }

            if next.yield_to_native {
                self.poll_native_now();
            }
            if next.is_immediate() || did_native_work {
                continue;
            }

            delegate.do_idle_work();
            if self.should_quit() {
                break;
            }

            self.schedule_delayed_work(&next);
            self.wait_for_work();
        }

        trace!(run_depth, "pump run finished");
    }

    /// Makes the innermost `run` return after its current step.
    ///
    /// # Panics
    ///
    /// Panics if called while no `run` is active on this pump.
    pub fn quit(&self) {
        match self.run_states.borrow_mut().last_mut() {
            Some(run_state) => run_state.should_quit = true,
            None => panic!("NativePump::quit called outside of NativePump::run"),
        }
    }

    /// Number of `run` invocations currently on the stack.
    pub fn run_depth(&self) -> usize {
        self.run_states
            .borrow()
            .last()
            .map_or(0, |run_state| run_state.run_depth)
    }

    /// Wakes the pump. Same as [`WakeHandle::wake`] on [`Self::wake_handle`].
    pub fn schedule_work(&self) {
        self.waker.wake();
    }

    /// A `Send` handle that wakes this pump from any thread.
    pub fn wake_handle(&self) -> WakeHandle {
        self.waker.clone()
    }

    /// Lowers the programmed wake deadline to `next`'s run time.
    ///
    /// Later or equal deadlines leave the programmed one untouched; it is
    /// cleared once it passes, so the next call establishes a fresh one.
    /// Immediate and empty `next` values are ignored.
    pub fn schedule_delayed_work(&self, next: &NextWorkInfo) {
        let Some(requested) = next.delayed_run_time.instant() else {
            return;
        };

        let adjusted = self.adjust_delayed_run_time(requested, next.leeway);
        if TimeTicks::from(adjusted) >= self.programmed.get() {
            return;
        }

        self.programmed.set(TimeTicks::from(adjusted));
        PumpCounters::bump(&self.counters.delayed_work_programmed);
        trace!(
            delay = ?adjusted.saturating_duration_since(Instant::now()),
            "programmed delayed work"
        );
    }

    /// Applies the coalescing policy, clamped to `[requested, requested + leeway]`.
    pub fn adjust_delayed_run_time(
        &self,
        requested: Instant,
        leeway: std::time::Duration,
    ) -> Instant {
        let latest = requested.checked_add(leeway).unwrap_or(requested);
        self.coalescing
            .adjust_delayed_run_time(requested, requested, latest)
            .clamp(requested, latest)
    }

    /// Records whether high-resolution delayed tasks are pending.
    ///
    /// Returns whether the state changed.
    pub fn set_high_resolution_timer(&self, active: bool) -> bool {
        let previous = self
            .counters
            .high_resolution_timer_active
            .swap(active, Ordering::Relaxed);
        if previous != active {
            debug!(active, "high resolution timer toggled");
        }
        previous != active
    }

    /// Starts watching `fd` for readiness. Requires [`PumpType::Io`].
    pub fn watch_file_descriptor(
        &self,
        fd: RawFd,
        persistent: bool,
        mode: WatchMode,
        watcher: Rc<dyn FdWatcher>,
    ) -> Result<FdWatchController> {
        match &self.backend {
            Backend::Io(io) => io.watch(fd, persistent, mode, watcher),
            Backend::Default(_) => Err(Error::Unsupported("watch_file_descriptor")),
        }
    }

    pub fn stats(&self) -> PumpStats {
        self.counters.snapshot()
    }

    fn should_quit(&self) -> bool {
        self.run_states
            .borrow()
            .last()
            .is_some_and(|run_state| run_state.should_quit)
    }

    fn dispatch_native(&self, delegate: &dyn PumpDelegate) -> bool {
        match &self.backend {
            Backend::Default(_) => false,
            Backend::Io(io) => io.dispatch_one(delegate),
        }
    }

    fn poll_native_now(&self) {
        if let Backend::Io(io) = &self.backend {
            if io.has_watches() {
                io.poll_now();
            }
        }
    }

    fn wait_for_work(&self) {
        let deadline = self.programmed.get().instant();
        PumpCounters::bump(&self.counters.waits);

        match &self.backend {
            Backend::Default(event) => event.wait(deadline),
            Backend::Io(io) => io.wait(deadline),
        }

        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            self.programmed.set(TimeTicks::max());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_only_earlier_deadlines_reprogram() {
        let pump = NativePump::new(PumpType::Default).unwrap();
        let base = TimeTicks::from(Instant::now());
        let at = |millis| NextWorkInfo {
            delayed_run_time: base.saturating_add(Duration::from_millis(millis)),
            ..NextWorkInfo::none()
        };

        pump.schedule_delayed_work(&at(50));
        pump.schedule_delayed_work(&at(50));
        pump.schedule_delayed_work(&at(80));
        assert_eq!(pump.stats().delayed_work_programmed, 1);

        pump.schedule_delayed_work(&at(20));
        assert_eq!(pump.stats().delayed_work_programmed, 2);

        pump.schedule_delayed_work(&NextWorkInfo::none());
        pump.schedule_delayed_work(&NextWorkInfo::immediate());
        assert_eq!(pump.stats().delayed_work_programmed, 2);
    }

    #[test]
    #[should_panic(expected = "outside of NativePump::run")]
    fn test_quit_outside_run_panics() {
        let pump = NativePump::new(PumpType::Default).unwrap();
        pump.quit();
    }

    #[test]
    fn test_watch_requires_io_pump() {
        let pump = NativePump::new(PumpType::Default).unwrap();
        struct Nothing;
        impl FdWatcher for Nothing {}

        let result = pump.watch_file_descriptor(0, false, WatchMode::Read, Rc::new(Nothing));
        assert!(matches!(result, Err(Error::Unsupported(_))));
    }
}
