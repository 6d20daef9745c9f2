//! Units of work and the interfaces that produce them.
//!
//! A [`PendingTask`] is created by a poster, owned by a task source until it
//! is selected, then moved onto the stack of the code that runs it. Running
//! consumes the callback and dropping an unrun task drops it, so every task
//! is either run or discarded exactly once.

pub mod annotator;
pub mod queue;
pub mod runner;
pub mod source;

pub use annotator::{TaskAnnotator, TaskInfo, TaskObserver};
pub use queue::TaskQueue;
pub use runner::TaskRunner;
pub use source::SequencedTaskSource;

use crate::time::TimeTicks;

use std::fmt;
use std::panic::Location;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Whether a task may run inside a nested run loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum Nestable {
    #[default]
    Nestable,
    NonNestable,
}

/// How strictly a delayed task's run time is honored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum DelayPolicy {
    /// May run late by up to the task's leeway, never early.
    #[default]
    FlexibleNoSooner,
    /// Wants a precise wake-up; keeps the high resolution timer active.
    Precise,
}

/// Default leeway granted to flexible delayed tasks.
pub const DEFAULT_LEEWAY: Duration = Duration::from_millis(8);

/// Shared cancellation flag for a posted task.
///
/// Cancelling is visible from any thread; a task whose token is cancelled when
/// it is selected is dropped without running.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// A posted unit of work.
pub struct PendingTask {
    callback: Box<dyn FnOnce() + Send>,
    /// Null for immediate tasks.
    pub delayed_run_time: TimeTicks,
    /// Assigned by the task source when the task is enqueued.
    pub sequence_num: u64,
    pub nestable: Nestable,
    pub delay_policy: DelayPolicy,
    pub leeway: Duration,
    pub posted_from: &'static Location<'static>,
    cancel: Option<CancelToken>,
}

impl PendingTask {
    /// Creates an immediate, nestable task posted from the caller's location.
    #[track_caller]
    pub fn new(callback: impl FnOnce() + Send + 'static) -> Self {
        Self {
            callback: Box::new(callback),
            delayed_run_time: TimeTicks::null(),
            sequence_num: 0,
            nestable: Nestable::Nestable,
            delay_policy: DelayPolicy::FlexibleNoSooner,
            leeway: DEFAULT_LEEWAY,
            posted_from: Location::caller(),
            cancel: None,
        }
    }

    pub fn with_run_time(mut self, run_time: TimeTicks) -> Self {
        self.delayed_run_time = run_time;
        self
    }

    pub fn with_nestable(mut self, nestable: Nestable) -> Self {
        self.nestable = nestable;
        self
    }

    pub fn with_delay_policy(mut self, delay_policy: DelayPolicy) -> Self {
        self.delay_policy = delay_policy;
        self
    }

    pub fn with_leeway(mut self, leeway: Duration) -> Self {
        self.leeway = leeway;
        self
    }

    pub fn with_cancel_token(mut self, token: CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn is_delayed(&self) -> bool {
        !self.delayed_run_time.is_null()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(CancelToken::is_cancelled)
    }

    /// Consumes the task and runs its callback.
    pub fn run(self) {
        (self.callback)()
    }
}

impl fmt::Debug for PendingTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingTask")
            .field("delayed_run_time", &self.delayed_run_time)
            .field("sequence_num", &self.sequence_num)
            .field("nestable", &self.nestable)
            .field("delay_policy", &self.delay_policy)
            .field("posted_from", &self.posted_from)
            .finish_non_exhaustive()
    }
}

/// When a task source next needs the thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WakeUp {
    /// Null means "now".
    pub time: TimeTicks,
    pub leeway: Duration,
    pub delay_policy: DelayPolicy,
}

impl WakeUp {
    pub fn immediate() -> Self {
        Self {
            time: TimeTicks::null(),
            leeway: Duration::ZERO,
            delay_policy: DelayPolicy::FlexibleNoSooner,
        }
    }

    pub fn is_immediate(&self) -> bool {
        self.time.is_null()
    }

    /// The latest acceptable wake time given the leeway.
    pub fn latest_time(&self) -> TimeTicks {
        match self.delay_policy {
            DelayPolicy::Precise => self.time,
            DelayPolicy::FlexibleNoSooner => self.time.saturating_add(self.leeway),
        }
    }
}
