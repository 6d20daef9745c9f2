//! Fluent builder for TaskExecutor construction.
//!
//! Collects the pump backend, batching, coalescing and clock settings, then
//! creates the pump, the queue and the controller and binds them to the
//! calling thread.

use crate::controller::ThreadController;
use crate::error::Result;
use crate::executor::TaskExecutor;
use crate::pump::{NativePump, PumpType};
use crate::task::TaskQueue;
use crate::time::{NoCoalescing, SystemTickClock, TickClock, TimerCoalescing};

use std::sync::Arc;

/// Builder for a [`TaskExecutor`] bound to the calling thread.
///
/// # Example
/// ```ignore
/// let executor = TaskExecutorBuilder::new()
///     .pump_type(PumpType::Io)
///     .work_batch_size(4)
///     .build()?;
/// ```
pub struct TaskExecutorBuilder {
    pump_type: PumpType,
    work_batch_size: usize,
    coalescing: Box<dyn TimerCoalescing>,
    clock: Arc<dyn TickClock>,
}

impl Default for TaskExecutorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskExecutorBuilder {
    /// Creates a builder for a software-only pump running one task per batch.
    ///
    /// # Example
    /// ```ignore
    /// let builder = TaskExecutorBuilder::new();
    /// ```
    pub fn new() -> Self {
        Self {
            pump_type: PumpType::Default,
            work_batch_size: 1,
            coalescing: Box::new(NoCoalescing),
            clock: Arc::new(SystemTickClock),
        }
    }

    /// Selects the pump backend. `PumpType::Io` enables file descriptor watching.
    pub fn pump_type(mut self, pump_type: PumpType) -> Self {
        self.pump_type = pump_type;
        self
    }

    /// Sets how many tasks one `do_work` call may run.
    ///
    /// # Panics
    /// Panics if `work_batch_size` is zero.
    pub fn work_batch_size(mut self, work_batch_size: usize) -> Self {
        assert!(work_batch_size >= 1, "work batch size must be at least 1");
        self.work_batch_size = work_batch_size;
        self
    }

    /// Sets the policy used to align delayed wake-ups.
    pub fn timer_coalescing(mut self, coalescing: impl TimerCoalescing + 'static) -> Self {
        self.coalescing = Box::new(coalescing);
        self
    }

    /// Replaces the monotonic clock, typically with a `TestTickClock`.
    pub fn clock(mut self, clock: Arc<dyn TickClock>) -> Self {
        self.clock = clock;
        self
    }

    /// Builds the executor and binds it to the current thread.
    ///
    /// # Returns
    /// The executor, or an error if the native pump could not be created.
    ///
    /// # Panics
    /// Panics if a controller is already bound to the current thread.
    pub fn build(self) -> Result<TaskExecutor> {
        let pump = NativePump::with_coalescing(self.pump_type, self.coalescing)?;
        let queue = Arc::new(TaskQueue::new(self.clock.clone()));

        let controller = ThreadController::new(self.clock);
        controller.set_work_batch_size(self.work_batch_size);

        let executor = TaskExecutor::new(queue, controller.clone(), self.pump_type);
        controller.bind_to_current_thread(pump);

        Ok(executor)
    }
}
