//! Single-threaded cooperative task execution.
//!
//! This crate runs posted tasks and native readiness events on one thread,
//! in order, with nested run loops, delayed tasks and cheap cross-thread
//! wake-ups.
//!
//! # Architecture
//!
//! - **NativePump** ([`pump`]): the thread's blocking wait (condition variable,
//!   epoll or kqueue), interleaving one native event with each batch of tasks
//! - **ThreadController** ([`controller`]): the pump's delegate; selects and runs
//!   tasks, computes the next wake-up, deduplicates wake requests
//! - **TaskQueue** ([`task`]): thread-safe immediate, delayed and idle queues
//!   behind the `SequencedTaskSource` trait
//! - **RunLoop** ([`run_loop`]): `run`/`quit`/`run_until_idle` for application code
//! - **TaskExecutorBuilder**: fluent builder binding all of the above to a thread
//!
//! # Example
//!
//! ```ignore
//! use runloop::{RunLoop, TaskExecutorBuilder};
//! use std::time::Duration;
//!
//! let executor = TaskExecutorBuilder::new().build()?;
//! let runner = executor.task_runner();
//! let run_loop = RunLoop::new();
//!
//! runner.post_delayed_task(run_loop.quit_closure(), Duration::from_millis(50));
//! run_loop.run();
//! ```

mod builder;
mod executor;

pub mod controller;
pub mod error;
pub mod pump;
pub mod run_loop;
pub mod task;
pub mod time;

pub use builder::TaskExecutorBuilder;
pub use controller::{ControllerHandle, ThreadController};
pub use error::{Error, Result};
pub use executor::TaskExecutor;
pub use pump::{NativePump, NextWorkInfo, PumpDelegate, PumpStats, PumpType};
pub use run_loop::{RunLoop, RunLoopType, ScopedNestableTaskAllower};
pub use task::{CancelToken, PendingTask, TaskRunner};
pub use time::TimeTicks;
