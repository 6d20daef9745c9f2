//! Thread-safe task queue feeding a thread controller.
//!
//! Holds three queues behind one short-lived lock:
//!
//! - an immediate FIFO,
//! - a delayed min-heap ordered by `(run_time, sequence_num)`,
//! - an idle queue that is only released when the thread is about to sleep.
//!
//! Posting may happen from any thread; selection happens on the controller's
//! thread. Tasks removed without running (cancelled, or discarded at
//! shutdown) are always dropped after the lock is released, since their
//! captured state may post again from its destructor.

use super::{DelayPolicy, PendingTask, SequencedTaskSource, WakeUp};
use crate::time::{LazyNow, TickClock, TimeTicks};

use parking_lot::Mutex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Outcome of [`TaskQueue::push`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Enqueued {
    /// The queue is shut down; the task was dropped.
    Rejected,
    Immediate,
    /// `new_head` is set when the task became the earliest delayed task.
    Delayed { new_head: bool },
    Idle,
}

impl Enqueued {
    pub fn accepted(&self) -> bool {
        !matches!(self, Enqueued::Rejected)
    }
}

struct DelayedEntry(PendingTask);

impl DelayedEntry {
    fn key(&self) -> (TimeTicks, u64) {
        (self.0.delayed_run_time, self.0.sequence_num)
    }
}

impl PartialEq for DelayedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for DelayedEntry {}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

// Reversed so the std max-heap pops the earliest entry first.
impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.key().cmp(&self.key())
    }
}

#[derive(Default)]
struct Inner {
    immediate: VecDeque<PendingTask>,
    delayed: BinaryHeap<DelayedEntry>,
    idle: VecDeque<PendingTask>,
    next_sequence: u64,
    precise_delayed: usize,
    shutdown: bool,
}

impl Inner {
    fn pop_delayed(&mut self) -> Option<PendingTask> {
        let task = self.delayed.pop()?.0;
        if task.delay_policy == DelayPolicy::Precise {
            self.precise_delayed -= 1;
        }
        Some(task)
    }

    // Moves every delayed task due at `now` to the back of the immediate queue.
    fn promote_ready(&mut self, now: &mut LazyNow<'_>) {
        if self.delayed.is_empty() {
            return;
        }

        let now = TimeTicks::from(now.now());
        while self
            .delayed
            .peek()
            .is_some_and(|entry| entry.0.delayed_run_time <= now)
        {
            if let Some(task) = self.pop_delayed() {
                self.immediate.push_back(task);
            }
        }
    }

    fn purge_cancelled(&mut self, graveyard: &mut Vec<PendingTask>) {
        while self.immediate.front().is_some_and(PendingTask::is_cancelled) {
            graveyard.extend(self.immediate.pop_front());
        }
        while self.delayed.peek().is_some_and(|entry| entry.0.is_cancelled()) {
            graveyard.extend(self.pop_delayed());
        }
    }
}

/// The default [`SequencedTaskSource`].
pub struct TaskQueue {
    inner: Mutex<Inner>,
    clock: Arc<dyn TickClock>,
    tasks_run: AtomicU64,
}

impl TaskQueue {
    pub fn new(clock: Arc<dyn TickClock>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            clock,
            tasks_run: AtomicU64::new(0),
        }
    }

    /// The clock used to compute delayed run times.
    pub fn clock(&self) -> &dyn TickClock {
        self.clock.as_ref()
    }

    /// Enqueues `task`, assigning its sequence number.
    ///
    /// A task with a null run time goes to the immediate queue, any other to
    /// the delayed heap. After [`shutdown`](Self::shutdown) the task is
    /// dropped and `Rejected` returned.
    pub fn push(&self, mut task: PendingTask) -> Enqueued {
        let mut inner = self.inner.lock();
        if inner.shutdown {
            drop(inner);
            drop(task);
            return Enqueued::Rejected;
        }

        task.sequence_num = inner.next_sequence;
        inner.next_sequence += 1;

        if !task.is_delayed() {
            inner.immediate.push_back(task);
            return Enqueued::Immediate;
        }

        if task.delay_policy == DelayPolicy::Precise {
            inner.precise_delayed += 1;
        }
        let run_time = task.delayed_run_time;
        let new_head = inner
            .delayed
            .peek()
            .is_none_or(|head| run_time < head.0.delayed_run_time);
        inner.delayed.push(DelayedEntry(task));

        Enqueued::Delayed { new_head }
    }

    /// Enqueues a task that only runs once the thread has nothing else to do.
    pub fn push_idle(&self, mut task: PendingTask) -> Enqueued {
        let mut inner = self.inner.lock();
        if inner.shutdown {
            drop(inner);
            drop(task);
            return Enqueued::Rejected;
        }

        task.sequence_num = inner.next_sequence;
        inner.next_sequence += 1;
        inner.idle.push_back(task);

        Enqueued::Idle
    }

    /// Number of tasks currently held, including delayed and idle ones.
    pub fn len(&self) -> usize {
        let inner = self.inner.lock();
        inner.immediate.len() + inner.delayed.len() + inner.idle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of tasks reported through `did_run_task`.
    pub fn tasks_run(&self) -> u64 {
        self.tasks_run.load(Ordering::Relaxed)
    }

    /// Rejects further posts and drops every queued task.
    ///
    /// The flag is set under the same lock posts take, so a post either lands
    /// before the drain or is rejected.
    pub fn shutdown(&self) {
        let drained = {
            let mut inner = self.inner.lock();
            inner.shutdown = true;
            let mut drained: Vec<PendingTask> = inner.immediate.drain(..).collect();
            drained.extend(inner.idle.drain(..));
            drained.extend(inner.delayed.drain().map(|entry| entry.0));
            inner.precise_delayed = 0;
            drained
        };
        drop(drained);
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.lock().shutdown
    }
}

impl SequencedTaskSource for TaskQueue {
    fn select_next_task(&self, lazy_now: &mut LazyNow<'_>) -> Option<PendingTask> {
        let mut inner = self.inner.lock();
        inner.promote_ready(lazy_now);
        inner.immediate.pop_front()
    }

    fn did_run_task(&self, _lazy_now: &mut LazyNow<'_>) {
        self.tasks_run.fetch_add(1, Ordering::Relaxed);
    }

    fn delay_till_next_task(&self, lazy_now: &mut LazyNow<'_>) -> Option<WakeUp> {
        let mut graveyard = Vec::new();

        let wake_up = {
            let mut inner = self.inner.lock();
            inner.purge_cancelled(&mut graveyard);

            if !inner.immediate.is_empty() {
                Some(WakeUp::immediate())
            } else {
                match inner.delayed.peek() {
                    None => None,
                    Some(head) if head.0.delayed_run_time <= TimeTicks::from(lazy_now.now()) => {
                        Some(WakeUp::immediate())
                    }
                    Some(head) => Some(WakeUp {
                        time: head.0.delayed_run_time,
                        leeway: head.0.leeway,
                        delay_policy: head.0.delay_policy,
                    }),
                }
            }
        };

        drop(graveyard);
        wake_up
    }

    fn has_pending_high_resolution_tasks(&self) -> bool {
        self.inner.lock().precise_delayed > 0
    }

    fn on_system_idle(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.idle.is_empty() {
            return false;
        }

        let idle = std::mem::take(&mut inner.idle);
        inner.immediate.extend(idle);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::CancelToken;
    use crate::time::TestTickClock;

    use proptest::prelude::*;
    use std::time::Duration;

    fn queue_with_clock() -> (TaskQueue, Arc<TestTickClock>) {
        let clock = Arc::new(TestTickClock::new());
        (TaskQueue::new(clock.clone()), clock)
    }

    fn drain(queue: &TaskQueue, clock: &TestTickClock) -> Vec<u64> {
        let mut order = Vec::new();
        let mut lazy_now = LazyNow::new(clock);
        while let Some(task) = queue.select_next_task(&mut lazy_now) {
            order.push(task.sequence_num);
        }
        order
    }

    #[test]
    fn test_delayed_task_waits_for_its_time() {
        let (queue, clock) = queue_with_clock();
        let run_time = TimeTicks::from(clock.now_ticks()).saturating_add(Duration::from_millis(10));
        queue.push(PendingTask::new(|| {}).with_run_time(run_time));

        let mut lazy_now = LazyNow::new(clock.as_ref());
        assert!(queue.select_next_task(&mut lazy_now).is_none());

        let wake_up = queue.delay_till_next_task(&mut lazy_now);
        assert_eq!(wake_up.map(|w| w.time), Some(run_time));

        clock.advance(Duration::from_millis(10));
        let mut lazy_now = LazyNow::new(clock.as_ref());
        assert!(queue.select_next_task(&mut lazy_now).is_some());
        assert!(queue.delay_till_next_task(&mut lazy_now).is_none());
    }

    #[test]
    fn test_new_head_reported_only_for_earlier_deadline() {
        let (queue, clock) = queue_with_clock();
        let base = TimeTicks::from(clock.now_ticks());

        let first = queue.push(PendingTask::new(|| {}).with_run_time(base.saturating_add(Duration::from_millis(20))));
        let later = queue.push(PendingTask::new(|| {}).with_run_time(base.saturating_add(Duration::from_millis(30))));
        let earlier = queue.push(PendingTask::new(|| {}).with_run_time(base.saturating_add(Duration::from_millis(5))));

        assert_eq!(first, Enqueued::Delayed { new_head: true });
        assert_eq!(later, Enqueued::Delayed { new_head: false });
        assert_eq!(earlier, Enqueued::Delayed { new_head: true });
    }

    #[test]
    fn test_cancelled_head_is_purged() {
        let (queue, clock) = queue_with_clock();
        let token = CancelToken::new();
        queue.push(PendingTask::new(|| {}).with_cancel_token(token.clone()));
        token.cancel();

        let mut lazy_now = LazyNow::new(clock.as_ref());
        assert!(queue.delay_till_next_task(&mut lazy_now).is_none());
        assert!(queue.is_empty(), "cancelled task should be dropped");
    }

    #[test]
    fn test_idle_tasks_released_on_system_idle() {
        let (queue, clock) = queue_with_clock();
        queue.push_idle(PendingTask::new(|| {}));

        let mut lazy_now = LazyNow::new(clock.as_ref());
        assert!(queue.select_next_task(&mut lazy_now).is_none());
        assert!(queue.on_system_idle());
        assert!(queue.select_next_task(&mut lazy_now).is_some());
        assert!(!queue.on_system_idle());
    }

    #[test]
    fn test_precise_tasks_tracked() {
        let (queue, clock) = queue_with_clock();
        let run_time = TimeTicks::from(clock.now_ticks()).saturating_add(Duration::from_millis(1));
        queue.push(
            PendingTask::new(|| {})
                .with_run_time(run_time)
                .with_delay_policy(DelayPolicy::Precise),
        );
        assert!(queue.has_pending_high_resolution_tasks());

        clock.advance(Duration::from_millis(1));
        let mut lazy_now = LazyNow::new(clock.as_ref());
        assert!(queue.select_next_task(&mut lazy_now).is_some());
        assert!(!queue.has_pending_high_resolution_tasks());
    }

    #[test]
    fn test_shutdown_rejects_posts() {
        let (queue, _clock) = queue_with_clock();
        queue.push(PendingTask::new(|| {}));
        queue.shutdown();

        assert!(queue.is_empty());
        assert_eq!(queue.push(PendingTask::new(|| {})), Enqueued::Rejected);
        assert_eq!(queue.push_idle(PendingTask::new(|| {})), Enqueued::Rejected);
    }

    #[test]
    fn test_posts_racing_shutdown_never_outlive_it() {
        let (queue, _clock) = queue_with_clock();
        let queue = Arc::new(queue);
        let accepted = Arc::new(AtomicU64::new(0));

        let posters: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                let accepted = accepted.clone();
                std::thread::spawn(move || {
                    while queue.push(PendingTask::new(|| {})).accepted() {
                        accepted.fetch_add(1, Ordering::Relaxed);
                        std::thread::yield_now();
                    }
                })
            })
            .collect();

        while accepted.load(Ordering::Relaxed) < 100 {
            std::thread::yield_now();
        }
        queue.shutdown();
        for poster in posters {
            poster.join().unwrap();
        }

        assert!(queue.is_shutdown());
        assert!(queue.is_empty(), "a post accepted after the drain survived shutdown");
    }

    proptest! {
        #[test]
        fn prop_equal_run_times_keep_post_order(delays in proptest::collection::vec(0u64..4, 1..64)) {
            let (queue, clock) = queue_with_clock();
            let base = TimeTicks::from(clock.now_ticks());

            let mut expected = Vec::new();
            for (sequence, delay) in delays.iter().enumerate() {
                let run_time = if *delay == 0 {
                    TimeTicks::null()
                } else {
                    base.saturating_add(Duration::from_millis(*delay))
                };
                queue.push(PendingTask::new(|| {}).with_run_time(run_time));
                expected.push((run_time, sequence as u64));
            }

            clock.advance(Duration::from_millis(10));
            let order = drain(&queue, &clock);

            // Immediate tasks first in post order, then delayed by (run time, post order).
            expected.sort();
            let expected: Vec<u64> = expected.into_iter().map(|(_, sequence)| sequence).collect();
            prop_assert_eq!(order, expected);
        }
    }
}
