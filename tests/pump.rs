mod common;

use common::init_test_logging;
use runloop::pump::{NativePump, NextWorkInfo, PumpDelegate, PumpType};
use runloop::TimeTicks;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::thread;
use std::time::{Duration, Instant};

type Step<'p> = Box<dyn FnOnce(&Scripted<'p>) -> NextWorkInfo + 'p>;

/// A delegate replaying one scripted `do_work` result per call.
///
/// Running out of steps quits the pump.
struct Scripted<'p> {
    pump: &'p NativePump,
    steps: RefCell<VecDeque<Step<'p>>>,
    log: RefCell<Vec<&'static str>>,
    open_work_items: Cell<usize>,
}

impl<'p> Scripted<'p> {
    fn new(pump: &'p NativePump) -> Self {
        init_test_logging();
        Self {
            pump,
            steps: RefCell::new(VecDeque::new()),
            log: RefCell::new(Vec::new()),
            open_work_items: Cell::new(0),
        }
    }

    fn step(self, step: impl FnOnce(&Scripted<'p>) -> NextWorkInfo + 'p) -> Self {
        self.steps.borrow_mut().push_back(Box::new(step));
        self
    }

    fn log(&self) -> Vec<&'static str> {
        self.log.borrow().clone()
    }
}

impl PumpDelegate for Scripted<'_> {
    fn do_work(&self) -> NextWorkInfo {
        self.log.borrow_mut().push("work");
        let next = self.steps.borrow_mut().pop_front();
        match next {
            Some(step) => step(self),
            None => {
                self.pump.quit();
                NextWorkInfo::none()
            }
        }
    }

    fn do_idle_work(&self) {
        self.log.borrow_mut().push("idle");
    }

    fn begin_work_item(&self) {
        self.open_work_items.set(self.open_work_items.get() + 1);
    }

    fn end_work_item(&self) {
        self.open_work_items.set(self.open_work_items.get() - 1);
    }

    fn run_depth(&self) -> usize {
        self.pump.run_depth()
    }
}

fn due_in(delay: Duration) -> NextWorkInfo {
    NextWorkInfo {
        delayed_run_time: TimeTicks::from(Instant::now()).saturating_add(delay),
        ..NextWorkInfo::none()
    }
}

#[test]
fn test_quit_from_do_work_stops_before_idle() {
    let pump = NativePump::new(PumpType::Default).unwrap();
    let delegate = Scripted::new(&pump)
        .step(|_| NextWorkInfo::immediate())
        .step(|d| {
            d.pump.quit();
            NextWorkInfo::immediate()
        })
        .step(|_| panic!("ran after quit"));

    pump.run(&delegate);

    assert_eq!(delegate.log(), ["work", "work"]);
    assert_eq!(pump.run_depth(), 0);
}

#[test]
fn test_idle_work_only_when_nothing_is_immediate() {
    let pump = NativePump::new(PumpType::Default).unwrap();
    let delegate = Scripted::new(&pump)
        .step(|_| NextWorkInfo::immediate())
        .step(|_| NextWorkInfo::immediate())
        .step(|_| due_in(Duration::ZERO));

    pump.run(&delegate);

    assert_eq!(delegate.log(), ["work", "work", "work", "idle", "work"]);
    assert_eq!(pump.stats().waits, 1);
}

#[test]
fn test_nested_run_quits_innermost_only() {
    let pump = NativePump::new(PumpType::Default).unwrap();
    let delegate = Scripted::new(&pump)
        .step(|d| {
            assert_eq!(d.pump.run_depth(), 1);
            d.pump.run(d);
            assert_eq!(d.pump.run_depth(), 1, "outer run still active");
            NextWorkInfo::immediate()
        })
        .step(|d| {
            assert_eq!(d.pump.run_depth(), 2);
            d.pump.quit();
            NextWorkInfo::immediate()
        })
        .step(|d| {
            assert_eq!(d.pump.run_depth(), 1);
            d.pump.quit();
            NextWorkInfo::none()
        });

    pump.run(&delegate);

    assert_eq!(delegate.log(), ["work", "work", "work"]);
    assert_eq!(pump.run_depth(), 0);
}

#[test]
fn test_wake_from_other_thread_ends_wait() {
    let pump = NativePump::new(PumpType::Default).unwrap();
    let waker = pump.wake_handle();
    let delegate = Scripted::new(&pump).step(|_| NextWorkInfo::none());

    let started = Instant::now();
    let wake_thread = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        waker.wake();
    });
    pump.run(&delegate);
    wake_thread.join().unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(delegate.log(), ["work", "idle", "work"]);
    assert_eq!(pump.stats().wakes_issued, 1);
}

#[test]
fn test_delayed_deadline_is_honoured() {
    let pump = NativePump::new(PumpType::Default).unwrap();
    let delegate = Scripted::new(&pump).step(|_| due_in(Duration::from_millis(30)));

    let started = Instant::now();
    pump.run(&delegate);

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(30), "woke early: {elapsed:?}");
    assert!(elapsed < Duration::from_secs(5));

    let stats = pump.stats();
    assert_eq!(stats.delayed_work_programmed, 1);
    assert_eq!(stats.waits, 1);
}

#[test]
fn test_io_pump_runs_without_watches() {
    let pump = NativePump::new(PumpType::Io).unwrap();
    let delegate = Scripted::new(&pump)
        .step(|_| NextWorkInfo {
            yield_to_native: true,
            ..NextWorkInfo::immediate()
        })
        .step(|_| due_in(Duration::from_millis(10)));

    let started = Instant::now();
    pump.run(&delegate);

    assert!(started.elapsed() >= Duration::from_millis(10));
    assert_eq!(delegate.log(), ["work", "work", "idle", "work"]);
    assert_eq!(delegate.open_work_items.get(), 0);
    assert_eq!(pump.stats().native_dispatches, 0);
}
