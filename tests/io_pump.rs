#![cfg(any(target_os = "linux", target_os = "android", target_os = "macos", target_os = "ios"))]

mod common;

use common::init_test_logging;
use runloop::pump::{FdWatcher, WatchMode};
use runloop::{Error, PumpType, RunLoop, TaskExecutor, TaskExecutorBuilder, TaskRunner};
use std::cell::Cell;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

fn io_executor() -> TaskExecutor {
    init_test_logging();
    TaskExecutorBuilder::new()
        .pump_type(PumpType::Io)
        .build()
        .expect("io pump should build")
}

fn pipe() -> (OwnedFd, OwnedFd) {
    let mut fds = [0 as libc::c_int; 2];
    let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(rc, 0, "pipe failed: {}", std::io::Error::last_os_error());
    unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
}

fn write_byte(fd: RawFd) {
    let written = unsafe { libc::write(fd, b"x".as_ptr().cast(), 1) };
    assert_eq!(written, 1);
}

fn read_byte(fd: RawFd) {
    let mut byte = 0u8;
    let read = unsafe { libc::read(fd, (&mut byte as *mut u8).cast(), 1) };
    assert_eq!(read, 1);
}

/// Reads one byte per callback, refills the pipe and quits after `quit_after`.
struct Reader {
    reads: Cell<usize>,
    quit_after: Option<usize>,
    refill: Option<RawFd>,
}

impl Reader {
    fn new(quit_after: Option<usize>, refill: Option<RawFd>) -> Rc<Self> {
        Rc::new(Self {
            reads: Cell::new(0),
            quit_after,
            refill,
        })
    }
}

impl FdWatcher for Reader {
    fn on_file_can_read_without_blocking(&self, fd: RawFd) {
        read_byte(fd);
        let reads = self.reads.get() + 1;
        self.reads.set(reads);

        if self.quit_after == Some(reads) {
            RunLoop::quit_current();
        } else if let Some(refill) = self.refill {
            write_byte(refill);
        }
    }
}

#[test]
fn test_persistent_watch_fires_repeatedly() {
    let executor = io_executor();
    let (read_end, write_end) = pipe();
    let reader = Reader::new(Some(2), Some(write_end.as_raw_fd()));

    let watch = executor
        .controller()
        .watch_file_descriptor(read_end.as_raw_fd(), true, WatchMode::Read, reader.clone())
        .unwrap();
    write_byte(write_end.as_raw_fd());

    RunLoop::new().run_for(Duration::from_secs(5));

    assert_eq!(reader.reads.get(), 2);
    assert!(watch.is_watching());
    assert_eq!(executor.stats().native_dispatches, 2);
}

#[test]
fn test_one_shot_watch_fires_once() {
    let executor = io_executor();
    let (read_end, write_end) = pipe();
    let reader = Reader::new(None, None);

    let watch = executor
        .controller()
        .watch_file_descriptor(read_end.as_raw_fd(), false, WatchMode::Read, reader.clone())
        .unwrap();
    write_byte(write_end.as_raw_fd());
    write_byte(write_end.as_raw_fd());

    RunLoop::new().run_for(Duration::from_millis(30));

    assert_eq!(reader.reads.get(), 1, "one-shot watch must not re-fire");
    assert!(!watch.is_watching());
}

#[test]
fn test_stop_watching_silences_descriptor() {
    let executor = io_executor();
    let (read_end, write_end) = pipe();
    let reader = Reader::new(Some(1), None);

    let mut watch = executor
        .controller()
        .watch_file_descriptor(read_end.as_raw_fd(), true, WatchMode::Read, reader.clone())
        .unwrap();
    assert!(watch.stop_watching());
    assert!(!watch.stop_watching(), "second stop is a no-op");

    write_byte(write_end.as_raw_fd());
    RunLoop::new().run_for(Duration::from_millis(30));

    assert_eq!(reader.reads.get(), 0);
    assert!(!watch.is_watching());
}

#[test]
fn test_same_descriptor_cannot_be_watched_twice() {
    let executor = io_executor();
    let (read_end, _write_end) = pipe();
    let controller = executor.controller();

    let _first = controller
        .watch_file_descriptor(read_end.as_raw_fd(), true, WatchMode::Read, Reader::new(None, None))
        .unwrap();
    let second =
        controller.watch_file_descriptor(read_end.as_raw_fd(), true, WatchMode::Read, Reader::new(None, None));

    assert!(matches!(second, Err(Error::Watch { .. })));
}

struct WriteReady {
    fired: Cell<usize>,
}

impl FdWatcher for WriteReady {
    fn on_file_can_write_without_blocking(&self, _fd: RawFd) {
        self.fired.set(self.fired.get() + 1);
        RunLoop::quit_current();
    }
}

#[test]
fn test_write_watch_reports_writable_pipe() {
    let executor = io_executor();
    let (_read_end, write_end) = pipe();
    let watcher = Rc::new(WriteReady { fired: Cell::new(0) });

    let _watch = executor
        .controller()
        .watch_file_descriptor(write_end.as_raw_fd(), false, WatchMode::Write, watcher.clone())
        .unwrap();

    RunLoop::new().run_for(Duration::from_secs(5));

    assert_eq!(watcher.fired.get(), 1);
}

#[test]
fn test_tasks_and_native_events_interleave() {
    let executor = io_executor();
    let (read_end, write_end) = pipe();
    let reader = Reader::new(Some(3), Some(write_end.as_raw_fd()));
    let tasks = common::Recorder::new();

    let _watch = executor
        .controller()
        .watch_file_descriptor(read_end.as_raw_fd(), true, WatchMode::Read, reader.clone())
        .unwrap();
    write_byte(write_end.as_raw_fd());
    for name in ["a", "b", "c", "d"] {
        let events = tasks.clone();
        executor.task_runner().post_task(move || events.record(name));
    }

    RunLoop::new().run_for(Duration::from_secs(5));

    assert_eq!(reader.reads.get(), 3);
    assert!(
        tasks.len() >= 2,
        "tasks should run between native events, ran {}",
        tasks.len()
    );
}

fn set_non_blocking(fd: RawFd) {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    assert!(flags >= 0);
    let rc = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    assert_eq!(rc, 0);
}

/// Drains everything readable on each callback, noting callbacks that found
/// nothing to read.
#[derive(Default)]
struct Drainer {
    calls: Cell<usize>,
    empty: Cell<usize>,
}

impl FdWatcher for Drainer {
    fn on_file_can_read_without_blocking(&self, fd: RawFd) {
        self.calls.set(self.calls.get() + 1);
        let mut buffer = [0u8; 64];
        let mut total = 0;
        loop {
            let read = unsafe { libc::read(fd, buffer.as_mut_ptr().cast(), buffer.len()) };
            if read <= 0 {
                break;
            }
            total += read as usize;
        }
        if total == 0 {
            self.empty.set(self.empty.get() + 1);
        }
    }
}

fn repost(remaining: usize) {
    if remaining == 0 {
        RunLoop::quit_current();
        return;
    }
    TaskRunner::current()
        .expect("runner bound")
        .post_task(move || repost(remaining - 1));
}

#[test]
fn test_task_flood_does_not_redeliver_drained_descriptors() {
    init_test_logging();
    let executor = TaskExecutorBuilder::new()
        .pump_type(PumpType::Io)
        .work_batch_size(1)
        .build()
        .expect("io pump should build");
    let controller = executor.controller();

    let mut pipes = Vec::new();
    let mut watches = Vec::new();
    let mut drainers = Vec::new();
    for _ in 0..2 {
        let (read_end, write_end) = pipe();
        set_non_blocking(read_end.as_raw_fd());
        let drainer = Rc::new(Drainer::default());
        watches.push(
            controller
                .watch_file_descriptor(read_end.as_raw_fd(), true, WatchMode::Read, drainer.clone())
                .unwrap(),
        );
        write_byte(write_end.as_raw_fd());
        drainers.push(drainer);
        pipes.push((read_end, write_end));
    }

    executor.task_runner().post_task(|| repost(10));
    RunLoop::new().run_for(Duration::from_secs(5));

    for drainer in &drainers {
        assert_eq!(drainer.empty.get(), 0, "watcher called on a drained descriptor");
        assert_eq!(drainer.calls.get(), 1);
    }
    assert_eq!(executor.stats().native_dispatches, 2);
}
