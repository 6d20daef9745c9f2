//! File-descriptor readiness for the I/O pump.
//!
//! Watches are keyed by a token that is never reused, so a readiness report
//! that outlives its watch is recognised as stale and skipped. Ready events
//! are buffered and dispatched one per loop iteration.

use super::delegate::{PumpDelegate, ScopedWorkItem};
use super::poller::{Interest, Poller, Readiness};
use super::waker::{PumpCounters, WakeSignal};
use crate::error::{Error, Result};

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Receives readiness callbacks for a watched file descriptor.
///
/// Callbacks run on the pump thread inside a work item and may post tasks,
/// start or stop watches, or run a nested loop.
pub trait FdWatcher {
    fn on_file_can_read_without_blocking(&self, _fd: RawFd) {}
    fn on_file_can_write_without_blocking(&self, _fd: RawFd) {}
}

/// Which readiness a watch reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchMode {
    Read,
    Write,
    ReadWrite,
}

impl WatchMode {
    fn reads(self) -> bool {
        matches!(self, WatchMode::Read | WatchMode::ReadWrite)
    }

    fn writes(self) -> bool {
        matches!(self, WatchMode::Write | WatchMode::ReadWrite)
    }

    fn interest(self) -> Interest {
        Interest {
            read: self.reads(),
            write: self.writes(),
        }
    }
}

struct Watch {
    fd: RawFd,
    mode: WatchMode,
    persistent: bool,
    watcher: Rc<dyn FdWatcher>,
}

pub(crate) struct IoBackend {
    poller: RefCell<Poller>,
    watches: RefCell<HashMap<u64, Watch>>,
    ready: RefCell<VecDeque<Readiness>>,
    next_token: Cell<u64>,
    counters: Arc<PumpCounters>,
}

impl IoBackend {
    pub(crate) fn new(counters: Arc<PumpCounters>) -> Result<Self> {
        Ok(Self {
            poller: RefCell::new(Poller::new()?),
            watches: RefCell::new(HashMap::new()),
            ready: RefCell::new(VecDeque::new()),
            next_token: Cell::new(0),
            counters,
        })
    }

    pub(crate) fn wake_signal(&self) -> Arc<dyn WakeSignal> {
        self.poller.borrow().wake_signal()
    }

    pub(crate) fn watch(
        self: &Rc<Self>,
        fd: RawFd,
        persistent: bool,
        mode: WatchMode,
        watcher: Rc<dyn FdWatcher>,
    ) -> Result<FdWatchController> {
        if self.watches.borrow().values().any(|watch| watch.fd == fd) {
            return Err(Error::Watch {
                fd,
                source: io::Error::from_raw_os_error(libc::EEXIST),
            });
        }

        let token = self.next_token.get();
        self.next_token.set(token + 1);

        self.poller
            .borrow()
            .add(fd, token, mode.interest())
            .map_err(|source| Error::Watch { fd, source })?;
        self.watches.borrow_mut().insert(
            token,
            Watch {
                fd,
                mode,
                persistent,
                watcher,
            },
        );
        debug!(fd, token, ?mode, persistent, "watching file descriptor");

        Ok(FdWatchController {
            fd,
            token: Some(token),
            backend: Rc::downgrade(self),
        })
    }

    fn unwatch(&self, token: u64) -> bool {
        let Some(watch) = self.watches.borrow_mut().remove(&token) else {
            return false;
        };

        // A closed descriptor has already left the poller.
        if let Err(error) = self.poller.borrow().delete(watch.fd) {
            trace!(fd = watch.fd, %error, "descriptor removal failed");
        }
        true
    }

    pub(crate) fn has_watches(&self) -> bool {
        !self.watches.borrow().is_empty()
    }

    /// Dispatches at most one ready event. Returns whether one ran.
    pub(crate) fn dispatch_one(&self, delegate: &dyn PumpDelegate) -> bool {
        if self.ready.borrow().is_empty() && self.has_watches() {
            self.poll(Some(Duration::ZERO));
        }

        loop {
            let Some(readiness) = self.ready.borrow_mut().pop_front() else {
                return false;
            };

            let (fd, mode, persistent, watcher) = {
                let watches = self.watches.borrow();
                let Some(watch) = watches.get(&readiness.token) else {
                    continue;
                };
                (watch.fd, watch.mode, watch.persistent, watch.watcher.clone())
            };
            // One-shot watches end before their callback so it can re-arm.
            if !persistent {
                self.unwatch(readiness.token);
            }

            let _item = ScopedWorkItem::new(delegate);
            PumpCounters::bump(&self.counters.native_dispatches);
            trace!(fd, token = readiness.token, "dispatching native event");

            let mut notified = false;
            if readiness.readable && mode.reads() {
                watcher.on_file_can_read_without_blocking(fd);
                notified = true;
            }

            let still_watched = if persistent {
                self.watches.borrow().contains_key(&readiness.token)
            } else {
                !notified
            };
            if readiness.writable && mode.writes() && still_watched {
                watcher.on_file_can_write_without_blocking(fd);
            }

            return true;
        }
    }

    /// Blocks until a native event, a wake-up or `deadline`.
    pub(crate) fn wait(&self, deadline: Option<Instant>) {
        let timeout = deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()));
        self.poll(timeout);
    }

    /// Refills the ready buffer without blocking.
    ///
    /// Events still buffered from an earlier poll are dispatched first. A
    /// level-triggered poll would report their descriptors again, and the
    /// second copy could reach a watcher after the first one drained it.
    pub(crate) fn poll_now(&self) {
        if self.ready.borrow().is_empty() {
            self.poll(Some(Duration::ZERO));
        }
    }

    fn poll(&self, timeout: Option<Duration>) {
        let mut ready = self.ready.borrow_mut();
        if let Err(error) = self.poller.borrow_mut().poll(&mut *ready, timeout) {
            warn!(%error, "native poll failed");
        }
    }
}

/// Owns one file-descriptor watch.
///
/// The watch ends on [`stop_watching`](Self::stop_watching) or when the
/// controller is dropped. A non-persistent watch also ends after it fires.
#[must_use = "dropping the controller stops the watch"]
pub struct FdWatchController {
    fd: RawFd,
    token: Option<u64>,
    backend: Weak<IoBackend>,
}

impl FdWatchController {
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Whether the watch is still registered with the pump.
    pub fn is_watching(&self) -> bool {
        match (self.token, self.backend.upgrade()) {
            (Some(token), Some(backend)) => backend.watches.borrow().contains_key(&token),
            _ => false,
        }
    }

    /// Stops the watch. Returns `false` if it had already ended.
    pub fn stop_watching(&mut self) -> bool {
        let Some(token) = self.token.take() else {
            return false;
        };
        self.backend
            .upgrade()
            .is_some_and(|backend| backend.unwatch(token))
    }
}

impl Drop for FdWatchController {
    fn drop(&mut self) {
        self.stop_watching();
    }
}

impl fmt::Debug for FdWatchController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FdWatchController")
            .field("fd", &self.fd)
            .field("token", &self.token)
            .finish()
    }
}
