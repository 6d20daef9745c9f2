use super::{Interest, Readiness, WakeSignal, timeout_millis};
use crate::error::{Error, Result};

use libc::{
    EFD_CLOEXEC, EFD_NONBLOCK, EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLLERR, EPOLLHUP,
    EPOLLIN, EPOLLOUT, EPOLLRDHUP, epoll_event,
};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

const WAKE_TOKEN: u64 = u64::MAX;
const EVENTS_CAPACITY: usize = 64;

/// Level-triggered epoll instance with an eventfd wake-up.
pub(crate) struct Poller {
    epoll: OwnedFd,
    wake: Arc<EventFd>,
    events: Vec<epoll_event>,
}

pub(crate) struct EventFd {
    fd: OwnedFd,
}

impl EventFd {
    fn drain(&self) {
        let mut value: u64 = 0;
        // Non-blocking; EAGAIN just means another poll already drained it.
        unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                (&mut value as *mut u64).cast(),
                std::mem::size_of::<u64>(),
            );
        }
    }
}

impl WakeSignal for EventFd {
    fn signal(&self) -> io::Result<()> {
        let value: u64 = 1;
        let written = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                (&value as *const u64).cast(),
                std::mem::size_of::<u64>(),
            )
        };

        if written >= 0 {
            return Ok(());
        }

        let error = io::Error::last_os_error();
        match error.raw_os_error() {
            // Counter saturated: a wake is already pending.
            Some(libc::EAGAIN) => Ok(()),
            _ => Err(error),
        }
    }
}

impl Poller {
    pub(crate) fn new() -> Result<Self> {
        let epoll = unsafe { libc::epoll_create1(EPOLL_CLOEXEC) };
        if epoll < 0 {
            return Err(Error::PumpCreation {
                what: "epoll instance",
                source: io::Error::last_os_error(),
            });
        }
        let epoll = unsafe { OwnedFd::from_raw_fd(epoll) };

        let eventfd = unsafe { libc::eventfd(0, EFD_CLOEXEC | EFD_NONBLOCK) };
        if eventfd < 0 {
            return Err(Error::PumpCreation {
                what: "eventfd",
                source: io::Error::last_os_error(),
            });
        }
        let wake = Arc::new(EventFd {
            fd: unsafe { OwnedFd::from_raw_fd(eventfd) },
        });

        let poller = Self {
            epoll,
            wake,
            events: Vec::with_capacity(EVENTS_CAPACITY),
        };
        poller
            .ctl(EPOLL_CTL_ADD, eventfd, EPOLLIN as u32, WAKE_TOKEN)
            .map_err(|source| Error::PumpCreation {
                what: "eventfd registration",
                source,
            })?;

        Ok(poller)
    }

    pub(crate) fn wake_signal(&self) -> Arc<dyn WakeSignal> {
        self.wake.clone()
    }

    pub(crate) fn add(&self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        let mut events = 0u32;
        if interest.read {
            events |= (EPOLLIN | EPOLLRDHUP) as u32;
        }
        if interest.write {
            events |= EPOLLOUT as u32;
        }
        self.ctl(EPOLL_CTL_ADD, fd, events, token)
    }

    pub(crate) fn delete(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(EPOLL_CTL_DEL, fd, 0, 0)
    }

    fn ctl(&self, op: i32, fd: RawFd, events: u32, token: u64) -> io::Result<()> {
        let mut event = epoll_event { events, u64: token };
        let ret = unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), op, fd, &mut event) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Waits up to `timeout` (forever if `None`) and appends readiness to
    /// `ready`. An interrupted wait returns with nothing appended.
    pub(crate) fn poll(
        &mut self,
        ready: &mut impl Extend<Readiness>,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        self.events.clear();
        let n = unsafe {
            libc::epoll_wait(
                self.epoll.as_raw_fd(),
                self.events.as_mut_ptr(),
                EVENTS_CAPACITY as i32,
                timeout_millis(timeout),
            )
        };

        if n < 0 {
            let error = io::Error::last_os_error();
            if error.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(error);
        }
        unsafe { self.events.set_len(n as usize) };

        for event in &self.events {
            let token = event.u64;
            let flags = event.events as i32;

            if token == WAKE_TOKEN {
                self.wake.drain();
                continue;
            }

            ready.extend(Some(Readiness {
                token,
                readable: flags & (EPOLLIN | EPOLLRDHUP | EPOLLHUP | EPOLLERR) != 0,
                writable: flags & (EPOLLOUT | EPOLLERR) != 0,
            }));
        }

        Ok(())
    }
}
