use super::{Interest, Readiness, WakeSignal};
use crate::error::{Error, Result};

use libc::{
    EV_ADD, EV_CLEAR, EV_DELETE, EV_ENABLE, EV_EOF, EV_ERROR, EVFILT_READ, EVFILT_USER,
    EVFILT_WRITE, NOTE_TRIGGER, kevent, timespec,
};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

const WAKE_IDENT: usize = 1;
const EVENTS_CAPACITY: usize = 64;

/// kqueue instance with an `EVFILT_USER` wake-up.
pub(crate) struct Poller {
    kqueue: Arc<OwnedFd>,
    events: Vec<kevent>,
}

struct UserEvent {
    kqueue: Arc<OwnedFd>,
}

fn change(ident: usize, filter: i16, flags: u16, fflags: u32, token: u64) -> kevent {
    kevent {
        ident,
        filter: filter as _,
        flags: flags as _,
        fflags,
        data: 0,
        udata: token as usize as *mut _,
    }
}

fn apply(kqueue: RawFd, changes: &[kevent]) -> io::Result<()> {
    let ret = unsafe {
        libc::kevent(
            kqueue,
            changes.as_ptr(),
            changes.len() as i32,
            ptr::null_mut(),
            0,
            ptr::null(),
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

impl WakeSignal for UserEvent {
    fn signal(&self) -> io::Result<()> {
        let trigger = change(WAKE_IDENT, EVFILT_USER as i16, 0, NOTE_TRIGGER, 0);
        apply(self.kqueue.as_raw_fd(), &[trigger])
    }
}

impl Poller {
    pub(crate) fn new() -> Result<Self> {
        let fd = unsafe { libc::kqueue() };
        if fd < 0 {
            return Err(Error::PumpCreation {
                what: "kqueue",
                source: io::Error::last_os_error(),
            });
        }
        let kqueue = Arc::new(unsafe { OwnedFd::from_raw_fd(fd) });

        let wake = change(
            WAKE_IDENT,
            EVFILT_USER as i16,
            (EV_ADD | EV_ENABLE | EV_CLEAR) as u16,
            0,
            0,
        );
        apply(fd, &[wake]).map_err(|source| Error::PumpCreation {
            what: "EVFILT_USER registration",
            source,
        })?;

        Ok(Self {
            kqueue,
            events: Vec::with_capacity(EVENTS_CAPACITY),
        })
    }

    pub(crate) fn wake_signal(&self) -> Arc<dyn WakeSignal> {
        Arc::new(UserEvent {
            kqueue: self.kqueue.clone(),
        })
    }

    pub(crate) fn add(&self, fd: RawFd, token: u64, interest: Interest) -> io::Result<()> {
        let flags = (EV_ADD | EV_ENABLE) as u16;
        let mut changes = Vec::with_capacity(2);

        if interest.read {
            changes.push(change(fd as usize, EVFILT_READ as i16, flags, 0, token));
        }
        if interest.write {
            changes.push(change(fd as usize, EVFILT_WRITE as i16, flags, 0, token));
        }

        apply(self.kqueue.as_raw_fd(), &changes)
    }

    pub(crate) fn delete(&self, fd: RawFd) -> io::Result<()> {
        // Filters are deleted one by one; ENOENT means it was never added.
        for filter in [EVFILT_READ, EVFILT_WRITE] {
            let removal = change(fd as usize, filter as i16, EV_DELETE as u16, 0, 0);
            if let Err(error) = apply(self.kqueue.as_raw_fd(), &[removal]) {
                if error.raw_os_error() != Some(libc::ENOENT) {
                    return Err(error);
                }
            }
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
        let wait_for = timeout.map(|timeout| timespec {
            tv_sec: timeout.as_secs().min(i64::MAX as u64) as _,
            tv_nsec: timeout.subsec_nanos() as _,
        });
        let wait_for_ptr = wait_for
            .as_ref()
            .map_or(ptr::null(), |wait_for| wait_for as *const timespec);

        self.events.clear();
        let n = unsafe {
            kevent(
                self.kqueue.as_raw_fd(),
                ptr::null(),
                0,
                self.events.as_mut_ptr(),
                EVENTS_CAPACITY as i32,
                wait_for_ptr,
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
            if event.filter == EVFILT_USER as _ {
                continue;
            }

            let failed = event.flags & (EV_ERROR as _) != 0 || event.flags & (EV_EOF as _) != 0;
            ready.extend(Some(Readiness {
                token: event.udata as usize as u64,
                readable: event.filter == EVFILT_READ as _ || failed,
                writable: event.filter == EVFILT_WRITE as _,
            }));
        }

        Ok(())
    }
}
