//! Native readiness pollers backing the I/O pump.
//!
//! Each platform poller exposes the same surface: register and deregister a
//! file descriptor under a token, wait for readiness with an optional
//! timeout, and hand out a [`WakeSignal`] that interrupts the wait. Wake
//! events are consumed inside `poll` and never reach the caller.

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;
#[cfg(any(target_os = "macos", target_os = "ios"))]
mod kqueue;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) use epoll::Poller;
#[cfg(any(target_os = "macos", target_os = "ios"))]
pub(crate) use kqueue::Poller;

#[cfg(any(target_os = "linux", target_os = "android"))]
use std::time::Duration;

pub(crate) use super::waker::WakeSignal;

/// Which readiness a registration asks for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Interest {
    pub(crate) read: bool,
    pub(crate) write: bool,
}

/// One readiness report for a registered token.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Readiness {
    pub(crate) token: u64,
    pub(crate) readable: bool,
    pub(crate) writable: bool,
}

/// Converts a wait timeout to whole milliseconds, rounding up so a deadline
/// is never reached early.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn timeout_millis(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(timeout) => {
            let millis = timeout.as_nanos().div_ceil(1_000_000);
            i32::try_from(millis).unwrap_or(i32::MAX)
        }
    }
}

#[cfg(all(test, any(target_os = "linux", target_os = "android")))]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_rounds_up() {
        assert_eq!(timeout_millis(None), -1);
        assert_eq!(timeout_millis(Some(Duration::ZERO)), 0);
        assert_eq!(timeout_millis(Some(Duration::from_micros(1))), 1);
        assert_eq!(timeout_millis(Some(Duration::from_millis(50))), 50);
        assert_eq!(timeout_millis(Some(Duration::from_secs(u64::MAX))), i32::MAX);
    }
}
