//! Software-only wait primitive for pumps without native event sources.

use super::waker::WakeSignal;

use parking_lot::{Condvar, Mutex};
use std::io;
use std::time::Instant;

/// An auto-reset event.
///
/// `signal` latches until the next `wait` consumes it, so a wake sent while
/// the pump is busy is not lost.
#[derive(Default)]
pub(crate) struct Event {
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl Event {
    /// Blocks until signalled or until `deadline` passes.
    pub(crate) fn wait(&self, deadline: Option<Instant>) {
        let mut signaled = self.signaled.lock();

        while !*signaled {
            match deadline {
                Some(deadline) => {
                    if self.condvar.wait_until(&mut signaled, deadline).timed_out() {
                        break;
                    }
                }
                None => self.condvar.wait(&mut signaled),
            }
        }

        *signaled = false;
    }
}

impl WakeSignal for Event {
    fn signal(&self) -> io::Result<()> {
        *self.signaled.lock() = true;
        self.condvar.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_signal_before_wait_is_latched() {
        let event = Event::default();
        event.signal().unwrap();

        let started = Instant::now();
        event.wait(Some(started + Duration::from_secs(5)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_signal_from_other_thread() {
        let event = Arc::new(Event::default());
        let remote = event.clone();

        let signaller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.signal().unwrap();
        });

        event.wait(None);
        signaller.join().unwrap();
    }

    #[test]
    fn test_deadline_expires() {
        let event = Event::default();
        let started = Instant::now();
        event.wait(Some(started + Duration::from_millis(20)));
        assert!(started.elapsed() >= Duration::from_millis(20));
    }
}
