//! Error types for recoverable failures.
//!
//! Misuse of the run loop (binding two controllers to one thread, running an
//! unbound controller, quitting outside `run`) is not represented here: those
//! are programming errors and panic at the call site.

use std::io;
use std::os::fd::RawFd;

/// Errors surfaced while setting up or extending a pump.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The native poller or its wake primitive could not be created.
    #[error("failed to create {what}: {source}")]
    PumpCreation {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    /// A file descriptor could not be added to the native poller.
    #[error("failed to watch file descriptor {fd}: {source}")]
    Watch {
        fd: RawFd,
        #[source]
        source: io::Error,
    },

    /// The operation needs a pump created with `PumpType::Io`.
    #[error("{0} requires a pump with native I/O support")]
    Unsupported(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
