//! Error types for PTY operations

use std::fmt;
use std::io;

use thiserror::Error;

/// Which one-shot claim on a PTY was attempted twice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// The output stream (child stdout/stderr)
    Reader,
    /// The input stream (child stdin)
    Writer,
    /// The console attachment; held by a live child
    Console,
}

impl fmt::Display for Claim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Claim::Reader => "reader",
            Claim::Writer => "writer",
            Claim::Console => "console",
        })
    }
}

/// PTY error type
#[derive(Error, Debug)]
pub enum Error {
    /// A non-blocking status check found the child still running
    #[error("not finished")]
    NotFinished,

    /// A one-shot resource was claimed a second time
    #[error("{0} already taken")]
    AlreadyTaken(Claim),

    /// The PTY or child has already been closed, waited on or killed
    #[error("already closed")]
    AlreadyClosed,

    /// An operating system call failed
    #[error("{op} failed: {source}")]
    Platform {
        /// Name of the failed operation
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// The command could not be encoded for the OS (e.g. interior NUL byte)
    #[error("invalid command: {0}")]
    InvalidCommand(String),
}

impl Error {
    /// Wrap an I/O error from the named operation
    pub(crate) fn platform(op: &'static str, source: io::Error) -> Self {
        Error::Platform { op, source }
    }

    /// Capture the calling thread's last OS error for the named operation
    pub(crate) fn last_os_error(op: &'static str) -> Self {
        Error::platform(op, io::Error::last_os_error())
    }

    /// `true` for the polling result of a child that is still running
    pub fn is_not_finished(&self) -> bool {
        matches!(self, Error::NotFinished)
    }

    /// `true` when the resource had already been released
    pub fn is_already_closed(&self) -> bool {
        matches!(self, Error::AlreadyClosed)
    }

    /// `true` when a one-shot claim was repeated
    pub fn is_already_taken(&self) -> bool {
        matches!(self, Error::AlreadyTaken(_))
    }

    /// Native error code of a platform failure, if any
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Error::Platform { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

/// Helper to attach an operation name to nix results
#[cfg(unix)]
pub(crate) trait NixResultExt<T> {
    fn op(self, op: &'static str) -> Result<T>;
}

#[cfg(unix)]
impl<T> NixResultExt<T> for nix::Result<T> {
    fn op(self, op: &'static str) -> Result<T> {
        self.map_err(|errno| Error::platform(op, io::Error::from(errno)))
    }
}

/// Result type for PTY operations
pub type Result<T> = std::result::Result<T, Error>;
