//! The child-process contract shared by every backend

use crate::error::Result;

/// A process attached to a PTY
///
/// `wait` and `kill` invalidate the child; afterwards every lifecycle call
/// fails with [`Error::AlreadyClosed`](crate::Error::AlreadyClosed).
pub trait Child: Send {
    /// Non-blocking status check
    ///
    /// Returns the exit code, or [`Error::NotFinished`](crate::Error::NotFinished)
    /// while the process is still running.
    fn exited(&mut self) -> Result<u32>;

    /// Block until the process exits and return its exit code
    ///
    /// Run this from a thread that is allowed to block.
    fn wait(&mut self) -> Result<u32>;

    /// Forcefully terminate the process
    fn kill(&mut self) -> Result<()>;

    /// OS process id, for diagnostics
    fn process_id(&self) -> Option<u32>;
}
