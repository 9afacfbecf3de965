//! The PTY contract shared by every backend

use std::io::{Read, Write};

use crate::child::Child;
use crate::command::CommandSpec;
use crate::error::Result;
use crate::size::PtySize;

/// Recommended buffer size for reading a PTY's output
pub const READ_BUFFER_SIZE: usize = 8192;

/// A pseudo-terminal: one console object plus its two byte streams
///
/// The reader and writer can each be taken exactly once. `close` releases
/// the console object; streams already handed out keep their own handle and
/// see end-of-stream or an I/O error once the terminal is gone.
pub trait Pty: Send {
    /// Resize the terminal; the stored size changes only on success
    fn resize(&mut self, size: PtySize) -> Result<()>;

    /// The last successfully applied size
    fn get_size(&self) -> Result<PtySize>;

    /// Take the output stream (child stdout/stderr)
    fn take_reader(&mut self) -> Result<Box<dyn Read + Send>>;

    /// Take the input stream (child stdin)
    fn take_writer(&mut self) -> Result<Box<dyn Write + Send>>;

    /// Start `command` with the terminal as its stdin, stdout and stderr
    fn spawn_command(&mut self, command: &CommandSpec) -> Result<Box<dyn Child + Send>>;

    /// Release the terminal; a second call fails with `AlreadyClosed`
    ///
    /// Call this after the child has exited and the streams are done with.
    fn close(&mut self) -> Result<()>;
}
