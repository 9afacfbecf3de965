//! POSIX backend
//!
//! Opens a master/slave pair with `openpty`, forks, makes the slave the
//! child's controlling terminal and execs the command. Exec failures travel
//! back to the parent over a close-on-exec pipe so `spawn_command` can fail
//! instead of handing out a child that already died with status 127.
//!
//! Reference: https://www.man7.org/linux/man-pages/man3/openpty.3.html

mod child;
mod pty;

pub use child::UnixChild;
pub use pty::{UnixPty, UnixReader, UnixWriter};

use crate::error::Result;
use crate::options::PtyOptions;

/// Open a PTY with the POSIX backend
pub fn open(options: &PtyOptions) -> Result<UnixPty> {
    UnixPty::open(options)
}
