//! xpty - cross-platform pseudo-terminals
//!
//! Allocate a PTY, take its reader and writer once each, spawn a child into
//! it, resize it, observe or kill the child and close the PTY.
//!
//! - `unix`: POSIX backend (`openpty`, `fork`, `setsid`, `TIOCSCTTY`)
//! - `windows`: pseudoconsole backend (`CreatePseudoConsole`, attribute lists)
//!
//! ```no_run
//! use std::io::Read;
//! use xpty::{new_pty, default_size, Child, CommandSpec, Pty, READ_BUFFER_SIZE};
//!
//! let mut pty = new_pty(default_size())?;
//! let mut reader = pty.take_reader()?;
//! let mut child = pty.spawn_command(&CommandSpec::new("echo").arg("hello"))?;
//!
//! let mut buf = [0u8; READ_BUFFER_SIZE];
//! let n = reader.read(&mut buf)?;
//! println!("{}", String::from_utf8_lossy(&buf[..n]));
//!
//! let code = child.wait()?;
//! pty.close()?;
//! # let _ = code;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

mod child;
mod command;
mod drain;
mod error;
mod options;
mod pty;
mod size;
mod slot;

#[cfg(unix)]
pub mod unix;

#[cfg(windows)]
pub mod windows;

pub use child::Child;
pub use command::CommandSpec;
pub use drain::{cursor_position_report, CURSOR_POSITION_REQUEST};
pub use error::{Claim, Error, Result};
pub use options::{PtyOptions, DEFAULT_DRAIN_BUFFER_SIZE};
pub use pty::{Pty, READ_BUFFER_SIZE};
pub use size::{default_size, PtySize};

/// The PTY type of the build target's backend
#[cfg(unix)]
pub type NativePty = unix::UnixPty;
/// The child type of the build target's backend
#[cfg(unix)]
pub type NativeChild = unix::UnixChild;

/// The PTY type of the build target's backend
#[cfg(windows)]
pub type NativePty = windows::WindowsPty;
/// The child type of the build target's backend
#[cfg(windows)]
pub type NativeChild = windows::WindowsChild;

/// Open a PTY of the given size with default options
pub fn new_pty(size: PtySize) -> Result<NativePty> {
    open_pty(&PtyOptions::new(size))
}

/// Open a PTY with explicit options
pub fn open_pty(options: &PtyOptions) -> Result<NativePty> {
    #[cfg(unix)]
    return unix::open(options);
    #[cfg(windows)]
    return windows::open(options);
}
