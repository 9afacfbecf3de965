//! Windows backend built on the pseudoconsole API (ConPTY)
//!
//! Two anonymous pipes feed the pseudoconsole: the console reads the input
//! pipe and writes the output pipe, we keep the opposite ends. Children are
//! attached through a `PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE` attribute list.
//!
//! Requires Windows 10 1809 or later.
//! Reference: https://learn.microsoft.com/en-us/windows/console/creating-a-pseudoconsole-session

mod child;
mod console;
mod pipe;
mod pty;

pub use child::WindowsChild;
pub use pipe::{WindowsReader, WindowsWriter};
pub use pty::WindowsPty;

use crate::error::Result;
use crate::options::PtyOptions;

/// Open a PTY with the pseudoconsole backend
pub fn open(options: &PtyOptions) -> Result<WindowsPty> {
    WindowsPty::open(options)
}
