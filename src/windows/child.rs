//! Child process management for the Windows backend

use std::os::windows::io::{AsRawHandle, OwnedHandle};
use std::sync::Arc;

use tracing::{debug, Span};
use windows_sys::Win32::Foundation::{WAIT_FAILED, WAIT_OBJECT_0, WAIT_TIMEOUT};
use windows_sys::Win32::System::Threading::{
    GetExitCodeProcess, TerminateProcess, WaitForSingleObject, INFINITE,
};

use super::console::Console;
use crate::child::Child;
use crate::error::{Error, Result};
use crate::slot::ConsoleLease;

/// Exit code given to a process ended by `kill`
const KILLED_EXIT_CODE: u32 = 1;

/// How long `kill` waits for the process object to become signaled
const KILL_WAIT_MS: u32 = 5_000;

/// A process attached to a pseudoconsole
pub struct WindowsChild {
    /// `None` once waited on or killed
    process: Option<OwnedHandle>,
    pid: u32,
    /// Torn down when the child has been waited on
    console: Arc<Console>,
    lease: Option<ConsoleLease>,
    span: Span,
}

impl WindowsChild {
    pub(crate) fn new(
        process: OwnedHandle,
        pid: u32,
        console: Arc<Console>,
        lease: ConsoleLease,
        span: Span,
    ) -> Self {
        Self {
            process: Some(process),
            pid,
            console,
            lease: Some(lease),
            span,
        }
    }

    fn process(&self) -> Result<&OwnedHandle> {
        self.process.as_ref().ok_or(Error::AlreadyClosed)
    }

    fn invalidate(&mut self) {
        self.process = None;
        self.lease = None;
    }
}

/// Wait up to `timeout_ms` for the process; `Ok(true)` once it has exited
fn wait_for(process: &OwnedHandle, timeout_ms: u32) -> Result<bool> {
    // SAFETY: the handle is open for the duration of the call
    match unsafe { WaitForSingleObject(process.as_raw_handle(), timeout_ms) } {
        WAIT_OBJECT_0 => Ok(true),
        WAIT_TIMEOUT => Ok(false),
        WAIT_FAILED => Err(Error::last_os_error("WaitForSingleObject")),
        other => Err(Error::platform(
            "WaitForSingleObject",
            std::io::Error::other(format!("unexpected wait result {:#x}", other)),
        )),
    }
}

fn exit_code(process: &OwnedHandle) -> Result<u32> {
    let mut code = 0u32;
    // SAFETY: the handle is open; code is a valid out-pointer
    if unsafe { GetExitCodeProcess(process.as_raw_handle(), &mut code) } == 0 {
        return Err(Error::last_os_error("GetExitCodeProcess"));
    }
    Ok(code)
}

impl Child for WindowsChild {
    /// Reports `NotFinished` only while the process object is unsignaled,
    /// so a process that really exited with 259 (`STILL_ACTIVE`) is not
    /// mistaken for a running one.
    fn exited(&mut self) -> Result<u32> {
        let process = self.process()?;
        if !wait_for(process, 0)? {
            return Err(Error::NotFinished);
        }
        exit_code(process)
    }

    fn wait(&mut self) -> Result<u32> {
        let process = self.process()?;
        wait_for(process, INFINITE)?;
        let code = exit_code(process)?;
        self.invalidate();
        debug!(parent: &self.span, pid = self.pid, code, "waited for child");

        // The child is gone; release the terminal so readers see end-of-stream.
        self.console.shutdown();
        Ok(code)
    }

    fn kill(&mut self) -> Result<()> {
        let process = self.process()?;
        // SAFETY: the handle is open and has terminate access
        if unsafe { TerminateProcess(process.as_raw_handle(), KILLED_EXIT_CODE) } == 0 {
            return Err(Error::last_os_error("TerminateProcess"));
        }
        if let Err(e) = wait_for(process, KILL_WAIT_MS) {
            debug!(parent: &self.span, error = %e, "wait after terminate failed");
        }
        self.invalidate();
        debug!(parent: &self.span, pid = self.pid, "killed child");
        Ok(())
    }

    fn process_id(&self) -> Option<u32> {
        Some(self.pid)
    }
}
