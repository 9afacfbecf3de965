//! Child process management for the POSIX backend

use std::thread;

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use tracing::{debug, warn, Span};

use crate::child::Child;
use crate::error::{Error, NixResultExt, Result};
use crate::slot::ConsoleLease;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Not yet collected
    Running,
    /// Collected by `exited`, still waitable once
    Reaped(u32),
    /// Waited on or killed; the pid may belong to someone else now
    Invalidated,
}

/// A child process attached to a PTY slave
pub struct UnixChild {
    pid: Pid,
    state: State,
    /// Released once the child is invalidated
    lease: Option<ConsoleLease>,
    span: Span,
}

impl UnixChild {
    pub(crate) fn new(pid: Pid, lease: ConsoleLease, span: Span) -> Self {
        Self {
            pid,
            state: State::Running,
            lease: Some(lease),
            span,
        }
    }

    /// Get the child process ID
    pub fn pid(&self) -> Pid {
        self.pid
    }

    fn invalidate(&mut self) {
        self.state = State::Invalidated;
        self.lease = None;
    }

    /// Block in `waitpid` until the child is collected
    fn reap_blocking(&self) -> Result<u32> {
        loop {
            match waitpid(self.pid, None) {
                Err(Errno::EINTR) => continue,
                Ok(status) => {
                    if let Some(code) = exit_code(status) {
                        return Ok(code);
                    }
                }
                Err(e) => return Err(Error::platform("waitpid", e.into())),
            }
        }
    }
}

/// Block until `pid` is collected, whatever its status
pub(super) fn reap(pid: Pid) {
    loop {
        match waitpid(pid, None) {
            Err(Errno::EINTR) => continue,
            _ => break,
        }
    }
}

/// Exit code for a terminal wait status; `128 + signal` for signal deaths
fn exit_code(status: WaitStatus) -> Option<u32> {
    match status {
        WaitStatus::Exited(_, code) => Some(code as u32),
        WaitStatus::Signaled(_, signal, _) => Some(128 + signal as u32),
        _ => None,
    }
}

impl Child for UnixChild {
    fn exited(&mut self) -> Result<u32> {
        match self.state {
            State::Invalidated => Err(Error::AlreadyClosed),
            State::Reaped(code) => Ok(code),
            State::Running => {
                let status = waitpid(self.pid, Some(WaitPidFlag::WNOHANG)).op("waitpid")?;
                match exit_code(status) {
                    Some(code) => {
                        self.state = State::Reaped(code);
                        debug!(parent: &self.span, pid = self.pid.as_raw(), code, "child exited");
                        Ok(code)
                    }
                    None => Err(Error::NotFinished),
                }
            }
        }
    }

    fn wait(&mut self) -> Result<u32> {
        let code = match self.state {
            State::Invalidated => return Err(Error::AlreadyClosed),
            State::Reaped(code) => code,
            State::Running => self.reap_blocking()?,
        };
        self.invalidate();
        debug!(parent: &self.span, pid = self.pid.as_raw(), code, "waited for child");
        Ok(code)
    }

    fn kill(&mut self) -> Result<()> {
        match self.state {
            State::Invalidated => return Err(Error::AlreadyClosed),
            // Already collected: the pid is no longer ours to signal.
            State::Reaped(_) => {}
            State::Running => {
                kill(self.pid, Signal::SIGKILL).op("kill")?;
                self.reap_blocking()?;
            }
        }
        self.invalidate();
        debug!(parent: &self.span, pid = self.pid.as_raw(), "killed child");
        Ok(())
    }

    fn process_id(&self) -> Option<u32> {
        Some(self.pid.as_raw() as u32)
    }
}

impl Drop for UnixChild {
    fn drop(&mut self) {
        if self.state != State::Running {
            return;
        }
        if let Ok(WaitStatus::StillAlive) = waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            // Try to terminate the child gracefully
            let _ = kill(self.pid, Signal::SIGHUP);
            debug!(parent: &self.span, pid = self.pid.as_raw(), "sent SIGHUP to dropped child");

            // Collect it off-thread so it does not linger as a zombie. A child
            // that ignores SIGHUP keeps this thread parked until it exits.
            let pid = self.pid;
            let reaper = thread::Builder::new()
                .name("xpty-reaper".to_string())
                .spawn(move || reap(pid));
            if let Err(e) = reaper {
                warn!(parent: &self.span, error = %e, "could not start reaper for dropped child");
            }
        }
    }
}
