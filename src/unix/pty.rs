//! PTY master/slave pair and process spawning

use std::ffi::{CStr, CString, OsStr};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::ptr;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::libc;
use nix::pty::openpty;
use nix::sys::termios::{self, SetArg};
use nix::unistd::{chdir, dup2, fork, setsid, ForkResult};
use tracing::{debug, warn, Span};

use super::child::{reap, UnixChild};
use crate::child::Child;
use crate::command::CommandSpec;
use crate::drain::{cursor_position_report, spawn_drain};
use crate::error::{Claim, Error, NixResultExt, Result};
use crate::options::PtyOptions;
use crate::pty::Pty;
use crate::size::PtySize;
use crate::slot::{ConsoleClaim, StreamSlot};

/// A pseudoterminal master with its slave kept open until the first spawn
pub struct UnixPty {
    /// The PTY master; `None` once closed
    master: Option<OwnedFd>,
    /// The slave, held only until a child has it as controlling terminal
    slave: Option<OwnedFd>,
    /// Path to the slave device, for reopening on later spawns
    slave_path: PathBuf,
    reader: StreamSlot<UnixReader>,
    writer: StreamSlot<UnixWriter>,
    size: PtySize,
    console: ConsoleClaim,
    drain_buffer_size: usize,
    cursor_reply: (u16, u16),
    closed: bool,
    span: Span,
}

impl UnixPty {
    /// Create a new PTY with the given size
    pub fn open(options: &PtyOptions) -> Result<Self> {
        let span = options.make_span("unix");
        let winsize = options.size.to_winsize();
        let pair = openpty(&winsize, None).op("openpty")?;

        set_cloexec(pair.master.as_raw_fd())?;
        set_cloexec(pair.slave.as_raw_fd())?;

        if options.raw_mode {
            make_raw(&pair.slave)?;
        }

        let slave_path = tty_name(pair.slave.as_raw_fd())?;
        let dup = |fd: &OwnedFd| {
            fd.try_clone()
                .map(File::from)
                .map_err(|e| Error::platform("dup", e))
        };
        let reader = UnixReader(dup(&pair.master)?);
        let writer = UnixWriter(dup(&pair.master)?);

        debug!(parent: &span, tty = %slave_path.display(), "opened pty");

        Ok(Self {
            master: Some(pair.master),
            slave: Some(pair.slave),
            slave_path,
            reader: StreamSlot::new(Claim::Reader, reader),
            writer: StreamSlot::new(Claim::Writer, writer),
            size: options.size,
            console: ConsoleClaim::default(),
            drain_buffer_size: options.drain_buffer_size,
            cursor_reply: options.cursor_reply,
            closed: false,
            span,
        })
    }

    /// Path of the slave device, e.g. `/dev/pts/3`
    pub fn tty_name(&self) -> &Path {
        &self.slave_path
    }

    fn master_fd(&self) -> Result<RawFd> {
        match &self.master {
            Some(master) if !self.closed => Ok(master.as_raw_fd()),
            _ => Err(Error::AlreadyClosed),
        }
    }

    /// The slave descriptor for the next child, reopening it if an earlier
    /// child already consumed the one from `openpty`
    fn slave_for_spawn(&mut self) -> Result<OwnedFd> {
        if let Some(slave) = self.slave.take() {
            return Ok(slave);
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY | libc::O_CLOEXEC)
            .open(&self.slave_path)
            .map_err(|e| Error::platform("open slave", e))?;
        Ok(OwnedFd::from(file))
    }

    /// Drop every descriptor the PTY still holds
    ///
    /// A stream handed out keeps the master open, so the kernel never hangs
    /// up the session on our close. In that case the output is drained on a
    /// detached thread until the last slave descriptor goes away, answering
    /// cursor-position requests so a child waiting on one can finish.
    fn release(&mut self) {
        self.closed = true;
        let handed_out = self.reader.is_taken() || self.writer.is_taken();
        self.reader.clear();
        self.writer.clear();
        self.slave = None;

        if let Some(master) = self.master.take() {
            if handed_out {
                self.start_drain(&master);
            }
        }
    }

    fn start_drain(&self, master: &OwnedFd) {
        let dup = || master.try_clone().map(File::from);
        let (reader, writer) = match dup().and_then(|read| Ok((read, dup()?))) {
            Ok((read, write)) => (UnixReader(read), UnixWriter(write)),
            Err(e) => {
                warn!(parent: &self.span, error = %e, "could not start output drain");
                return;
            }
        };

        let reply = cursor_position_report(self.cursor_reply.0, self.cursor_reply.1);
        match spawn_drain(reader, writer, self.drain_buffer_size, reply, self.span.clone()) {
            Ok(()) => debug!(parent: &self.span, "draining output after close"),
            Err(e) => warn!(parent: &self.span, error = %e, "could not start output drain"),
        }
    }
}

impl Pty for UnixPty {
    fn resize(&mut self, size: PtySize) -> Result<()> {
        set_window_size(self.master_fd()?, size)?;
        self.size = size;
        debug!(parent: &self.span, rows = size.rows, cols = size.cols, "resized");
        Ok(())
    }

    fn get_size(&self) -> Result<PtySize> {
        Ok(self.size)
    }

    fn take_reader(&mut self) -> Result<Box<dyn Read + Send>> {
        self.master_fd()?;
        Ok(Box::new(self.reader.take()?))
    }

    fn take_writer(&mut self) -> Result<Box<dyn Write + Send>> {
        self.master_fd()?;
        Ok(Box::new(self.writer.take()?))
    }

    fn spawn_command(&mut self, command: &CommandSpec) -> Result<Box<dyn Child + Send>> {
        self.master_fd()?;
        let lease = self.console.acquire()?;
        let exec = ExecArgs::new(command)?;
        let slave = self.slave_for_spawn()?;

        match spawn_on_slave(&slave, &exec) {
            Ok(pid) => {
                // The child holds the slave now; keeping our copy would stop
                // the reader from ever seeing end-of-stream.
                drop(slave);
                debug!(parent: &self.span, pid = pid.as_raw(), program = ?command.get_program(), "spawned child");
                Ok(Box::new(UnixChild::new(pid, lease, self.span.clone())))
            }
            Err(e) => {
                self.slave = Some(slave);
                debug!(parent: &self.span, error = %e, program = ?command.get_program(), "spawn failed");
                Err(e)
            }
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Err(Error::AlreadyClosed);
        }
        self.release();
        debug!(parent: &self.span, "closed pty");
        Ok(())
    }
}

impl Drop for UnixPty {
    fn drop(&mut self) {
        if !self.closed {
            self.release();
        }
    }
}

/// Output side of the PTY master
///
/// Once every slave descriptor is closed Linux reports `EIO` on the master;
/// that is surfaced as end-of-stream.
#[derive(Debug)]
pub struct UnixReader(File);

impl Read for UnixReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.0.read(buf) {
            Err(e) if e.raw_os_error() == Some(libc::EIO) => Ok(0),
            other => other,
        }
    }
}

/// Input side of the PTY master
#[derive(Debug)]
pub struct UnixWriter(File);

impl Write for UnixWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()
    }
}

/// Everything `execve` needs, encoded before forking so the child
/// allocates nothing
struct ExecArgs {
    program: CString,
    cwd: Option<CString>,
    argv: Vec<CString>,
    envp: Option<Vec<CString>>,
}

impl ExecArgs {
    fn new(command: &CommandSpec) -> Result<Self> {
        let program = resolve_program(command)?;
        let argv = std::iter::once(command.get_program())
            .chain(command.get_args().iter().map(|a| a.as_os_str()))
            .map(to_cstring)
            .collect::<Result<Vec<_>>>()?;
        let envp = command
            .get_env()
            .map(|vars| {
                vars.iter()
                    .map(|(k, v)| {
                        if k.is_empty() || k.as_bytes().contains(&b'=') {
                            return Err(Error::InvalidCommand(format!(
                                "invalid environment variable name {:?}",
                                k
                            )));
                        }
                        let mut entry = Vec::with_capacity(k.len() + v.len() + 1);
                        entry.extend_from_slice(k.as_bytes());
                        entry.push(b'=');
                        entry.extend_from_slice(v.as_bytes());
                        CString::new(entry).map_err(|e| Error::InvalidCommand(e.to_string()))
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .transpose()?;
        let cwd = command
            .get_cwd()
            .map(|dir| to_cstring(dir.as_os_str()))
            .transpose()?;
        Ok(Self {
            program,
            cwd,
            argv,
            envp,
        })
    }
}

fn to_cstring(s: &OsStr) -> Result<CString> {
    CString::new(s.as_bytes()).map_err(|e| Error::InvalidCommand(e.to_string()))
}

/// Find the executable the way `execvp` would, using the command's own
/// `PATH` when it sets one
fn resolve_program(command: &CommandSpec) -> Result<CString> {
    let program = command.get_program();
    if program.is_empty() {
        return Err(Error::InvalidCommand("empty program name".to_string()));
    }
    if program.as_bytes().contains(&b'/') {
        return to_cstring(program);
    }

    let path = command
        .env_var("PATH")
        .map(|p| p.to_os_string())
        .or_else(|| std::env::var_os("PATH"))
        .unwrap_or_else(|| "/usr/local/bin:/usr/bin:/bin".into());

    for dir in path.as_bytes().split(|&b| b == b':') {
        let dir = if dir.is_empty() {
            Path::new(".")
        } else {
            Path::new(OsStr::from_bytes(dir))
        };
        let candidate = dir.join(program);
        if is_executable(&candidate) {
            return to_cstring(candidate.as_os_str());
        }
    }

    Err(Error::platform(
        "execve",
        io::Error::from_raw_os_error(libc::ENOENT),
    ))
}

fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Fork and exec `exec` with `slave` as controlling terminal and stdio
fn spawn_on_slave(slave: &OwnedFd, exec: &ExecArgs) -> Result<nix::unistd::Pid> {
    let argv = null_terminated(&exec.argv);
    let envp = exec.envp.as_deref().map(null_terminated);

    let (err_read, err_write) = cloexec_pipe()?;

    // SAFETY: the child branch only makes async-signal-safe calls on data
    // prepared above, then execs or exits.
    match unsafe { fork() }.op("fork")? {
        ForkResult::Child => unsafe {
            exec_in_child(
                slave.as_raw_fd(),
                err_write.as_raw_fd(),
                &exec.program,
                exec.cwd.as_deref(),
                &argv,
                envp.as_deref(),
            )
        },
        ForkResult::Parent { child } => {
            drop(err_write);

            // Empty means exec succeeded and the close-on-exec pipe closed.
            let mut report = Vec::with_capacity(4);
            let read = File::from(err_read).read_to_end(&mut report);

            if report.len() >= 4 {
                let errno = i32::from_ne_bytes([report[0], report[1], report[2], report[3]]);
                reap(child);
                return Err(Error::platform(
                    "execve",
                    io::Error::from_raw_os_error(errno),
                ));
            }
            if let Err(e) = read {
                warn!(error = %e, "could not read exec status from child");
            }
            Ok(child)
        }
    }
}

fn null_terminated(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(ptr::null()))
        .collect()
}

/// Runs in the forked child. Never returns.
unsafe fn exec_in_child(
    slave: RawFd,
    err_fd: RawFd,
    program: &CStr,
    cwd: Option<&CStr>,
    argv: &[*const libc::c_char],
    envp: Option<&[*const libc::c_char]>,
) -> ! {
    // Create new session and set controlling terminal
    if setsid().is_err() {
        report_and_exit(err_fd);
    }
    if libc::ioctl(slave, libc::TIOCSCTTY as _, 0) < 0 {
        report_and_exit(err_fd);
    }

    // Duplicate slave to stdin, stdout, stderr
    for fd in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        if dup2(slave, fd).is_err() {
            report_and_exit(err_fd);
        }
    }
    if slave > libc::STDERR_FILENO {
        libc::close(slave);
    } else if libc::fcntl(slave, libc::F_SETFD, 0) < 0 {
        // dup2 onto itself is a no-op and keeps FD_CLOEXEC.
        report_and_exit(err_fd);
    }

    if let Some(dir) = cwd {
        if chdir(dir).is_err() {
            report_and_exit(err_fd);
        }
    }

    // The Rust runtime ignores SIGPIPE; exec'd programs expect the default.
    libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    let mut set: libc::sigset_t = std::mem::zeroed();
    libc::sigemptyset(&mut set);
    libc::sigprocmask(libc::SIG_SETMASK, &set, ptr::null_mut());

    match envp {
        Some(envp) => libc::execve(program.as_ptr(), argv.as_ptr(), envp.as_ptr()),
        None => libc::execv(program.as_ptr(), argv.as_ptr()),
    };
    report_and_exit(err_fd)
}

unsafe fn report_and_exit(err_fd: RawFd) -> ! {
    let errno = Errno::last_raw().to_ne_bytes();
    libc::write(err_fd, errno.as_ptr().cast(), errno.len());
    libc::_exit(127)
}

/// Pipe with both ends close-on-exec from the start
#[cfg(not(target_vendor = "apple"))]
fn cloexec_pipe() -> Result<(OwnedFd, OwnedFd)> {
    nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).op("pipe2")
}

/// Pipe with both ends close-on-exec; Apple platforms have no `pipe2`
#[cfg(target_vendor = "apple")]
fn cloexec_pipe() -> Result<(OwnedFd, OwnedFd)> {
    let (read, write) = nix::unistd::pipe().op("pipe")?;
    set_cloexec(read.as_raw_fd())?;
    set_cloexec(write.as_raw_fd())?;
    Ok((read, write))
}

fn set_cloexec(fd: RawFd) -> Result<()> {
    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).op("fcntl")?;
    Ok(())
}

/// Put the line discipline into raw mode (no echo, no signals, no output
/// processing)
fn make_raw(slave: &OwnedFd) -> Result<()> {
    let mut attrs = termios::tcgetattr(slave.as_fd()).op("tcgetattr")?;
    termios::cfmakeraw(&mut attrs);
    termios::tcsetattr(slave.as_fd(), SetArg::TCSANOW, &attrs).op("tcsetattr")?;
    Ok(())
}

fn tty_name(fd: RawFd) -> Result<PathBuf> {
    let mut buf = [0 as libc::c_char; 128];
    // SAFETY: buf is writable for its full length and NUL-terminated on success
    let rc = unsafe { libc::ttyname_r(fd, buf.as_mut_ptr(), buf.len()) };
    if rc != 0 {
        return Err(Error::platform("ttyname", io::Error::from_raw_os_error(rc)));
    }
    let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
    Ok(PathBuf::from(OsStr::from_bytes(name.to_bytes())))
}

/// Set the window size on a PTY file descriptor
fn set_window_size(fd: RawFd, size: PtySize) -> Result<()> {
    let ws = size.to_winsize();
    // SAFETY: TIOCSWINSZ reads a winsize from a valid pointer
    let result = unsafe { libc::ioctl(fd, libc::TIOCSWINSZ as _, &ws) };
    if result < 0 {
        Err(Error::last_os_error("resize"))
    } else {
        Ok(())
    }
}

/// Get the window size from a PTY file descriptor
#[cfg(test)]
fn get_window_size(fd: RawFd) -> Result<PtySize> {
    let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
    // SAFETY: TIOCGWINSZ writes a winsize to a valid pointer
    let result = unsafe { libc::ioctl(fd, libc::TIOCGWINSZ as _, &mut ws) };
    if result < 0 {
        Err(Error::last_os_error("resize"))
    } else {
        Ok(PtySize::from(ws))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pty_creation() {
        let pty = UnixPty::open(&PtyOptions::default()).unwrap();
        let name = pty.tty_name().to_string_lossy().into_owned();
        #[cfg(target_os = "linux")]
        assert!(name.starts_with("/dev/pts/"), "unexpected tty {}", name);
        #[cfg(target_os = "macos")]
        assert!(name.starts_with("/dev/ttys"), "unexpected tty {}", name);
        assert!(!name.is_empty());
    }

    #[test]
    fn test_initial_size_reaches_kernel() {
        let pty = UnixPty::open(&PtyOptions::new(PtySize::new(100, 30))).unwrap();
        let size = get_window_size(pty.master_fd().unwrap()).unwrap();
        assert_eq!(size.cols, 100);
        assert_eq!(size.rows, 30);
    }

    #[test]
    fn test_resize_reaches_kernel() {
        let mut pty = UnixPty::open(&PtyOptions::default()).unwrap();
        let size = PtySize::with_pixels(120, 40, 960, 640);
        pty.resize(size).unwrap();
        assert_eq!(get_window_size(pty.master_fd().unwrap()).unwrap(), size);
        assert_eq!(pty.get_size().unwrap(), size);
    }

    #[test]
    fn test_operations_after_close() {
        let mut pty = UnixPty::open(&PtyOptions::default()).unwrap();
        pty.close().unwrap();
        assert!(matches!(pty.resize(PtySize::default()), Err(Error::AlreadyClosed)));
        assert!(matches!(pty.take_reader(), Err(Error::AlreadyClosed)));
        assert!(matches!(pty.take_writer(), Err(Error::AlreadyClosed)));
        assert!(matches!(
            pty.spawn_command(&CommandSpec::new("/bin/true")),
            Err(Error::AlreadyClosed)
        ));
        assert_eq!(pty.get_size().unwrap(), PtySize::default());
    }

    #[test]
    fn test_resolve_program_uses_command_path() {
        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("xpty-tool");
        std::fs::write(&tool, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o755)).unwrap();

        let command = CommandSpec::new("xpty-tool").env("PATH", dir.path());
        let resolved = resolve_program(&command).unwrap();
        assert_eq!(resolved.as_bytes(), tool.as_os_str().as_bytes());
    }

    #[test]
    fn test_resolve_program_not_found() {
        let command = CommandSpec::new("xpty-no-such-program").env("PATH", "/nonexistent");
        let err = resolve_program(&command).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }

    #[test]
    fn test_resolve_program_skips_non_executables() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("plain"), "data").unwrap();
        let command = CommandSpec::new("plain").env("PATH", dir.path());
        assert!(resolve_program(&command).is_err());
    }

    #[test]
    fn test_exec_args_reject_nul() {
        let command = CommandSpec::new("/bin/echo").arg("a\0b");
        assert!(matches!(ExecArgs::new(&command), Err(Error::InvalidCommand(_))));

        let command = CommandSpec::new("/bin/echo").env_clear().env("A=B", "1");
        assert!(matches!(ExecArgs::new(&command), Err(Error::InvalidCommand(_))));
    }

    #[test]
    fn test_exec_failure_is_reported() {
        let mut pty = UnixPty::open(&PtyOptions::default()).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let not_exec = dir.path().join("not-executable");
        std::fs::write(&not_exec, "data").unwrap();

        let err = pty
            .spawn_command(&CommandSpec::new(&not_exec))
            .err()
            .expect("spawn should fail");
        assert_eq!(err.raw_os_error(), Some(libc::EACCES));

        // The claim was released and the slave kept for a retry.
        let mut child = pty
            .spawn_command(&CommandSpec::new("/bin/sh").args(["-c", "exit 0"]))
            .unwrap();
        assert_eq!(child.wait().unwrap(), 0);
    }

    #[test]
    fn test_missing_cwd_is_reported() {
        let mut pty = UnixPty::open(&PtyOptions::default()).unwrap();
        let err = pty
            .spawn_command(&CommandSpec::new("/bin/sh").cwd("/nonexistent/xpty"))
            .err()
            .expect("spawn should fail");
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }

    #[test]
    fn test_exec_status_pipe_is_cloexec() {
        let (read, write) = cloexec_pipe().unwrap();
        for fd in [read.as_raw_fd(), write.as_raw_fd()] {
            let flags = fcntl(fd, FcntlArg::F_GETFD).unwrap();
            assert!(FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC));
        }
    }

    #[test]
    fn test_close_without_streams_hangs_up_child() {
        let mut pty = UnixPty::open(&PtyOptions::default()).unwrap();
        let mut child = pty
            .spawn_command(&CommandSpec::new("/bin/sh").args(["-c", "read line; exit 0"]))
            .unwrap();
        pty.close().unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let _ = tx.send(child.wait());
        });
        let waited = rx
            .recv_timeout(std::time::Duration::from_secs(10))
            .expect("child kept running after the master closed");
        assert!(waited.is_ok());
    }

    const STDIO_SLAVE_CHILD: &str = "XPTY_STDIO_SLAVE_CHILD";
    const STDIO_SLAVE_MARKER: &str = "stdio slave child ran";

    /// Body of `test_slave_on_stdio_descriptor`, run in a re-executed test
    /// binary so closing stdin and stdout affects no other test
    #[test]
    #[ignore]
    fn test_slave_on_stdio_descriptor_reexec() {
        if std::env::var_os(STDIO_SLAVE_CHILD).is_none() {
            return;
        }
        eprintln!("{}", STDIO_SLAVE_MARKER);
        unsafe {
            libc::close(libc::STDIN_FILENO);
            libc::close(libc::STDOUT_FILENO);
        }

        // The master takes fd 0 and the slave fd 1.
        let mut pty = UnixPty::open(&PtyOptions::default()).unwrap();
        let slave_fd = pty.slave.as_ref().unwrap().as_raw_fd();
        assert!(slave_fd <= libc::STDERR_FILENO, "slave landed on fd {}", slave_fd);

        let mut reader = pty.take_reader().unwrap();
        let mut child = pty
            .spawn_command(&CommandSpec::new("/bin/sh").args(["-c", "printf ok"]))
            .unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(child.wait().unwrap(), 0);
        assert!(String::from_utf8_lossy(&out).contains("ok"));
    }

    #[test]
    fn test_slave_on_stdio_descriptor() {
        let output = std::process::Command::new(std::env::current_exe().unwrap())
            .args([
                "unix::pty::tests::test_slave_on_stdio_descriptor_reexec",
                "--exact",
                "--ignored",
                "--nocapture",
                "--test-threads=1",
            ])
            .env(STDIO_SLAVE_CHILD, "1")
            .output()
            .unwrap();
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(stderr.contains(STDIO_SLAVE_MARKER), "test did not run: {}", stderr);
        assert!(output.status.success(), "{}", stderr);
    }
}
