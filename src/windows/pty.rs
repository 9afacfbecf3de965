//! ConPTY-backed PTY and process creation

use std::ffi::{c_void, OsStr};
use std::io::{Read, Write};
use std::os::windows::ffi::OsStrExt;
use std::os::windows::io::{FromRawHandle, OwnedHandle};
use std::ptr;
use std::sync::Arc;

use tracing::{debug, Span};
use windows_sys::Win32::Foundation::INVALID_HANDLE_VALUE;
use windows_sys::Win32::System::Threading::{
    CreateProcessW, CREATE_UNICODE_ENVIRONMENT, EXTENDED_STARTUPINFO_PRESENT,
    PROCESS_INFORMATION, STARTF_USESTDHANDLES, STARTUPINFOEXW,
};

use super::child::WindowsChild;
use super::console::{Console, PseudoConsoleAttribute};
use super::pipe::{WindowsReader, WindowsWriter};
use crate::child::Child;
use crate::command::{windows_command_line, windows_env_block, CommandSpec};
use crate::error::{Claim, Error, Result};
use crate::options::PtyOptions;
use crate::pty::Pty;
use crate::size::PtySize;
use crate::slot::{ConsoleClaim, StreamSlot};

/// A pseudo-terminal backed by a Windows pseudoconsole
pub struct WindowsPty {
    console: Arc<Console>,
    reader: StreamSlot<WindowsReader>,
    writer: StreamSlot<WindowsWriter>,
    size: PtySize,
    claim: ConsoleClaim,
    closed: bool,
    span: Span,
}

impl WindowsPty {
    pub fn open(options: &PtyOptions) -> Result<Self> {
        let span = options.make_span("conpty");
        let console = Console::create(options, span.clone())?;
        let (reader, writer) = console.streams()?;

        Ok(Self {
            console: Arc::new(console),
            reader: StreamSlot::new(Claim::Reader, reader),
            writer: StreamSlot::new(Claim::Writer, writer),
            size: options.size,
            claim: ConsoleClaim::default(),
            closed: false,
            span,
        })
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::AlreadyClosed)
        } else {
            Ok(())
        }
    }
}

fn wide(s: &OsStr) -> Vec<u16> {
    s.encode_wide().collect()
}

fn wide_nul(s: &OsStr) -> Result<Vec<u16>> {
    let mut w = wide(s);
    if w.contains(&0) {
        return Err(Error::InvalidCommand(format!("{:?} contains a NUL character", s)));
    }
    w.push(0);
    Ok(w)
}

impl Pty for WindowsPty {
    fn resize(&mut self, size: PtySize) -> Result<()> {
        self.check_open()?;
        self.console.resize(size)?;
        self.size = size;
        debug!(parent: &self.span, rows = size.rows, cols = size.cols, "resized");
        Ok(())
    }

    fn get_size(&self) -> Result<PtySize> {
        Ok(self.size)
    }

    fn take_reader(&mut self) -> Result<Box<dyn Read + Send>> {
        self.check_open()?;
        Ok(Box::new(self.reader.take()?))
    }

    fn take_writer(&mut self) -> Result<Box<dyn Write + Send>> {
        self.check_open()?;
        Ok(Box::new(self.writer.take()?))
    }

    fn spawn_command(&mut self, command: &CommandSpec) -> Result<Box<dyn Child + Send>> {
        self.check_open()?;
        let lease = self.claim.acquire()?;

        // Encode everything before touching the OS so a bad argument leaks nothing.
        let args: Vec<Vec<u16>> = command.get_args().iter().map(|a| wide(a)).collect();
        let mut command_line = windows_command_line(&wide(command.get_program()), &args)?;
        let env_block = command
            .get_env()
            .map(|vars| {
                let vars: Vec<(Vec<u16>, Vec<u16>)> =
                    vars.iter().map(|(k, v)| (wide(k), wide(v))).collect();
                windows_env_block(&vars)
            })
            .transpose()?;
        let cwd = command
            .get_cwd()
            .map(|dir| wide_nul(dir.as_os_str()))
            .transpose()?;

        let console = self.console.live()?;
        let attribute = PseudoConsoleAttribute::new(console.hpcon())?;

        let mut startup: STARTUPINFOEXW = unsafe { std::mem::zeroed() };
        startup.StartupInfo.cb = std::mem::size_of::<STARTUPINFOEXW>() as u32;
        // Keep the child from inheriting our own standard handles.
        startup.StartupInfo.dwFlags = STARTF_USESTDHANDLES;
        startup.StartupInfo.hStdInput = INVALID_HANDLE_VALUE;
        startup.StartupInfo.hStdOutput = INVALID_HANDLE_VALUE;
        startup.StartupInfo.hStdError = INVALID_HANDLE_VALUE;
        startup.lpAttributeList = attribute.as_ptr();

        let mut info: PROCESS_INFORMATION = unsafe { std::mem::zeroed() };

        // SAFETY: every pointer refers to a live, NUL-terminated buffer or
        // is null; command_line is mutable as CreateProcessW requires
        let ok = unsafe {
            CreateProcessW(
                ptr::null(),
                command_line.as_mut_ptr(),
                ptr::null(),
                ptr::null(),
                0,
                EXTENDED_STARTUPINFO_PRESENT | CREATE_UNICODE_ENVIRONMENT,
                env_block
                    .as_ref()
                    .map_or(ptr::null(), |block| block.as_ptr() as *const c_void),
                cwd.as_ref().map_or(ptr::null(), |dir| dir.as_ptr()),
                &startup.StartupInfo,
                &mut info,
            )
        };
        if ok == 0 {
            let err = Error::last_os_error("CreateProcessW");
            debug!(parent: &self.span, error = %err, program = ?command.get_program(), "spawn failed");
            return Err(err);
        }
        drop(attribute);
        drop(console);

        // SAFETY: CreateProcessW succeeded, so both handles are ours
        let process = unsafe { OwnedHandle::from_raw_handle(info.hProcess) };
        drop(unsafe { OwnedHandle::from_raw_handle(info.hThread) });

        debug!(parent: &self.span, pid = info.dwProcessId, program = ?command.get_program(), "spawned child");
        Ok(Box::new(WindowsChild::new(
            process,
            info.dwProcessId,
            Arc::clone(&self.console),
            lease,
            self.span.clone(),
        )))
    }

    fn close(&mut self) -> Result<()> {
        self.check_open()?;
        self.closed = true;
        self.reader.clear();
        self.writer.clear();
        if !self.console.shutdown() {
            debug!(parent: &self.span, "console already torn down by child exit");
        }
        debug!(parent: &self.span, "closed pty");
        Ok(())
    }
}
