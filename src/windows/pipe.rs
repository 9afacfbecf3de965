//! Anonymous pipes and the byte streams over their near ends

use std::io::{self, Read, Write};
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle};
use std::ptr;
use std::sync::Arc;

use windows_sys::Win32::Foundation::{
    GetLastError, ERROR_BROKEN_PIPE, ERROR_MORE_DATA, ERROR_NO_DATA, HANDLE, INVALID_HANDLE_VALUE,
};
use windows_sys::Win32::Security::SECURITY_ATTRIBUTES;
use windows_sys::Win32::Storage::FileSystem::{ReadFile, WriteFile};
use windows_sys::Win32::System::Pipes::CreatePipe;

use crate::error::{Error, Result};

/// One directed byte channel: what is written to `write` comes out of `read`
#[derive(Debug)]
pub(crate) struct Pipe {
    pub read: OwnedHandle,
    pub write: OwnedHandle,
}

impl Pipe {
    /// Create a pipe whose handles are not inherited by child processes
    pub(crate) fn new() -> Result<Self> {
        let attributes = SECURITY_ATTRIBUTES {
            nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
            lpSecurityDescriptor: ptr::null_mut(),
            bInheritHandle: 0,
        };
        let mut read: HANDLE = INVALID_HANDLE_VALUE;
        let mut write: HANDLE = INVALID_HANDLE_VALUE;

        // SAFETY: both out-pointers are valid; on success we own the handles
        if unsafe { CreatePipe(&mut read, &mut write, &attributes, 0) } == 0 {
            return Err(Error::last_os_error("CreatePipe"));
        }
        Ok(Self {
            read: unsafe { OwnedHandle::from_raw_handle(read) },
            write: unsafe { OwnedHandle::from_raw_handle(write) },
        })
    }
}

/// Output side of the pseudoconsole
///
/// Broken-pipe and no-data results mean the console has gone away and are
/// reported as end-of-stream.
#[derive(Debug, Clone)]
pub struct WindowsReader {
    handle: Arc<OwnedHandle>,
}

impl WindowsReader {
    pub(crate) fn new(handle: Arc<OwnedHandle>) -> Self {
        Self { handle }
    }
}

impl Read for WindowsReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let len = buf.len().min(u32::MAX as usize) as u32;
        let mut n = 0u32;
        // SAFETY: buf is valid for len bytes; the handle is open while we hold the Arc
        let ok = unsafe {
            ReadFile(
                self.handle.as_raw_handle(),
                buf.as_mut_ptr(),
                len,
                &mut n,
                ptr::null_mut(),
            )
        };
        if ok != 0 {
            return Ok(n as usize);
        }
        match unsafe { GetLastError() } {
            ERROR_BROKEN_PIPE | ERROR_NO_DATA => Ok(0),
            ERROR_MORE_DATA => Ok(n as usize),
            code => Err(io::Error::from_raw_os_error(code as i32)),
        }
    }
}

/// Input side of the pseudoconsole
#[derive(Debug, Clone)]
pub struct WindowsWriter {
    handle: Arc<OwnedHandle>,
}

impl WindowsWriter {
    pub(crate) fn new(handle: Arc<OwnedHandle>) -> Self {
        Self { handle }
    }
}

impl Write for WindowsWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let len = buf.len().min(u32::MAX as usize) as u32;
        let mut n = 0u32;
        // SAFETY: buf is valid for len bytes; the handle is open while we hold the Arc
        let ok = unsafe {
            WriteFile(
                self.handle.as_raw_handle(),
                buf.as_ptr(),
                len,
                &mut n,
                ptr::null_mut(),
            )
        };
        if ok == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
