//! Pseudoconsole ownership and teardown
//!
//! The console object and the near pipe ends live behind one mutex so that
//! `WindowsPty::close` and `WindowsChild::wait` can both start teardown and
//! whichever comes first does the work.

use std::ffi::c_void;
use std::io;
use std::os::windows::io::{AsRawHandle, OwnedHandle};
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn, Span};
use windows_sys::Win32::System::Console::{
    ClosePseudoConsole, CreatePseudoConsole, ResizePseudoConsole, HPCON,
};
use windows_sys::Win32::System::Threading::{
    DeleteProcThreadAttributeList, InitializeProcThreadAttributeList, UpdateProcThreadAttribute,
    LPPROC_THREAD_ATTRIBUTE_LIST, PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE,
};

use super::pipe::{Pipe, WindowsReader, WindowsWriter};
use crate::drain::{cursor_position_report, spawn_drain};
use crate::error::{Error, Result};
use crate::options::PtyOptions;
use crate::size::PtySize;

/// Live pseudoconsole plus the pipe ends the parent keeps
struct Live {
    hpcon: HPCON,
    /// Read end of the console's output pipe
    output: Arc<OwnedHandle>,
    /// Write end of the console's input pipe
    input: Arc<OwnedHandle>,
}

/// Shared between a `WindowsPty` and the child it spawned
pub(crate) struct Console {
    live: Mutex<Option<Live>>,
    drain_buffer_size: usize,
    cursor_reply: (u16, u16),
    span: Span,
}

/// Access to a live pseudoconsole while the lock is held
pub(crate) struct LiveConsole<'a> {
    guard: MutexGuard<'a, Option<Live>>,
}

impl LiveConsole<'_> {
    pub(crate) fn hpcon(&self) -> HPCON {
        self.live().hpcon
    }

    fn live(&self) -> &Live {
        // Only constructed when the option is Some.
        match self.guard.as_ref() {
            Some(live) => live,
            None => unreachable!("LiveConsole over a closed console"),
        }
    }
}

impl Console {
    /// Create the pipes and the pseudoconsole
    ///
    /// The console gets the input pipe's read end and the output pipe's
    /// write end; our copies of those are closed right after creation.
    pub(crate) fn create(options: &PtyOptions, span: Span) -> Result<Self> {
        let input = Pipe::new()?;
        let output = Pipe::new()?;

        let mut hpcon: HPCON = 0;
        // SAFETY: the pipe handles are valid; hpcon is a valid out-pointer
        let hr = unsafe {
            CreatePseudoConsole(
                options.size.to_coord(),
                input.read.as_raw_handle(),
                output.write.as_raw_handle(),
                options.pseudoconsole_flags(),
                &mut hpcon,
            )
        };
        if hr < 0 {
            // Pipes close on drop.
            return Err(Error::platform(
                "CreatePseudoConsole",
                io::Error::from_raw_os_error(hr),
            ));
        }
        drop(input.read);
        drop(output.write);

        debug!(parent: &span, flags = options.pseudoconsole_flags(), "created pseudoconsole");

        Ok(Self {
            live: Mutex::new(Some(Live {
                hpcon,
                output: Arc::new(output.read),
                input: Arc::new(input.write),
            })),
            drain_buffer_size: options.drain_buffer_size,
            cursor_reply: options.cursor_reply,
            span,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Option<Live>> {
        // A panic while holding the lock leaves the state consistent.
        self.live.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Lock the console, failing with `AlreadyClosed` once it is torn down
    pub(crate) fn live(&self) -> Result<LiveConsole<'_>> {
        let guard = self.lock();
        if guard.is_none() {
            return Err(Error::AlreadyClosed);
        }
        Ok(LiveConsole { guard })
    }

    /// Streams over the near pipe ends
    pub(crate) fn streams(&self) -> Result<(WindowsReader, WindowsWriter)> {
        let console = self.live()?;
        let live = console.live();
        Ok((
            WindowsReader::new(Arc::clone(&live.output)),
            WindowsWriter::new(Arc::clone(&live.input)),
        ))
    }

    pub(crate) fn resize(&self, size: PtySize) -> Result<()> {
        let console = self.live()?;
        // SAFETY: hpcon stays valid while the lock is held
        let hr = unsafe { ResizePseudoConsole(console.hpcon(), size.to_coord()) };
        if hr < 0 {
            return Err(Error::platform(
                "ResizePseudoConsole",
                io::Error::from_raw_os_error(hr),
            ));
        }
        Ok(())
    }

    /// Tear the console down: start the drain, close the pseudoconsole and
    /// release our pipe ends
    ///
    /// Returns `false` if teardown had already happened.
    pub(crate) fn shutdown(&self) -> bool {
        let Some(live) = self.lock().take() else {
            return false;
        };

        // ClosePseudoConsole may block until its output is read, and the
        // console may ask for the cursor position on the way out.
        let reply = cursor_position_report(self.cursor_reply.0, self.cursor_reply.1);
        if let Err(e) = spawn_drain(
            WindowsReader::new(Arc::clone(&live.output)),
            WindowsWriter::new(Arc::clone(&live.input)),
            self.drain_buffer_size,
            reply,
            self.span.clone(),
        ) {
            warn!(parent: &self.span, error = %e, "could not start console drain");
        }

        // SAFETY: hpcon came from CreatePseudoConsole and is closed once
        unsafe { ClosePseudoConsole(live.hpcon) };
        debug!(parent: &self.span, "closed pseudoconsole");

        // Our references go; the drain and any taken streams keep theirs.
        drop(live);
        true
    }
}

impl Drop for Console {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A process-thread attribute list carrying the pseudoconsole
pub(crate) struct PseudoConsoleAttribute {
    /// Backing storage, `usize` for pointer alignment
    buf: Vec<usize>,
}

impl PseudoConsoleAttribute {
    pub(crate) fn new(hpcon: HPCON) -> Result<Self> {
        let mut size = 0usize;
        // SAFETY: a null list with a size pointer only queries the size
        unsafe { InitializeProcThreadAttributeList(ptr::null_mut(), 1, 0, &mut size) };
        if size == 0 {
            return Err(Error::last_os_error("InitializeProcThreadAttributeList"));
        }

        let words = size.div_ceil(std::mem::size_of::<usize>());
        let mut buf = vec![0usize; words];
        let list = buf.as_mut_ptr() as LPPROC_THREAD_ATTRIBUTE_LIST;
        // SAFETY: buf is at least `size` bytes
        if unsafe { InitializeProcThreadAttributeList(list, 1, 0, &mut size) } == 0 {
            return Err(Error::last_os_error("InitializeProcThreadAttributeList"));
        }
        let attribute = Self { buf };

        // The console handle itself is the attribute value.
        // SAFETY: the list is initialized; hpcon outlives the process creation
        let ok = unsafe {
            UpdateProcThreadAttribute(
                attribute.as_ptr(),
                0,
                PROC_THREAD_ATTRIBUTE_PSEUDOCONSOLE as usize,
                hpcon as *const c_void,
                std::mem::size_of::<HPCON>(),
                ptr::null_mut(),
                ptr::null(),
            )
        };
        if ok == 0 {
            return Err(Error::last_os_error("UpdateProcThreadAttribute"));
        }
        Ok(attribute)
    }

    pub(crate) fn as_ptr(&self) -> LPPROC_THREAD_ATTRIBUTE_LIST {
        self.buf.as_ptr() as LPPROC_THREAD_ATTRIBUTE_LIST
    }
}

impl Drop for PseudoConsoleAttribute {
    fn drop(&mut self) {
        // SAFETY: initialized in new(); deleted once
        unsafe { DeleteProcThreadAttributeList(self.as_ptr()) };
    }
}
