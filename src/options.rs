//! Construction options for a PTY

use serde::{Deserialize, Serialize};
use tracing::Span;

use crate::size::PtySize;

/// Default read size for the teardown drain
pub const DEFAULT_DRAIN_BUFFER_SIZE: usize = 4096;

/// Options for [`open_pty`](crate::open_pty)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PtyOptions {
    /// Initial terminal size
    pub size: PtySize,
    /// POSIX: put the line discipline in raw mode (no echo, no signal keys,
    /// no output processing) before any child starts
    pub raw_mode: bool,
    /// Pseudoconsole: start with the cursor where the parent console has it
    pub inherit_cursor: bool,
    /// Pseudoconsole: skip the reflow redraw on resize
    pub resize_quirk: bool,
    /// Pseudoconsole: report input as win32-input-mode sequences
    pub win32_input_mode: bool,
    /// Read size for the teardown drain
    pub drain_buffer_size: usize,
    /// Row and column reported when answering a cursor-position request
    /// during teardown
    pub cursor_reply: (u16, u16),
    /// Parent span for the PTY's diagnostics; the current span when unset
    #[serde(skip)]
    pub span: Option<Span>,
}

impl PtyOptions {
    pub fn new(size: PtySize) -> Self {
        Self {
            size,
            ..Self::default()
        }
    }

    /// Log this PTY's events under `span`
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Flags word for `CreatePseudoConsole`
    #[cfg_attr(not(windows), allow(dead_code))]
    pub(crate) fn pseudoconsole_flags(&self) -> u32 {
        const INHERIT_CURSOR: u32 = 0x1;
        const RESIZE_QUIRK: u32 = 0x2;
        const WIN32_INPUT_MODE: u32 = 0x4;

        let mut flags = 0;
        if self.inherit_cursor {
            flags |= INHERIT_CURSOR;
        }
        if self.resize_quirk {
            flags |= RESIZE_QUIRK;
        }
        if self.win32_input_mode {
            flags |= WIN32_INPUT_MODE;
        }
        flags
    }

    /// Span every backend operation logs under
    pub(crate) fn make_span(&self, backend: &'static str) -> Span {
        let parent = self.span.clone().unwrap_or_else(Span::current);
        tracing::debug_span!(
            parent: &parent,
            "xpty::pty",
            backend,
            rows = self.size.rows,
            cols = self.size.cols
        )
    }
}

impl Default for PtyOptions {
    fn default() -> Self {
        Self {
            size: PtySize::default(),
            raw_mode: false,
            inherit_cursor: true,
            resize_quirk: true,
            win32_input_mode: true,
            drain_buffer_size: DEFAULT_DRAIN_BUFFER_SIZE,
            cursor_reply: (24, 80),
            span: None,
        }
    }
}
