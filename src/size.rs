//! Terminal size for a PTY

use serde::{Deserialize, Serialize};

/// Terminal dimensions in character cells, plus optional pixel dimensions
///
/// The pixel fields are advisory. The POSIX backend passes them to the
/// kernel; the Windows pseudoconsole has no place for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PtySize {
    /// Number of rows (characters)
    pub rows: u16,
    /// Number of columns (characters)
    pub cols: u16,
    /// Width in pixels (optional, can be 0)
    #[serde(default)]
    pub pixel_width: u16,
    /// Height in pixels (optional, can be 0)
    #[serde(default)]
    pub pixel_height: u16,
}

impl PtySize {
    /// Create a new size with zero pixel dimensions
    pub fn new(cols: u16, rows: u16) -> Self {
        Self {
            rows,
            cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }

    /// Create a size with pixel dimensions
    pub fn with_pixels(cols: u16, rows: u16, pixel_width: u16, pixel_height: u16) -> Self {
        Self {
            rows,
            cols,
            pixel_width,
            pixel_height,
        }
    }

    /// Convert to libc winsize structure
    #[cfg(unix)]
    pub(crate) fn to_winsize(self) -> libc::winsize {
        libc::winsize {
            ws_row: self.rows,
            ws_col: self.cols,
            ws_xpixel: self.pixel_width,
            ws_ypixel: self.pixel_height,
        }
    }

    /// Convert to a console `COORD` (columns in X, rows in Y)
    #[cfg(windows)]
    pub(crate) fn to_coord(self) -> windows_sys::Win32::System::Console::COORD {
        windows_sys::Win32::System::Console::COORD {
            X: clamp_i16(self.cols),
            Y: clamp_i16(self.rows),
        }
    }
}

#[cfg(any(windows, test))]
fn clamp_i16(value: u16) -> i16 {
    i16::try_from(value).unwrap_or(i16::MAX)
}

impl Default for PtySize {
    fn default() -> Self {
        Self::new(80, 24)
    }
}

#[cfg(unix)]
impl From<libc::winsize> for PtySize {
    fn from(ws: libc::winsize) -> Self {
        Self {
            rows: ws.ws_row,
            cols: ws.ws_col,
            pixel_width: ws.ws_xpixel,
            pixel_height: ws.ws_ypixel,
        }
    }
}

/// The conventional 24x80 terminal with no pixel information
pub fn default_size() -> PtySize {
    PtySize::default()
}
