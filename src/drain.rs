//! Console output drain used while tearing down a pseudoconsole
//!
//! A console host may send a cursor-position request (`ESC [ 6 n`) at any
//! time, teardown included, and block until it reads a report back. Once
//! teardown starts nobody else reads the output pipe, so a detached thread
//! keeps reading it until end-of-stream and answers that one request.

use std::io::{self, Read, Write};
use std::thread;

use tracing::{debug, Span};

/// Cursor-position request as emitted by the console host
pub const CURSOR_POSITION_REQUEST: &[u8] = b"\x1b[6n";

/// Build a cursor-position report for the given 1-based row and column
pub fn cursor_position_report(row: u16, col: u16) -> Vec<u8> {
    format!("\x1b[{};{}R", row, col).into_bytes()
}

/// What a finished drain saw
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct DrainSummary {
    /// Bytes read and discarded
    pub bytes: usize,
    /// Cursor-position reports written back
    pub replies: usize,
}

/// Read `reader` until end-of-stream, answering each read that is exactly a
/// cursor-position request with `reply` on `writer`
///
/// I/O errors end the drain; they are logged, never returned.
pub(crate) fn drain_console_output<R, W>(
    mut reader: R,
    mut writer: W,
    buffer_size: usize,
    reply: &[u8],
) -> DrainSummary
where
    R: Read,
    W: Write,
{
    let mut summary = DrainSummary::default();
    let mut buf = vec![0u8; buffer_size.max(CURSOR_POSITION_REQUEST.len())];

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(error = %e, "drain stopped on read error");
                break;
            }
        };
        summary.bytes += n;

        if &buf[..n] == CURSOR_POSITION_REQUEST {
            match writer.write_all(reply).and_then(|()| writer.flush()) {
                Ok(()) => {
                    summary.replies += 1;
                    debug!("answered cursor position request during teardown");
                }
                Err(e) => debug!(error = %e, "could not answer cursor position request"),
            }
        }
    }

    debug!(bytes = summary.bytes, replies = summary.replies, "drain finished");
    summary
}

/// Run [`drain_console_output`] on a detached thread
///
/// The thread is never joined; it ends when `reader` reaches end-of-stream or
/// fails because its handle went away.
pub(crate) fn spawn_drain<R, W>(
    reader: R,
    writer: W,
    buffer_size: usize,
    reply: Vec<u8>,
    span: Span,
) -> io::Result<()>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    thread::Builder::new()
        .name("xpty-drain".to_string())
        .spawn(move || {
            let _entered = span.enter();
            drain_console_output(reader, writer, buffer_size, &reply);
        })
        .map(|_detached| ())
}
