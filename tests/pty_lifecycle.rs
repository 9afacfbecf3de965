//! Integration tests for PTY and child lifecycles
//!
//! These run real shells through the native backend. Set
//! `RUST_LOG=xpty=debug` to see the library's events.

#![cfg(unix)]

use std::io::{Read, Write};
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use proptest::prelude::*;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use xpty::{
    default_size, new_pty, open_pty, Child, Claim, CommandSpec, Error, Pty, PtyOptions, PtySize,
    READ_BUFFER_SIZE,
};

fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

fn sh(script: &str) -> CommandSpec {
    CommandSpec::new("/bin/sh").args(["-c", script])
}

/// Run `f` on another thread and fail the test if it takes longer than `secs`
fn within<T: Send + 'static>(secs: u64, f: impl FnOnce() -> T + Send + 'static) -> T {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(f());
    });
    rx.recv_timeout(Duration::from_secs(secs))
        .expect("operation did not finish in time")
}

/// Poll `exited` until the child is collected
fn poll_exit(child: &mut Box<dyn Child + Send>) -> u32 {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match child.exited() {
            Ok(code) => return code,
            Err(Error::NotFinished) if Instant::now() < deadline => {
                thread::sleep(Duration::from_millis(20))
            }
            Err(e) => panic!("child did not exit: {}", e),
        }
    }
}

// ============================================================================
// Size
// ============================================================================

#[test]
fn test_default_size() {
    let size = default_size();
    assert_eq!((size.rows, size.cols), (24, 80));

    let pty = new_pty(size).unwrap();
    assert_eq!(pty.get_size().unwrap(), size);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_resize_then_get_size(rows in 1u16..=500, cols in 1u16..=500) {
        let mut pty = new_pty(default_size()).unwrap();
        let size = PtySize::new(cols, rows);
        pty.resize(size).unwrap();
        prop_assert_eq!(pty.get_size().unwrap(), size);
    }
}

// ============================================================================
// One-shot streams and close
// ============================================================================

#[test]
fn test_streams_are_taken_once() {
    let mut pty = new_pty(default_size()).unwrap();

    assert!(pty.take_reader().is_ok());
    assert!(matches!(
        pty.take_reader(),
        Err(Error::AlreadyTaken(Claim::Reader))
    ));

    assert!(pty.take_writer().is_ok());
    assert!(matches!(
        pty.take_writer(),
        Err(Error::AlreadyTaken(Claim::Writer))
    ));
}

#[test]
fn test_close_is_reported_once() {
    let mut pty = new_pty(default_size()).unwrap();
    pty.close().unwrap();

    assert!(matches!(pty.close(), Err(Error::AlreadyClosed)));
    assert!(matches!(pty.take_reader(), Err(Error::AlreadyClosed)));
    assert!(matches!(pty.take_writer(), Err(Error::AlreadyClosed)));
    assert!(matches!(
        pty.resize(PtySize::new(100, 40)),
        Err(Error::AlreadyClosed)
    ));
    assert!(matches!(
        pty.spawn_command(&sh("exit 0")),
        Err(Error::AlreadyClosed)
    ));
}

// ============================================================================
// Child lifecycle
// ============================================================================

#[test]
fn test_exit_codes_round_trip() {
    init_tracing();
    for code in 0..=255u32 {
        let mut pty = new_pty(default_size()).unwrap();
        let mut child = pty.spawn_command(&sh(&format!("exit {}", code))).unwrap();
        assert_eq!(child.wait().unwrap(), code, "exit {}", code);
        pty.close().unwrap();
    }
}

#[test]
fn test_exited_before_and_after_exit() {
    let mut pty = new_pty(default_size()).unwrap();

    let mut sleeper = pty.spawn_command(&sh("sleep 30")).unwrap();
    assert!(matches!(sleeper.exited(), Err(Error::NotFinished)));
    sleeper.kill().unwrap();

    let mut child = pty.spawn_command(&sh("exit 4")).unwrap();
    assert_eq!(poll_exit(&mut child), 4);
    assert_eq!(child.exited().unwrap(), 4);
    assert_eq!(child.wait().unwrap(), 4);
    assert!(matches!(child.exited(), Err(Error::AlreadyClosed)));
}

#[test]
fn test_kill_invalidates_child() {
    let mut pty = new_pty(default_size()).unwrap();
    let mut child = pty.spawn_command(&sh("sleep 30")).unwrap();
    assert!(child.process_id().is_some());

    child.kill().unwrap();
    assert!(matches!(child.kill(), Err(Error::AlreadyClosed)));
    assert!(matches!(child.wait(), Err(Error::AlreadyClosed)));
}

#[test]
fn test_one_live_child_per_pty() {
    let mut pty = new_pty(default_size()).unwrap();
    let mut first = pty.spawn_command(&sh("sleep 30")).unwrap();

    assert!(matches!(
        pty.spawn_command(&sh("exit 0")),
        Err(Error::AlreadyTaken(Claim::Console))
    ));

    first.kill().unwrap();
    let mut second = pty.spawn_command(&sh("exit 0")).unwrap();
    assert_eq!(second.wait().unwrap(), 0);
}

#[test]
fn test_spawn_unknown_program() {
    let mut pty = new_pty(default_size()).unwrap();
    let err = pty
        .spawn_command(&CommandSpec::new("xpty-no-such-program"))
        .err()
        .unwrap();
    assert!(matches!(err, Error::Platform { .. }), "{}", err);
    assert!(err.raw_os_error().is_some());
}

// ============================================================================
// Data path
// ============================================================================

#[test]
fn test_payload_round_trips_byte_identical() {
    init_tracing();
    let options = PtyOptions {
        raw_mode: true,
        ..PtyOptions::default()
    };
    let mut pty = open_pty(&options).unwrap();
    let mut reader = pty.take_reader().unwrap();
    let mut writer = pty.take_writer().unwrap();
    let mut child = pty.spawn_command(&CommandSpec::new("cat")).unwrap();

    // Longer than one read buffer, with a NUL in the middle.
    let mut payload: Vec<u8> = (0..READ_BUFFER_SIZE + 1)
        .map(|i| b'a' + (i % 26) as u8)
        .collect();
    payload[100] = 0;
    let expected = payload.clone();

    let feeder = thread::spawn(move || {
        writer.write_all(&payload).unwrap();
        writer.flush().unwrap();
    });

    let received = within(20, move || {
        let mut received = Vec::new();
        let mut buf = [0u8; READ_BUFFER_SIZE];
        while received.len() < READ_BUFFER_SIZE + 1 {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => received.extend_from_slice(&buf[..n]),
                Err(e) => panic!("read failed: {}", e),
            }
        }
        received
    });
    feeder.join().unwrap();

    assert_eq!(received.len(), expected.len());
    assert!(received == expected, "payload was altered in transit");

    child.kill().unwrap();
    pty.close().unwrap();
}

#[test]
fn test_reader_sees_end_of_stream_after_exit() {
    let mut pty = new_pty(default_size()).unwrap();
    let mut reader = pty.take_reader().unwrap();
    let mut child = pty.spawn_command(&sh("printf hello")).unwrap();

    let output = within(10, move || {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        out
    });
    assert_eq!(child.wait().unwrap(), 0);
    assert!(String::from_utf8_lossy(&output).contains("hello"));
}

#[test]
fn test_cursor_query_answered_during_close() {
    init_tracing();
    let mut pty = new_pty(default_size()).unwrap();
    // Held for the whole test: the master stays open, so only a reply to the
    // query lets the child finish.
    let _reader = pty.take_reader().unwrap();
    let _writer = pty.take_writer().unwrap();

    // The reply "ESC [ 24 ; 80 R" is exactly 8 bytes.
    let mut child = pty
        .spawn_command(&sh(
            "stty raw -echo; printf '\\033[6n'; dd bs=1 count=8 of=/dev/null 2>/dev/null; exit 3",
        ))
        .unwrap();

    let code = within(10, move || {
        pty.close()?;
        child.wait()
    });
    assert_eq!(code.unwrap(), 3);
}

// ============================================================================
// Command options
// ============================================================================

#[test]
fn test_working_directory() {
    let dir = tempfile::tempdir().unwrap();
    let expected = dir.path().canonicalize().unwrap();

    let mut pty = new_pty(default_size()).unwrap();
    let mut reader = pty.take_reader().unwrap();
    let mut child = pty.spawn_command(&sh("pwd -P").cwd(dir.path())).unwrap();

    let output = within(10, move || {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        out
    });
    assert_eq!(child.wait().unwrap(), 0);
    assert_eq!(
        String::from_utf8_lossy(&output).trim(),
        expected.to_string_lossy()
    );
}

#[test]
fn test_explicit_environment() {
    let mut pty = new_pty(default_size()).unwrap();
    let mut reader = pty.take_reader().unwrap();
    let command = sh("printf '%s' \"$XPTY_GREETING\"")
        .env_clear()
        .env("XPTY_GREETING", "hi there");
    let mut child = pty.spawn_command(&command).unwrap();

    let output = within(10, move || {
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        out
    });
    assert_eq!(child.wait().unwrap(), 0);
    assert_eq!(String::from_utf8_lossy(&output), "hi there");
}

#[test]
fn test_span_parent_is_accepted() {
    init_tracing();
    let session = tracing::info_span!("session", id = 1);
    let options = PtyOptions::new(PtySize::new(120, 40)).with_span(session);
    let mut pty = open_pty(&options).unwrap();
    assert_eq!(pty.get_size().unwrap(), PtySize::new(120, 40));

    let mut child = pty.spawn_command(&sh("exit 0")).unwrap();
    assert_eq!(child.wait().unwrap(), 0);
    pty.close().unwrap();
}
