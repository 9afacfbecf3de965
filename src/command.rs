//! Commands to run inside a PTY
//!
//! Also holds the Windows command-line and environment-block encoders. They
//! work on UTF-16 code units rather than `OsStr` so they can be tested on
//! every platform.

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// What to run in a PTY: program, arguments, environment, working directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    program: OsString,
    args: Vec<OsString>,
    /// `None` inherits the parent's environment unchanged
    env: Option<Vec<(OsString, OsString)>>,
    cwd: Option<PathBuf>,
}

impl CommandSpec {
    /// Run `program`, looked up on `PATH` when it has no path separator
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            env: None,
            cwd: None,
        }
    }

    /// The user's shell: `$SHELL` or `/bin/sh` on Unix, `%COMSPEC%` or
    /// `cmd.exe` on Windows
    pub fn default_shell() -> Self {
        #[cfg(windows)]
        let shell = std::env::var_os("COMSPEC").unwrap_or_else(|| "cmd.exe".into());
        #[cfg(not(windows))]
        let shell = std::env::var_os("SHELL").unwrap_or_else(|| "/bin/sh".into());
        Self::new(shell)
    }

    /// Append one argument
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    /// Append several arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Set one environment variable, replacing any previous value
    ///
    /// The first call switches the command from the inherited environment to
    /// an explicit one, seeded with the parent's variables.
    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        let key = key.as_ref();
        let vars = self.explicit_env();
        vars.retain(|(k, _)| !same_key(k, key));
        vars.push((key.to_os_string(), value.as_ref().to_os_string()));
        self
    }

    /// Set several environment variables
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<OsStr>,
        V: AsRef<OsStr>,
    {
        for (k, v) in vars {
            self = self.env(k, v);
        }
        self
    }

    /// Remove one environment variable
    pub fn env_remove(mut self, key: impl AsRef<OsStr>) -> Self {
        let key = key.as_ref();
        self.explicit_env().retain(|(k, _)| !same_key(k, key));
        self
    }

    /// Start the child with an empty environment
    pub fn env_clear(mut self) -> Self {
        self.env = Some(Vec::new());
        self
    }

    /// Working directory for the child; defaults to the parent's
    pub fn cwd(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn get_program(&self) -> &OsStr {
        &self.program
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    /// The explicit environment, or `None` when the parent's is inherited
    pub fn get_env(&self) -> Option<&[(OsString, OsString)]> {
        self.env.as_deref()
    }

    pub fn get_cwd(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    /// Look up a variable in the explicit environment
    #[cfg_attr(windows, allow(dead_code))]
    pub(crate) fn env_var(&self, key: &str) -> Option<&OsStr> {
        self.env.as_ref().and_then(|vars| {
            vars.iter()
                .find(|(k, _)| same_key(k, OsStr::new(key)))
                .map(|(_, v)| v.as_os_str())
        })
    }

    fn explicit_env(&mut self) -> &mut Vec<(OsString, OsString)> {
        self.env.get_or_insert_with(|| std::env::vars_os().collect())
    }
}

#[cfg(windows)]
fn same_key(a: &OsStr, b: &OsStr) -> bool {
    a.to_string_lossy()
        .eq_ignore_ascii_case(&b.to_string_lossy())
}

#[cfg(not(windows))]
fn same_key(a: &OsStr, b: &OsStr) -> bool {
    a == b
}

const QUOTE: u16 = b'"' as u16;
const BACKSLASH: u16 = b'\\' as u16;
const SPACE: u16 = b' ' as u16;
const EQUALS: u16 = b'=' as u16;

/// Append `arg` to a Windows command line, quoted so that
/// `CommandLineToArgvW` yields exactly `arg` back
#[cfg_attr(not(windows), allow(dead_code))]
pub(crate) fn quote_windows_arg(arg: &[u16], out: &mut Vec<u16>) -> Result<()> {
    if arg.contains(&0) {
        return Err(Error::InvalidCommand(
            "argument contains a NUL character".to_string(),
        ));
    }

    let needs_quotes = arg.is_empty()
        || arg
            .iter()
            .any(|&c| c == SPACE || c == b'\t' as u16 || c == b'\n' as u16 || c == QUOTE);
    if !needs_quotes {
        out.extend_from_slice(arg);
        return Ok(());
    }

    out.push(QUOTE);
    let mut backslashes = 0usize;
    for &c in arg {
        if c == BACKSLASH {
            backslashes += 1;
            continue;
        }
        if c == QUOTE {
            // Backslashes before a quote are escaped, and so is the quote.
            out.extend(std::iter::repeat(BACKSLASH).take(backslashes * 2 + 1));
        } else {
            out.extend(std::iter::repeat(BACKSLASH).take(backslashes));
        }
        backslashes = 0;
        out.push(c);
    }
    // Trailing backslashes would otherwise escape the closing quote.
    out.extend(std::iter::repeat(BACKSLASH).take(backslashes * 2));
    out.push(QUOTE);
    Ok(())
}

/// Build a NUL-terminated Windows command line from the program and its
/// arguments
#[cfg_attr(not(windows), allow(dead_code))]
pub(crate) fn windows_command_line(program: &[u16], args: &[Vec<u16>]) -> Result<Vec<u16>> {
    let capacity = program.len() + args.iter().map(|a| a.len() + 3).sum::<usize>() + 3;
    let mut line = Vec::with_capacity(capacity);
    quote_windows_arg(program, &mut line)?;
    for arg in args {
        line.push(SPACE);
        quote_windows_arg(arg, &mut line)?;
    }
    line.push(0);
    Ok(line)
}

/// Build a `CREATE_UNICODE_ENVIRONMENT` block: `KEY=VALUE\0` entries sorted
/// by upper-cased key, terminated by an extra `\0`
#[cfg_attr(not(windows), allow(dead_code))]
pub(crate) fn windows_env_block(vars: &[(Vec<u16>, Vec<u16>)]) -> Result<Vec<u16>> {
    let mut sorted: Vec<&(Vec<u16>, Vec<u16>)> = vars.iter().collect();
    sorted.sort_by_cached_key(|(k, _)| String::from_utf16_lossy(k).to_uppercase());

    let mut block = Vec::new();
    for (key, value) in sorted {
        if key.is_empty() || key[1..].contains(&EQUALS) {
            return Err(Error::InvalidCommand(format!(
                "invalid environment variable name {:?}",
                String::from_utf16_lossy(key)
            )));
        }
        if key.contains(&0) || value.contains(&0) {
            return Err(Error::InvalidCommand(
                "environment variable contains a NUL character".to_string(),
            ));
        }
        block.extend_from_slice(key);
        block.push(EQUALS);
        block.extend_from_slice(value);
        block.push(0);
    }
    if block.is_empty() {
        block.push(0);
    }
    block.push(0);
    Ok(block)
}
