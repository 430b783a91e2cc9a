//! Pluggable log channel.
//!
//! The manager reports what it is doing through a single installable hook.
//! Without a hook, logging is a no-op. Message formatting is best-effort and
//! never in the critical path of correctness.
use std::fmt;

/// Messages longer than this are truncated before the hook runs.
pub const MAX_MESSAGE_LEN: usize = 1024;

/// The subsystem a log message originates from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogModule {
    /// Connection lifecycle: acquire, register, deregister.
    Connection,
    /// Replica-set topology discovery.
    Topology,
    /// Candidate selection.
    Selection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Warn,
    Info,
    Fine,
}

/// A log sink. State travels in the closure's captures.
pub type LogHook = Box<dyn Fn(LogModule, LogLevel, &str) + Send + Sync>;

impl fmt::Display for LogModule {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LogModule::Connection => write!(fmt, "con"),
            LogModule::Topology => write!(fmt, "topology"),
            LogModule::Selection => write!(fmt, "select"),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            LogLevel::Warn => write!(fmt, "warn"),
            LogLevel::Info => write!(fmt, "info"),
            LogLevel::Fine => write!(fmt, "fine"),
        }
    }
}

/// Returns the built-in hook that prints every message to standard output.
pub fn stdout_hook() -> LogHook {
    Box::new(|module, level, message| {
        println!("{}/{}: {}", module, level, message);
    })
}

/// Truncates `message` to [`MAX_MESSAGE_LEN`] on a character boundary.
pub(crate) fn clip(mut message: String) -> String {
    if message.len() > MAX_MESSAGE_LEN {
        let mut end = MAX_MESSAGE_LEN;
        while !message.is_char_boundary(end) {
            end -= 1;
        }
        message.truncate(end);
    }
    message
}
