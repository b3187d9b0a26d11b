//! Leveled file logging for relay.
//!
//! Log levels:
//! - ERROR: failures that end a task, chain, or execution
//! - WARN: recoverable conditions (stale reports, transport retries, dead delegates)
//! - INFO: lifecycle notifications (registration, grants, chain completion)
//! - DEBUG: per-call traces of the dispatch protocol
//! - TRACE: queue scans and admission arithmetic
//!
//! Debug mode can be enabled with `--debug` or `RELAY_DEBUG=1`; `RELAY_LOG=<level>`
//! overrides both.
//!
//! Request-scoped fields travel in an explicit [`LogContext`] that callers
//! pass by reference and render as a message prefix.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, OnceLock};

use crate::core::ids::{DelegateId, ExecutionId, TaskId};

static SINK: OnceLock<Sink> = OnceLock::new();
static LEVEL: AtomicU8 = AtomicU8::new(LogLevel::Info as u8);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum LogLevel {
    Error = 0,
    Warn = 1,
    Info = 2,
    Debug = 3,
    Trace = 4,
}

impl LogLevel {
    const ALL: [LogLevel; 5] = [
        LogLevel::Error,
        LogLevel::Warn,
        LogLevel::Info,
        LogLevel::Debug,
        LogLevel::Trace,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Trace => "TRACE",
        }
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LogLevel::ALL
            .into_iter()
            .find(|level| level.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown log level '{}'", s))
    }
}

/// An open, append-only log file shared by every thread.
struct Sink {
    file: Mutex<File>,
}

impl Sink {
    /// Opens `path`, truncating whatever a previous run left behind.
    fn open(path: &Path) -> std::io::Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    fn write(&self, level: LogLevel, msg: &str) {
        let timestamp = chrono::Local::now().format("%H:%M:%S%.3f");
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "[{}] [{}] {}", timestamp, level.as_str(), msg);
        }
    }
}

/// Picks the starting level: `RELAY_LOG` wins, then `--debug`/`RELAY_DEBUG`.
fn initial_level(debug: bool) -> LogLevel {
    if let Some(level) = std::env::var("RELAY_LOG").ok().and_then(|v| v.parse().ok()) {
        return level;
    }
    let env_debug = std::env::var("RELAY_DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    if debug || env_debug {
        LogLevel::Debug
    } else {
        LogLevel::Info
    }
}

/// Initialize logging to ~/.relay/relay.log
pub fn init_with_debug(debug: bool) {
    if let Some(path) = dirs::home_dir().map(|h| h.join(".relay").join("relay.log")) {
        init_at(&path, debug);
    }
}

/// Initialize logging to an explicit file. Only the first call takes effect.
pub fn init_at(path: &Path, debug: bool) {
    set_level(initial_level(debug));
    if SINK.get().is_none() {
        if let Ok(sink) = Sink::open(path) {
            let _ = SINK.set(sink);
        }
    }
}

pub fn set_level(level: LogLevel) {
    LEVEL.store(level as u8, Ordering::SeqCst);
}

pub fn enabled(level: LogLevel) -> bool {
    level as u8 <= LEVEL.load(Ordering::Relaxed)
}

/// Messages are dropped until a log file has been chosen.
pub fn log_at(level: LogLevel, msg: &str) {
    if !enabled(level) {
        return;
    }
    if let Some(sink) = SINK.get() {
        sink.write(level, msg);
    }
}

pub fn error(msg: &str) {
    log_at(LogLevel::Error, msg);
}

pub fn warn(msg: &str) {
    log_at(LogLevel::Warn, msg);
}

pub fn info(msg: &str) {
    log_at(LogLevel::Info, msg);
}

pub fn debug(msg: &str) {
    log_at(LogLevel::Debug, msg);
}

pub fn trace(msg: &str) {
    log_at(LogLevel::Trace, msg);
}

/// Request-scoped fields rendered in front of a log line.
///
/// Empty fields are omitted, so `LogContext::default()` renders as an empty
/// string.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogContext {
    pub account_id: Option<String>,
    pub task_id: Option<TaskId>,
    pub delegate_id: Option<DelegateId>,
    pub execution_id: Option<ExecutionId>,
}

impl LogContext {
    pub fn account(account_id: &str) -> Self {
        Self {
            account_id: Some(account_id.to_string()),
            ..Default::default()
        }
    }

    pub fn with_task(mut self, task_id: TaskId) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_delegate(mut self, delegate_id: DelegateId) -> Self {
        self.delegate_id = Some(delegate_id);
        self
    }

    pub fn with_execution(mut self, execution_id: ExecutionId) -> Self {
        self.execution_id = Some(execution_id);
        self
    }
}

impl std::fmt::Display for LogContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut fields = Vec::new();
        if let Some(account) = &self.account_id {
            fields.push(format!("account={}", account));
        }
        if let Some(task) = &self.task_id {
            fields.push(format!("task={}", task.short()));
        }
        if let Some(delegate) = &self.delegate_id {
            fields.push(format!("delegate={}", delegate.short()));
        }
        if let Some(execution) = &self.execution_id {
            fields.push(format!("execution={}", execution.short()));
        }
        if fields.is_empty() {
            Ok(())
        } else {
            write!(f, "[{}]", fields.join(" "))
        }
    }
}

/// Logs at INFO.
#[macro_export]
macro_rules! rlog {
    ($($arg:tt)*) => {
        $crate::log::info(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! rlog_error {
    ($($arg:tt)*) => {
        $crate::log::error(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! rlog_warn {
    ($($arg:tt)*) => {
        $crate::log::warn(&format!($($arg)*))
    };
}

/// Logs at DEBUG; dropped unless `--debug`, `RELAY_DEBUG`, or `RELAY_LOG` allow it.
#[macro_export]
macro_rules! rlog_debug {
    ($($arg:tt)*) => {
        $crate::log::debug(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! rlog_trace {
    ($($arg:tt)*) => {
        $crate::log::trace(&format!($($arg)*))
    };
}
