//! Level-filtered logging for harness users and mirrored child output.
//!
//! Messages are filtered against a single [`LogLevel`] threshold and handed
//! to a [`LogSink`]. The default sink forwards to `tracing`; a
//! [`CaptureSink`] keeps lines in memory for test reporters.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, LazyLock, Mutex};

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Log threshold, ordered the way the backend ranks its own levels.
///
/// `Critical` sits below `Error`, so `Error` is the most restrictive
/// threshold and the default. `Child` lets everything through and also
/// mirrors every raw line the child writes to stderr.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Child,
    Debug,
    Info,
    Warning,
    Critical,
    #[default]
    Error,
}

impl LogLevel {
    /// Lowercase name as understood by the backend's `--log_level` flag.
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Child => "child",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Critical => "critical",
            LogLevel::Error => "error",
        }
    }

    /// Level passed to the child; it has no notion of `child`.
    pub fn child_flag(self) -> &'static str {
        match self {
            LogLevel::Child => LogLevel::Debug.as_str(),
            other => other.as_str(),
        }
    }

    /// Whether a message at `level` passes this threshold.
    pub fn allows(self, level: LogLevel) -> bool {
        level >= self
    }

    fn tag(self) -> String {
        self.as_str().to_ascii_uppercase()
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "child" => Ok(LogLevel::Child),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warning" | "warn" => Ok(LogLevel::Warning),
            "critical" => Ok(LogLevel::Critical),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level {other:?}")),
        }
    }
}

/// Destination for harness log lines.
pub trait LogSink: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);
}

/// Forwards to `tracing` at the closest matching level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Child | LogLevel::Debug => tracing::debug!(target: "devharness", "{message}"),
            LogLevel::Info => tracing::info!(target: "devharness", "{message}"),
            LogLevel::Warning => tracing::warn!(target: "devharness", "{message}"),
            LogLevel::Critical | LogLevel::Error => {
                tracing::error!(target: "devharness", "{message}")
            }
        }
    }
}

/// Collects formatted lines in memory. Plays the test-reporter role.
#[derive(Debug, Default, Clone)]
pub struct CaptureSink {
    lines: Arc<Mutex<Vec<String>>>,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything logged so far.
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl LogSink for CaptureSink {
    fn log(&self, _level: LogLevel, message: &str) {
        self.lines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message.to_string());
    }
}

/// Threshold plus sink, shared by the facade and the stderr scanner.
#[derive(Clone)]
pub struct Logger {
    threshold: LogLevel,
    sink: Arc<dyn LogSink>,
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("threshold", &self.threshold)
            .finish_non_exhaustive()
    }
}

impl Logger {
    pub fn new(threshold: LogLevel, sink: Arc<dyn LogSink>) -> Self {
        Self { threshold, sink }
    }

    pub fn threshold(&self) -> LogLevel {
        self.threshold
    }

    /// Emit `message` tagged with its level if it passes the threshold.
    pub fn log(&self, level: LogLevel, message: &str) {
        if self.threshold.allows(level) {
            let line = format!("{}: {}", level.tag(), collapse_lines(message));
            self.sink.log(level, &line);
        }
    }

    /// Mirror one raw stderr line from the child.
    ///
    /// `last_level` carries the level of the previous prefixed line so
    /// that continuation lines (tracebacks, wrapped messages) follow it.
    pub fn mirror_child(&self, line: &str, last_level: &mut Option<LogLevel>) {
        if let Some(level) = child_line_level(line) {
            *last_level = Some(level);
        }
        let passes = match self.threshold {
            LogLevel::Child => true,
            threshold => last_level.is_some_and(|level| threshold.allows(level)),
        };
        if passes {
            let level = last_level.unwrap_or(LogLevel::Debug);
            self.sink.log(level, &format!("CHILD: {}", collapse_lines(line)));
        }
    }
}

static CHILD_LEVEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(DEBUG|INFO|WARNING|CRITICAL|ERROR)\b").expect("child level regex must compile")
});

/// Level token at the start of a child stderr line, if any.
pub fn child_line_level(line: &str) -> Option<LogLevel> {
    let caps = CHILD_LEVEL.captures(line)?;
    caps.get(1)?.as_str().parse().ok()
}

/// Fold embedded newlines and the whitespace around them into single spaces.
pub fn collapse_lines(message: &str) -> String {
    message
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
