//! Structured replay log and warning throttle
//!
//! Every candidate warning is counted. The first `max_printed` of them are
//! emitted through `tracing` and retained as [`LogEntry`] values; the rest
//! are only counted, and the summary reports how many were suppressed.
//! At [`Verbosity::Minimum`] nothing is emitted but everything is counted.

use serde::{Serialize, Deserialize};
use chrono::{DateTime, Utc};
use crate::operation::Operation;
use crate::types::{Verbosity, WarningSummary};

/// Default number of warnings printed before the rest are suppressed
pub const DEFAULT_MAX_PRINTED_WARNINGS: usize = 64;

/// Upper bound on retained informational notes
const MAX_RETAINED_NOTES: usize = 1024;

/// Log level for replay logging
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LogLevel {
    /// Notes only shown at maximum verbosity
    Debug,
    /// General information
    Info,
    /// Per-line warnings
    Warn,
}

/// A replay log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub timestamp: DateTime<Utc>,
    /// Trace line the entry refers to
    pub line: Option<usize>,
    pub operation: Option<Operation>,
    pub message: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: String) -> Self {
        Self {
            level,
            timestamp: Utc::now(),
            line: None,
            operation: None,
            message,
        }
    }

    /// Attach the trace position the entry refers to
    pub fn at(mut self, line: usize, operation: Option<Operation>) -> Self {
        self.line = Some(line);
        self.operation = operation;
        self
    }
}

/// Collects replay warnings and notes with throttled console output
#[derive(Debug, Clone)]
pub struct ReplayLogger {
    entries: Vec<LogEntry>,
    verbosity: Verbosity,
    max_printed: usize,
    warning_count: usize,
    printed: usize,
    suppression_announced: bool,
}

impl ReplayLogger {
    pub fn new(verbosity: Verbosity, max_printed: usize) -> Self {
        Self {
            entries: Vec::new(),
            verbosity,
            max_printed,
            warning_count: 0,
            printed: 0,
            suppression_announced: false,
        }
    }

    pub fn verbosity(&self) -> Verbosity {
        self.verbosity
    }

    /// Record a per-line warning; returns whether it was printed
    pub fn warn(
        &mut self,
        line: usize,
        operation: Option<Operation>,
        message: impl Into<String>,
    ) -> bool {
        self.warning_count += 1;

        if self.verbosity == Verbosity::Minimum {
            return false;
        }
        if self.printed >= self.max_printed {
            if !self.suppression_announced {
                self.suppression_announced = true;
                tracing::warn!("Too many warnings, further warnings are suppressed");
            }
            return false;
        }

        let message = message.into();
        tracing::warn!("Line {}: {}", line, message);
        self.printed += 1;
        self.entries.push(LogEntry::new(LogLevel::Warn, message).at(line, operation));
        true
    }

    /// Note shown only at maximum verbosity; never counted as a warning
    pub fn note(&mut self, line: usize, operation: Option<Operation>, message: impl Into<String>) {
        if self.verbosity < Verbosity::Maximum {
            return;
        }
        let message = message.into();
        tracing::debug!("Line {}: {}", line, message);
        if self.entries.len() < MAX_RETAINED_NOTES + self.max_printed {
            self.entries.push(LogEntry::new(LogLevel::Debug, message).at(line, operation));
        }
    }

    /// Informational message outside the per-line flow
    pub fn info(&mut self, message: impl Into<String>) {
        let message = message.into();
        if self.verbosity > Verbosity::Minimum {
            tracing::info!("{}", message);
        }
        self.entries.push(LogEntry::new(LogLevel::Info, message));
    }

    pub fn warning_count(&self) -> usize {
        self.warning_count
    }

    pub fn summary(&self) -> WarningSummary {
        WarningSummary {
            total: self.warning_count,
            printed: self.printed,
            suppressed: self.warning_count - self.printed,
        }
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Retained entries of one level
    pub fn filter_by_level(&self, level: LogLevel) -> Vec<&LogEntry> {
        self.entries.iter().filter(|e| e.level == level).collect()
    }

    /// Retained entries about one trace line
    pub fn filter_by_line(&self, line: usize) -> Vec<&LogEntry> {
        self.entries.iter().filter(|e| e.line == Some(line)).collect()
    }
}

impl Default for ReplayLogger {
    fn default() -> Self {
        Self::new(Verbosity::Default, DEFAULT_MAX_PRINTED_WARNINGS)
    }
}
