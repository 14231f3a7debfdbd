//! Logging support for ringsock.
//!
//! This module provides structured logging for servers, clients and their
//! connections. There is deliberately no process-wide logger: a [`Logger`]
//! is built from the owning server's or client's configuration and handed
//! down to everything it owns, so two owners in one process can log at
//! different levels or to different destinations.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

/// Log level for ringsock operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    /// Trace-level logging (very verbose)
    Trace = 0,
    /// Debug-level logging
    Debug = 1,
    /// Info-level logging
    Info = 2,
    /// Warning-level logging
    Warn = 3,
    /// Error-level logging
    Error = 4,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "TRACE"),
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Log entry containing structured information about ringsock operations.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Timestamp when the log entry was created
    pub timestamp: SystemTime,
    /// Log level
    pub level: LogLevel,
    /// Component that generated the log
    pub component: String,
    /// File descriptor if applicable
    pub fd: Option<i32>,
    /// Message content
    pub message: String,
    /// Duration if this is a timing log
    pub duration: Option<Duration>,
}

impl LogEntry {
    /// Create a new log entry.
    pub fn new(level: LogLevel, component: &str, message: &str) -> Self {
        Self {
            timestamp: SystemTime::now(),
            level,
            component: component.to_string(),
            fd: None,
            message: message.to_string(),
            duration: None,
        }
    }

    /// Add a file descriptor to the log entry.
    pub fn with_fd(mut self, fd: i32) -> Self {
        self.fd = Some(fd);
        self
    }

    /// Add a duration to the log entry.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Format the log entry as a human-readable string.
    pub fn format(&self) -> String {
        let timestamp = self
            .timestamp
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();

        let mut parts = vec![
            format!("[{}]", timestamp),
            format!("{}", self.level),
            self.component.clone(),
        ];

        if let Some(fd) = self.fd {
            parts.push(format!("fd:{}", fd));
        }

        parts.push(self.message.clone());

        if let Some(duration) = self.duration {
            parts.push(format!("duration:{}us", duration.as_micros()));
        }

        parts.join(" ")
    }

    /// Format the log entry as JSON.
    pub fn format_json(&self) -> String {
        let timestamp = self
            .timestamp
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();

        let mut json_parts = vec![
            format!("\"timestamp\":{}", timestamp),
            format!("\"level\":\"{}\"", self.level),
            format!("\"component\":\"{}\"", self.component),
            format!("\"message\":\"{}\"", self.message.replace('"', "\\\"")),
        ];

        if let Some(fd) = self.fd {
            json_parts.push(format!("\"fd\":{}", fd));
        }

        if let Some(duration) = self.duration {
            json_parts.push(format!("\"duration_us\":{}", duration.as_micros()));
        }

        format!("{{{}}}", json_parts.join(","))
    }
}

/// Trait for log output destinations.
pub trait LogOutput: Send + Sync {
    /// Write a log entry to the output.
    fn write(&self, entry: &LogEntry) -> Result<()>;

    /// Flush any buffered output.
    fn flush(&self) -> Result<()>;
}

/// Console log output that writes to stderr.
#[derive(Debug)]
pub struct ConsoleOutput {
    /// Whether to use JSON format
    json_format: bool,
}

impl ConsoleOutput {
    /// Create a new console output with text format.
    pub fn new() -> Self {
        Self { json_format: false }
    }

    /// Create a new console output with JSON format.
    pub fn new_json() -> Self {
        Self { json_format: true }
    }
}

impl Default for ConsoleOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl LogOutput for ConsoleOutput {
    fn write(&self, entry: &LogEntry) -> Result<()> {
        let formatted = if self.json_format {
            entry.format_json()
        } else {
            entry.format()
        };

        eprintln!("{}", formatted);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        use std::io::Write;
        std::io::stderr().flush().map_err(Error::Io)?;
        Ok(())
    }
}

/// File log output that appends to a file.
#[derive(Debug)]
pub struct FileOutput {
    /// Path to the log file
    path: std::path::PathBuf,
    /// Whether to use JSON format
    json_format: bool,
}

impl FileOutput {
    /// Create a new file output.
    pub fn new<P: AsRef<std::path::Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            json_format: false,
        }
    }

    /// Create a new file output with JSON format.
    pub fn new_json<P: AsRef<std::path::Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            json_format: true,
        }
    }
}

impl LogOutput for FileOutput {
    fn write(&self, entry: &LogEntry) -> Result<()> {
        use std::io::Write;

        let formatted = if self.json_format {
            entry.format_json()
        } else {
            entry.format()
        };

        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(Error::Io)?;

        writeln!(file, "{}", formatted).map_err(Error::Io)?;
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        // File is opened and closed for each write, so no explicit flush needed
        Ok(())
    }
}

struct LoggerInner {
    min_level: LogLevel,
    outputs: Vec<Box<dyn LogOutput>>,
}

/// Logger handed down from an owning server or client.
///
/// Cheap to clone; every clone shares the same outputs and threshold. A
/// disabled logger has no outputs and drops entries without formatting
/// them.
#[derive(Clone)]
pub struct Logger {
    inner: Arc<LoggerInner>,
}

impl Logger {
    /// Create a logger writing to stderr at the given minimum level.
    pub fn new(min_level: LogLevel) -> Self {
        Self {
            inner: Arc::new(LoggerInner {
                min_level,
                outputs: vec![Box::new(ConsoleOutput::new())],
            }),
        }
    }

    /// Create a logger with explicit output destinations.
    pub fn with_outputs(min_level: LogLevel, outputs: Vec<Box<dyn LogOutput>>) -> Self {
        Self {
            inner: Arc::new(LoggerInner { min_level, outputs }),
        }
    }

    /// Create a logger that drops everything.
    pub fn disabled() -> Self {
        Self {
            inner: Arc::new(LoggerInner {
                min_level: LogLevel::Error,
                outputs: Vec::new(),
            }),
        }
    }

    /// Whether entries at `level` would be emitted.
    pub fn enabled(&self, level: LogLevel) -> bool {
        level >= self.inner.min_level && !self.inner.outputs.is_empty()
    }

    /// Log a message at the specified level.
    pub fn log(&self, level: LogLevel, component: &str, message: &str) {
        if !self.enabled(level) {
            return;
        }
        self.write_entry(&LogEntry::new(level, component, message));
    }

    /// Log a message tagged with a file descriptor.
    pub fn log_fd(&self, level: LogLevel, component: &str, fd: i32, message: &str) {
        if !self.enabled(level) {
            return;
        }
        self.write_entry(&LogEntry::new(level, component, message).with_fd(fd));
    }

    /// Log an error with context.
    pub fn log_error(&self, component: &str, error: &Error, context: &str) {
        self.log(
            LogLevel::Error,
            component,
            &format!("{}: {}", context, error),
        );
    }

    /// Write a log entry to all outputs.
    fn write_entry(&self, entry: &LogEntry) {
        for output in &self.inner.outputs {
            if let Err(e) = output.write(entry) {
                eprintln!("Failed to write log entry: {}", e);
            }
        }
    }

    /// Flush all outputs.
    pub fn flush(&self) {
        for output in &self.inner.outputs {
            if let Err(e) = output.flush() {
                eprintln!("Failed to flush log output: {}", e);
            }
        }
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger")
            .field("min_level", &self.inner.min_level)
            .field("outputs", &self.inner.outputs.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct CaptureOutput {
        entries: Mutex<Vec<String>>,
    }

    impl LogOutput for CaptureOutput {
        fn write(&self, entry: &LogEntry) -> Result<()> {
            self.entries.lock().unwrap().push(entry.format());
            Ok(())
        }

        fn flush(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_log_entry_creation() {
        let entry = LogEntry::new(LogLevel::Info, "server", "listener up")
            .with_fd(4)
            .with_duration(Duration::from_millis(10));

        assert_eq!(entry.level, LogLevel::Info);
        assert_eq!(entry.component, "server");
        assert_eq!(entry.message, "listener up");
        assert_eq!(entry.fd, Some(4));
        assert_eq!(entry.duration, Some(Duration::from_millis(10)));
    }

    #[test]
    fn test_log_entry_formatting() {
        let entry = LogEntry::new(LogLevel::Info, "server", "listener up");
        let formatted = entry.format();

        assert!(formatted.contains("INFO"));
        assert!(formatted.contains("server"));
        assert!(formatted.contains("listener up"));
    }

    #[test]
    fn test_log_entry_json_formatting() {
        let entry = LogEntry::new(LogLevel::Info, "server", "listener up").with_fd(7);
        let json = entry.format_json();

        assert!(json.contains("\"level\":\"INFO\""));
        assert!(json.contains("\"component\":\"server\""));
        assert!(json.contains("\"fd\":7"));
    }

    #[test]
    fn test_level_threshold() {
        let capture = Arc::new(CaptureOutput {
            entries: Mutex::new(Vec::new()),
        });
        let logger = Logger::with_outputs(
            LogLevel::Warn,
            vec![Box::new(SharedCapture(capture.clone()))],
        );

        logger.log(LogLevel::Debug, "test", "dropped");
        logger.log(LogLevel::Error, "test", "kept");

        let entries = capture.entries.lock().unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].contains("kept"));
    }

    #[test]
    fn test_disabled_logger() {
        let logger = Logger::disabled();
        assert!(!logger.enabled(LogLevel::Error));
        // Must not panic with no outputs.
        logger.log(LogLevel::Error, "test", "nowhere");
        logger.flush();
    }

    struct SharedCapture(Arc<CaptureOutput>);

    impl LogOutput for SharedCapture {
        fn write(&self, entry: &LogEntry) -> Result<()> {
            self.0.write(entry)
        }

        fn flush(&self) -> Result<()> {
            self.0.flush()
        }
    }
}
