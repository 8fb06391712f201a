//! Flagwire Logging
//!
//! Provides the logger capability the evaluation client writes diagnostics
//! through, plus the loggers shipped with it.
//!
//! # Features
//!
//! - **Injectable**: anything implementing [`Logger`] can be handed to the registry
//! - **Environment-controlled**: `FLAGWIRE_LOG_LEVEL` and friends configure the console logger
//! - **Crash-proof**: [`SafeLogger`] catches panics in user loggers and falls back to the console
//! - **Multiple backends**: write to stderr directly or forward into `tracing`
//!
//! # Usage
//!
//! ```rust
//! use flagwire_log::{ConsoleLogger, Logger, SafeLogger};
//! use std::sync::Arc;
//!
//! let logger = SafeLogger::new(Arc::new(ConsoleLogger::from_env()));
//! logger.info("provider ready");
//! logger.error("hook failed: boom");
//! ```
//!
//! # Environment Variables
//!
//! - `FLAGWIRE_DEBUG=1` - Enable debug logging
//! - `FLAGWIRE_LOG_LEVEL=debug|info|warn|error` - Set log level
//! - `FLAGWIRE_LOG_FORMAT=pretty|json|compact` - Set output format
//! - `FLAGWIRE_LOG_TIMESTAMPS=1|0` - Include timestamps

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::env;
use std::io::Write;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

/// Target used for every line the console logger writes.
pub const LOG_TARGET: &str = "flagwire";

// ============================================================================
// Log Levels
// ============================================================================

/// Log level for flagwire logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Level {
    /// Debug level (most verbose)
    Debug = 1,
    /// Info level
    Info = 2,
    /// Warning level
    Warn = 3,
    /// Error level (least verbose)
    Error = 4,
    /// Off (no logging)
    Off = 5,
}

impl Level {
    /// Get level from string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "debug" | "trace" => Some(Level::Debug),
            "info" => Some(Level::Info),
            "warn" | "warning" => Some(Level::Warn),
            "error" => Some(Level::Error),
            "off" | "none" => Some(Level::Off),
            _ => None,
        }
    }

    /// Get level name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Level::Debug => "DEBUG",
            Level::Info => "INFO",
            Level::Warn => "WARN",
            Level::Error => "ERROR",
            Level::Off => "OFF",
        }
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Log Format
// ============================================================================

/// Output format for log messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    /// Human readable multi-field line
    Pretty,
    /// Compact single-line format
    Compact,
    /// JSON format for structured logging
    Json,
}

impl Format {
    /// Get format from string.
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "pretty" => Some(Format::Pretty),
            "compact" => Some(Format::Compact),
            "json" => Some(Format::Json),
            _ => None,
        }
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Process-wide configuration read once from the environment.
static CONFIG: Lazy<LogConfig> = Lazy::new(LogConfig::from_env);

/// Console logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Minimum log level
    pub level: Level,
    /// Output format
    pub format: Format,
    /// Whether to include timestamps
    pub timestamps: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::Warn,
            format: Format::Json,
            timestamps: true,
        }
    }
}

impl LogConfig {
    /// Create a config with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let debug = env::var("FLAGWIRE_DEBUG")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let level = env::var("FLAGWIRE_LOG_LEVEL")
            .ok()
            .and_then(|s| Level::from_str(&s))
            .unwrap_or(if debug { Level::Debug } else { defaults.level });

        let format = env::var("FLAGWIRE_LOG_FORMAT")
            .ok()
            .and_then(|s| Format::from_str(&s))
            .unwrap_or(defaults.format);

        let timestamps = env::var("FLAGWIRE_LOG_TIMESTAMPS")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(defaults.timestamps);

        Self {
            level,
            format,
            timestamps,
        }
    }

    /// Set the minimum level.
    pub fn level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Set the output format.
    pub fn format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    /// Enable or disable timestamps.
    pub fn with_timestamps(mut self, timestamps: bool) -> Self {
        self.timestamps = timestamps;
        self
    }
}

/// Get the process-wide configuration.
pub fn config() -> &'static LogConfig {
    &CONFIG
}

// ============================================================================
// Logger capability
// ============================================================================

/// Logger capability injected into the evaluation client.
///
/// Implementations must be cheap to call from any task. A panicking
/// implementation is tolerated when wrapped in a [`SafeLogger`].
pub trait Logger: Send + Sync {
    /// Log an error.
    fn error(&self, message: &str);

    /// Log a warning.
    fn warn(&self, message: &str);

    /// Log an informational message.
    fn info(&self, message: &str);

    /// Log a debug message.
    fn debug(&self, message: &str);

    /// Log at an explicit level.
    fn log(&self, level: Level, message: &str) {
        match level {
            Level::Debug => self.debug(message),
            Level::Info => self.info(message),
            Level::Warn => self.warn(message),
            Level::Error => self.error(message),
            Level::Off => {}
        }
    }
}

// ============================================================================
// Console logger
// ============================================================================

/// Logger writing straight to stderr.
#[derive(Debug, Clone, Default)]
pub struct ConsoleLogger {
    config: LogConfig,
}

impl ConsoleLogger {
    /// Create a console logger with an explicit configuration.
    pub fn new(config: LogConfig) -> Self {
        Self { config }
    }

    /// Create a console logger from the process-wide environment config.
    pub fn from_env() -> Self {
        Self::new(config().clone())
    }

    /// Configuration in use.
    pub fn config(&self) -> &LogConfig {
        &self.config
    }

    /// Check if a level passes the configured filter.
    #[inline]
    pub fn is_enabled(&self, level: Level) -> bool {
        level != Level::Off && level >= self.config.level
    }

    fn write(&self, level: Level, message: &str) {
        if !self.is_enabled(level) {
            return;
        }

        match self.config.format {
            Format::Pretty => log_pretty(level, message, &self.config),
            Format::Compact => log_compact(level, message, &self.config),
            Format::Json => log_json(level, message),
        }
    }
}

impl Logger for ConsoleLogger {
    fn error(&self, message: &str) {
        self.write(Level::Error, message);
    }

    fn warn(&self, message: &str) {
        self.write(Level::Warn, message);
    }

    fn info(&self, message: &str) {
        self.write(Level::Info, message);
    }

    fn debug(&self, message: &str) {
        self.write(Level::Debug, message);
    }
}

fn log_pretty(level: Level, message: &str, config: &LogConfig) {
    let mut stderr = std::io::stderr().lock();

    if config.timestamps {
        let now = chrono::Local::now();
        let _ = write!(stderr, "{} ", now.format("%Y-%m-%d %H:%M:%S%.3f"));
    }

    let _ = write!(stderr, "{:5} ", level.as_str());
    let _ = write!(stderr, "[{}] ", LOG_TARGET);
    let _ = writeln!(stderr, "{}", message);
}

fn log_compact(level: Level, message: &str, config: &LogConfig) {
    let mut stderr = std::io::stderr().lock();

    if config.timestamps {
        let now = chrono::Local::now();
        let _ = write!(stderr, "{} ", now.format("%H:%M:%S"));
    }

    let _ = write!(stderr, "{} ", level.as_str().chars().next().unwrap_or('?'));
    let _ = writeln!(stderr, "{}: {}", LOG_TARGET, message);
}

#[cfg(feature = "json")]
fn log_json(level: Level, message: &str) {
    use serde::Serialize;

    #[derive(Serialize)]
    struct LogEntry<'a> {
        timestamp: String,
        level: &'a str,
        target: &'a str,
        message: &'a str,
    }

    let entry = LogEntry {
        timestamp: chrono::Utc::now().to_rfc3339(),
        level: level.as_str(),
        target: LOG_TARGET,
        message,
    };

    if let Ok(json) = serde_json::to_string(&entry) {
        eprintln!("{}", json);
    }
}

#[cfg(not(feature = "json"))]
fn log_json(level: Level, message: &str) {
    let timestamp = chrono::Utc::now().to_rfc3339();
    eprintln!(
        r#"{{"timestamp":"{}","level":"{}","target":"{}","message":"{}"}}"#,
        timestamp,
        level.as_str(),
        LOG_TARGET,
        escape_json(message)
    );
}

#[cfg(not(feature = "json"))]
fn escape_json(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => result.push_str("\\\""),
            '\\' => result.push_str("\\\\"),
            '\n' => result.push_str("\\n"),
            '\r' => result.push_str("\\r"),
            '\t' => result.push_str("\\t"),
            c if c.is_control() => {
                result.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => result.push(c),
        }
    }
    result
}

// ============================================================================
// Tracing logger
// ============================================================================

/// Logger forwarding into the `tracing` ecosystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn error(&self, message: &str) {
        tracing::error!(target: "flagwire", "{}", message);
    }

    fn warn(&self, message: &str) {
        tracing::warn!(target: "flagwire", "{}", message);
    }

    fn info(&self, message: &str) {
        tracing::info!(target: "flagwire", "{}", message);
    }

    fn debug(&self, message: &str) {
        tracing::debug!(target: "flagwire", "{}", message);
    }
}

// ============================================================================
// Buffer logger
// ============================================================================

/// A single captured log line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub level: Level,
    pub message: String,
}

/// Logger that keeps every message in memory.
///
/// Clones share the same buffer.
#[derive(Debug, Clone, Default)]
pub struct BufferLogger {
    records: Arc<Mutex<Vec<LogRecord>>>,
}

impl BufferLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// All captured records, oldest first.
    pub fn records(&self) -> Vec<LogRecord> {
        self.records.lock().clone()
    }

    /// Messages captured at the given level.
    pub fn messages(&self, level: Level) -> Vec<String> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.level == level)
            .map(|r| r.message.clone())
            .collect()
    }

    /// Whether any record at `level` contains `needle`.
    pub fn contains(&self, level: Level, needle: &str) -> bool {
        self.records
            .lock()
            .iter()
            .any(|r| r.level == level && r.message.contains(needle))
    }

    pub fn clear(&self) {
        self.records.lock().clear();
    }

    fn push(&self, level: Level, message: &str) {
        self.records.lock().push(LogRecord {
            level,
            message: message.to_string(),
        });
    }
}

impl Logger for BufferLogger {
    fn error(&self, message: &str) {
        self.push(Level::Error, message);
    }

    fn warn(&self, message: &str) {
        self.push(Level::Warn, message);
    }

    fn info(&self, message: &str) {
        self.push(Level::Info, message);
    }

    fn debug(&self, message: &str) {
        self.push(Level::Debug, message);
    }
}

// ============================================================================
// Safe logger
// ============================================================================

/// Wrapper that never lets a logger failure escape.
///
/// A panic inside the wrapped logger is caught and the original message is
/// written through a fallback [`ConsoleLogger`] instead.
#[derive(Clone)]
pub struct SafeLogger {
    inner: Arc<dyn Logger>,
    fallback: ConsoleLogger,
}

impl SafeLogger {
    /// Wrap a logger.
    pub fn new(inner: Arc<dyn Logger>) -> Self {
        Self {
            inner,
            fallback: ConsoleLogger::from_env(),
        }
    }

    /// Wrap a logger with an explicit fallback.
    pub fn with_fallback(inner: Arc<dyn Logger>, fallback: ConsoleLogger) -> Self {
        Self { inner, fallback }
    }

    /// The wrapped logger.
    pub fn inner(&self) -> &Arc<dyn Logger> {
        &self.inner
    }

    fn guarded(&self, level: Level, message: &str) {
        let inner = &self.inner;
        let outcome = catch_unwind(AssertUnwindSafe(|| inner.log(level, message)));
        if outcome.is_err() {
            self.fallback
                .error("configured logger panicked, falling back to console logger");
            self.fallback.log(level, message);
        }
    }
}

impl Default for SafeLogger {
    fn default() -> Self {
        Self::new(Arc::new(ConsoleLogger::from_env()))
    }
}

impl std::fmt::Debug for SafeLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafeLogger")
            .field("fallback", &self.fallback)
            .finish_non_exhaustive()
    }
}

impl Logger for SafeLogger {
    fn error(&self, message: &str) {
        self.guarded(Level::Error, message);
    }

    fn warn(&self, message: &str) {
        self.guarded(Level::Warn, message);
    }

    fn info(&self, message: &str) {
        self.guarded(Level::Info, message);
    }

    fn debug(&self, message: &str) {
        self.guarded(Level::Debug, message);
    }
}

// ============================================================================
// Tests
// ============================================================================
