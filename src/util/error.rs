// logtail - util/error.rs
//
// Typed error hierarchy with context-preserving error chains.
// No string-based error propagation; every error keeps its causal chain
// for diagnostic logging.
//
// Note that none of these cross a pipeline stage boundary during a tick:
// sources translate them into properties (see core::property::ErrorFlag)
// and the scheduler logs whatever a callback returns.

use std::fmt;
use std::io;
use std::path::PathBuf;

/// Top-level error type for all logtail operations.
/// Errors are categorised by the subsystem that produced them.
#[derive(Debug)]
pub enum LogTailError {
    /// A log source could not read its backing data.
    Source(SourceError),

    /// A line could not be parsed (always recovered from).
    Parse(ParseError),

    /// Filter construction failed.
    Filter(FilterError),

    /// A scheduled callback failed.
    Scheduler(SchedulerError),

    /// Configuration loading or validation failed.
    Config(ConfigError),

    /// Writing output failed.
    Output(io::Error),
}

impl fmt::Display for LogTailError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Source(e) => write!(f, "Source error: {e}"),
            Self::Parse(e) => write!(f, "Parse error: {e}"),
            Self::Filter(e) => write!(f, "Filter error: {e}"),
            Self::Scheduler(e) => write!(f, "Scheduler error: {e}"),
            Self::Config(e) => write!(f, "Configuration error: {e}"),
            Self::Output(e) => write!(f, "Output error: {e}"),
        }
    }
}

impl std::error::Error for LogTailError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Source(e) => Some(e),
            Self::Parse(e) => Some(e),
            Self::Filter(e) => Some(e),
            Self::Scheduler(e) => Some(e),
            Self::Config(e) => Some(e),
            Self::Output(e) => Some(e),
        }
    }
}

// ---------------------------------------------------------------------------
// Source errors
// ---------------------------------------------------------------------------

/// Errors raised while a source reads its backing file.
#[derive(Debug)]
pub enum SourceError {
    /// The file (or one of its parent directories) does not exist.
    DoesNotExist { path: PathBuf },

    /// The file exists but cannot be opened (locked, permission denied).
    CannotBeAccessed { path: PathBuf, source: io::Error },

    /// Reading from an opened file failed.
    Read {
        path: PathBuf,
        offset: u64,
        source: io::Error,
    },
}

impl SourceError {
    /// Classify an I/O error raised while opening or stat-ing `path`.
    pub fn from_io(path: PathBuf, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::NotFound => Self::DoesNotExist { path },
            _ => Self::CannotBeAccessed { path, source },
        }
    }
}

impl fmt::Display for SourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DoesNotExist { path } => {
                write!(f, "'{}' does not exist", path.display())
            }
            Self::CannotBeAccessed { path, source } => {
                write!(f, "'{}' cannot be accessed: {source}", path.display())
            }
            Self::Read {
                path,
                offset,
                source,
            } => write!(
                f,
                "Read error in '{}' at offset {offset}: {source}",
                path.display()
            ),
        }
    }
}

impl std::error::Error for SourceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::CannotBeAccessed { source, .. } => Some(source),
            Self::Read { source, .. } => Some(source),
            Self::DoesNotExist { .. } => None,
        }
    }
}

impl From<SourceError> for LogTailError {
    fn from(e: SourceError) -> Self {
        Self::Source(e)
    }
}

// ---------------------------------------------------------------------------
// Parse errors
// ---------------------------------------------------------------------------

/// Errors related to interpreting a single line.
///
/// These are always recovered: the line is kept without timestamp/level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// A timestamp string could not be parsed with the configured format.
    TimestampParse {
        line_number: usize,
        raw_timestamp: String,
        format: String,
    },

    /// Bytes could not be decoded with the detected encoding.
    Decode {
        encoding: &'static str,
        offset: u64,
    },
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TimestampParse {
                line_number,
                raw_timestamp,
                format,
            } => write!(
                f,
                "line {line_number}: cannot parse timestamp \
                 '{raw_timestamp}' with format '{format}'"
            ),
            Self::Decode { encoding, offset } => {
                write!(f, "invalid {encoding} sequence at byte offset {offset}")
            }
        }
    }
}

impl std::error::Error for ParseError {}

impl From<ParseError> for LogTailError {
    fn from(e: ParseError) -> Self {
        Self::Parse(e)
    }
}

// ---------------------------------------------------------------------------
// Filter errors
// ---------------------------------------------------------------------------

/// Errors related to building a filter predicate.
#[derive(Debug)]
pub enum FilterError {
    /// User-provided regex is invalid.
    InvalidRegex {
        pattern: String,
        source: regex::Error,
    },

    /// User-provided wildcard pattern is invalid.
    InvalidWildcard {
        pattern: String,
        source: glob::PatternError,
    },

    /// A filter expression could not be parsed.
    Expression {
        expression: String,
        position: usize,
        reason: String,
    },

    /// Pattern exceeds MAX_FILTER_PATTERN_LENGTH.
    PatternTooLong { length: usize, max_length: usize },

    /// A level list named something that is not a level.
    UnknownLevel { list: String },
}

impl fmt::Display for FilterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidRegex { pattern, source } => {
                write!(f, "Invalid filter regex '{pattern}': {source}")
            }
            Self::InvalidWildcard { pattern, source } => {
                write!(f, "Invalid wildcard pattern '{pattern}': {source}")
            }
            Self::Expression {
                expression,
                position,
                reason,
            } => write!(
                f,
                "Unable to parse \"{expression}\" at position {position}: {reason}"
            ),
            Self::PatternTooLong { length, max_length } => write!(
                f,
                "Filter pattern is {length} chars, exceeds maximum of {max_length}"
            ),
            Self::UnknownLevel { list } => write!(
                f,
                "Unknown level in '{list}' (expected trace, debug, info, warn, error, fatal, other)"
            ),
        }
    }
}

impl std::error::Error for FilterError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::InvalidRegex { source, .. } => Some(source),
            Self::InvalidWildcard { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<FilterError> for LogTailError {
    fn from(e: FilterError) -> Self {
        Self::Filter(e)
    }
}

// ---------------------------------------------------------------------------
// Scheduler errors
// ---------------------------------------------------------------------------

/// Faults raised by periodic callbacks. Logged, never propagated.
#[derive(Debug)]
pub enum SchedulerError {
    /// The callback returned an error.
    CallbackFault {
        task: String,
        source: Box<LogTailError>,
    },

    /// The callback panicked.
    Panicked { task: String, message: String },

    /// The worker pool could not be created.
    ThreadPool {
        source: rayon::ThreadPoolBuildError,
    },

    /// The timer thread could not be spawned.
    TimerThread { source: io::Error },
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CallbackFault { task, source } => {
                write!(f, "Periodic task '{task}' failed: {source}")
            }
            Self::Panicked { task, message } => {
                write!(f, "Periodic task '{task}' panicked: {message}")
            }
            Self::ThreadPool { source } => {
                write!(f, "Cannot build scheduler worker pool: {source}")
            }
            Self::TimerThread { source } => {
                write!(f, "Cannot spawn scheduler timer thread: {source}")
            }
        }
    }
}

impl std::error::Error for SchedulerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::CallbackFault { source, .. } => Some(source.as_ref()),
            Self::ThreadPool { source } => Some(source),
            Self::TimerThread { source } => Some(source),
            Self::Panicked { .. } => None,
        }
    }
}

impl From<SchedulerError> for LogTailError {
    fn from(e: SchedulerError) -> Self {
        Self::Scheduler(e)
    }
}

// ---------------------------------------------------------------------------
// Config errors
// ---------------------------------------------------------------------------

/// Errors related to configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    /// TOML parsing failed.
    TomlParse {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// A config value is out of the allowed range.
    ValueOutOfRange {
        field: String,
        value: String,
        expected: String,
    },

    /// I/O error reading config file.
    Io { path: PathBuf, source: io::Error },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TomlParse { path, source } => {
                write!(f, "Config parse error '{}': {source}", path.display())
            }
            Self::ValueOutOfRange {
                field,
                value,
                expected,
            } => write!(
                f,
                "Config '{field}' = '{value}' is out of range. Expected: {expected}"
            ),
            Self::Io { path, source } => {
                write!(f, "Config I/O error '{}': {source}", path.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::TomlParse { source, .. } => Some(source),
            Self::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<ConfigError> for LogTailError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

/// Convenience type alias for logtail results.
pub type Result<T> = std::result::Result<T, LogTailError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_from_io_classifies_not_found() {
        let err = SourceError::from_io(
            PathBuf::from("missing.log"),
            io::Error::new(io::ErrorKind::NotFound, "gone"),
        );
        assert!(matches!(err, SourceError::DoesNotExist { .. }));
    }

    #[test]
    fn test_from_io_classifies_permission_denied() {
        let err = SourceError::from_io(
            PathBuf::from("locked.log"),
            io::Error::new(io::ErrorKind::PermissionDenied, "nope"),
        );
        assert!(matches!(err, SourceError::CannotBeAccessed { .. }));
        assert!(err.source().is_some());
    }

    #[test]
    fn test_scheduler_fault_keeps_chain() {
        let inner = LogTailError::from(SourceError::DoesNotExist {
            path: PathBuf::from("a.log"),
        });
        let err = LogTailError::from(SchedulerError::CallbackFault {
            task: "tail a.log".to_string(),
            source: Box::new(inner),
        });
        let msg = err.to_string();
        assert!(msg.contains("tail a.log"), "{msg}");
        assert!(err.source().and_then(|e| e.source()).is_some());
    }
}
