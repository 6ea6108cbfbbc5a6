// logtail - platform/config.rs
//
// Platform-specific configuration directory resolution and config.toml
// loading with startup validation.
//
// Uses the `directories` crate for XDG (Linux), AppData (Windows),
// Library (macOS) compliance.

use crate::core::encoding::Encoding;
use crate::core::model::MultilineMode;
use crate::core::timestamp::TimestampFormat;
use crate::util::constants;
use crate::util::error::ConfigError;
use directories::ProjectDirs;
use std::fmt::Display;
use std::ops::RangeInclusive;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Resolved platform paths for logtail configuration.
#[derive(Debug, Clone)]
pub struct PlatformPaths {
    /// Configuration directory (e.g. ~/.config/logtail/ or %APPDATA%\logtail\config\)
    pub config_dir: PathBuf,
}

impl PlatformPaths {
    /// Resolve platform-appropriate paths.
    ///
    /// Falls back to current directory if platform dirs cannot be determined.
    pub fn resolve() -> Self {
        if let Some(proj_dirs) = ProjectDirs::from("", "", constants::APP_ID) {
            let config_dir = proj_dirs.config_dir().to_path_buf();
            tracing::debug!(config = %config_dir.display(), "Platform paths resolved");
            Self { config_dir }
        } else {
            tracing::warn!("Could not determine platform directories, using current directory");
            Self {
                config_dir: PathBuf::from("."),
            }
        }
    }

    /// Default location of config.toml.
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join(constants::CONFIG_FILE_NAME)
    }
}

// =============================================================================
// config.toml shape
// =============================================================================

/// Raw deserialisable shape of config.toml.
///
/// Unknown keys are silently ignored for forward compatibility.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
pub struct RawConfig {
    pub scheduler: SchedulerSection,
    pub tail: TailSection,
    pub merge: MergeSection,
    pub filter: FilterSection,
    pub cache: CacheSection,
    pub logging: LoggingSection,
}

/// `[scheduler]` config section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
pub struct SchedulerSection {
    /// Number of worker threads (0 = auto).
    pub worker_threads: Option<usize>,
}

/// `[tail]` config section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
pub struct TailSection {
    pub poll_interval_ms: Option<u64>,
    pub max_read_bytes_per_tick: Option<usize>,
    /// Encoding used when a file has no byte-order mark.
    pub encoding: Option<String>,
    /// chrono format matched at the start of each line (empty = sniff).
    pub timestamp_format: Option<String>,
    /// "continuation" or "raw".
    pub multiline: Option<String>,
}

/// `[merge]` config section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
pub struct MergeSection {
    pub poll_interval_ms: Option<u64>,
    /// Whether disposing a merge also disposes its children.
    pub owns_sources: Option<bool>,
}

/// `[filter]` config section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
pub struct FilterSection {
    pub poll_interval_ms: Option<u64>,
    pub batch_size: Option<usize>,
}

/// `[cache]` config section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub poll_interval_ms: Option<u64>,
    pub page_size: Option<usize>,
    pub max_pages: Option<usize>,
}

/// `[logging]` config section.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Log level: "error", "warn", "info", "debug", "trace".
    pub level: Option<String>,
    /// Log file path (empty = stderr only).
    pub file: Option<String>,
}

// =============================================================================
// Validated configuration
// =============================================================================

/// Settings for single-file sources.
#[derive(Debug, Clone, PartialEq)]
pub struct TailConfig {
    pub poll_interval: Duration,
    pub max_read_bytes_per_tick: usize,
    pub fallback_encoding: Encoding,
    pub timestamp_format: TimestampFormat,
    pub multiline: MultilineMode,
}

impl Default for TailConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(constants::DEFAULT_TAIL_POLL_INTERVAL_MS),
            max_read_bytes_per_tick: constants::DEFAULT_MAX_READ_BYTES_PER_TICK,
            fallback_encoding: Encoding::Utf8,
            timestamp_format: TimestampFormat::Sniff,
            multiline: MultilineMode::Continuation,
        }
    }
}

/// Settings for merge sources.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeConfig {
    pub poll_interval: Duration,
    pub owns_sources: bool,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(constants::DEFAULT_MERGE_POLL_INTERVAL_MS),
            owns_sources: true,
        }
    }
}

/// Settings for filter sources.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(constants::DEFAULT_FILTER_POLL_INTERVAL_MS),
            batch_size: constants::FILTER_BATCH_SIZE,
        }
    }
}

/// Settings for page-cache sources.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheConfig {
    pub poll_interval: Duration,
    pub page_size: usize,
    pub max_pages: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(constants::DEFAULT_CACHE_POLL_INTERVAL_MS),
            page_size: constants::DEFAULT_PAGE_SIZE,
            max_pages: constants::DEFAULT_MAX_PAGES,
        }
    }
}

/// Validated pipeline configuration derived from `config.toml`.
///
/// All values are validated against named constants at load time.
/// Invalid values produce actionable warnings and fall back to defaults.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PipelineConfig {
    /// Scheduler worker threads (0 = one per CPU core).
    pub worker_threads: usize,
    pub tail: TailConfig,
    pub merge: MergeConfig,
    pub filter: FilterConfig,
    pub cache: CacheConfig,
    /// Logging level string (for init before tracing is available).
    pub log_level: Option<String>,
    /// Log file path.
    pub log_file: Option<String>,
}

/// Accept `value` if it lies in `range`, otherwise record a warning and
/// return `default`.
fn validated<T: PartialOrd + Display + Copy>(
    field: &str,
    value: Option<T>,
    range: RangeInclusive<T>,
    default: T,
    warnings: &mut Vec<String>,
) -> T {
    match value {
        Some(v) if range.contains(&v) => v,
        Some(v) => {
            let err = ConfigError::ValueOutOfRange {
                field: field.to_string(),
                value: v.to_string(),
                expected: format!("{}-{}", range.start(), range.end()),
            };
            warnings.push(format!("{err}. Using default ({default})."));
            default
        }
        None => default,
    }
}

fn validated_interval(
    field: &str,
    value: Option<u64>,
    default_ms: u64,
    warnings: &mut Vec<String>,
) -> Duration {
    Duration::from_millis(validated(
        field,
        value,
        constants::MIN_POLL_INTERVAL_MS..=constants::MAX_POLL_INTERVAL_MS,
        default_ms,
        warnings,
    ))
}

/// Load and validate the config file at `config_path`.
///
/// Returns `PipelineConfig` with validated values and a list of non-fatal
/// warnings. If the file does not exist, returns defaults with no warnings
/// (first run). If the file is unreadable or unparseable, returns defaults
/// with a warning so the pipeline still starts and the user is informed.
pub fn load_config(config_path: &Path) -> (PipelineConfig, Vec<String>) {
    let mut warnings: Vec<String> = Vec::new();

    if !config_path.exists() {
        tracing::debug!(path = %config_path.display(), "No config.toml found; using defaults");
        return (PipelineConfig::default(), warnings);
    }

    let content = match std::fs::read_to_string(config_path) {
        Ok(c) => c,
        Err(source) => {
            let err = ConfigError::Io {
                path: config_path.to_path_buf(),
                source,
            };
            let msg = format!("{err}. Using defaults.");
            tracing::warn!("{}", msg);
            warnings.push(msg);
            return (PipelineConfig::default(), warnings);
        }
    };

    let (config, mut more) = parse_config(&content, config_path);
    warnings.append(&mut more);
    (config, warnings)
}

/// Parse and validate config.toml content. `origin` is only used in
/// messages.
pub fn parse_config(content: &str, origin: &Path) -> (PipelineConfig, Vec<String>) {
    let mut warnings: Vec<String> = Vec::new();

    let raw: RawConfig = match toml::from_str(content) {
        Ok(r) => r,
        Err(source) => {
            let err = ConfigError::TomlParse {
                path: origin.to_path_buf(),
                source,
            };
            let msg = format!("{err}. Using defaults.");
            tracing::warn!("{}", msg);
            warnings.push(msg);
            return (PipelineConfig::default(), warnings);
        }
    };

    tracing::info!(path = %origin.display(), "Loaded config.toml");

    // Validate each field against named constants, accumulating all errors.
    let mut config = PipelineConfig::default();

    // -- Scheduler --
    config.worker_threads = validated(
        "scheduler.worker_threads",
        raw.scheduler.worker_threads,
        0..=constants::MAX_WORKER_THREADS,
        constants::DEFAULT_WORKER_THREADS,
        &mut warnings,
    );

    // -- Tail --
    config.tail.poll_interval = validated_interval(
        "tail.poll_interval_ms",
        raw.tail.poll_interval_ms,
        constants::DEFAULT_TAIL_POLL_INTERVAL_MS,
        &mut warnings,
    );
    config.tail.max_read_bytes_per_tick = validated(
        "tail.max_read_bytes_per_tick",
        raw.tail.max_read_bytes_per_tick,
        constants::MIN_READ_BYTES_PER_TICK..=constants::MAX_READ_BYTES_PER_TICK,
        constants::DEFAULT_MAX_READ_BYTES_PER_TICK,
        &mut warnings,
    );
    if let Some(ref name) = raw.tail.encoding {
        match Encoding::from_name(name) {
            Some(enc) if enc.is_valid_fallback() => config.tail.fallback_encoding = enc,
            _ => warnings.push(format!(
                "[tail] encoding = \"{name}\" is not supported. \
                 Valid values: utf-8, utf-16le, utf-16be, latin1. Using default ({}).",
                constants::DEFAULT_ENCODING
            )),
        }
    }
    config.tail.timestamp_format = TimestampFormat::from_config(raw.tail.timestamp_format.as_deref());
    if let Some(ref mode) = raw.tail.multiline {
        match mode.to_lowercase().as_str() {
            "continuation" => config.tail.multiline = MultilineMode::Continuation,
            "raw" => config.tail.multiline = MultilineMode::Raw,
            other => warnings.push(format!(
                "[tail] multiline = \"{other}\" is not recognised. \
                 Expected \"continuation\" or \"raw\". Using default (continuation).",
            )),
        }
    }

    // -- Merge --
    config.merge.poll_interval = validated_interval(
        "merge.poll_interval_ms",
        raw.merge.poll_interval_ms,
        constants::DEFAULT_MERGE_POLL_INTERVAL_MS,
        &mut warnings,
    );
    if let Some(owns) = raw.merge.owns_sources {
        config.merge.owns_sources = owns;
    }

    // -- Filter --
    config.filter.poll_interval = validated_interval(
        "filter.poll_interval_ms",
        raw.filter.poll_interval_ms,
        constants::DEFAULT_FILTER_POLL_INTERVAL_MS,
        &mut warnings,
    );
    config.filter.batch_size = validated(
        "filter.batch_size",
        raw.filter.batch_size,
        1..=constants::FILTER_BATCH_SIZE * 10,
        constants::FILTER_BATCH_SIZE,
        &mut warnings,
    );

    // -- Cache --
    config.cache.poll_interval = validated_interval(
        "cache.poll_interval_ms",
        raw.cache.poll_interval_ms,
        constants::DEFAULT_CACHE_POLL_INTERVAL_MS,
        &mut warnings,
    );
    config.cache.page_size = validated(
        "cache.page_size",
        raw.cache.page_size,
        1..=constants::MAX_PAGE_SIZE,
        constants::DEFAULT_PAGE_SIZE,
        &mut warnings,
    );
    config.cache.max_pages = validated(
        "cache.max_pages",
        raw.cache.max_pages,
        1..=constants::MAX_PAGES,
        constants::DEFAULT_MAX_PAGES,
        &mut warnings,
    );

    // -- Logging: level --
    if let Some(ref level) = raw.logging.level {
        let valid = ["error", "warn", "info", "debug", "trace"];
        if valid.contains(&level.to_lowercase().as_str()) {
            config.log_level = Some(level.clone());
        } else {
            warnings.push(format!(
                "[logging] level = \"{level}\" is not recognised. \
                 Valid values: error, warn, info, debug, trace. Using default (info).",
            ));
        }
    }

    // -- Logging: file --
    if let Some(ref file) = raw.logging.file {
        if !file.is_empty() {
            config.log_file = Some(file.clone());
        }
    }

    if !warnings.is_empty() {
        tracing::warn!(
            count = warnings.len(),
            "Config validation produced warnings"
        );
    }

    (config, warnings)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(content: &str) -> (PipelineConfig, Vec<String>) {
        parse_config(content, Path::new("config.toml"))
    }

    #[test]
    fn test_empty_config_is_default() {
        let (config, warnings) = parse("");
        assert!(warnings.is_empty());
        assert_eq!(config, PipelineConfig::default());
    }

    #[test]
    fn test_valid_values_are_applied() {
        let (config, warnings) = parse(
            r#"
[scheduler]
worker_threads = 4

[tail]
poll_interval_ms = 250
encoding = "utf-16le"
timestamp_format = "%Y-%m-%d %H:%M:%S"
multiline = "raw"

[merge]
owns_sources = false

[cache]
page_size = 500
max_pages = 3

[logging]
level = "debug"
"#,
        );
        assert!(warnings.is_empty(), "{warnings:?}");
        assert_eq!(config.worker_threads, 4);
        assert_eq!(config.tail.poll_interval, Duration::from_millis(250));
        assert_eq!(config.tail.fallback_encoding, Encoding::Utf16Le);
        assert_eq!(
            config.tail.timestamp_format,
            TimestampFormat::Custom("%Y-%m-%d %H:%M:%S".to_string())
        );
        assert_eq!(config.tail.multiline, MultilineMode::Raw);
        assert!(!config.merge.owns_sources);
        assert_eq!(config.cache.page_size, 500);
        assert_eq!(config.cache.max_pages, 3);
        assert_eq!(config.log_level.as_deref(), Some("debug"));
    }

    #[test]
    fn test_out_of_range_values_warn_and_default() {
        let (config, warnings) = parse(
            r#"
[tail]
poll_interval_ms = 1
encoding = "utf-32le"

[cache]
page_size = 0
"#,
        );
        assert_eq!(warnings.len(), 3, "{warnings:?}");
        assert_eq!(config.tail, TailConfig::default());
        assert_eq!(config.cache.page_size, constants::DEFAULT_PAGE_SIZE);
        assert!(warnings[0].contains("tail.poll_interval_ms"));
    }

    #[test]
    fn test_malformed_toml_warns() {
        let (config, warnings) = parse("[tail\npoll_interval_ms = ");
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("Config parse error"));
    }

    #[test]
    fn test_missing_file_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        let (config, warnings) = load_config(&dir.path().join("config.toml"));
        assert!(warnings.is_empty());
        assert_eq!(config, PipelineConfig::default());
    }
}
