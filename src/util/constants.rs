// logtail - util/constants.rs
//
// Single source of truth for all named constants, limits, and defaults.
// Config validation (platform::config) checks user values against the
// MIN_/MAX_ bounds declared here.

// =============================================================================
// Application metadata
// =============================================================================

/// Application display name.
pub const APP_NAME: &str = "logtail";

/// Application identifier used for config/data directories.
pub const APP_ID: &str = "logtail";

/// Current application version.
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

// =============================================================================
// Scheduler
// =============================================================================

/// Default number of worker threads for the real-time scheduler.
/// 0 means auto-detect (use available CPU cores).
pub const DEFAULT_WORKER_THREADS: usize = 0;

/// Hard upper bound on scheduler worker threads.
pub const MAX_WORKER_THREADS: usize = 64;

/// Upper bound on how long the timer thread sleeps when no task is due (ms).
/// Newly registered tasks also wake the timer, so this only bounds drift.
pub const SCHEDULER_MAX_IDLE_MS: u64 = 1_000;

// =============================================================================
// Single-file tailing
// =============================================================================

/// How often a file source re-stats and reads its file (ms).
pub const DEFAULT_TAIL_POLL_INTERVAL_MS: u64 = 100;

/// Minimum user-configurable tick interval for any source (ms).
pub const MIN_POLL_INTERVAL_MS: u64 = 10;

/// Maximum user-configurable tick interval for any source (ms).
pub const MAX_POLL_INTERVAL_MS: u64 = 10_000;

/// Maximum bytes read from a single file in one tick.
/// Prevents a large burst of new content from stalling a worker thread.
pub const DEFAULT_MAX_READ_BYTES_PER_TICK: usize = 512 * 1_024; // 512 KiB

/// Smallest accepted per-tick read cap.
pub const MIN_READ_BYTES_PER_TICK: usize = 4 * 1_024;

/// Largest accepted per-tick read cap.
pub const MAX_READ_BYTES_PER_TICK: usize = 64 * 1_024 * 1_024;

/// Maximum length (in chars) of a single line kept in memory. Longer lines
/// are truncated and suffixed with `TRUNCATION_MARKER`.
pub const MAX_LINE_CHARS: usize = 64 * 1_024;

/// Suffix appended to lines cut at `MAX_LINE_CHARS`.
pub const TRUNCATION_MARKER: &str = "... [truncated]";

/// Percentage reported while a file has unread bytes, even if the read
/// offset has numerically reached the end.
pub const MAX_PERCENT_BEFORE_END: f64 = 99.0;

// =============================================================================
// Merge
// =============================================================================

/// How often the merge engine drains its children's pending changes (ms).
pub const DEFAULT_MERGE_POLL_INTERVAL_MS: u64 = 100;

/// Maximum number of children a merge source accepts.
pub const MAX_MERGED_SOURCES: usize = 256;

/// Batching hint the merge engine passes to each child listener: flush after
/// this many new lines even if the wait time has not elapsed.
pub const MERGE_LISTENER_BATCH_LINES: usize = 1_000;

// =============================================================================
// Filter
// =============================================================================

/// How often a filter source re-evaluates pending upstream changes (ms).
pub const DEFAULT_FILTER_POLL_INTERVAL_MS: u64 = 100;

/// Number of upstream rows fetched per read while filtering.
pub const FILTER_BATCH_SIZE: usize = 10_000;

/// Maximum accepted length of a regex/expression filter pattern.
pub const MAX_FILTER_PATTERN_LENGTH: usize = 4_096;

// =============================================================================
// Page cache
// =============================================================================

/// Default number of rows per cache page.
pub const DEFAULT_PAGE_SIZE: usize = 1_000;

/// Default maximum number of resident pages.
pub const DEFAULT_MAX_PAGES: usize = 10;

/// Hard upper bound on page size.
pub const MAX_PAGE_SIZE: usize = 100_000;

/// Hard upper bound on resident pages.
pub const MAX_PAGES: usize = 10_000;

/// How often the page cache fetches queued pages from its upstream (ms).
pub const DEFAULT_CACHE_POLL_INTERVAL_MS: u64 = 50;

// =============================================================================
// Listener batching
// =============================================================================

/// Default maximum wait before pending appended lines are reported to a
/// listener (ms).
pub const DEFAULT_LISTENER_MAX_WAIT_MS: u64 = 100;

/// Default number of appended lines after which a listener is notified
/// without waiting for the end of the tick.
pub const DEFAULT_LISTENER_BATCH_LINES: usize = 1_000;

// =============================================================================
// Logging
// =============================================================================

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Maximum length of a log line included in debug output.
/// Prevents accidental exposure of sensitive data in long lines.
pub const DEBUG_MAX_LINE_PREVIEW: usize = 200;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration file name.
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Encoding used when a file carries no byte-order mark.
pub const DEFAULT_ENCODING: &str = "utf-8";
