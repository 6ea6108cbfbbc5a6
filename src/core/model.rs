// logtail - core/model.rs
//
// Core data model types. Pure data definitions with no I/O and no
// scheduling concerns.
//
// These types are the shared vocabulary across all pipeline stages.

use crate::core::column::{columns, ColumnDescriptor, RetrievalState, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::ops::{BitOr, BitOrAssign, Range};

// =============================================================================
// Sections and modifications
// =============================================================================

/// A contiguous range of line indices `[index, index + count)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Section {
    pub index: usize,
    pub count: usize,
}

impl Section {
    pub const fn new(index: usize, count: usize) -> Self {
        Self { index, count }
    }

    /// One past the last index covered by this section.
    pub const fn end(&self) -> usize {
        self.index + self.count
    }

    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub const fn contains(&self, index: usize) -> bool {
        index >= self.index && index < self.end()
    }

    pub fn indices(&self) -> Range<usize> {
        self.index..self.end()
    }
}

impl std::fmt::Display for Section {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[#{}, #{})", self.index, self.end())
    }
}

/// How a source's content changed since the last observation.
///
/// Producers only ever append at their current count and only ever remove a
/// suffix, so `Removed(s)` always satisfies `s.end() == count` at the time it
/// is emitted. Replaying modifications with [`Modification::apply`] therefore
/// reproduces the producer's count exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modification {
    /// Everything previously reported is gone.
    Reset,
    /// New lines were added at the end.
    Appended(Section),
    /// A suffix of previously reported lines is gone.
    Removed(Section),
}

impl Modification {
    pub const fn appended(index: usize, count: usize) -> Self {
        Self::Appended(Section::new(index, count))
    }

    pub const fn removed(index: usize, count: usize) -> Self {
        Self::Removed(Section::new(index, count))
    }

    /// Replay this modification against a known prior count.
    pub fn apply(&self, count: usize) -> usize {
        match self {
            Self::Reset => 0,
            Self::Appended(section) => count.max(section.end()),
            Self::Removed(section) => count.min(section.index),
        }
    }
}

impl std::fmt::Display for Modification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reset => f.write_str("Reset"),
            Self::Appended(s) => write!(f, "Appended {s}"),
            Self::Removed(s) => write!(f, "Removed {s}"),
        }
    }
}

/// Replay a sequence of modifications starting from `count`.
pub fn replay<'a>(count: usize, modifications: impl IntoIterator<Item = &'a Modification>) -> usize {
    modifications
        .into_iter()
        .fold(count, |count, modification| modification.apply(count))
}

// =============================================================================
// Level
// =============================================================================

/// Normalised log levels, ordered from least to most severe.
///
/// `Other` marks lines without a recognisable level keyword.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum Level {
    #[default]
    Other,
    Trace,
    Debug,
    Info,
    Warning,
    Error,
    Fatal,
}

impl Level {
    /// Returns all variants in severity order (least severe first).
    pub fn all() -> &'static [Level] {
        &[
            Level::Other,
            Level::Trace,
            Level::Debug,
            Level::Info,
            Level::Warning,
            Level::Error,
            Level::Fatal,
        ]
    }

    /// Human-readable label for display.
    pub fn label(&self) -> &'static str {
        match self {
            Level::Other => "Other",
            Level::Trace => "Trace",
            Level::Debug => "Debug",
            Level::Info => "Info",
            Level::Warning => "Warning",
            Level::Error => "Error",
            Level::Fatal => "Fatal",
        }
    }

    /// Parse a level name as typed by a user (case-insensitive, common
    /// abbreviations accepted).
    pub fn from_name(name: &str) -> Option<Level> {
        match name.trim().to_ascii_lowercase().as_str() {
            "other" | "none" => Some(Level::Other),
            "trace" | "trc" => Some(Level::Trace),
            "debug" | "dbg" => Some(Level::Debug),
            "info" | "inf" | "information" => Some(Level::Info),
            "warning" | "warn" | "wrn" => Some(Level::Warning),
            "error" | "err" => Some(Level::Error),
            "fatal" | "ftl" | "critical" | "crit" => Some(Level::Fatal),
            _ => None,
        }
    }

    /// The single-bit flag for this level.
    pub const fn flag(self) -> LevelFlags {
        LevelFlags(1 << self as u8)
    }
}

impl std::fmt::Display for Level {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Bitmask over [`Level`]s, used by level filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct LevelFlags(u8);

impl LevelFlags {
    pub const NONE: LevelFlags = LevelFlags(0);
    pub const OTHER: LevelFlags = Level::Other.flag();
    pub const TRACE: LevelFlags = Level::Trace.flag();
    pub const DEBUG: LevelFlags = Level::Debug.flag();
    pub const INFO: LevelFlags = Level::Info.flag();
    pub const WARNING: LevelFlags = Level::Warning.flag();
    pub const ERROR: LevelFlags = Level::Error.flag();
    pub const FATAL: LevelFlags = Level::Fatal.flag();
    pub const ALL: LevelFlags = LevelFlags(0b0111_1111);

    pub const fn contains(&self, level: Level) -> bool {
        self.0 & level.flag().0 != 0
    }

    pub const fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn insert(&mut self, level: Level) {
        self.0 |= level.flag().0;
    }

    /// All levels at or above `level`.
    pub fn at_least(level: Level) -> LevelFlags {
        Level::all().iter().filter(|l| **l >= level).copied().collect()
    }

    /// Parse a comma-separated list of level names, e.g. `"warn,error"`.
    pub fn parse_list(list: &str) -> Option<LevelFlags> {
        list.split(',')
            .filter(|s| !s.trim().is_empty())
            .map(Level::from_name)
            .collect::<Option<LevelFlags>>()
    }
}

impl BitOr for LevelFlags {
    type Output = LevelFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        LevelFlags(self.0 | rhs.0)
    }
}

impl BitOrAssign for LevelFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl FromIterator<Level> for LevelFlags {
    fn from_iter<T: IntoIterator<Item = Level>>(iter: T) -> Self {
        let mut flags = LevelFlags::NONE;
        for level in iter {
            flags.insert(level);
        }
        flags
    }
}

// =============================================================================
// Multiline mode
// =============================================================================

/// How a text source groups physical lines into logical entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MultilineMode {
    /// A line with neither timestamp nor level continues the previous entry
    /// and inherits its timestamp and level. This is the correct behaviour
    /// for stack traces and multi-line messages.
    #[default]
    Continuation,

    /// Every physical line is its own entry.
    Raw,
}

// =============================================================================
// Log entry
// =============================================================================

/// One row of a log source: a set of column values.
///
/// Only the columns that were requested (or set) are stored; reading any
/// other column yields that column's default value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogEntry {
    values: Vec<(ColumnDescriptor, Value)>,
}

impl LogEntry {
    pub fn new() -> Self {
        Self::default()
    }

    /// An entry holding the default value of every given column.
    pub fn with_defaults(columns: &[ColumnDescriptor]) -> Self {
        Self {
            values: columns.iter().map(|c| (*c, c.default_value())).collect(),
        }
    }

    /// Borrow the stored value of `column`, if present.
    pub fn value(&self, column: &ColumnDescriptor) -> Option<&Value> {
        self.values
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, v)| v)
    }

    /// The value of `column`, or its default when not stored.
    pub fn get(&self, column: &ColumnDescriptor) -> Value {
        self.value(column)
            .cloned()
            .unwrap_or_else(|| column.default_value())
    }

    /// Store `value` for `column`, replacing any previous value.
    ///
    /// A value of the wrong kind is replaced by the column default.
    pub fn set(&mut self, column: ColumnDescriptor, value: Value) {
        let value = if value.kind() == column.kind() {
            value
        } else {
            tracing::warn!(
                column = column.id(),
                "Value kind does not match column kind; storing default"
            );
            column.default_value()
        };
        match self.values.iter_mut().find(|(c, _)| *c == column) {
            Some(slot) => slot.1 = value,
            None => self.values.push((column, value)),
        }
    }

    pub fn contains(&self, column: &ColumnDescriptor) -> bool {
        self.value(column).is_some()
    }

    pub fn columns(&self) -> impl Iterator<Item = &ColumnDescriptor> {
        self.values.iter().map(|(c, _)| c)
    }

    /// A copy of this entry restricted to (and completed with) `columns`.
    pub fn project(&self, columns: &[ColumnDescriptor]) -> LogEntry {
        LogEntry {
            values: columns.iter().map(|c| (*c, self.get(c))).collect(),
        }
    }

    pub fn index(&self) -> Option<usize> {
        self.value(&columns::INDEX).and_then(Value::as_index)
    }

    pub fn original_index(&self) -> Option<usize> {
        self.value(&columns::ORIGINAL_INDEX).and_then(Value::as_index)
    }

    pub fn entry_index(&self) -> Option<usize> {
        self.value(&columns::LOG_ENTRY_INDEX)
            .and_then(Value::as_index)
    }

    pub fn line_number(&self) -> usize {
        self.value(&columns::LINE_NUMBER)
            .and_then(Value::as_number)
            .unwrap_or(0)
    }

    pub fn raw_content(&self) -> Option<&str> {
        self.value(&columns::RAW_CONTENT).and_then(Value::as_text)
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        self.value(&columns::TIMESTAMP)
            .and_then(Value::as_timestamp)
    }

    pub fn level(&self) -> Level {
        self.value(&columns::LEVEL)
            .and_then(Value::as_level)
            .unwrap_or_default()
    }

    pub fn source_id(&self) -> Option<usize> {
        self.value(&columns::SOURCE_ID)
            .and_then(Value::as_source_id)
    }

    pub fn retrieval_state(&self) -> RetrievalState {
        self.value(&columns::RETRIEVAL_STATE)
            .and_then(Value::as_retrieval_state)
            .unwrap_or_default()
    }
}

// =============================================================================
// Log buffer
// =============================================================================

/// The result of a read: rows restricted to a fixed column list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogBuffer {
    columns: Vec<ColumnDescriptor>,
    entries: Vec<LogEntry>,
}

impl LogBuffer {
    pub fn new(columns: &[ColumnDescriptor]) -> Self {
        Self {
            columns: columns.to_vec(),
            entries: Vec::new(),
        }
    }

    pub fn with_capacity(columns: &[ColumnDescriptor], capacity: usize) -> Self {
        Self {
            columns: columns.to_vec(),
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn columns(&self) -> &[ColumnDescriptor] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append `entry`, projected onto this buffer's columns.
    pub fn push(&mut self, entry: &LogEntry) {
        self.entries.push(entry.project(&self.columns));
    }

    /// Append a row holding only default values.
    pub fn push_default(&mut self) {
        self.entries.push(LogEntry::with_defaults(&self.columns));
    }

    pub fn get(&self, index: usize) -> Option<&LogEntry> {
        self.entries.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut LogEntry> {
        self.entries.get_mut(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, LogEntry> {
        self.entries.iter()
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<LogEntry> {
        self.entries
    }
}

impl<'a> IntoIterator for &'a LogBuffer {
    type Item = &'a LogEntry;
    type IntoIter = std::slice::Iter<'a, LogEntry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
