// logtail - core/column.rs
//
// Column descriptors: the open, negotiable schema of a log source.
//
// A column is an immutable (id, kind) pair. Sources advertise the columns
// they supply; a reader may request any column, supported or not, and
// receives the column's default for anything the source cannot provide.

use crate::core::model::Level;
use chrono::{DateTime, Duration, Utc};

/// The type of the values a column holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnKind {
    /// Optional row index (`None` means "no such row").
    Index,
    /// Non-negative count, e.g. a line number.
    Number,
    /// Optional text.
    Text,
    /// Optional UTC timestamp.
    Timestamp,
    Level,
    /// Optional id of the merge child that produced a row.
    SourceId,
    /// Whether a row was served from a page cache.
    RetrievalState,
    /// Optional signed time span.
    Duration,
}

/// Immutable identifier of one column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColumnDescriptor {
    id: &'static str,
    kind: ColumnKind,
}

impl ColumnDescriptor {
    pub const fn new(id: &'static str, kind: ColumnKind) -> Self {
        Self { id, kind }
    }

    pub const fn id(&self) -> &'static str {
        self.id
    }

    pub const fn kind(&self) -> ColumnKind {
        self.kind
    }

    /// The value readers see when a source does not supply this column.
    pub fn default_value(&self) -> Value {
        match self.kind {
            ColumnKind::Index => Value::Index(None),
            ColumnKind::Number => Value::Number(0),
            ColumnKind::Text => Value::Text(None),
            ColumnKind::Timestamp => Value::Timestamp(None),
            ColumnKind::Level => Value::Level(Level::Other),
            ColumnKind::SourceId => Value::SourceId(None),
            ColumnKind::RetrievalState => Value::RetrievalState(RetrievalState::NotInSource),
            ColumnKind::Duration => Value::Duration(None),
        }
    }
}

impl std::fmt::Display for ColumnDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id)
    }
}

/// Whether a row returned by a page cache was actually cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RetrievalState {
    /// The row lies beyond the end of the source.
    #[default]
    NotInSource,
    /// The row exists but its page is not resident yet.
    NotCached,
    Retrieved,
}

/// A single typed cell value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Index(Option<usize>),
    Number(usize),
    Text(Option<String>),
    Timestamp(Option<DateTime<Utc>>),
    Level(Level),
    SourceId(Option<usize>),
    RetrievalState(RetrievalState),
    Duration(Option<Duration>),
}

impl Value {
    pub fn kind(&self) -> ColumnKind {
        match self {
            Value::Index(_) => ColumnKind::Index,
            Value::Number(_) => ColumnKind::Number,
            Value::Text(_) => ColumnKind::Text,
            Value::Timestamp(_) => ColumnKind::Timestamp,
            Value::Level(_) => ColumnKind::Level,
            Value::SourceId(_) => ColumnKind::SourceId,
            Value::RetrievalState(_) => ColumnKind::RetrievalState,
            Value::Duration(_) => ColumnKind::Duration,
        }
    }

    pub fn as_index(&self) -> Option<usize> {
        match self {
            Value::Index(i) => *i,
            _ => None,
        }
    }

    pub fn as_number(&self) -> Option<usize> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(t) => t.as_deref(),
            _ => None,
        }
    }

    pub fn as_timestamp(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Timestamp(t) => *t,
            _ => None,
        }
    }

    pub fn as_level(&self) -> Option<Level> {
        match self {
            Value::Level(l) => Some(*l),
            _ => None,
        }
    }

    pub fn as_source_id(&self) -> Option<usize> {
        match self {
            Value::SourceId(s) => *s,
            _ => None,
        }
    }

    pub fn as_retrieval_state(&self) -> Option<RetrievalState> {
        match self {
            Value::RetrievalState(r) => Some(*r),
            _ => None,
        }
    }

    pub fn as_duration(&self) -> Option<Duration> {
        match self {
            Value::Duration(d) => *d,
            _ => None,
        }
    }
}

/// Merge column lists, keeping the first occurrence of each column.
pub fn union<'a>(lists: impl IntoIterator<Item = &'a [ColumnDescriptor]>) -> Vec<ColumnDescriptor> {
    let mut merged: Vec<ColumnDescriptor> = Vec::new();
    for list in lists {
        for column in list {
            if !merged.contains(column) {
                merged.push(*column);
            }
        }
    }
    merged
}

/// Well-known columns.
pub mod columns {
    use super::{ColumnDescriptor, ColumnKind};

    /// Index of the row in the source being read.
    pub const INDEX: ColumnDescriptor = ColumnDescriptor::new("index", ColumnKind::Index);

    /// Index of the row in the immediate upstream.
    pub const ORIGINAL_INDEX: ColumnDescriptor =
        ColumnDescriptor::new("original_index", ColumnKind::Index);

    /// Index of the logical (possibly multi-line) entry the row belongs to.
    pub const LOG_ENTRY_INDEX: ColumnDescriptor =
        ColumnDescriptor::new("log_entry_index", ColumnKind::Index);

    /// 1-based line number within the source being read.
    pub const LINE_NUMBER: ColumnDescriptor =
        ColumnDescriptor::new("line_number", ColumnKind::Number);

    /// 1-based line number within the file the row came from.
    pub const ORIGINAL_LINE_NUMBER: ColumnDescriptor =
        ColumnDescriptor::new("original_line_number", ColumnKind::Number);

    pub const RAW_CONTENT: ColumnDescriptor =
        ColumnDescriptor::new("raw_content", ColumnKind::Text);

    pub const TIMESTAMP: ColumnDescriptor =
        ColumnDescriptor::new("timestamp", ColumnKind::Timestamp);

    pub const LEVEL: ColumnDescriptor = ColumnDescriptor::new("level", ColumnKind::Level);

    /// Registration ordinal of the merge child a row came from.
    pub const SOURCE_ID: ColumnDescriptor =
        ColumnDescriptor::new("source_id", ColumnKind::SourceId);

    /// File name of the source a row came from.
    pub const DATA_SOURCE_NAME: ColumnDescriptor =
        ColumnDescriptor::new("data_source_name", ColumnKind::Text);

    pub const RETRIEVAL_STATE: ColumnDescriptor =
        ColumnDescriptor::new("retrieval_state", ColumnKind::RetrievalState);

    /// Time since the source's first timestamp.
    pub const ELAPSED_TIME: ColumnDescriptor =
        ColumnDescriptor::new("elapsed_time", ColumnKind::Duration);

    /// Time since the previous row of the same source. `None` for the first
    /// row and whenever either row has no timestamp.
    pub const DELTA_TIME: ColumnDescriptor =
        ColumnDescriptor::new("delta_time", ColumnKind::Duration);

    /// Columns derived from `TIMESTAMP` by the source that orders the rows.
    pub const TIME_DERIVED: &[ColumnDescriptor] = &[ELAPSED_TIME, DELTA_TIME];

    /// Columns every text source supplies.
    pub const MINIMUM: &[ColumnDescriptor] = &[
        INDEX,
        ORIGINAL_INDEX,
        LOG_ENTRY_INDEX,
        LINE_NUMBER,
        ORIGINAL_LINE_NUMBER,
        RAW_CONTENT,
        TIMESTAMP,
        LEVEL,
    ];
}
