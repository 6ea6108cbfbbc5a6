// logtail - app/file_source.rs
//
// A log source backed by one text file that may grow, shrink, disappear or
// reappear while it is being read.
//
// Each tick:
//   - stat the file; missing/inaccessible files only set the error property
//     (a missing file also drops its rows);
//   - a file shorter than the consumed offset was truncated or rotated: drop
//     everything and re-read from byte 0;
//   - otherwise read at most `max_read_bytes_per_tick` new bytes, decode them
//     (BOM sniffed on the first read, fallback encoding otherwise), split into
//     lines and append.
//
// The trailing unterminated line is shown as the last row. When more bytes
// complete or extend it, that row is replaced (Removed + Appended).
//
// File I/O happens under the reader lock only; readers of the content never
// wait for disk.

use crate::app::listeners::Listeners;
use crate::app::scheduler::TaskScheduler;
use crate::app::source::{LogSource, LogSourceListener, Tick, Ticker};
use crate::core::column::{columns, ColumnDescriptor, Value};
use crate::core::encoding::{detect_bom, BomDetection, Decoder, Encoding};
use crate::core::model::{Level, LogBuffer, LogEntry, Modification, MultilineMode};
use crate::core::property::{properties, ErrorFlag, PropertyDescriptor, PropertySet, PropertyValue};
use crate::core::text::{detect_level, truncate_line, LineSplitter};
use crate::core::timestamp::span;
use crate::platform::config::TailConfig;
use crate::platform::fs::{self, FileStat};
use crate::util::constants::MAX_PERCENT_BEFORE_END;
use crate::util::error::{Result, SourceError};
use crate::util::logging::preview;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Properties a text source reports.
const TEXT_PROPERTIES: &[PropertyDescriptor] = &[
    properties::NAME,
    properties::LOG_ENTRY_COUNT,
    properties::SIZE,
    properties::CREATED,
    properties::LAST_MODIFIED,
    properties::PERCENTAGE_PROCESSED,
    properties::ENCODING,
    properties::ERROR,
    properties::START_TIMESTAMP,
    properties::END_TIMESTAMP,
    properties::DURATION,
    properties::MAX_CHARACTERS_IN_LINE,
];

// =============================================================================
// Reader: tick-private decoding state
// =============================================================================

struct Reader {
    /// Bytes consumed from the file.
    offset: u64,
    /// Chosen on the first read.
    decoder: Option<Decoder>,
    splitter: LineSplitter,
}

impl Reader {
    fn new() -> Self {
        Self {
            offset: 0,
            decoder: None,
            splitter: LineSplitter::new(),
        }
    }

    fn reset(&mut self) {
        *self = Self::new();
    }

    fn encoding(&self) -> Option<Encoding> {
        self.decoder.as_ref().map(Decoder::encoding)
    }

    /// Decode `bytes` read at the current offset and advance past them.
    ///
    /// On the first read the offset stays at 0 until enough bytes are
    /// available to rule a byte order mark in or out.
    fn decode(&mut self, bytes: &[u8], fallback: Encoding, path: &Path) -> String {
        let mut body = bytes;
        if self.decoder.is_none() {
            match detect_bom(bytes, false) {
                BomDetection::NeedMoreData => return String::new(),
                BomDetection::Found { encoding, len } => {
                    tracing::debug!(file = %path.display(), %encoding, "Byte order mark detected");
                    self.decoder = Some(Decoder::new(encoding));
                    body = &bytes[len..];
                }
                BomDetection::Absent => self.decoder = Some(Decoder::new(fallback)),
            }
        }
        self.offset += bytes.len() as u64;
        let decoder = self.decoder.get_or_insert_with(|| Decoder::new(fallback));
        let text = decoder.decode(body);
        if let Some(err) = decoder.take_error() {
            tracing::debug!(file = %path.display(), error = %err, "Invalid byte sequence replaced");
        }
        text
    }
}

// =============================================================================
// Content: what readers see
// =============================================================================

#[derive(Debug, Clone)]
struct Line {
    content: String,
    entry_index: usize,
    timestamp: Option<DateTime<Utc>>,
    level: Level,
}

struct Content {
    lines: Vec<Line>,
    /// The last line has no terminator yet and may still change.
    partial_last: bool,
    max_characters: usize,
    properties: PropertySet,
}

impl Content {
    fn new(path: &Path) -> Self {
        let mut properties = PropertySet::with_defaults(TEXT_PROPERTIES);
        properties.set(
            properties::NAME,
            PropertyValue::Text(Some(path.display().to_string())),
        );
        Self {
            lines: Vec::new(),
            partial_last: false,
            max_characters: 0,
            properties,
        }
    }

    fn clear(&mut self) {
        self.lines.clear();
        self.partial_last = false;
        self.max_characters = 0;
    }

    fn entry_count(&self) -> usize {
        self.lines.last().map_or(0, |l| l.entry_index + 1)
    }

    /// Append newly completed lines and the current unterminated tail.
    fn append(
        &mut self,
        complete: Vec<String>,
        partial: &str,
        config: &TailConfig,
        changes: &mut Vec<Modification>,
    ) {
        let mut complete = complete.into_iter().map(truncate_line).peekable();
        if self.partial_last {
            self.partial_last = false;
            let same = match (complete.peek(), self.lines.last()) {
                (Some(first), Some(last)) => *first == last.content,
                _ => false,
            };
            if same {
                // The tentative row just got its terminator.
                complete.next();
            } else {
                self.lines.pop();
                changes.push(Modification::removed(self.lines.len(), 1));
            }
        }
        for line in complete {
            self.push_line(line, config);
        }
        if !partial.is_empty() {
            self.push_line(truncate_line(partial.to_string()), config);
            self.partial_last = true;
        }
    }

    fn push_line(&mut self, content: String, config: &TailConfig) {
        let line_number = self.lines.len() + 1;
        let timestamp = match config.timestamp_format.parse(&content, line_number) {
            Ok(ts) => ts,
            Err(err) => {
                tracing::trace!(error = %err, line = preview(&content), "No timestamp");
                None
            }
        };
        let level = detect_level(&content);
        let line = match (config.multiline, self.lines.last()) {
            (MultilineMode::Continuation, Some(prev)) if timestamp.is_none() && level == Level::Other => {
                Line {
                    content,
                    entry_index: prev.entry_index,
                    timestamp: prev.timestamp,
                    level: prev.level,
                }
            }
            (_, prev) => Line {
                content,
                entry_index: prev.map_or(0, |p| p.entry_index + 1),
                timestamp,
                level,
            },
        };
        self.max_characters = self.max_characters.max(line.content.chars().count());
        self.lines.push(line);
    }

    fn refresh_properties(
        &mut self,
        stat: Option<&FileStat>,
        encoding: Option<Encoding>,
        percent: f64,
        error: ErrorFlag,
    ) {
        let start = self.lines.iter().find_map(|l| l.timestamp);
        let end = self.lines.iter().rev().find_map(|l| l.timestamp);
        let entries = self.entry_count();
        let max_characters = self.max_characters;
        let p = &mut self.properties;
        p.set(properties::LOG_ENTRY_COUNT, PropertyValue::Count(entries));
        p.set(properties::SIZE, PropertyValue::Size(stat.map(|s| s.len)));
        p.set(properties::CREATED, PropertyValue::Timestamp(stat.and_then(|s| s.created)));
        p.set(properties::LAST_MODIFIED, PropertyValue::Timestamp(stat.and_then(|s| s.modified)));
        p.set(properties::PERCENTAGE_PROCESSED, PropertyValue::Percentage(percent));
        p.set(properties::ENCODING, PropertyValue::Encoding(encoding));
        p.set(properties::ERROR, PropertyValue::Error(error));
        p.set(properties::START_TIMESTAMP, PropertyValue::Timestamp(start));
        p.set(properties::END_TIMESTAMP, PropertyValue::Timestamp(end));
        p.set(
            properties::DURATION,
            PropertyValue::Duration(span(start, end)),
        );
        p.set(properties::MAX_CHARACTERS_IN_LINE, PropertyValue::Count(max_characters));
    }

    fn row(&self, index: usize, line: &Line, name: &str, wanted: &[ColumnDescriptor]) -> LogEntry {
        let mut entry = LogEntry::new();
        for &column in wanted {
            let value = if column == columns::INDEX || column == columns::ORIGINAL_INDEX {
                Value::Index(Some(index))
            } else if column == columns::LOG_ENTRY_INDEX {
                Value::Index(Some(line.entry_index))
            } else if column == columns::LINE_NUMBER || column == columns::ORIGINAL_LINE_NUMBER {
                Value::Number(index + 1)
            } else if column == columns::RAW_CONTENT {
                Value::Text(Some(line.content.clone()))
            } else if column == columns::TIMESTAMP {
                Value::Timestamp(line.timestamp)
            } else if column == columns::LEVEL {
                Value::Level(line.level)
            } else if column == columns::DATA_SOURCE_NAME {
                Value::Text(Some(name.to_string()))
            } else if column == columns::ELAPSED_TIME {
                Value::Duration(span(self.properties.timestamp(&properties::START_TIMESTAMP), line.timestamp))
            } else if column == columns::DELTA_TIME {
                let previous = index
                    .checked_sub(1)
                    .and_then(|i| self.lines.get(i))
                    .and_then(|l| l.timestamp);
                Value::Duration(span(previous, line.timestamp))
            } else {
                column.default_value()
            };
            entry.set(column, value);
        }
        entry
    }
}

/// How far through the file the reader is.
fn percent_processed(offset: u64, len: u64) -> f64 {
    if offset >= len {
        100.0
    } else {
        (offset as f64 / len as f64 * 100.0).min(MAX_PERCENT_BEFORE_END)
    }
}

// =============================================================================
// TextLogSource
// =============================================================================

/// A live view of one text file.
pub struct TextLogSource {
    path: PathBuf,
    /// File name shown in the data source name column.
    name: String,
    config: TailConfig,
    reader: Mutex<Reader>,
    content: Mutex<Content>,
    listeners: Listeners,
    ticker: Ticker,
    disposed: AtomicBool,
}

impl TextLogSource {
    /// Open `path` and start tailing it on `scheduler`. The file does not
    /// have to exist yet.
    pub fn open(
        scheduler: Arc<dyn TaskScheduler>,
        path: impl Into<PathBuf>,
        config: TailConfig,
    ) -> Arc<Self> {
        let path = path.into();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        let period = config.poll_interval;
        let source = Arc::new(Self {
            content: Mutex::new(Content::new(&path)),
            path,
            name,
            config,
            reader: Mutex::new(Reader::new()),
            listeners: Listeners::new(),
            ticker: Ticker::new(scheduler),
            disposed: AtomicBool::new(false),
        });
        source
            .ticker
            .start(&source, format!("tail {}", source.path.display()), period);
        tracing::info!(file = %source.path.display(), "Text source opened");
        source
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The file cannot be stat-ed. Returns the modifications to report.
    fn unavailable(&self, err: &SourceError, reader: &mut Reader) -> Vec<Modification> {
        let mut content = self.content.lock();
        let previous = content.properties.error();
        let mut changes = Vec::new();
        let flag = match err {
            SourceError::DoesNotExist { .. } => {
                if !content.lines.is_empty() || reader.offset > 0 {
                    tracing::info!(file = %self.path.display(), "File disappeared");
                    content.clear();
                    changes.push(Modification::Reset);
                }
                reader.reset();
                ErrorFlag::SourceDoesNotExist
            }
            _ => ErrorFlag::SourceCannotBeAccessed,
        };
        if previous != flag {
            tracing::warn!(file = %self.path.display(), error = %err, "Source unavailable");
        }
        let encoding = reader.encoding();
        let size = match err {
            SourceError::DoesNotExist { .. } => None,
            _ => content.properties.size(),
        };
        content.refresh_properties(None, encoding, 100.0, flag);
        content.properties.set(properties::SIZE, PropertyValue::Size(size));
        changes
    }
}

impl Tick for TextLogSource {
    fn tick(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut reader = self.reader.lock();

        let stat = match fs::stat(&self.path) {
            Ok(stat) => stat,
            Err(err) => {
                let changes = self.unavailable(&err, &mut reader);
                drop(reader);
                let count = self.count();
                self.listeners.changed(&changes, count, true).deliver(self);
                return Ok(());
            }
        };

        let mut changes = Vec::new();
        if stat.len < reader.offset {
            tracing::info!(
                file = %self.path.display(),
                previous = reader.offset,
                len = stat.len,
                "File shrank; re-reading from the start"
            );
            reader.reset();
            self.content.lock().clear();
            changes.push(Modification::Reset);
        }

        let mut text = String::new();
        let mut error = ErrorFlag::None;
        if stat.len > reader.offset {
            let want = (stat.len - reader.offset).min(self.config.max_read_bytes_per_tick as u64);
            match fs::read_bytes_at(&self.path, reader.offset, want as usize) {
                Ok(bytes) => {
                    text = reader.decode(&bytes, self.config.fallback_encoding, &self.path);
                }
                Err(err) => {
                    tracing::warn!(file = %self.path.display(), error = %err, "Read failed");
                    error = ErrorFlag::SourceCannotBeAccessed;
                }
            }
        }

        let complete = if text.is_empty() {
            Vec::new()
        } else {
            reader.splitter.push(&text)
        };
        let at_end = reader.offset >= stat.len;
        let percent = percent_processed(reader.offset, stat.len);

        let count = {
            let mut content = self.content.lock();
            if !text.is_empty() {
                let partial = reader.splitter.partial();
                content.append(complete, partial, &self.config, &mut changes);
            }
            content.refresh_properties(Some(&stat), reader.encoding(), percent, error);
            content.lines.len()
        };
        drop(reader);

        if !changes.is_empty() {
            tracing::trace!(file = %self.path.display(), count, "Text source changed");
        }
        self.listeners.changed(&changes, count, at_end).deliver(self);
        Ok(())
    }
}

impl LogSource for TextLogSource {
    fn columns(&self) -> Vec<ColumnDescriptor> {
        let mut out = columns::MINIMUM.to_vec();
        out.push(columns::DATA_SOURCE_NAME);
        out.extend_from_slice(columns::TIME_DERIVED);
        out
    }

    fn properties(&self) -> Vec<PropertyDescriptor> {
        TEXT_PROPERTIES.to_vec()
    }

    fn count(&self) -> usize {
        self.content.lock().lines.len()
    }

    fn get_all_properties(&self, destination: &mut PropertySet) {
        self.content.lock().properties.copy_to(destination);
    }

    fn get_entries_at(&self, indices: &[usize], columns: &[ColumnDescriptor]) -> LogBuffer {
        let content = self.content.lock();
        let mut buffer = LogBuffer::with_capacity(columns, indices.len());
        for &index in indices {
            match content.lines.get(index) {
                Some(line) => buffer.push(&content.row(index, line, &self.name, columns)),
                None => buffer.push_default(),
            }
        }
        buffer
    }

    fn add_listener(
        &self,
        listener: Arc<dyn LogSourceListener>,
        max_wait: Duration,
        min_lines_before_flush: usize,
    ) {
        self.listeners.add(listener, max_wait, min_lines_before_flush);
    }

    fn remove_listener(&self, listener: &Arc<dyn LogSourceListener>) -> bool {
        self.listeners.remove(listener)
    }

    fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.ticker.stop();
        self.listeners.clear();
        tracing::debug!(file = %self.path.display(), "Text source disposed");
    }
}
