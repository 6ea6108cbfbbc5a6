// logtail - app/merged.rs
//
// Time-ordered merge of up to MAX_MERGED_SOURCES child sources.
//
// Child listeners only queue modifications. The merge tick drains the
// queues, folds each child's changes, reads the newly appended child rows
// (outside every merge lock), then updates the ordering index in one step
// and reports a single change set.
//
// Lines without a timestamp are excluded from the merged order and counted
// in the untimestamped-count property.

use crate::app::listeners::Listeners;
use crate::app::scheduler::TaskScheduler;
use crate::app::source::{LogSource, LogSourceListener, Tick, Ticker};
use crate::core::changes::Coalescer;
use crate::core::column::{self, columns, ColumnDescriptor, Value};
use crate::core::merge_index::{ChildDelta, ChildLine, MergeIndex, MergedLine};
use crate::core::model::{LogBuffer, LogEntry, Modification};
use crate::core::timestamp::span;
use crate::core::property::{properties, ErrorFlag, PropertyDescriptor, PropertySet, PropertyValue};
use crate::platform::config::MergeConfig;
use crate::util::constants::{DEFAULT_LISTENER_MAX_WAIT_MS, MAX_MERGED_SOURCES, MERGE_LISTENER_BATCH_LINES};
use crate::util::error::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Columns read from a child to place its rows.
const ORDERING_COLUMNS: &[ColumnDescriptor] =
    &[columns::INDEX, columns::LOG_ENTRY_INDEX, columns::TIMESTAMP];

/// Columns the merge computes itself instead of copying from the child.
const MERGE_COLUMNS: &[ColumnDescriptor] = &[
    columns::INDEX,
    columns::ORIGINAL_INDEX,
    columns::LOG_ENTRY_INDEX,
    columns::LINE_NUMBER,
    columns::SOURCE_ID,
    columns::ELAPSED_TIME,
    columns::DELTA_TIME,
];

const MERGE_PROPERTIES: &[PropertyDescriptor] = &[
    properties::LOG_ENTRY_COUNT,
    properties::SIZE,
    properties::LAST_MODIFIED,
    properties::PERCENTAGE_PROCESSED,
    properties::ERROR,
    properties::START_TIMESTAMP,
    properties::END_TIMESTAMP,
    properties::DURATION,
    properties::UNTIMESTAMPED_COUNT,
];

/// A merged line together with the timestamps its time columns are
/// measured from.
struct Placed {
    line: MergedLine,
    /// Timestamp of the first merged line.
    first: Option<DateTime<Utc>>,
    /// Timestamp of the merged line before this one.
    previous: Option<DateTime<Utc>>,
}

/// Queues a child's modifications for the next merge tick.
#[derive(Default)]
struct ChildListener {
    pending: Mutex<Vec<Modification>>,
}

impl LogSourceListener for ChildListener {
    fn on_modified(&self, _source: &dyn LogSource, modification: Modification) {
        self.pending.lock().push(modification);
    }
}

struct Child {
    source_id: usize,
    source: Arc<dyn LogSource>,
    listener: Arc<ChildListener>,
    /// Child row count as of the last processed modification.
    known_count: usize,
}

impl Child {
    fn listener(&self) -> Arc<dyn LogSourceListener> {
        self.listener.clone()
    }
}

struct Children {
    list: Vec<Child>,
    next_id: usize,
    /// Ids removed since the last tick.
    removed: Vec<usize>,
}

struct MergeState {
    index: MergeIndex,
    properties: PropertySet,
    columns: Vec<ColumnDescriptor>,
}

/// A time-ordered merge of several sources.
pub struct MergedLogSource {
    config: MergeConfig,
    children: Mutex<Children>,
    state: Mutex<MergeState>,
    listeners: Listeners,
    ticker: Ticker,
    disposed: AtomicBool,
}

impl MergedLogSource {
    /// Create a merge over `sources` (more than MAX_MERGED_SOURCES are
    /// ignored with a warning) and start ticking it.
    pub fn new(
        scheduler: Arc<dyn TaskScheduler>,
        sources: Vec<Arc<dyn LogSource>>,
        config: MergeConfig,
    ) -> Arc<Self> {
        let period = config.poll_interval;
        let merged = Arc::new(Self {
            config,
            children: Mutex::new(Children {
                list: Vec::new(),
                next_id: 0,
                removed: Vec::new(),
            }),
            state: Mutex::new(MergeState {
                index: MergeIndex::new(),
                properties: PropertySet::with_defaults(MERGE_PROPERTIES),
                columns: columns::MINIMUM.to_vec(),
            }),
            listeners: Listeners::new(),
            ticker: Ticker::new(scheduler),
            disposed: AtomicBool::new(false),
        });
        for source in sources {
            merged.add_source(source);
        }
        merged.ticker.start(&merged, "merge".to_string(), period);
        merged
    }

    /// Add a child; returns its source id, or `None` when the merge is full.
    pub fn add_source(&self, source: Arc<dyn LogSource>) -> Option<usize> {
        let (source_id, listener) = {
            let mut children = self.children.lock();
            if children.list.len() >= MAX_MERGED_SOURCES {
                tracing::warn!(limit = MAX_MERGED_SOURCES, "Merge is full; source not added");
                return None;
            }
            let source_id = children.next_id;
            children.next_id += 1;
            let listener = Arc::new(ChildListener::default());
            children.list.push(Child {
                source_id,
                source: source.clone(),
                listener: listener.clone(),
                known_count: 0,
            });
            (source_id, listener)
        };
        source.add_listener(
            listener,
            Duration::from_millis(DEFAULT_LISTENER_MAX_WAIT_MS),
            MERGE_LISTENER_BATCH_LINES,
        );
        tracing::debug!(source_id, "Source added to merge");
        Some(source_id)
    }

    /// Remove a child. Its rows leave the merged view on the next tick.
    pub fn remove_source(&self, source: &Arc<dyn LogSource>) -> bool {
        let removed = {
            let mut children = self.children.lock();
            let position = children.list.iter().position(|c| same_source(&c.source, source));
            position.map(|at| {
                let child = children.list.remove(at);
                children.removed.push(child.source_id);
                child
            })
        };
        match removed {
            Some(child) => {
                child.source.remove_listener(&child.listener());
                tracing::debug!(source_id = child.source_id, "Source removed from merge");
                true
            }
            None => false,
        }
    }

    /// Snapshot of the children as (id, source) pairs.
    fn snapshot(&self) -> Vec<(usize, Arc<dyn LogSource>)> {
        self.children
            .lock()
            .list
            .iter()
            .map(|c| (c.source_id, c.source.clone()))
            .collect()
    }

    /// Drain every child's queue into one folded change per child.
    fn drain(&self) -> (Vec<(usize, Arc<dyn LogSource>, Coalescer)>, Vec<usize>) {
        let mut children = self.children.lock();
        let removed = std::mem::take(&mut children.removed);
        let mut changed = Vec::new();
        for child in children.list.iter_mut() {
            let pending = std::mem::take(&mut *child.listener.pending.lock());
            if pending.is_empty() {
                continue;
            }
            let mut coalescer = Coalescer::new(child.known_count);
            coalescer.extend(pending);
            child.known_count = coalescer.count();
            if !coalescer.is_empty() {
                changed.push((child.source_id, child.source.clone(), coalescer));
            }
        }
        (changed, removed)
    }

    fn aggregate_properties(&self, children: &[(usize, Arc<dyn LogSource>)]) -> PropertySet {
        let mut size: Option<u64> = None;
        let mut last_modified: Option<DateTime<Utc>> = None;
        let mut start: Option<DateTime<Utc>> = None;
        let mut end: Option<DateTime<Utc>> = None;
        let mut fraction = 1.0_f64;
        let mut error = ErrorFlag::None;

        for (_, source) in children {
            let mut set = PropertySet::new();
            source.get_all_properties(&mut set);
            if let Some(s) = set.size() {
                size = Some(size.unwrap_or(0) + s);
            }
            last_modified = last_modified.max(set.timestamp(&properties::LAST_MODIFIED));
            if let Some(s) = set.timestamp(&properties::START_TIMESTAMP) {
                start = Some(start.map_or(s, |c| c.min(s)));
            }
            end = end.max(set.timestamp(&properties::END_TIMESTAMP));
            fraction *= set.percentage_processed() / 100.0;
            if !error.is_error() {
                error = set.error();
            }
        }

        let mut out = PropertySet::with_defaults(MERGE_PROPERTIES);
        out.set(properties::SIZE, PropertyValue::Size(size));
        out.set(properties::LAST_MODIFIED, PropertyValue::Timestamp(last_modified));
        out.set(properties::START_TIMESTAMP, PropertyValue::Timestamp(start));
        out.set(properties::END_TIMESTAMP, PropertyValue::Timestamp(end));
        out.set(
            properties::DURATION,
            PropertyValue::Duration(span(start, end)),
        );
        let percent = if children.is_empty() { 100.0 } else { fraction * 100.0 };
        out.set(properties::PERCENTAGE_PROCESSED, PropertyValue::Percentage(percent));
        out.set(properties::ERROR, PropertyValue::Error(error));
        out
    }

    fn row(placed: &Placed, index: usize, wanted: &[ColumnDescriptor], child_row: Option<&LogEntry>) -> LogEntry {
        let line = &placed.line;
        let mut entry = LogEntry::new();
        for &column in wanted {
            let value = if column == columns::INDEX {
                Value::Index(Some(index))
            } else if column == columns::ORIGINAL_INDEX {
                Value::Index(Some(line.original_index))
            } else if column == columns::LOG_ENTRY_INDEX {
                Value::Index(Some(line.merged_entry_index))
            } else if column == columns::LINE_NUMBER {
                Value::Number(index + 1)
            } else if column == columns::SOURCE_ID {
                Value::SourceId(Some(line.source_id))
            } else if column == columns::ELAPSED_TIME {
                Value::Duration(span(placed.first, Some(line.timestamp)))
            } else if column == columns::DELTA_TIME {
                Value::Duration(span(placed.previous, Some(line.timestamp)))
            } else {
                child_row.map_or_else(|| column.default_value(), |r| r.get(&column))
            };
            entry.set(column, value);
        }
        entry
    }
}

fn same_source(a: &Arc<dyn LogSource>, b: &Arc<dyn LogSource>) -> bool {
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

/// Read the rows `coalescer` reports as appended and turn them into index
/// input.
fn child_delta(source_id: usize, source: &dyn LogSource, coalescer: &Coalescer) -> ChildDelta {
    let lines = match coalescer.appended() {
        Some(section) => source
            .get_entries(section, ORDERING_COLUMNS)
            .iter()
            .filter_map(|row| {
                // A row past the child's end was removed meanwhile; the
                // removal is already queued for the next tick.
                let original_index = row.index()?;
                Some(ChildLine {
                    original_index,
                    original_entry_index: row.entry_index().unwrap_or(original_index),
                    timestamp: row.timestamp(),
                })
            })
            .collect(),
        None => Vec::new(),
    };
    ChildDelta {
        source_id,
        invalidate_from: coalescer.first_invalid(),
        lines,
    }
}

impl Tick for MergedLogSource {
    fn tick(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Ok(());
        }
        let (changed, removed) = self.drain();

        let mut deltas: Vec<ChildDelta> = changed
            .iter()
            .map(|(id, source, coalescer)| child_delta(*id, source.as_ref(), coalescer))
            .collect();
        deltas.extend(removed.iter().map(|&source_id| ChildDelta {
            source_id,
            invalidate_from: Some(0),
            lines: Vec::new(),
        }));

        let children = self.snapshot();
        let mut aggregated = self.aggregate_properties(&children);
        let child_columns: Vec<Vec<ColumnDescriptor>> =
            children.iter().map(|(_, s)| s.columns()).collect();

        let (changes, count) = {
            let mut state = self.state.lock();
            let changes = if deltas.is_empty() {
                Vec::new()
            } else {
                let changes = state.index.apply(deltas);
                for &source_id in &removed {
                    state.index.remove_source(source_id);
                }
                changes
            };
            let entries = state.index.lines().last().map_or(0, |l| l.merged_entry_index + 1);
            aggregated.set(properties::LOG_ENTRY_COUNT, PropertyValue::Count(entries));
            aggregated.set(
                properties::UNTIMESTAMPED_COUNT,
                PropertyValue::Count(state.index.untimestamped_count()),
            );
            state.properties = aggregated;
            let mut merged_columns =
                column::union(child_columns.iter().map(Vec::as_slice));
            for &column in std::iter::once(&columns::SOURCE_ID).chain(columns::TIME_DERIVED) {
                if !merged_columns.contains(&column) {
                    merged_columns.push(column);
                }
            }
            state.columns = merged_columns;
            (changes, state.index.len())
        };

        if !changes.is_empty() {
            tracing::trace!(count, changes = changes.len(), "Merge index updated");
        }
        self.listeners.changed(&changes, count, true).deliver(self);
        Ok(())
    }
}

impl LogSource for MergedLogSource {
    fn columns(&self) -> Vec<ColumnDescriptor> {
        self.state.lock().columns.clone()
    }

    fn properties(&self) -> Vec<PropertyDescriptor> {
        MERGE_PROPERTIES.to_vec()
    }

    fn count(&self) -> usize {
        self.state.lock().index.len()
    }

    fn get_all_properties(&self, destination: &mut PropertySet) {
        self.state.lock().properties.copy_to(destination);
    }

    fn get_entries_at(&self, indices: &[usize], wanted: &[ColumnDescriptor]) -> LogBuffer {
        let lines: Vec<Option<Placed>> = {
            let state = self.state.lock();
            let first = state.index.get(0).map(|l| l.timestamp);
            indices
                .iter()
                .map(|&i| {
                    let line = *state.index.get(i)?;
                    let previous = i
                        .checked_sub(1)
                        .and_then(|p| state.index.get(p))
                        .map(|l| l.timestamp);
                    Some(Placed { line, first, previous })
                })
                .collect()
        };

        // Fetch the child-supplied columns grouped per child.
        let child_columns: Vec<ColumnDescriptor> = wanted
            .iter()
            .filter(|c| !MERGE_COLUMNS.contains(*c))
            .copied()
            .collect();
        let mut child_rows: BTreeMap<usize, Vec<(usize, usize)>> = BTreeMap::new();
        if !child_columns.is_empty() {
            for (position, line) in lines.iter().enumerate() {
                if let Some(Placed { line, .. }) = line {
                    child_rows
                        .entry(line.source_id)
                        .or_default()
                        .push((position, line.original_index));
                }
            }
        }
        let mut fetched: Vec<Option<LogEntry>> = vec![None; lines.len()];
        if !child_rows.is_empty() {
            let children: BTreeMap<usize, Arc<dyn LogSource>> = self.snapshot().into_iter().collect();
            for (source_id, rows) in child_rows {
                let Some(source) = children.get(&source_id) else {
                    continue;
                };
                let originals: Vec<usize> = rows.iter().map(|&(_, original)| original).collect();
                let buffer = source.get_entries_at(&originals, &child_columns);
                for ((position, _), row) in rows.into_iter().zip(buffer.into_entries()) {
                    fetched[position] = Some(row);
                }
            }
        }

        let mut buffer = LogBuffer::with_capacity(wanted, indices.len());
        for ((line, &index), child_row) in lines.iter().zip(indices).zip(&fetched) {
            match line {
                Some(line) => buffer.push(&Self::row(line, index, wanted, child_row.as_ref())),
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
        let children = std::mem::take(&mut self.children.lock().list);
        for child in children {
            child.source.remove_listener(&child.listener());
            if self.config.owns_sources {
                child.source.dispose();
            }
        }
        tracing::debug!(owns_sources = self.config.owns_sources, "Merge disposed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::file_source::TextLogSource;
    use crate::app::scheduler::ManualScheduler;
    use crate::core::model::Section;
    use crate::platform::config::TailConfig;
    use std::io::Write;
    use std::path::Path;

    fn write(path: &Path, text: &str) {
        let mut f = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        f.write_all(text.as_bytes()).unwrap();
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        scheduler: Arc<ManualScheduler>,
        paths: Vec<std::path::PathBuf>,
        sources: Vec<Arc<dyn LogSource>>,
    }

    fn fixture(files: usize) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let scheduler = Arc::new(ManualScheduler::new());
        let paths: Vec<_> = (0..files).map(|i| dir.path().join(format!("{i}.log"))).collect();
        let sources = paths
            .iter()
            .map(|p| {
                let s: Arc<dyn LogSource> =
                    TextLogSource::open(scheduler.clone(), p, TailConfig::default());
                s
            })
            .collect();
        Fixture {
            _dir: dir,
            scheduler,
            paths,
            sources,
        }
    }

    fn merged_lines(source: &dyn LogSource) -> Vec<(String, usize)> {
        source
            .get_entries(
                Section::new(0, source.count()),
                &[columns::RAW_CONTENT, columns::SOURCE_ID],
            )
            .iter()
            .map(|e| {
                (
                    e.raw_content().unwrap_or_default().to_string(),
                    e.source_id().unwrap_or(usize::MAX),
                )
            })
            .collect()
    }

    #[test]
    fn test_merges_by_timestamp() {
        let fx = fixture(2);
        write(&fx.paths[0], "2024-01-01 10:00:00 INFO a1\n2024-01-01 10:00:02 INFO a2\n");
        write(&fx.paths[1], "2024-01-01 10:00:01 INFO b1\n2024-01-01 10:00:03 INFO b2\n");
        let merged = MergedLogSource::new(fx.scheduler.clone(), fx.sources.clone(), MergeConfig::default());
        fx.scheduler.run_once();

        let lines = merged_lines(merged.as_ref());
        let contents: Vec<_> = lines.iter().map(|(c, _)| c.as_str()).collect();
        assert_eq!(
            contents,
            vec![
                "2024-01-01 10:00:00 INFO a1",
                "2024-01-01 10:00:01 INFO b1",
                "2024-01-01 10:00:02 INFO a2",
                "2024-01-01 10:00:03 INFO b2",
            ]
        );
        let ids: Vec<_> = lines.iter().map(|(_, id)| *id).collect();
        assert_eq!(ids, vec![0, 1, 0, 1]);
    }

    #[test]
    fn test_equal_timestamps_keep_registration_order() {
        let fx = fixture(2);
        write(&fx.paths[1], "2024-01-01 10:00:00 INFO second-source\n");
        write(&fx.paths[0], "2024-01-01 10:00:00 INFO first-source\n");
        let merged = MergedLogSource::new(fx.scheduler.clone(), fx.sources.clone(), MergeConfig::default());
        fx.scheduler.run_once();
        let ids: Vec<_> = merged_lines(merged.as_ref()).iter().map(|(_, id)| *id).collect();
        assert_eq!(ids, vec![0, 1]);
    }

    #[test]
    fn test_untimestamped_lines_are_excluded_and_counted() {
        let fx = fixture(1);
        write(&fx.paths[0], "no stamp\n2024-01-01 10:00:00 INFO stamped\n");
        let merged = MergedLogSource::new(fx.scheduler.clone(), fx.sources.clone(), MergeConfig::default());
        fx.scheduler.run_once();
        assert_eq!(merged.count(), 1);
        assert_eq!(
            merged.get_property(&properties::UNTIMESTAMPED_COUNT),
            PropertyValue::Count(1)
        );
    }

    #[test]
    fn test_late_line_is_inserted_in_order() {
        let fx = fixture(2);
        write(&fx.paths[0], "2024-01-01 10:00:00 INFO a1\n2024-01-01 10:00:05 INFO a2\n");
        let merged = MergedLogSource::new(fx.scheduler.clone(), fx.sources.clone(), MergeConfig::default());
        fx.scheduler.run_once();
        assert_eq!(merged.count(), 2);

        write(&fx.paths[1], "2024-01-01 10:00:03 INFO b1\n");
        fx.scheduler.run_once();
        let contents: Vec<_> = merged_lines(merged.as_ref()).into_iter().map(|(c, _)| c).collect();
        assert_eq!(
            contents,
            vec![
                "2024-01-01 10:00:00 INFO a1",
                "2024-01-01 10:00:03 INFO b1",
                "2024-01-01 10:00:05 INFO a2",
            ]
        );
    }

    #[test]
    fn test_remove_source_drops_its_rows() {
        let fx = fixture(2);
        write(&fx.paths[0], "2024-01-01 10:00:00 INFO a\n");
        write(&fx.paths[1], "2024-01-01 10:00:01 INFO b\n");
        let merged = MergedLogSource::new(fx.scheduler.clone(), fx.sources.clone(), MergeConfig::default());
        fx.scheduler.run_once();
        assert_eq!(merged.count(), 2);

        assert!(merged.remove_source(&fx.sources[0]));
        assert!(!merged.remove_source(&fx.sources[0]));
        fx.scheduler.run_once();
        let ids: Vec<_> = merged_lines(merged.as_ref()).iter().map(|(_, id)| *id).collect();
        assert_eq!(ids, vec![1]);
    }

    #[test]
    fn test_child_truncation_propagates() {
        let fx = fixture(1);
        write(&fx.paths[0], "2024-01-01 10:00:00 INFO a\n");
        let merged = MergedLogSource::new(fx.scheduler.clone(), fx.sources.clone(), MergeConfig::default());
        fx.scheduler.run_once();
        assert_eq!(merged.count(), 1);

        std::fs::File::create(&fx.paths[0]).unwrap();
        fx.scheduler.run_once();
        assert_eq!(merged.count(), 0);
    }

    #[test]
    fn test_time_columns_follow_merged_order() {
        let fx = fixture(2);
        write(&fx.paths[0], "2024-01-01 10:00:00 INFO a1\n2024-01-01 10:00:05 INFO a2\n");
        write(&fx.paths[1], "2024-01-01 10:00:01 INFO b1\n");
        let merged = MergedLogSource::new(fx.scheduler.clone(), fx.sources.clone(), MergeConfig::default());
        fx.scheduler.run_once();
        assert!(merged.columns().contains(&columns::ELAPSED_TIME));

        // Delta is measured against the previous merged row, not the
        // previous row of the same file.
        let buffer = merged.get_entries(
            Section::new(0, 3),
            &[columns::ELAPSED_TIME, columns::DELTA_TIME],
        );
        let seconds = |column: ColumnDescriptor| -> Vec<Option<i64>> {
            buffer
                .iter()
                .map(|e| e.get(&column).as_duration().map(|d| d.num_seconds()))
                .collect()
        };
        assert_eq!(seconds(columns::ELAPSED_TIME), vec![Some(0), Some(1), Some(5)]);
        assert_eq!(seconds(columns::DELTA_TIME), vec![None, Some(1), Some(4)]);

        let tail = merged.get_entries_at(&[2], &[columns::DELTA_TIME]);
        assert_eq!(
            tail.get(0).unwrap().get(&columns::DELTA_TIME).as_duration().map(|d| d.num_seconds()),
            Some(4)
        );
    }

    #[test]
    fn test_dispose_owning_merge_disposes_children() {
        let fx = fixture(1);
        let merged = MergedLogSource::new(fx.scheduler.clone(), fx.sources.clone(), MergeConfig::default());
        assert_eq!(fx.scheduler.active_task_count(), 2);
        merged.dispose();
        assert_eq!(fx.scheduler.active_task_count(), 0);
    }

    #[test]
    fn test_dispose_non_owning_merge_keeps_children() {
        let fx = fixture(1);
        let config = MergeConfig {
            owns_sources: false,
            ..MergeConfig::default()
        };
        let merged = MergedLogSource::new(fx.scheduler.clone(), fx.sources.clone(), config);
        merged.dispose();
        assert_eq!(fx.scheduler.active_task_count(), 1);
    }
}
