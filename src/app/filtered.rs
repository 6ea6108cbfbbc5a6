// logtail - app/filtered.rs
//
// Incremental filtering of an upstream source by logical entry.
//
// The filter keeps the ascending list of upstream rows that pass. Each tick
// it folds the upstream's queued modifications, rewinds to the start of the
// first entry they touched, and evaluates at most a few batches of new rows.
// An entry passes when any of its lines matches; every line of a passing
// entry is kept.
//
// The last entry seen is provisional: more of its lines may still arrive, so
// it is re-evaluated once the upstream grows. The reported change set only
// covers rows whose mapping actually changed.

use crate::app::listeners::Listeners;
use crate::app::scheduler::TaskScheduler;
use crate::app::source::{LogSource, LogSourceListener, Tick, Ticker};
use crate::core::changes::{changes_between, Coalescer};
use crate::core::column::{columns, ColumnDescriptor, Value};
use crate::core::filter::Predicate;
use crate::core::model::{LogBuffer, LogEntry, Modification, Section};
use crate::core::property::{properties, PropertyDescriptor, PropertySet, PropertyValue};
use crate::platform::config::FilterConfig;
use crate::util::constants::DEFAULT_LISTENER_MAX_WAIT_MS;
use crate::util::error::Result;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Columns read from upstream to evaluate predicates.
const EVAL_COLUMNS: &[ColumnDescriptor] = &[
    columns::INDEX,
    columns::LOG_ENTRY_INDEX,
    columns::LINE_NUMBER,
    columns::RAW_CONTENT,
    columns::TIMESTAMP,
    columns::LEVEL,
];

/// Columns the filter computes instead of copying from upstream.
const FILTER_COLUMNS: &[ColumnDescriptor] = &[
    columns::INDEX,
    columns::ORIGINAL_INDEX,
    columns::LOG_ENTRY_INDEX,
    columns::LINE_NUMBER,
];

#[derive(Default)]
struct UpstreamListener {
    pending: Mutex<Vec<Modification>>,
}

impl LogSourceListener for UpstreamListener {
    fn on_modified(&self, _source: &dyn LogSource, modification: Modification) {
        self.pending.lock().push(modification);
    }
}

/// One row of the filtered view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Kept {
    upstream: usize,
    entry: usize,
}

/// Evaluation progress. Only touched by the tick.
#[derive(Debug, Default)]
struct Progress {
    /// Upstream row count as of the last folded modification.
    upstream_count: usize,
    /// Upstream rows evaluated so far.
    evaluated: usize,
    /// Upstream start row of every evaluated entry, ascending.
    entry_starts: Vec<usize>,
    /// Start row of the provisional last entry.
    open_entry: Option<usize>,
}

struct FilterIndex {
    kept: Vec<Kept>,
    properties: PropertySet,
    /// Share of the known upstream rows evaluated, `0.0..=1.0`.
    evaluated_fraction: f64,
}

/// Filtered entry index following the last of `kept`.
fn next_entry_after(kept: &[Kept]) -> usize {
    kept.last().map_or(0, |k| k.entry + 1)
}

/// A view of the upstream rows whose entries match a predicate.
pub struct FilteredLogSource {
    upstream: Arc<dyn LogSource>,
    upstream_listener: Arc<UpstreamListener>,
    predicate: Predicate,
    config: FilterConfig,
    owns_upstream: bool,
    progress: Mutex<Progress>,
    index: Mutex<FilterIndex>,
    listeners: Listeners,
    ticker: Ticker,
    disposed: AtomicBool,
}

impl FilteredLogSource {
    /// Filter `upstream` by `predicate`. With `owns_upstream`, disposing the
    /// filter disposes the upstream too.
    pub fn new(
        scheduler: Arc<dyn TaskScheduler>,
        upstream: Arc<dyn LogSource>,
        predicate: Predicate,
        config: FilterConfig,
        owns_upstream: bool,
    ) -> Arc<Self> {
        let period = config.poll_interval;
        let batch = config.batch_size.max(1);
        let filtered = Arc::new(Self {
            upstream: upstream.clone(),
            upstream_listener: Arc::new(UpstreamListener::default()),
            predicate,
            config,
            owns_upstream,
            progress: Mutex::new(Progress::default()),
            index: Mutex::new(FilterIndex {
                kept: Vec::new(),
                properties: PropertySet::new(),
                evaluated_fraction: 1.0,
            }),
            listeners: Listeners::new(),
            ticker: Ticker::new(scheduler),
            disposed: AtomicBool::new(false),
        });
        upstream.add_listener(
            filtered.upstream_listener.clone(),
            Duration::from_millis(DEFAULT_LISTENER_MAX_WAIT_MS),
            batch,
        );
        filtered.ticker.start(&filtered, "filter".to_string(), period);
        filtered
    }

    pub fn predicate(&self) -> &Predicate {
        &self.predicate
    }

    /// Upstream row shown at `filtered_index`.
    pub fn upstream_index(&self, filtered_index: usize) -> Option<usize> {
        self.index.lock().kept.get(filtered_index).map(|k| k.upstream)
    }

    /// Filtered row showing `upstream_index`, if it passed.
    pub fn filtered_index_of(&self, upstream_index: usize) -> Option<usize> {
        let index = self.index.lock();
        index
            .kept
            .binary_search_by_key(&upstream_index, |k| k.upstream)
            .ok()
    }

    /// Fold queued upstream modifications; returns the lowest upstream row
    /// whose content is no longer valid.
    fn fold_upstream(&self, progress: &mut Progress) -> Option<usize> {
        let pending = std::mem::take(&mut *self.upstream_listener.pending.lock());
        if pending.is_empty() {
            return None;
        }
        let mut coalescer = Coalescer::new(progress.upstream_count);
        coalescer.extend(pending);
        progress.upstream_count = coalescer.count();
        coalescer.first_invalid()
    }

    /// Forget every entry touching rows at or above `row`; returns the
    /// start row of the first forgotten entry.
    fn rewind(progress: &mut Progress, row: usize) -> usize {
        let from = match row.checked_sub(1) {
            None => 0,
            Some(last_valid) => {
                let at = progress.entry_starts.partition_point(|&s| s <= last_valid);
                at.checked_sub(1).map_or(0, |i| progress.entry_starts[i])
            }
        };
        let keep = progress.entry_starts.partition_point(|&s| s < from);
        progress.entry_starts.truncate(keep);
        progress.evaluated = progress.evaluated.min(from);
        if progress.open_entry.is_some_and(|start| start >= from) {
            progress.open_entry = None;
        }
        from
    }

    /// Evaluate rows from `progress.evaluated` up to `end`; returns the new
    /// rows to keep.
    fn evaluate(&self, progress: &mut Progress, end: usize, mut next_entry: usize) -> Vec<Kept> {
        let mut kept = Vec::new();
        if end <= progress.evaluated {
            return kept;
        }
        let buffer = self.upstream.get_entries(
            Section::new(progress.evaluated, end - progress.evaluated),
            EVAL_COLUMNS,
        );

        let mut current: Vec<LogEntry> = Vec::new();
        let mut current_start = progress.evaluated;
        let mut consumed = progress.evaluated;
        for row in buffer.into_entries() {
            let Some(index) = row.index() else {
                // Upstream shrank since it notified; its removal is queued.
                break;
            };
            let same_entry = current
                .last()
                .is_some_and(|prev| prev.entry_index() == row.entry_index());
            if !current.is_empty() && !same_entry {
                self.finish_entry(progress, current_start, &current, &mut next_entry, &mut kept);
                current.clear();
                current_start = index;
            }
            if current.is_empty() {
                current_start = index;
            }
            current.push(row);
            consumed = index + 1;
        }
        if !current.is_empty() {
            // Possibly incomplete: the upstream may append more lines to it.
            self.finish_entry(progress, current_start, &current, &mut next_entry, &mut kept);
            progress.open_entry = Some(current_start);
        }
        progress.evaluated = consumed;
        kept
    }

    fn finish_entry(
        &self,
        progress: &mut Progress,
        start: usize,
        lines: &[LogEntry],
        next_entry: &mut usize,
        kept: &mut Vec<Kept>,
    ) {
        progress.entry_starts.push(start);
        progress.open_entry = None;
        if self.predicate.matches_any(lines) {
            kept.extend((0..lines.len()).map(|i| Kept {
                upstream: start + i,
                entry: *next_entry,
            }));
            *next_entry += 1;
        }
    }

    fn row(&self, index: usize, kept: Kept, wanted: &[ColumnDescriptor], upstream_row: Option<&LogEntry>) -> LogEntry {
        let mut entry = LogEntry::new();
        for &column in wanted {
            let value = if column == columns::INDEX {
                Value::Index(Some(index))
            } else if column == columns::ORIGINAL_INDEX {
                Value::Index(Some(kept.upstream))
            } else if column == columns::LOG_ENTRY_INDEX {
                Value::Index(Some(kept.entry))
            } else if column == columns::LINE_NUMBER {
                Value::Number(index + 1)
            } else {
                upstream_row.map_or_else(|| column.default_value(), |r| r.get(&column))
            };
            entry.set(column, value);
        }
        entry
    }
}

impl Tick for FilteredLogSource {
    fn tick(&self) -> Result<()> {
        if self.disposed.load(Ordering::Acquire) {
            return Ok(());
        }
        let mut progress = self.progress.lock();
        let invalid_from = self.fold_upstream(&mut progress);

        // The index is only modified once, at the end, so readers never see
        // a transiently shorter view.
        let mut first_damaged: Option<usize> = None;
        let (old_count, mut truncate_at, mut next_entry) = {
            let index = self.index.lock();
            let old_count = index.kept.len();
            let mut truncate_at = old_count;
            if let Some(row) = invalid_from.filter(|&row| row < progress.evaluated) {
                let from = Self::rewind(&mut progress, row);
                truncate_at = index.kept.partition_point(|k| k.upstream < from);
                first_damaged = Some(truncate_at);
            }
            (old_count, truncate_at, next_entry_after(&index.kept[..truncate_at]))
        };

        // A batch covers new rows only, so re-evaluating a long provisional
        // entry still makes progress.
        let end = progress
            .upstream_count
            .min(progress.evaluated.saturating_add(self.config.batch_size.max(1)));

        // Re-evaluate the provisional entry when it may have grown.
        let mut previous: Vec<Kept> = Vec::new();
        if let Some(start) = progress.open_entry {
            if progress.upstream_count > progress.evaluated {
                Self::rewind(&mut progress, start + 1);
                let index = self.index.lock();
                let keep = index.kept[..truncate_at].partition_point(|k| k.upstream < start);
                previous = index.kept[keep..truncate_at].to_vec();
                truncate_at = keep;
                next_entry = next_entry_after(&index.kept[..keep]);
            }
        }

        let fresh = self.evaluate(&mut progress, end, next_entry);
        let more = progress.evaluated < progress.upstream_count;
        let upstream_count = progress.upstream_count;
        let evaluated_fraction = if upstream_count == 0 {
            1.0
        } else {
            progress.evaluated as f64 / upstream_count as f64
        };
        drop(progress);

        let (changes, count) = {
            let mut index = self.index.lock();
            index.kept.truncate(truncate_at);
            index.kept.extend(fresh);
            if !previous.is_empty() {
                // Damage starts where the re-evaluated rows first differ.
                let now = &index.kept[truncate_at..];
                let same = previous.iter().zip(now).take_while(|(a, b)| a == b).count();
                if same < previous.len() {
                    let damaged = truncate_at + same;
                    first_damaged = Some(first_damaged.map_or(damaged, |d| d.min(damaged)));
                }
            }
            let count = index.kept.len();
            let entries = next_entry_after(&index.kept);
            index.evaluated_fraction = evaluated_fraction;
            index
                .properties
                .set(properties::LOG_ENTRY_COUNT, PropertyValue::Count(entries));
            (changes_between(old_count, first_damaged, count), count)
        };

        if more {
            tracing::trace!(count, upstream_count, "Filter batch done; more rows pending");
        }
        self.listeners.changed(&changes, count, !more).deliver(self);
        Ok(())
    }
}

impl LogSource for FilteredLogSource {
    fn columns(&self) -> Vec<ColumnDescriptor> {
        self.upstream.columns()
    }

    fn properties(&self) -> Vec<PropertyDescriptor> {
        let mut out = self.upstream.properties();
        if !out.contains(&properties::LOG_ENTRY_COUNT) {
            out.push(properties::LOG_ENTRY_COUNT);
        }
        out
    }

    fn count(&self) -> usize {
        self.index.lock().kept.len()
    }

    fn get_all_properties(&self, destination: &mut PropertySet) {
        self.upstream.get_all_properties(destination);
        let upstream_percent = destination.percentage_processed();
        let index = self.index.lock();
        index.properties.copy_to(destination);
        destination.set(
            properties::PERCENTAGE_PROCESSED,
            PropertyValue::Percentage(upstream_percent * index.evaluated_fraction),
        );
    }

    fn get_entries_at(&self, indices: &[usize], wanted: &[ColumnDescriptor]) -> LogBuffer {
        let mapped: Vec<Option<Kept>> = {
            let index = self.index.lock();
            indices.iter().map(|&i| index.kept.get(i).copied()).collect()
        };
        let upstream_columns: Vec<ColumnDescriptor> = wanted
            .iter()
            .filter(|c| !FILTER_COLUMNS.contains(*c))
            .copied()
            .collect();
        let positions: Vec<usize> = mapped.iter().flatten().map(|k| k.upstream).collect();
        let mut upstream_rows = if upstream_columns.is_empty() || positions.is_empty() {
            Vec::new()
        } else {
            self.upstream
                .get_entries_at(&positions, &upstream_columns)
                .into_entries()
        }
        .into_iter();

        let mut buffer = LogBuffer::with_capacity(wanted, indices.len());
        for (&index, kept) in indices.iter().zip(mapped) {
            match kept {
                Some(kept) => {
                    let upstream_row = upstream_rows.next();
                    buffer.push(&self.row(index, kept, wanted, upstream_row.as_ref()));
                }
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
        let listener: Arc<dyn LogSourceListener> = self.upstream_listener.clone();
        self.upstream.remove_listener(&listener);
        if self.owns_upstream {
            self.upstream.dispose();
        }
        tracing::debug!(owns_upstream = self.owns_upstream, "Filter disposed");
    }
}
