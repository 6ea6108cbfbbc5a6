// logtail - core/merge_index.rs
//
// The merge engine's ordering index, without any I/O or locking.
//
// Holds one record per merged row, sorted by (timestamp, child registration
// order, index within the child). Each tick the merge source feeds it the
// per-child invalidations and newly appended lines; the index updates only
// the damaged suffix and reports the lowest merged index that changed.

use crate::core::changes::changes_between;
use crate::core::model::Modification;
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// One row of the merged view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergedLine {
    pub timestamp: DateTime<Utc>,
    /// Registration ordinal of the owning child.
    pub source_id: usize,
    /// Row index within the child.
    pub original_index: usize,
    /// Entry index within the child.
    pub original_entry_index: usize,
    /// Entry index within the merged view.
    pub merged_entry_index: usize,
}

impl MergedLine {
    fn key(&self) -> (DateTime<Utc>, usize, usize) {
        (self.timestamp, self.source_id, self.original_index)
    }

    fn same_entry(&self, other: &MergedLine) -> bool {
        self.source_id == other.source_id && self.original_entry_index == other.original_entry_index
    }
}

/// A line read from a child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildLine {
    pub original_index: usize,
    pub original_entry_index: usize,
    pub timestamp: Option<DateTime<Utc>>,
}

/// Everything that happened to one child since the previous tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildDelta {
    pub source_id: usize,
    /// Drop every line of this child at or above this index.
    pub invalidate_from: Option<usize>,
    /// Newly readable lines of this child, in child order.
    pub lines: Vec<ChildLine>,
}

/// Sorted merge index plus per-child untimestamped line lists.
#[derive(Debug, Clone, Default)]
pub struct MergeIndex {
    lines: Vec<MergedLine>,
    untimestamped: BTreeMap<usize, Vec<usize>>,
}

impl MergeIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&MergedLine> {
        self.lines.get(index)
    }

    pub fn lines(&self) -> &[MergedLine] {
        &self.lines
    }

    /// Lines excluded from the merged order because they carry no timestamp.
    pub fn untimestamped_count(&self) -> usize {
        self.untimestamped.values().map(Vec::len).sum()
    }

    /// Drop every line of `source_id`; returns the lowest changed index.
    fn invalidate(&mut self, source_id: usize, from: usize) -> Option<usize> {
        if let Some(list) = self.untimestamped.get_mut(&source_id) {
            let keep = list.partition_point(|&i| i < from);
            list.truncate(keep);
        }
        let doomed = |l: &MergedLine| l.source_id == source_id && l.original_index >= from;
        let first = self.lines.iter().position(doomed)?;
        let mut tail = self.lines.split_off(first);
        tail.retain(|l| !doomed(l));
        self.lines.extend(tail);
        Some(first)
    }

    /// Insert sorted `new` lines; returns the lowest index that shifted.
    fn insert_sorted(&mut self, mut new: Vec<MergedLine>) -> Option<usize> {
        if new.is_empty() {
            return None;
        }
        new.sort_unstable_by_key(MergedLine::key);
        let first_key = new[0].key();
        let split = self.lines.partition_point(|l| l.key() < first_key);
        let damaged = (split < self.lines.len()).then_some(split);

        let tail = self.lines.split_off(split);
        self.lines.reserve(tail.len() + new.len());
        let mut tail = tail.into_iter().peekable();
        let mut new = new.into_iter().peekable();
        loop {
            let next = match (tail.peek(), new.peek()) {
                (Some(a), Some(b)) => match a.key().cmp(&b.key()) {
                    Ordering::Greater => new.next(),
                    _ => tail.next(),
                },
                (Some(_), None) => tail.next(),
                (None, Some(_)) => new.next(),
                (None, None) => break,
            };
            if let Some(line) = next {
                self.lines.push(line);
            }
        }
        damaged
    }

    /// Recompute merged entry indices from `start` onward.
    fn renumber_from(&mut self, start: usize) {
        for i in start..self.lines.len() {
            let merged = match i.checked_sub(1).map(|p| self.lines[p]) {
                None => 0,
                Some(prev) if prev.same_entry(&self.lines[i]) => prev.merged_entry_index,
                Some(prev) => prev.merged_entry_index + 1,
            };
            self.lines[i].merged_entry_index = merged;
        }
    }

    /// Apply one tick's worth of child deltas.
    ///
    /// Invalidations are applied before insertions, so a child that was
    /// reset and refilled within one tick is handled correctly. Returns the
    /// change set for the merged view (empty when nothing changed).
    pub fn apply(&mut self, deltas: Vec<ChildDelta>) -> Vec<Modification> {
        let old_count = self.lines.len();
        let mut first_damaged: Option<usize> = None;
        let mut note = |index: Option<usize>| {
            if let Some(i) = index {
                first_damaged = Some(first_damaged.map_or(i, |d: usize| d.min(i)));
            }
        };

        for delta in &deltas {
            if let Some(from) = delta.invalidate_from {
                note(self.invalidate(delta.source_id, from));
            }
        }

        let mut new = Vec::new();
        for delta in deltas {
            for line in delta.lines {
                match line.timestamp {
                    Some(timestamp) => new.push(MergedLine {
                        timestamp,
                        source_id: delta.source_id,
                        original_index: line.original_index,
                        original_entry_index: line.original_entry_index,
                        merged_entry_index: 0,
                    }),
                    None => {
                        let list = self.untimestamped.entry(delta.source_id).or_default();
                        let at = list.partition_point(|&i| i < line.original_index);
                        if list.get(at) != Some(&line.original_index) {
                            list.insert(at, line.original_index);
                        }
                    }
                }
            }
        }
        note(self.insert_sorted(new));

        let renumber_start = first_damaged.unwrap_or(old_count).min(old_count);
        self.renumber_from(renumber_start);

        changes_between(old_count, first_damaged, self.lines.len())
    }

    /// Forget a child entirely.
    pub fn remove_source(&mut self, source_id: usize) -> Vec<Modification> {
        let changes = self.apply(vec![ChildDelta {
            source_id,
            invalidate_from: Some(0),
            lines: Vec::new(),
        }]);
        self.untimestamped.remove(&source_id);
        changes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn lines(entries: &[(usize, Option<i64>)]) -> Vec<ChildLine> {
        entries
            .iter()
            .map(|&(i, t)| ChildLine {
                original_index: i,
                original_entry_index: i,
                timestamp: t.map(ts),
            })
            .collect()
    }

    fn order(index: &MergeIndex) -> Vec<(usize, usize)> {
        index
            .lines()
            .iter()
            .map(|l| (l.source_id, l.original_index))
            .collect()
    }

    #[test]
    fn test_interleaves_by_timestamp() {
        let mut index = MergeIndex::new();
        let changes = index.apply(vec![
            ChildDelta {
                source_id: 0,
                invalidate_from: None,
                lines: lines(&[(0, Some(1)), (1, Some(3))]),
            },
            ChildDelta {
                source_id: 1,
                invalidate_from: None,
                lines: lines(&[(0, Some(2)), (1, Some(3))]),
            },
        ]);
        assert_eq!(changes, vec![Modification::appended(0, 4)]);
        // Equal timestamps tie-break on registration order.
        assert_eq!(order(&index), vec![(0, 0), (1, 0), (0, 1), (1, 1)]);
    }

    #[test]
    fn test_late_line_damages_suffix() {
        let mut index = MergeIndex::new();
        index.apply(vec![ChildDelta {
            source_id: 0,
            invalidate_from: None,
            lines: lines(&[(0, Some(1)), (1, Some(5))]),
        }]);
        let changes = index.apply(vec![ChildDelta {
            source_id: 1,
            invalidate_from: None,
            lines: lines(&[(0, Some(3))]),
        }]);
        assert_eq!(
            changes,
            vec![Modification::removed(1, 1), Modification::appended(1, 2)]
        );
        assert_eq!(order(&index), vec![(0, 0), (1, 0), (0, 1)]);
    }

    #[test]
    fn test_no_changes_no_modification() {
        let mut index = MergeIndex::new();
        index.apply(vec![ChildDelta {
            source_id: 0,
            invalidate_from: None,
            lines: lines(&[(0, Some(1))]),
        }]);
        assert!(index.apply(Vec::new()).is_empty());
    }

    #[test]
    fn test_untimestamped_lines_counted_separately() {
        let mut index = MergeIndex::new();
        index.apply(vec![ChildDelta {
            source_id: 0,
            invalidate_from: None,
            lines: lines(&[(0, Some(1)), (1, None), (2, None)]),
        }]);
        assert_eq!(index.len(), 1);
        assert_eq!(index.untimestamped_count(), 2);
        index.apply(vec![ChildDelta {
            source_id: 0,
            invalidate_from: Some(2),
            lines: Vec::new(),
        }]);
        assert_eq!(index.untimestamped_count(), 1);
    }

    #[test]
    fn test_reset_and_refill_in_one_tick() {
        let mut index = MergeIndex::new();
        index.apply(vec![ChildDelta {
            source_id: 0,
            invalidate_from: None,
            lines: lines(&[(0, Some(1)), (1, Some(2))]),
        }]);
        let changes = index.apply(vec![ChildDelta {
            source_id: 0,
            invalidate_from: Some(0),
            lines: lines(&[(0, Some(9))]),
        }]);
        assert_eq!(
            changes,
            vec![Modification::removed(0, 2), Modification::appended(0, 1)]
        );
        assert_eq!(index.get(0).map(|l| l.timestamp), Some(ts(9)));
    }

    #[test]
    fn test_remove_source_to_empty_is_reset() {
        let mut index = MergeIndex::new();
        index.apply(vec![ChildDelta {
            source_id: 3,
            invalidate_from: None,
            lines: lines(&[(0, Some(1))]),
        }]);
        assert_eq!(index.remove_source(3), vec![Modification::Reset]);
        assert!(index.is_empty());
    }

    #[test]
    fn test_multiline_entry_stays_one_merged_entry() {
        let mut index = MergeIndex::new();
        let child = |i, entry, t| ChildLine {
            original_index: i,
            original_entry_index: entry,
            timestamp: Some(ts(t)),
        };
        index.apply(vec![
            ChildDelta {
                source_id: 0,
                invalidate_from: None,
                lines: vec![child(0, 0, 1), child(1, 0, 1), child(2, 1, 4)],
            },
            ChildDelta {
                source_id: 1,
                invalidate_from: None,
                lines: vec![child(0, 0, 2)],
            },
        ]);
        let entries: Vec<usize> = index.lines().iter().map(|l| l.merged_entry_index).collect();
        assert_eq!(entries, vec![0, 0, 1, 2]);
    }
}
