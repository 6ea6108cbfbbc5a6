// logtail - core/changes.rs
//
// Folding and producing modification sequences.
//
// `Coalescer` folds the modifications one producer reported during a tick
// into the shortest equivalent sequence. `changes_between` builds the change
// set a derived source (merge, filter) reports after recomputing from its
// first damaged row.

use crate::core::model::{Modification, Section};

/// Folds a run of modifications from one producer.
///
/// The result is at most `[Reset, Appended]` or `[Removed, Appended]`, and
/// replaying it against `initial_count` yields the same count as replaying
/// every pushed modification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Coalescer {
    initial_count: usize,
    count: usize,
    reset: bool,
    /// Lowest index of the initial rows that was removed.
    removed_from: Option<usize>,
    /// Rows appended after the surviving prefix. Always starts at the end
    /// of the surviving prefix.
    appended: Option<Section>,
}

impl Coalescer {
    pub fn new(initial_count: usize) -> Self {
        Self {
            initial_count,
            count: initial_count,
            reset: false,
            removed_from: None,
            appended: None,
        }
    }

    /// The producer's count after every pushed modification.
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn initial_count(&self) -> usize {
        self.initial_count
    }

    /// True when nothing observable changed.
    pub fn is_empty(&self) -> bool {
        !self.reset && self.removed_from.is_none() && self.appended.is_none()
    }

    pub fn is_reset(&self) -> bool {
        self.reset
    }

    /// Lowest index whose previous content is no longer valid.
    pub fn first_invalid(&self) -> Option<usize> {
        if self.reset {
            Some(0)
        } else {
            self.removed_from
        }
    }

    /// Rows that are new relative to the surviving prefix.
    pub fn appended(&self) -> Option<Section> {
        self.appended
    }

    pub fn push(&mut self, modification: Modification) {
        match modification {
            Modification::Reset => {
                self.reset = true;
                self.removed_from = None;
                self.appended = None;
                self.count = 0;
            }
            Modification::Removed(section) => self.remove_from(section.index),
            Modification::Appended(section) => self.append(section),
        }
    }

    pub fn extend(&mut self, modifications: impl IntoIterator<Item = Modification>) {
        for modification in modifications {
            self.push(modification);
        }
    }

    fn remove_from(&mut self, from: usize) {
        if from >= self.count {
            tracing::trace!(from, count = self.count, "Removal past end ignored");
            return;
        }
        match &mut self.appended {
            Some(appended) if from >= appended.index => {
                appended.count = from - appended.index;
                if appended.count == 0 {
                    self.appended = None;
                }
            }
            _ => {
                // The removal reaches into the initial rows; anything
                // appended since lay above it and is gone too.
                self.appended = None;
                if !self.reset {
                    let lowest = self.removed_from.map_or(from, |r| r.min(from));
                    self.removed_from = Some(lowest);
                }
            }
        }
        self.count = from;
    }

    fn append(&mut self, section: Section) {
        if section.is_empty() {
            return;
        }
        if section.index < self.count {
            tracing::debug!(
                index = section.index,
                count = self.count,
                "Overlapping append treated as replacement"
            );
            self.remove_from(section.index);
        }
        let start = self.appended.map_or(self.count, |a| a.index);
        self.appended = Some(Section::new(start, section.end() - start));
        self.count = section.end();
    }

    /// The folded modification sequence.
    pub fn modifications(&self) -> Vec<Modification> {
        let mut out = Vec::with_capacity(2);
        if self.reset {
            out.push(Modification::Reset);
        } else if let Some(from) = self.removed_from {
            out.push(Modification::removed(from, self.initial_count - from));
        }
        if let Some(appended) = self.appended {
            out.push(Modification::Appended(appended));
        }
        out
    }
}

/// The change set a derived source reports after recomputing.
///
/// `old_count` is what listeners last saw, `first_damaged` the lowest row
/// whose content changed (if any), and `new_count` the current count.
pub fn changes_between(
    old_count: usize,
    first_damaged: Option<usize>,
    new_count: usize,
) -> Vec<Modification> {
    if new_count == 0 {
        return if old_count > 0 {
            vec![Modification::Reset]
        } else {
            Vec::new()
        };
    }
    let kept = first_damaged
        .unwrap_or(old_count)
        .min(old_count)
        .min(new_count);
    let mut out = Vec::with_capacity(2);
    if kept < old_count {
        out.push(Modification::removed(kept, old_count - kept));
    }
    if new_count > kept {
        out.push(Modification::appended(kept, new_count - kept));
    }
    out
}
