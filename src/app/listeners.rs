// logtail - app/listeners.rs
//
// Per-source listener registry.
//
// Each registration remembers how many rows its listener has been told
// about, so every listener receives a change set that replays exactly to the
// source's count even if it subscribed late or had appends held back by its
// batching hints. Notifications are gathered under the registry lock and
// delivered after it is released.

use crate::app::source::{same_listener, LogSource, LogSourceListener};
use crate::core::model::{Modification, Section};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Registration {
    listener: Arc<dyn LogSourceListener>,
    max_wait: Duration,
    min_lines: usize,
    /// Row count this listener has been told about.
    reported: usize,
    /// When the oldest unreported append was first seen.
    pending_since: Option<Instant>,
}

impl Registration {
    fn apply(&mut self, change: &Modification, out: &mut Vec<(Arc<dyn LogSourceListener>, Event)>) {
        match *change {
            Modification::Reset => {
                if self.reported > 0 {
                    out.push((self.listener.clone(), Event::Modified(Modification::Reset)));
                    self.reported = 0;
                }
            }
            Modification::Removed(section) => {
                if self.reported > section.index {
                    let removed = Modification::removed(section.index, self.reported - section.index);
                    out.push((self.listener.clone(), Event::Modified(removed)));
                    self.reported = section.index;
                }
            }
            Modification::Appended(_) => {}
        }
    }

    fn progress(
        &mut self,
        count: usize,
        flush: bool,
        now: Instant,
        out: &mut Vec<(Arc<dyn LogSourceListener>, Event)>,
    ) {
        if count < self.reported {
            // Shrink without an explicit removal; keep the replay exact.
            let removed = Modification::removed(count, self.reported - count);
            out.push((self.listener.clone(), Event::Modified(removed)));
            self.reported = count;
        }
        if count == self.reported {
            self.pending_since = None;
            return;
        }
        let waited = self
            .pending_since
            .is_some_and(|since| now.duration_since(since) >= self.max_wait);
        if flush || count - self.reported >= self.min_lines || waited {
            let appended = Modification::appended(self.reported, count - self.reported);
            out.push((self.listener.clone(), Event::Modified(appended)));
            self.reported = count;
            self.pending_since = None;
        } else if self.pending_since.is_none() {
            self.pending_since = Some(now);
        }
    }
}

enum Event {
    Modified(Modification),
    Retrieved(Section),
}

/// Notifications gathered from a [`Listeners`] registry, ready to deliver.
#[must_use = "notifications do nothing until delivered"]
pub struct Notifications(Vec<(Arc<dyn LogSourceListener>, Event)>);

impl Notifications {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn append(&mut self, mut other: Notifications) {
        self.0.append(&mut other.0);
    }

    /// Invoke every listener callback. Must be called without holding any
    /// lock of `source`.
    pub fn deliver(self, source: &dyn LogSource) {
        for (listener, event) in self.0 {
            match event {
                Event::Modified(modification) => {
                    tracing::trace!(%modification, "Notifying listener");
                    listener.on_modified(source, modification);
                }
                Event::Retrieved(section) => {
                    tracing::trace!(%section, "Notifying listener of retrieval");
                    listener.on_retrieved(source, section);
                }
            }
        }
    }
}

/// The listeners of one source.
#[derive(Default)]
pub struct Listeners {
    registrations: Mutex<Vec<Registration>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `listener`. It has been told about zero rows; the next
    /// [`Listeners::changed`] call brings it up to date.
    pub fn add(&self, listener: Arc<dyn LogSourceListener>, max_wait: Duration, min_lines: usize) {
        let mut registrations = self.registrations.lock();
        if registrations.iter().any(|r| same_listener(&r.listener, &listener)) {
            tracing::debug!("Listener already registered");
            return;
        }
        registrations.push(Registration {
            listener,
            max_wait,
            min_lines: min_lines.max(1),
            reported: 0,
            pending_since: Some(Instant::now()),
        });
    }

    pub fn remove(&self, listener: &Arc<dyn LogSourceListener>) -> bool {
        let mut registrations = self.registrations.lock();
        let before = registrations.len();
        registrations.retain(|r| !same_listener(&r.listener, listener));
        registrations.len() != before
    }

    pub fn clear(&self) {
        self.registrations.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.registrations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.lock().is_empty()
    }

    /// The source applied `changes` and now holds `count` rows.
    ///
    /// Resets and removals are forwarded only to listeners that knew about
    /// the affected rows. Appends are held back per the listener's batching
    /// hints unless `flush` is set.
    pub fn changed(&self, changes: &[Modification], count: usize, flush: bool) -> Notifications {
        let now = Instant::now();
        let mut out = Vec::new();
        for registration in self.registrations.lock().iter_mut() {
            for change in changes {
                registration.apply(change, &mut out);
            }
            registration.progress(count, flush, now, &mut out);
        }
        Notifications(out)
    }

    /// Rows of `section` became readable from a cache.
    pub fn retrieved(&self, section: Section) -> Notifications {
        let out = self
            .registrations
            .lock()
            .iter()
            .filter(|r| r.reported > section.index)
            .map(|r| (r.listener.clone(), Event::Retrieved(section)))
            .collect();
        Notifications(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::column::ColumnDescriptor;
    use crate::core::model::{replay, LogBuffer};
    use crate::core::property::{PropertyDescriptor, PropertySet};

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Modification>>,
    }

    impl LogSourceListener for Recorder {
        fn on_modified(&self, _source: &dyn LogSource, modification: Modification) {
            self.seen.lock().push(modification);
        }
    }

    struct Nothing;

    impl LogSource for Nothing {
        fn columns(&self) -> Vec<ColumnDescriptor> {
            Vec::new()
        }
        fn properties(&self) -> Vec<PropertyDescriptor> {
            Vec::new()
        }
        fn count(&self) -> usize {
            0
        }
        fn get_all_properties(&self, _destination: &mut PropertySet) {}
        fn get_entries_at(&self, _indices: &[usize], columns: &[ColumnDescriptor]) -> LogBuffer {
            LogBuffer::new(columns)
        }
        fn add_listener(&self, _l: Arc<dyn LogSourceListener>, _w: Duration, _n: usize) {}
        fn remove_listener(&self, _l: &Arc<dyn LogSourceListener>) -> bool {
            false
        }
        fn dispose(&self) {}
    }

    fn recorder(listeners: &Listeners, min_lines: usize) -> Arc<Recorder> {
        let recorder = Arc::new(Recorder::default());
        listeners.add(recorder.clone(), Duration::from_secs(3600), min_lines);
        recorder
    }

    #[test]
    fn test_flush_reports_everything() {
        let listeners = Listeners::new();
        let rec = recorder(&listeners, 1_000);
        listeners.changed(&[], 5, true).deliver(&Nothing);
        assert_eq!(*rec.seen.lock(), vec![Modification::appended(0, 5)]);
    }

    #[test]
    fn test_appends_batched_until_min_lines() {
        let listeners = Listeners::new();
        let rec = recorder(&listeners, 10);
        listeners.changed(&[], 4, false).deliver(&Nothing);
        assert!(rec.seen.lock().is_empty());
        listeners.changed(&[], 12, false).deliver(&Nothing);
        assert_eq!(*rec.seen.lock(), vec![Modification::appended(0, 12)]);
    }

    #[test]
    fn test_max_wait_releases_batch() {
        let listeners = Listeners::new();
        let rec = Arc::new(Recorder::default());
        listeners.add(rec.clone(), Duration::ZERO, 1_000);
        listeners.changed(&[], 3, false).deliver(&Nothing);
        assert_eq!(*rec.seen.lock(), vec![Modification::appended(0, 3)]);
    }

    #[test]
    fn test_removal_of_unreported_rows_is_silent() {
        let listeners = Listeners::new();
        let rec = recorder(&listeners, 100);
        listeners.changed(&[], 3, true).deliver(&Nothing);
        // Rows 3..5 were never reported, so removing them is invisible.
        listeners
            .changed(&[Modification::removed(3, 2)], 3, true)
            .deliver(&Nothing);
        listeners
            .changed(&[Modification::removed(2, 1)], 2, true)
            .deliver(&Nothing);
        assert_eq!(
            *rec.seen.lock(),
            vec![Modification::appended(0, 3), Modification::removed(2, 1)]
        );
    }

    #[test]
    fn test_late_listener_replays_to_count() {
        let listeners = Listeners::new();
        let early = recorder(&listeners, 1);
        listeners.changed(&[], 7, true).deliver(&Nothing);
        let late = recorder(&listeners, 1);
        listeners
            .changed(&[Modification::removed(6, 1), Modification::appended(6, 3)], 9, true)
            .deliver(&Nothing);
        assert_eq!(replay(0, early.seen.lock().iter()), 9);
        assert_eq!(replay(0, late.seen.lock().iter()), 9);
        assert_eq!(*late.seen.lock(), vec![Modification::appended(0, 9)]);
    }

    #[test]
    fn test_reset_only_when_rows_were_reported() {
        let listeners = Listeners::new();
        let rec = recorder(&listeners, 1);
        listeners.changed(&[Modification::Reset], 0, true).deliver(&Nothing);
        assert!(rec.seen.lock().is_empty());
        listeners.changed(&[], 2, true).deliver(&Nothing);
        listeners.changed(&[Modification::Reset], 0, true).deliver(&Nothing);
        assert_eq!(
            *rec.seen.lock(),
            vec![Modification::appended(0, 2), Modification::Reset]
        );
    }

    #[test]
    fn test_remove_listener() {
        let listeners = Listeners::new();
        let rec = recorder(&listeners, 1);
        let as_dyn: Arc<dyn LogSourceListener> = rec.clone();
        assert!(listeners.remove(&as_dyn));
        assert!(!listeners.remove(&as_dyn));
        listeners.changed(&[], 2, true).deliver(&Nothing);
        assert!(rec.seen.lock().is_empty());
    }
}
