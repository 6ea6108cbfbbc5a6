// logtail - app/source.rs
//
// The read/listen contract every pipeline stage implements, plus the small
// helper that ties a stage's tick to the scheduler.
//
// Reads never fail: rows past the end (or columns a source does not supply)
// come back holding their column defaults. Listeners are told about changes
// through `on_modified`; replaying those modifications against the count a
// listener last saw always reproduces the source's count.

use crate::app::scheduler::{TaskHandle, TaskScheduler};
use crate::core::column::ColumnDescriptor;
use crate::core::model::{LogBuffer, Modification, Section};
use crate::core::property::{PropertyDescriptor, PropertySet, PropertyValue};
use crate::util::error::Result;
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;

/// Receives change notifications from a [`LogSource`].
pub trait LogSourceListener: Send + Sync {
    /// `source` changed. Called from the source's tick, never under the
    /// source's lock; implementations should return quickly.
    fn on_modified(&self, source: &dyn LogSource, modification: Modification);

    /// Rows of `section` became readable from a cache. Purely informational:
    /// the source's count is unchanged.
    fn on_retrieved(&self, source: &dyn LogSource, section: Section) {
        let _ = (source, section);
    }
}

/// A readable, observable table of log rows.
pub trait LogSource: Send + Sync {
    /// Columns this source supplies.
    fn columns(&self) -> Vec<ColumnDescriptor>;

    /// Properties this source supplies.
    fn properties(&self) -> Vec<PropertyDescriptor>;

    /// Number of rows currently readable.
    fn count(&self) -> usize;

    /// Copy every supplied property into `destination`.
    fn get_all_properties(&self, destination: &mut PropertySet);

    /// One property, or its default if unsupported.
    fn get_property(&self, property: &PropertyDescriptor) -> PropertyValue {
        let mut set = PropertySet::new();
        self.get_all_properties(&mut set);
        set.get(property)
    }

    /// Read the rows at `indices` (in that order) restricted to `columns`.
    fn get_entries_at(&self, indices: &[usize], columns: &[ColumnDescriptor]) -> LogBuffer;

    /// Read a contiguous range of rows.
    fn get_entries(&self, section: Section, columns: &[ColumnDescriptor]) -> LogBuffer {
        let indices: Vec<usize> = section.indices().collect();
        self.get_entries_at(&indices, columns)
    }

    /// Subscribe. `max_wait` and `min_lines_before_flush` are batching
    /// hints for appended rows.
    fn add_listener(
        &self,
        listener: Arc<dyn LogSourceListener>,
        max_wait: Duration,
        min_lines_before_flush: usize,
    );

    /// Unsubscribe; returns false if `listener` was not registered.
    fn remove_listener(&self, listener: &Arc<dyn LogSourceListener>) -> bool;

    /// Stop ticking and release upstream sources. Idempotent.
    fn dispose(&self);
}

/// Identity comparison of listeners (data pointer only).
pub fn same_listener(a: &Arc<dyn LogSourceListener>, b: &Arc<dyn LogSourceListener>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

/// A stage that does its work in a periodic tick.
pub trait Tick: Send + Sync {
    fn tick(&self) -> Result<()>;
}

/// Registration of one stage's tick with a scheduler.
///
/// The scheduled callback holds only a `Weak` reference, so a source that
/// is dropped while a tick is queued is still freed; dropping the ticker
/// unregisters the task.
pub struct Ticker {
    scheduler: Arc<dyn TaskScheduler>,
    handle: Mutex<Option<TaskHandle>>,
}

impl Ticker {
    pub fn new(scheduler: Arc<dyn TaskScheduler>) -> Self {
        Self {
            scheduler,
            handle: Mutex::new(None),
        }
    }

    /// Start ticking `source` every `period`.
    pub fn start<T: Tick + 'static>(&self, source: &Arc<T>, name: String, period: Duration) {
        let weak: Weak<T> = Arc::downgrade(source);
        let handle = self.scheduler.register(
            &name,
            period,
            Box::new(move || match weak.upgrade() {
                Some(source) => source.tick(),
                None => Ok(()),
            }),
        );
        if let Some(previous) = self.handle.lock().replace(handle) {
            self.scheduler.unregister(previous);
        }
    }

    /// Stop ticking. Blocks until an in-flight tick returns (unless called
    /// from that tick). Returns false if already stopped.
    pub fn stop(&self) -> bool {
        let handle = self.handle.lock().take();
        match handle {
            Some(handle) => self.scheduler.unregister(handle),
            None => false,
        }
    }

    pub fn scheduler(&self) -> &Arc<dyn TaskScheduler> {
        &self.scheduler
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}
